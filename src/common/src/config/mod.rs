use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Connection settings for the metadata index service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataStoreConfig {
    /// `memory://` selects the in-process store, `http(s)://host:port` the signed HTTP client
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    pub region: String,
    pub service: String,
    /// Page size used for every index listing
    pub max_keys: usize,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for MetadataStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("memory://"),
            access_key: String::new(),
            secret_key: String::new(),
            region: String::from("us-west-2"),
            service: String::from("s3"),
            max_keys: 1000,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Opaque ids of every index the background services touch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub global_bucket_index_id: String,
    pub global_bucket_index_id_replica: String,
    pub bucket_metadata_index_id: String,
    pub bucket_metadata_index_id_replica: String,
    pub probable_delete_index_id: String,
    pub object_metadata_index_id: String,
    /// Index of live write-path instances. Liveness checks are skipped when unset.
    #[serde(default)]
    pub global_instance_index_id: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            global_bucket_index_id: String::from("AAAAAAAAAHg=-AQAQAAAAAAA="),
            global_bucket_index_id_replica: String::from("AAAAAAAAAHg=-BQAQAAAAAAA="),
            bucket_metadata_index_id: String::from("AAAAAAAAAHg=-AgAQAAAAAAA="),
            bucket_metadata_index_id_replica: String::from("AAAAAAAAAHg=-BgAQAAAAAAA="),
            probable_delete_index_id: String::from("AAAAAAAAAHg=-AwAQAAAAAAA="),
            object_metadata_index_id: String::from("AAAAAAAAAHg=-BAAQAAAAAAA="),
            global_instance_index_id: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Memory,
    JetStream,
}

/// Deletion queue connection settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub topic: String,
    /// Persist queued jobs across broker restarts
    pub durable: bool,
    /// Upper bound on queued jobs for the in-memory backend
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Memory,
            url: String::from("nats://localhost:4222"),
            username: None,
            password: None,
            topic: String::from("s3_delete_obj_job_queue"),
            durable: true,
            capacity: 1024,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between the end of one tick and the start of the next
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Run a tick immediately instead of waiting one interval first
    pub run_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            run_on_startup: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Fixed delay between broker reconnect attempts
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Keep consuming forever. When false the worker drains the jobs queued at start and exits.
    pub daemon_mode: bool,
    /// How long a single broker fetch waits for a job
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            daemon_mode: true,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store holding the data objects (`memory://`, `file:///path`, `s3://host/bucket`)
    pub dsn: String,
    /// Path prefix under which object data is addressed by object id
    pub object_prefix: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("memory://"),
            object_prefix: String::from("objects"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Metadata index service
    pub metadata_store: MetadataStoreConfig,
    /// Index ids for replica pairs and the deletion pipeline
    pub indexes: IndexConfig,
    /// Deletion queue
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    /// Object data storage
    pub storage: StorageConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file("sweeper.toml"))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(Toml::file(path))
    }

    fn figment(file: figment::providers::Data<Toml>) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(file)
            .merge(Env::prefixed("SWEEPER__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Reject settings that would make a service spin or address nothing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.metadata_store.endpoint.is_empty() {
            anyhow::bail!("metadata_store.endpoint cannot be empty");
        }

        if self.metadata_store.max_keys == 0 {
            anyhow::bail!("metadata_store.max_keys must be positive");
        }

        if self.scheduler.interval.is_zero() {
            anyhow::bail!("scheduler.interval must be positive");
        }

        if self.worker.reconnect_delay.is_zero() {
            anyhow::bail!("worker.reconnect_delay must be positive");
        }

        if self.queue.topic.is_empty() {
            anyhow::bail!("queue.topic cannot be empty");
        }

        if self.queue.backend == QueueBackendKind::Memory && self.queue.capacity == 0 {
            anyhow::bail!("queue.capacity must be positive for the memory backend");
        }

        let required = [
            ("indexes.global_bucket_index_id", &self.indexes.global_bucket_index_id),
            (
                "indexes.global_bucket_index_id_replica",
                &self.indexes.global_bucket_index_id_replica,
            ),
            ("indexes.bucket_metadata_index_id", &self.indexes.bucket_metadata_index_id),
            (
                "indexes.bucket_metadata_index_id_replica",
                &self.indexes.bucket_metadata_index_id_replica,
            ),
            ("indexes.probable_delete_index_id", &self.indexes.probable_delete_index_id),
            ("indexes.object_metadata_index_id", &self.indexes.object_metadata_index_id),
        ];
        for (name, value) in required {
            if value.is_empty() {
                anyhow::bail!("{name} cannot be empty");
            }
        }

        Ok(())
    }
}
