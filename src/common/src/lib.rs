pub mod cli;
pub mod config;
pub mod records;
pub mod shutdown;
pub mod storage;
pub mod store;

pub use shutdown::Shutdown;
pub use store::{MetadataStore, StoreError};
