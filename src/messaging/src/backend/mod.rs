pub mod jetstream;
pub mod memory;

pub use jetstream::{Credentials, JetStreamBackend};
pub use memory::InMemoryStreamingBackend;
