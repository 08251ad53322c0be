pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use error::KvError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{KeyedStore, LockToken};
