pub mod clock;
pub mod in_memory;
pub mod kv;
#[cfg(feature = "lock-redis")]
pub mod redis_lock;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod store;
