pub mod redb_store;
pub mod redis_store;

pub use redb_store::RedbMetadataStore;
pub use redis_store::RedisMetadataStore;
