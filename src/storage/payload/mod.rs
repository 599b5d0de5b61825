pub mod local;
pub mod object;

pub use local::LocalPayloadStore;
pub use object::ObjectPayloadStore;
