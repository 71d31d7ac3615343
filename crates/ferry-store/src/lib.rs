pub mod error;
pub mod links;
pub mod locks;
pub mod seen;
pub mod store;

pub use error::StoreError;
pub use links::{LinkTable, RoomLink};
pub use locks::{KeyLocks, Keyspace};
pub use seen::SeenEvents;
pub use store::{Bucket, Store};
