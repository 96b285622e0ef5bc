pub mod clock;
pub mod coverage;
pub mod in_memory;
pub mod registry;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
