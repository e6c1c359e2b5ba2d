pub mod container_manager;
pub mod disk_store;
pub mod lock_manager;
pub mod metadata_store;
pub mod replication;
pub mod resync;
pub mod storage_service;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;
