pub mod tracking_store;
pub use tracking_store::TrackingStore;
pub mod memory_store;
pub use memory_store::InMemoryTrackingStore;
pub mod tracking_repo;
pub use tracking_repo::PgTrackingRepository;
#[cfg(test)]
pub mod flaky_store;
