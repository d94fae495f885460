pub mod delivery_queue_repository;
pub mod retry_configuration_repository;

pub use delivery_queue_repository::SqliteDeliveryQueue;
pub use retry_configuration_repository::RetryConfigurationRepository;
