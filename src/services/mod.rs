pub mod channels;
pub mod delivery;
pub mod init;
pub mod queue;
pub mod rate_limiter;
pub mod retry;

pub use delivery::{DeliveryOptions, NotificationDeliveryService, ProcessQueueSummary};
pub use queue::{DeliveryQueue, InMemoryDeliveryQueue};
pub use rate_limiter::{RateLimitRule, RateLimiter};
pub use retry::{RetryConfiguration, RetryPolicies, RetrySettings};
