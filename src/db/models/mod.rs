//! Database models split into separate files.
//! Everything is re-exported at the `crate::db::models` namespace.

pub mod channel;
pub mod queued_notification;
pub mod retry_configuration;

pub use self::channel::*;
pub use self::queued_notification::*;
pub use self::retry_configuration::*;
