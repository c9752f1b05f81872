//! Row types matching the tables created by `migrations/`.

pub mod entity;
pub mod managed_webhook;
pub mod object_run;
pub mod sync_run;

pub use entity::{EntityKind, EntityRecord};
pub use managed_webhook::ManagedWebhook;
pub use object_run::{ObjectRun, ObjectRunStatus};
pub use sync_run::{SyncRun, SyncRunStatus};
