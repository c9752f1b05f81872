pub mod entities;
pub mod managed_webhooks;
pub mod object_runs;
pub mod sync_runs;

pub use entities::Entities;
pub use managed_webhooks::ManagedWebhooks;
pub use object_runs::ObjectRuns;
pub use sync_runs::SyncRuns;
