//! Webhook Router and Managed Endpoint Registry (spec.md §4.3, §4.4).

pub mod registry;
pub mod router;
pub mod signing;

pub use registry::Registry;
pub use router::Router;
