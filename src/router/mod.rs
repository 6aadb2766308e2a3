#![allow(clippy::module_inception)]
pub mod config;
pub mod options;
pub mod router;
pub mod session;

pub use config::RouterConfig;
pub use options::AggregateOptions;
pub use router::Router;
pub use session::RetrySession;
