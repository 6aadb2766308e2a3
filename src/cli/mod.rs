pub mod app;
pub mod scenario;
