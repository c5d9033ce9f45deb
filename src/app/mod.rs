pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod span;
pub mod workload;

pub use lifecycle::{context, shutdown, startup};
