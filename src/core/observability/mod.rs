pub mod export;
mod provider;

pub use provider::{init, runtime_id, service_name, shutdown};
