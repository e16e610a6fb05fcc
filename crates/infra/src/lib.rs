pub mod config;
pub mod logging;
pub mod metered_store;
pub mod observability;
pub mod services;
pub mod telemetry;
