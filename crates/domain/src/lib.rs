pub mod chat;
pub mod collaborations;
pub mod config;
pub mod connections;
pub mod error;
pub mod memory_store;
pub mod notifications;
pub mod pagination;
pub mod ports;
pub mod query_builder;
pub mod realtime;
pub mod trades;
pub mod users;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
