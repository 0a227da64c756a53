pub mod clock;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transition;
pub mod wal;
pub mod webhook;
