pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod host;
pub mod node;
pub mod shutdown;
pub mod sse;
pub mod volume;
