//! Library crate for scan-stream-rs: a resilient client for a scan job's
//! event stream, aggregating it into a read model for terminal and HTTP views.
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod events;
pub mod feed;
pub mod history;
pub mod producer;
pub mod router;
pub mod server;
pub mod simulated;
pub mod transport;
pub mod types;
