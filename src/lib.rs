//! Segmented memory-mapped cache behind a WebSocket byte-stream protocol.
//! Split out as a library so integration tests can drive a real server over
//! real sockets instead of only exercising its pieces in isolation.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod pool;
pub mod server;
pub mod stream_context;
pub mod stream_manager;
