pub mod backoff;
pub mod connector;

pub use backoff::Backoff;
pub use connector::{wait_for_stop, ConnectionState, UpstreamConnector, UpstreamHandle, UpstreamSettings};
