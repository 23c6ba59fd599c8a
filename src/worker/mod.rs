pub mod connection;
pub mod health;
pub mod upstream;

pub use connection::{Connection, ConnectionState, WorkerStatus};
pub use upstream::{UpstreamClient, UpstreamError};
