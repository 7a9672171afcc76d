//! Accept HTTP connections and stream `heartbeat\n` to each one, once per
//! interval, until the client hangs up or the server shuts down.

mod config;
pub mod connection;
mod error;
mod server;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use connection::{StreamEnd, HEARTBEAT};
pub use error::Error;
pub use server::HeartbeatServer;

pub use tokio_util::sync::CancellationToken;
