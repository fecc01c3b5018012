//! HTTP client for the Overpass API: owns the session and the per-client
//! slot semaphore, and orchestrates the try loop of [`run_query`](Client::run_query).

mod client;
mod config;

pub use client::Client;
pub use config::{default_user_agent, ClientConfig, ClientConfigBuilder, ClientConfigError, DEFAULT_INSTANCE};
pub use overpass_runner::QueryRunner;
pub use overpass_status::Status;
