//! What the binary does once arguments are parsed.

use anyhow::Result;
use tracing::error;

use crate::cli::telemetry;

pub mod server;

/// The only action today is serving the HTTP API.
#[derive(Debug)]
pub enum Action {
    Server(server::Args),
}

impl Action {
    /// Run the action to completion, then flush pending spans.
    ///
    /// # Errors
    /// Returns an error if the server fails to start or stops with an error.
    pub async fn execute(self) -> Result<()> {
        let result = match self {
            Self::Server(args) => server::execute(args).await,
        };
        if let Err(err) = &result {
            error!("universal-auth stopped: {err:#}");
        }
        telemetry::shutdown_tracer();
        result
    }
}
