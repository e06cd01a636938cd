//! Standalone sync hub for one shared document.
//!
//! Configured entirely from `SCRIBE_*` environment variables; see
//! [`config`]. Log output is controlled with `RUST_LOG`.

mod config;

use std::process::ExitCode;

use log::{error, info, warn};
use scribe_collab::SyncServer;

use crate::config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if settings.credentials.is_empty() {
        warn!("{} is empty; every connection will be refused", config::TOKENS);
    }

    info!(
        "Starting hub for document {:?} ({:?}, {} credentials)",
        settings.server.document_id,
        settings.server.conflict_policy,
        settings.credentials.len()
    );

    let server = SyncServer::new(settings.server, settings.credentials);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
