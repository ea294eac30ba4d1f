//! Shared application state handed to every handler.

use crate::config::Config;
use crate::inference::{CompletionSource, HfClient};
use std::sync::Arc;

/// Immutable per-process state: configuration plus the inference client.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub completions: Arc<dyn CompletionSource>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let completions = Arc::new(HfClient::new(config.inference.clone()));
        Self::with_source(config, completions)
    }

    /// Use a specific completion source instead of the HTTP client.
    pub fn with_source(config: Config, completions: Arc<dyn CompletionSource>) -> Self {
        Self {
            config: Arc::new(config),
            completions,
        }
    }
}
