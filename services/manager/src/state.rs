//! Application state shared across request handlers.

use std::sync::Arc;

use crate::Manager;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Manager>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { inner: manager }
    }

    pub fn manager(&self) -> &Manager {
        &self.inner
    }
}
