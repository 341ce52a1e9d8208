//! Application state shared across request handlers.

use std::sync::Arc;

use crate::scheduler::FleetScheduler;
use crate::store::Store;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    scheduler: FleetScheduler,
}

impl AppState {
    pub fn new(scheduler: FleetScheduler) -> Self {
        Self {
            inner: Arc::new(AppStateInner { scheduler }),
        }
    }

    pub fn scheduler(&self) -> &FleetScheduler {
        &self.inner.scheduler
    }

    /// Direct store access for read-only queries.
    pub fn store(&self) -> &Arc<dyn Store> {
        self.inner.scheduler.store()
    }
}
