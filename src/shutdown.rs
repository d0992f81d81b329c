//! Cooperative stop signal shared by the proxy and the scheduler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::Result;

/// Cloneable flag; once triggered it stays triggered.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Triggers on Ctrl-C, SIGTERM or SIGHUP.
    ///
    /// Only one handler may be installed per process; a second call fails.
    pub fn trigger_on_signal(&self) -> Result<()> {
        let shutdown = self.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutdown signal received, stopping gracefully");
            shutdown.trigger();
        })
        .map_err(std::io::Error::other)?;
        Ok(())
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
