//! # Connectivity
//!
//! Whether the backend is believed reachable right now. Sampled
//! synchronously at mutation time and by the reconnect agent.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Source of the current online/offline belief.
pub trait ConnectivityOracle: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Shared flag toggled by the host (network-change callbacks, a health-check task
/// or a test).
///
/// Clones observe the same flag.
#[derive(Clone)]
pub struct ConnectivityFlag {
    online: Arc<AtomicBool>,
}

impl ConnectivityFlag {
    pub fn new(online: bool) -> Self {
        ConnectivityFlag {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        ConnectivityFlag::new(true)
    }
}

impl fmt::Debug for ConnectivityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityFlag")
            .field("online", &self.is_online())
            .finish()
    }
}

impl ConnectivityOracle for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
