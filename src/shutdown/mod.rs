use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Process-wide, monotonic shutdown flag passed explicitly to every loop.
///
/// Once triggered it stays triggered; clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownToken {
    triggered: Arc<AtomicBool>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` only for the call that actually flipped the flag.
    pub fn trigger(&self) -> bool {
        !self.triggered.swap(true, Ordering::SeqCst)
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Sleeps up to `timeout`, waking early on shutdown.
    /// Returns `false` when shutdown was observed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_triggered() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }
}

/// Adapter that routes SIGINT/SIGTERM into a [`ShutdownToken`].
pub struct ShutdownHooks {
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install(token: &ShutdownToken) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&token.triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&token.triggered))?;
            Ok(Self {
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            let _ = token;
            Ok(Self {})
        }
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
