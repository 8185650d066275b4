//! Background GC worker and its adaptive sleep controller.
//!
//! One long-lived worker wakes on an adaptive interval, checks that the
//! I/O subsystem is quiet, and runs a background reclamation round. Busy
//! periods double the interval so freshly invalidated segments have time
//! to accumulate; a round that finds no victim parks the worker on the
//! long no-GC interval until a later round reclaims again.

use crate::{run_gc, GcOutcome, Mount};
use ember_error::{EmberError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace};

/// Shortest wait between background cycles.
pub const MIN_SLEEP: Duration = Duration::from_millis(10_000);
/// Longest wait between background cycles.
pub const MAX_SLEEP: Duration = Duration::from_millis(60_000);
/// Wait applied after a cycle that found nothing to reclaim.
pub const NOGC_SLEEP: Duration = Duration::from_millis(300_000);

/// Timing knobs for the background worker. Defaults match the on-device
/// tunables; tests shrink them.
#[derive(Debug, Clone)]
pub struct GcDaemonConfig {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    pub nogc_sleep: Duration,
}

impl Default for GcDaemonConfig {
    fn default() -> Self {
        Self {
            min_sleep: MIN_SLEEP,
            max_sleep: MAX_SLEEP,
            nogc_sleep: NOGC_SLEEP,
        }
    }
}

impl GcDaemonConfig {
    /// Check the invariants the sleep controller relies on.
    pub fn validate(self) -> Result<Self> {
        if self.min_sleep.is_zero() {
            return Err(EmberError::Config(
                "gc daemon min_sleep must be non-zero".to_owned(),
            ));
        }
        if self.min_sleep > self.max_sleep {
            return Err(EmberError::Config(
                "gc daemon min_sleep must not exceed max_sleep".to_owned(),
            ));
        }
        if self.nogc_sleep < self.max_sleep {
            return Err(EmberError::Config(
                "gc daemon nogc_sleep must not undercut max_sleep".to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Double the wait, clamped to the configured maximum.
#[must_use]
pub fn increase_sleep_time(config: &GcDaemonConfig, wait: Duration) -> Duration {
    (wait * 2).min(config.max_sleep)
}

/// Halve the wait, clamped to the configured minimum.
#[must_use]
pub fn decrease_sleep_time(config: &GcDaemonConfig, wait: Duration) -> Duration {
    (wait / 2).max(config.min_sleep)
}

#[derive(Debug)]
struct DaemonShared {
    stop: AtomicBool,
    freeze: AtomicBool,
    wait_ms: AtomicU64,
    wake_lock: Mutex<()>,
    wake_cv: Condvar,
}

impl DaemonShared {
    fn store_wait(&self, wait: Duration) {
        let ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        self.wait_ms.store(ms, Ordering::Release);
    }

    fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake_cv.notify_all();
    }
}

/// Handle for the running background GC worker.
///
/// `shutdown` (or drop) stops the worker and joins it.
#[derive(Debug)]
pub struct GcDaemon {
    shared: Arc<DaemonShared>,
    join: Option<JoinHandle<()>>,
}

impl GcDaemon {
    /// Request shutdown and block until the worker exits.
    pub fn shutdown(mut self) {
        self.signal_stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }

    fn signal_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.notify();
    }

    /// Host freeze signal: the worker parks until thawed.
    pub fn freeze(&self) {
        self.shared.freeze.store(true, Ordering::Release);
    }

    pub fn thaw(&self) {
        self.shared.freeze.store(false, Ordering::Release);
        self.shared.notify();
    }

    /// Prod the worker awake ahead of its timer.
    pub fn wakeup(&self) {
        self.shared.notify();
    }

    /// The wait interval currently in effect.
    #[must_use]
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.shared.wait_ms.load(Ordering::Acquire))
    }
}

impl Drop for GcDaemon {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the background GC worker.
pub fn start_gc_thread(mount: Arc<Mount>, config: GcDaemonConfig) -> Result<GcDaemon> {
    let config = config.validate()?;
    let shared = Arc::new(DaemonShared {
        stop: AtomicBool::new(false),
        freeze: AtomicBool::new(false),
        wait_ms: AtomicU64::new(u64::try_from(config.min_sleep.as_millis()).unwrap_or(u64::MAX)),
        wake_lock: Mutex::new(()),
        wake_cv: Condvar::new(),
    });
    let thread_shared = Arc::clone(&shared);

    let join = thread::Builder::new()
        .name("ember-gc".to_owned())
        .spawn(move || gc_thread_loop(&mount, &config, &thread_shared))
        .map_err(EmberError::from)?;

    info!(target: "ember::gc::daemon", event = "gc_thread_started");
    Ok(GcDaemon {
        shared,
        join: Some(join),
    })
}

fn gc_thread_loop(mount: &Mount, config: &GcDaemonConfig, shared: &DaemonShared) {
    let mut wait = config.min_sleep;

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        if shared.freeze.load(Ordering::Acquire) {
            let mut guard = shared.wake_lock.lock();
            shared
                .wake_cv
                .wait_for(&mut guard, Duration::from_millis(50));
            continue;
        }
        {
            let mut guard = shared.wake_lock.lock();
            shared.wake_cv.wait_for(&mut guard, wait);
        }
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        mount.checkpoint().balance_fs();

        if !mount.options().background_gc {
            continue;
        }

        // A round runs only when no other GC is in flight and the I/O
        // subsystem is idle; segments invalidated moments ago may gain
        // more invalid blocks if we wait, so busy periods back off.
        let Some(gc_lock) = mount.try_lock_gc() else {
            continue;
        };

        if !mount.is_idle() {
            wait = increase_sleep_time(config, wait);
            shared.store_wait(wait);
            drop(gc_lock);
            continue;
        }

        wait = if mount.seg().has_enough_invalid_blocks() {
            decrease_sleep_time(config, wait)
        } else {
            increase_sleep_time(config, wait)
        };

        mount.counters().inc_bg_gc();

        match run_gc(mount, gc_lock, 1) {
            Ok(GcOutcome::NoVictim) => {
                wait = config.nogc_sleep;
            }
            Ok(_) => {
                if wait == config.nogc_sleep {
                    wait = config.max_sleep;
                }
            }
            Err(err) => {
                error!(target: "ember::gc::daemon", event = "bg_gc_failed", error = %err);
                if wait == config.nogc_sleep {
                    wait = config.max_sleep;
                }
            }
        }
        shared.store_wait(wait);
        trace!(
            target: "ember::gc::daemon",
            event = "bg_gc_cycle",
            wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX)
        );
    }
    debug!(target: "ember::gc::daemon", event = "gc_thread_stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GcDaemonConfig {
        GcDaemonConfig::default()
    }

    #[test]
    fn test_increase_clamps_to_max() {
        let cfg = config();
        assert_eq!(
            increase_sleep_time(&cfg, Duration::from_millis(10_000)),
            Duration::from_millis(20_000)
        );
        assert_eq!(
            increase_sleep_time(&cfg, Duration::from_millis(40_000)),
            MAX_SLEEP
        );
        // Five increases from the ceiling stay at the ceiling.
        let mut wait = MAX_SLEEP;
        for _ in 0..5 {
            wait = increase_sleep_time(&cfg, wait);
            assert_eq!(wait, MAX_SLEEP);
        }
    }

    #[test]
    fn test_decrease_clamps_to_min() {
        let cfg = config();
        assert_eq!(
            decrease_sleep_time(&cfg, Duration::from_millis(60_000)),
            Duration::from_millis(30_000)
        );
        assert_eq!(
            decrease_sleep_time(&cfg, Duration::from_millis(12_000)),
            MIN_SLEEP
        );
        // Five decreases from the floor stay at the floor.
        let mut wait = MIN_SLEEP;
        for _ in 0..5 {
            wait = decrease_sleep_time(&cfg, wait);
            assert_eq!(wait, MIN_SLEEP);
        }
    }

    #[test]
    fn test_wait_stays_in_bounds() {
        // Any mixed sequence of controller steps lands in [MIN, MAX].
        let cfg = config();
        let mut wait = MIN_SLEEP;
        for round in 0..64_u32 {
            wait = if round % 3 == 0 {
                decrease_sleep_time(&cfg, wait)
            } else {
                increase_sleep_time(&cfg, wait)
            };
            assert!(wait >= MIN_SLEEP && wait <= MAX_SLEEP);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(GcDaemonConfig::default().validate().is_ok());
        assert!(GcDaemonConfig {
            min_sleep: Duration::ZERO,
            ..GcDaemonConfig::default()
        }
        .validate()
        .is_err());
        assert!(GcDaemonConfig {
            min_sleep: Duration::from_millis(200),
            max_sleep: Duration::from_millis(100),
            nogc_sleep: Duration::from_millis(300),
        }
        .validate()
        .is_err());
        assert!(GcDaemonConfig {
            min_sleep: Duration::from_millis(100),
            max_sleep: Duration::from_millis(200),
            nogc_sleep: Duration::from_millis(150),
        }
        .validate()
        .is_err());
    }
}
