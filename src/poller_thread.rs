//! A background thread that periodically refreshes the snapshot.
use std::{ops::ControlFlow, sync::mpsc::RecvTimeoutError, time::Duration};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between refreshes.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between refreshes. This helps to avoid
    /// multiple instances synchronizing and producing spiky load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A refresh poller thread.
///
/// The thread sleeps for a jittered interval, then calls `tick`. It exits when stopped, when the
/// stop channel disconnects, or when `tick` returns [`ControlFlow::Break`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the thread failed to start.
    pub fn start<F>(config: PollerThreadConfig, mut tick: F) -> std::io::Result<PollerThread>
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as we're only ever sending a stop command.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("flagent-poller".to_owned())
            .spawn(move || loop {
                let timeout = jitter(config.interval, config.jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        // Timed out. Time to refresh.
                    }
                    Ok(()) => {
                        log::debug!(target: "flagent", "poller thread received stop command");
                        return;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        log::debug!(target: "flagent", "poller thread received disconnected");
                        return;
                    }
                }

                if tick().is_break() {
                    log::debug!(target: "flagent", "poller thread has nothing left to refresh");
                    return;
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full (another stop command is already pending). Both can be ignored.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::{
        ops::ControlFlow,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::{PollerThread, PollerThreadConfig};

    fn fast_config() -> PollerThreadConfig {
        PollerThreadConfig::new()
            .with_interval(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let poller = {
            let ticks = ticks.clone();
            PollerThread::start(fast_config(), move || {
                ticks.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            })
            .unwrap()
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        poller.shutdown().unwrap();

        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown >= 3);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }

    #[test]
    fn exits_when_tick_breaks() {
        let poller = PollerThread::start(fast_config(), || ControlFlow::Break(())).unwrap();
        // Joins without a stop command having any effect on an already finished thread.
        poller.shutdown().unwrap();
    }

    #[test]
    fn panicking_tick_is_reported() {
        let ticked = Arc::new(AtomicBool::new(false));
        let poller = {
            let ticked = ticked.clone();
            PollerThread::start(fast_config(), move || {
                ticked.store(true, Ordering::SeqCst);
                panic!("tick failed")
            })
            .unwrap()
        };

        // Stopping before the first tick would exit cleanly.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ticked.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ticked.load(Ordering::SeqCst));
        assert!(poller.shutdown().is_err());
    }

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let result = super::jitter(interval, Duration::from_secs(30));
        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        assert_eq!(
            super::jitter(Duration::ZERO, Duration::from_secs(30)),
            Duration::ZERO
        );
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        assert_eq!(
            super::jitter(Duration::from_secs(30), Duration::ZERO),
            Duration::from_secs(30)
        );
    }
}
