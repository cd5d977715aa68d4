//! Timer/timeout utility implemented as a small ticker task plus channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::utils::PalisadeError;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Commands understood by the ticker task.
#[derive(Debug, Clone, Copy)]
enum TimerCmd {
    /// Start (or restart) the countdown with the given duration.
    Kickoff(Duration),

    /// Push an armed countdown's deadline further out by the given duration.
    Extend(Duration),

    /// Disarm the countdown without firing.
    Cancel,
}

/// Timer utility for signalling after a given timeout. The countdown can be
/// restarted, extended, or cancelled while armed. An explosion can be
/// awaited through `timeout()` (usable as a `tokio::select!` branch) and,
/// optionally, handed to a callback registered at creation time.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Sender side of the command channel to the ticker task.
    cmd_tx: mpsc::UnboundedSender<TimerCmd>,

    /// Receiver side of the explosion channel; the inner counter bumps
    /// once per explosion.
    fired_rx: watch::Receiver<u64>,

    /// True if the last armed countdown has fired and no kickoff or cancel
    /// has happened since; shared with the ticker task.
    exploded: Arc<AtomicBool>,

    /// Join handle of the ticker task.
    _ticker_handle: JoinHandle<()>,
}

impl Timer {
    /// Creates a new disarmed timer without an explosion callback.
    pub fn new() -> Self {
        Self::spawn(None)
    }

    /// Creates a new disarmed timer that additionally runs `explode_fn` on
    /// the ticker task every time the countdown fires.
    pub fn with_callback(explode_fn: impl Fn() + Send + 'static) -> Self {
        Self::spawn(Some(Box::new(explode_fn)))
    }

    fn spawn(explode_fn: Option<Box<dyn Fn() + Send + 'static>>) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (fired_tx, fired_rx) = watch::channel(0u64);
        let exploded = Arc::new(AtomicBool::new(false));
        let exploded_ref = exploded.clone();

        let ticker_handle = tokio::spawn(async move {
            // deadline is None whenever the timer is disarmed
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    // prefer draining queued commands over firing, so that a
                    // kickoff/cancel racing an explosion usually wins
                    biased;

                    cmd = cmd_rx.recv() => match cmd {
                        Some(TimerCmd::Kickoff(dur)) => {
                            exploded_ref.store(false, Ordering::Release);
                            deadline = Some(Instant::now() + dur);
                        }
                        Some(TimerCmd::Extend(dur)) => {
                            if let Some(d) = deadline {
                                deadline = Some(d + dur);
                            }
                        }
                        Some(TimerCmd::Cancel) => {
                            exploded_ref.store(false, Ordering::Release);
                            deadline = None;
                        }
                        None => break, // Timer struct dropped
                    },

                    _ = async { time::sleep_until(deadline.unwrap()).await },
                        if deadline.is_some() =>
                    {
                        deadline = None;
                        exploded_ref.store(true, Ordering::Release);
                        if let Some(explode_fn) = explode_fn.as_ref() {
                            explode_fn();
                        }
                        fired_tx.send_modify(|cnt| *cnt += 1);
                    }
                }
            }
        });

        Timer {
            cmd_tx,
            fired_rx,
            exploded,
            _ticker_handle: ticker_handle,
        }
    }

    /// Starts (or restarts) the countdown with the given duration, clearing
    /// any previous explosion flag.
    pub fn kickoff(&self, dur: Duration) -> Result<(), PalisadeError> {
        if dur.is_zero() {
            return Err(PalisadeError(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }
        Ok(self.cmd_tx.send(TimerCmd::Kickoff(dur))?)
    }

    /// Pushes an armed countdown's deadline further out by `dur`. Ignored
    /// if the timer is currently disarmed.
    pub fn extend(&self, dur: Duration) -> Result<(), PalisadeError> {
        if dur.is_zero() {
            return Err(PalisadeError(format!(
                "invalid extension duration {} ns",
                dur.as_nanos()
            )));
        }
        Ok(self.cmd_tx.send(TimerCmd::Extend(dur))?)
    }

    /// Disarms the countdown if armed; clears the explosion flag.
    pub fn cancel(&self) -> Result<(), PalisadeError> {
        Ok(self.cmd_tx.send(TimerCmd::Cancel)?)
    }

    /// True if the last armed countdown has fired (and no kickoff or cancel
    /// has been issued since). An explosion may be observable here slightly
    /// before the corresponding `timeout()` wakeup is processed.
    pub fn exploded(&self) -> bool {
        self.exploded.load(Ordering::Acquire)
    }

    /// Waits for the next explosion. Typically used as a `tokio::select!`
    /// branch; cancellation-safe in that an explosion missed while not
    /// being awaited stays observable by the next call.
    pub async fn timeout(&mut self) {
        if self.fired_rx.changed().await.is_err() {
            // ticker task went away unexpectedly; park instead of spinning
            std::future::pending::<()>().await;
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_fires() -> Result<(), PalisadeError> {
        let mut timer = Timer::new();
        assert!(timer.kickoff(Duration::ZERO).is_err());
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(150))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(timer.exploded());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), PalisadeError> {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(400))?;
        time::sleep(Duration::from_millis(100)).await;
        timer.kickoff(Duration::from_millis(200))?;
        timer.timeout().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_cancel() -> Result<(), PalisadeError> {
        let mut timer = Timer::new();
        timer.kickoff(Duration::from_millis(100))?;
        time::sleep(Duration::from_millis(30)).await;
        timer.cancel()?;
        assert!(time::timeout(Duration::from_millis(200), timer.timeout())
            .await
            .is_err());
        assert!(!timer.exploded());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_extend() -> Result<(), PalisadeError> {
        let mut timer = Timer::new();
        let start = Instant::now();
        timer.kickoff(Duration::from_millis(200))?;
        time::sleep(Duration::from_millis(50)).await;
        timer.extend(Duration::from_millis(200))?;
        timer.timeout().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_callback() -> Result<(), PalisadeError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = Timer::with_callback(move || {
            tx.send(()).expect("sending explosion mark should succeed");
        });
        timer.kickoff(Duration::from_millis(100))?;
        assert!(
            time::timeout(Duration::from_millis(300), rx.recv())
                .await?
                .is_some()
        );
        Ok(())
    }
}
