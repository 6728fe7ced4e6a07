//! Dual-timer abort coordination.
//!
//! A [`TimeoutAbort`] owns a single [`AbortSignal`] and up to two timers which
//! may fire it: a one-shot lifespan timer, started at construction, and an
//! idle timer which is re-armed on every call to [`TimeoutAbort::reset_timeout`].
//! Whichever trigger wins cancels the other, and the signal fires at most once.
//!
//! Timers run as Tokio tasks, so a coordinator with a non-zero lifespan, or an
//! idle timer with a non-zero duration, must be armed from within a Tokio runtime.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// The cancellation signal shared by everything taking part in an exchange.
///
/// Once fired, a signal stays fired. Clones observe the same signal.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Has the signal fired?
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A future which resolves once the signal fires.
    pub fn aborted(&self) -> Aborted {
        Aborted {
            inner: Box::pin(self.token.clone().cancelled_owned()),
        }
    }

    fn fire(&self) {
        self.token.cancel();
    }
}

/// Future returned by [`AbortSignal::aborted`].
pub struct Aborted {
    inner: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl fmt::Debug for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aborted").finish()
    }
}

impl Future for Aborted {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// The stage of an exchange which armed the idle timer.
///
/// Stages are ordered: a later stage may take the idle timer over from an
/// earlier one, but never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Waiting for the response head, with no streamed upload to drive resets.
    Exchange,

    /// Sending a streamed request body.
    Upload,

    /// Reading the response body.
    Response,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Exchange => f.write_str("exchange"),
            Phase::Upload => f.write_str("upload"),
            Phase::Response => f.write_str("response"),
        }
    }
}

/// Observable state of the idle timer on a [`TimeoutAbort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// No idle timer is pending.
    Idle,

    /// An idle timer is pending, armed by the given phase.
    Armed(Phase),

    /// The coordinator has fired. Nothing can be armed again.
    Aborted,
}

/// Which trigger caused the abort, for logging.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Lifespan,
    Idle,
    Explicit,
}

/// The pending idle deadline and the phase which armed it.
struct IdleTimer {
    deadline: Instant,
    phase: Phase,
}

#[derive(Default)]
struct Timers {
    lifespan: Option<JoinHandle<()>>,
    idle: Option<IdleTimer>,
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    signal: AbortSignal,
    aborted: AtomicBool,
    timers: Mutex<Timers>,

    /// Wakes the idle driver when the deadline moves earlier.
    rearm: Arc<Notify>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.timers.get_mut().driver.take() {
            handle.abort();
        }
    }
}

impl Inner {
    /// The one transition to the aborted state. Returns `false` if some other
    /// trigger already won.
    fn fire(&self, trigger: Trigger) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let (lifespan, driver) = {
            let mut timers = self.timers.lock();
            timers.idle = None;
            (timers.lifespan.take(), timers.driver.take())
        };

        if let Some(handle) = lifespan {
            handle.abort();
        }

        if let Some(handle) = driver {
            handle.abort();
        }

        tracing::debug!(timeout.trigger = ?trigger, "aborting");
        self.signal.fire();
        true
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.timers.lock().idle.as_ref().map(|idle| idle.deadline)
    }

    /// Fire the idle trigger if its deadline has passed. Returns `false` when
    /// the timer was cleared or pushed back in the meantime.
    fn fire_idle(&self) -> bool {
        {
            let mut timers = self.timers.lock();
            match timers.idle {
                Some(ref idle) if idle.deadline <= Instant::now() => timers.idle = None,
                _ => return false,
            }
        }

        self.fire(Trigger::Idle);
        true
    }

    fn fire_lifespan(&self) {
        self.timers.lock().lifespan = None;
        self.fire(Trigger::Lifespan);
    }
}

/// Drives the idle timer for one coordinator.
///
/// Resets only move the shared deadline. The sleep is re-armed when it
/// wakes early, and the task is notified only when a deadline moves earlier.
/// The coordinator is held weakly between wakes; dropping the last handle
/// aborts the driver.
async fn drive_idle(inner: Weak<Inner>, rearm: Arc<Notify>) {
    let sleep = tokio::time::sleep_until(Instant::now());
    tokio::pin!(sleep);

    loop {
        let deadline = {
            let Some(inner) = inner.upgrade() else {
                return;
            };

            match inner.idle_deadline() {
                Some(deadline) if deadline <= Instant::now() => {
                    if inner.fire_idle() {
                        return;
                    }
                    continue;
                }
                deadline => deadline,
            }
        };

        match deadline {
            Some(deadline) => {
                sleep.as_mut().reset(deadline);
                tokio::select! {
                    _ = &mut sleep => {}
                    _ = rearm.notified() => {}
                }
            }
            None => rearm.notified().await,
        }
    }
}

/// Coordinates a lifespan timeout and an idle timeout over one [`AbortSignal`].
///
/// `TimeoutAbort` is a cheap handle; clones share the same signal and timers.
#[derive(Clone)]
pub struct TimeoutAbort {
    inner: Arc<Inner>,
}

impl fmt::Debug for TimeoutAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutAbort")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for TimeoutAbort {
    fn default() -> Self {
        Self::new(None)
    }
}

impl TimeoutAbort {
    /// Create a coordinator, starting the lifespan timer if one is given.
    ///
    /// A zero lifespan has already elapsed, so the coordinator is returned
    /// aborted. No idle timer is started here.
    pub fn new(lifespan: Option<Duration>) -> Self {
        let abort = Self {
            inner: Arc::new(Inner {
                signal: AbortSignal::new(),
                aborted: AtomicBool::new(false),
                timers: Mutex::new(Timers::default()),
                rearm: Arc::new(Notify::new()),
            }),
        };

        match lifespan {
            Some(lifespan) if lifespan.is_zero() => {
                abort.inner.fire(Trigger::Lifespan);
            }
            Some(lifespan) => {
                tracing::trace!(timeout.ms = lifespan.as_millis() as u64, "arming lifespan timer");
                let deadline = Instant::now() + lifespan;
                let inner = abort.inner.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep_until(deadline).await;
                    inner.fire_lifespan();
                });

                let mut timers = abort.inner.timers.lock();
                if abort.inner.aborted.load(Ordering::Acquire) {
                    handle.abort();
                } else {
                    timers.lifespan = Some(handle);
                }
            }
            None => {}
        }

        abort
    }

    /// The cancellation signal driven by this coordinator.
    pub fn signal(&self) -> &AbortSignal {
        &self.inner.signal
    }

    /// Has this coordinator fired?
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::Acquire)
    }

    /// The current idle timer state.
    pub fn state(&self) -> TimerState {
        if self.is_aborted() {
            return TimerState::Aborted;
        }

        match self.inner.timers.lock().idle {
            Some(ref idle) => TimerState::Armed(idle.phase),
            None => TimerState::Idle,
        }
    }

    /// Arm the idle timer for `timeout`, replacing any pending idle timer.
    ///
    /// Returns `false` when the coordinator has already fired, in which case no
    /// timer is scheduled.
    pub fn reset_timeout(&self, timeout: Duration) -> bool {
        self.arm(Phase::Exchange, timeout, true)
    }

    /// Cancel the pending idle timer, if any.
    ///
    /// The lifespan timer and the aborted state are left untouched.
    pub fn clear_timeout(&self) {
        self.disarm(None);
    }

    /// Abort immediately, cancelling both timers and firing the signal.
    ///
    /// Aborting an aborted coordinator does nothing.
    pub fn abort(&self) {
        self.inner.fire(Trigger::Explicit);
    }

    /// Arm the idle timer on behalf of `phase`.
    ///
    /// The timer is only taken over when it is unowned or owned by the same
    /// or an earlier phase.
    pub(crate) fn reset_for(&self, phase: Phase, timeout: Duration) -> bool {
        self.arm(phase, timeout, false)
    }

    /// Cancel the idle timer, but only when `phase` or an earlier phase armed it.
    pub(crate) fn clear_for(&self, phase: Phase) {
        self.disarm(Some(phase));
    }

    fn arm(&self, phase: Phase, timeout: Duration, force: bool) -> bool {
        let mut timers = self.inner.timers.lock();

        // Read under the lock: `fire` clears the timers after winning the
        // exchange, so a driver installed here is cancelled by it.
        if self.inner.aborted.load(Ordering::Acquire) {
            return false;
        }

        if let Some(ref idle) = timers.idle {
            if !force && idle.phase > phase {
                tracing::trace!(
                    timeout.phase = %phase,
                    timeout.owner = %idle.phase,
                    "idle timer owned by a later phase"
                );
                return false;
            }
        }

        if timeout.is_zero() {
            timers.idle = None;
            drop(timers);
            self.inner.fire(Trigger::Idle);
            return true;
        }

        let deadline = Instant::now() + timeout;
        let earlier = timers
            .idle
            .as_ref()
            .map_or(true, |idle| deadline < idle.deadline);
        timers.idle = Some(IdleTimer { deadline, phase });

        if timers.driver.is_none() {
            let driver = drive_idle(Arc::downgrade(&self.inner), self.inner.rearm.clone());
            timers.driver = Some(tokio::spawn(driver));
        } else if earlier {
            self.inner.rearm.notify_one();
        }

        tracing::trace!(
            timeout.phase = %phase,
            timeout.ms = timeout.as_millis() as u64,
            "armed idle timer"
        );
        true
    }

    fn disarm(&self, phase: Option<Phase>) {
        let mut timers = self.inner.timers.lock();
        let owned = match (&timers.idle, phase) {
            (None, _) => return,
            (Some(_), None) => true,
            (Some(idle), Some(phase)) => idle.phase <= phase,
        };

        if owned {
            if let Some(idle) = timers.idle.take() {
                tracing::trace!(timeout.phase = %idle.phase, "cleared idle timer");
            }
        }
    }
}
