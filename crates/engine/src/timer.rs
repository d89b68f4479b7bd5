// SPDX-FileCopyrightText: © 2025 AOSL Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Interval and one-shot timers that fire on a queue.
//!
//! A timer is a destroy-wait reference object. Every (re)scheduling bumps the
//! timer's epoch and arms a fresh deadline on the owning queue; armings with an
//! older epoch are ignored when they come due. That makes `resched`, `sched`
//! and `cancel` safe from any thread and guarantees no spurious fire from a
//! superseded schedule.
//!
//! One-shot expiry is relative to the scheduling call.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aosl_core::error::record;
use aosl_core::helpers::lock;
use aosl_core::refobj::{self, Access, RefId};
use aosl_core::{AoslError, Result};

use crate::constants::DEFAULT_TIMER_MIN_INTERVAL_MS;
use crate::mpq::{self, QueueId};
use crate::queue_messages::TimerEntry;
use crate::runtime;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(RefId);

impl TimerId {
    pub const fn ref_id(self) -> RefId {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer({})", self.0)
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Timing of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires every `interval` until canceled.
    Interval(Duration),
    /// Fires once, `delay` after scheduling.
    Oneshot(Duration),
}

type OnTimer = Box<dyn FnMut(Instant) + Send>;

struct Schedule {
    period: Duration,
    deadline: Option<Instant>,
    epoch: u64,
}

struct TimerState {
    name: &'static str,
    queue: QueueId,
    oneshot: bool,
    schedule: Mutex<Schedule>,
    on_timer: Mutex<OnTimer>,
}

impl TimerState {
    /// Arms the timer `delay` from now, superseding any earlier arming.
    fn arm(&self, id: TimerId, delay: Duration) -> Result<()> {
        let entry = {
            let mut schedule = lock(&self.schedule);
            schedule.epoch += 1;
            let deadline = Instant::now() + delay;
            schedule.deadline = Some(deadline);
            TimerEntry { deadline, timer: id.0, epoch: schedule.epoch }
        };
        mpq::shared(self.queue)?.arm(entry)
    }
}

fn min_interval() -> Duration {
    let ms = runtime::try_current()
        .map_or(DEFAULT_TIMER_MIN_INTERVAL_MS, |rt| rt.config().timer.min_interval_ms);
    Duration::from_millis(ms)
}

fn validate(period: Duration) -> Result<Duration> {
    if period.is_zero() {
        return Err(AoslError::InvalidArgument("timer interval must be non-zero".to_string()));
    }
    Ok(period.max(min_interval()))
}

/// Creates a timer on `queue`.
///
/// `on_timer` runs on `queue` with the firing instant. `on_drop` runs exactly
/// once when the timer is killed, after any in-flight fire has finished.
///
/// # Errors
///
/// Returns `InvalidQueue` for an unknown queue and `InvalidArgument` for a
/// zero interval or delay.
pub fn create<F, D>(
    queue: QueueId,
    name: &'static str,
    kind: TimerKind,
    active: bool,
    on_timer: F,
    on_drop: D,
) -> Result<TimerId>
where
    F: FnMut(Instant) + Send + 'static,
    D: FnOnce() + Send + 'static,
{
    record(create_inner(queue, name, kind, active, Box::new(on_timer), on_drop))
}

fn create_inner<D>(
    queue: QueueId,
    name: &'static str,
    kind: TimerKind,
    active: bool,
    on_timer: OnTimer,
    on_drop: D,
) -> Result<TimerId>
where
    D: FnOnce() + Send + 'static,
{
    mpq::shared(queue)?;
    let (oneshot, period) = match kind {
        TimerKind::Interval(interval) => (false, validate(interval)?),
        TimerKind::Oneshot(delay) => (true, validate(delay)?),
    };

    let state = TimerState {
        name,
        queue,
        oneshot,
        schedule: Mutex::new(Schedule { period, deadline: None, epoch: 0 }),
        on_timer: Mutex::new(on_timer),
    };
    let id = TimerId(refobj::create(state, move |_| on_drop(), true)?);

    if active {
        if let Err(err) = with_state(id, |state| state.arm(id, period)) {
            let _ = refobj::destroy(id.0, true);
            return Err(err);
        }
    }

    tracing::debug!(timer = %id, queue = %queue, name, ?kind, active, "timer created");
    Ok(id)
}

/// Creates and starts an interval timer.
///
/// # Errors
///
/// See [`create`].
pub fn set_timer<F>(queue: QueueId, name: &'static str, interval: Duration, on_timer: F) -> Result<TimerId>
where
    F: FnMut(Instant) + Send + 'static,
{
    create(queue, name, TimerKind::Interval(interval), true, on_timer, || {})
}

/// Creates and starts a one-shot timer.
///
/// # Errors
///
/// See [`create`].
pub fn set_oneshot<F>(queue: QueueId, name: &'static str, delay: Duration, on_timer: F) -> Result<TimerId>
where
    F: FnMut(Instant) + Send + 'static,
{
    create(queue, name, TimerKind::Oneshot(delay), true, on_timer, || {})
}

/// Creates an interval timer that stays idle until [`resched`].
///
/// # Errors
///
/// See [`create`].
pub fn create_timer<F>(queue: QueueId, name: &'static str, interval: Duration, on_timer: F) -> Result<TimerId>
where
    F: FnMut(Instant) + Send + 'static,
{
    create(queue, name, TimerKind::Interval(interval), false, on_timer, || {})
}

/// Creates a one-shot timer that stays idle until [`sched`].
///
/// # Errors
///
/// See [`create`].
pub fn create_oneshot<F>(queue: QueueId, name: &'static str, delay: Duration, on_timer: F) -> Result<TimerId>
where
    F: FnMut(Instant) + Send + 'static,
{
    create(queue, name, TimerKind::Oneshot(delay), false, on_timer, || {})
}

fn with_state<R>(id: TimerId, f: impl FnOnce(&TimerState) -> Result<R>) -> Result<R> {
    refobj::hold::<TimerState, _>(id.0, |access| match access {
        Access::Live(state) => f(state),
        Access::FreeOnly => Err(AoslError::InvalidRef(id.to_string())),
    })
}

/// Restarts an interval timer, optionally with a new interval.
///
/// The next fire happens one (new) interval from now; a fire that was due
/// under the old schedule is dropped.
///
/// # Errors
///
/// Returns `InvalidRef` for a killed timer and `InvalidArgument` for a
/// one-shot timer or a zero interval.
pub fn resched(id: TimerId, interval: Option<Duration>) -> Result<()> {
    record(with_state(id, |state| {
        if state.oneshot {
            return Err(AoslError::InvalidArgument(format!("{id} is one-shot, use sched")));
        }
        let period = match interval {
            Some(interval) => {
                let period = validate(interval)?;
                lock(&state.schedule).period = period;
                period
            },
            None => lock(&state.schedule).period,
        };
        state.arm(id, period)
    }))
}

/// Schedules a one-shot timer to fire `expire` from now.
///
/// # Errors
///
/// Returns `InvalidRef` for a killed timer and `InvalidArgument` for an
/// interval timer or a zero delay.
pub fn sched(id: TimerId, expire: Duration) -> Result<()> {
    record(with_state(id, |state| {
        if !state.oneshot {
            return Err(AoslError::InvalidArgument(format!("{id} is an interval timer, use resched")));
        }
        let delay = validate(expire)?;
        lock(&state.schedule).period = delay;
        state.arm(id, delay)
    }))
}

/// Stops future fires. A fire already running is not interrupted.
///
/// # Errors
///
/// Returns `InvalidRef` for a killed timer.
pub fn cancel(id: TimerId) -> Result<()> {
    record(with_state(id, |state| {
        let mut schedule = lock(&state.schedule);
        schedule.epoch += 1;
        schedule.deadline = None;
        Ok(())
    }))
}

/// Destroys the timer. Its drop callback runs exactly once, after any
/// in-flight fire completes. Killing a timer from its own callback is allowed.
///
/// # Errors
///
/// Returns `InvalidRef` if the timer was already killed.
pub fn kill(id: TimerId) -> Result<()> {
    refobj::destroy(id.0, true)
}

/// Interval of an interval timer, `None` for a one-shot timer.
///
/// # Errors
///
/// Returns `InvalidRef` for a killed timer.
pub fn interval(id: TimerId) -> Result<Option<Duration>> {
    record(with_state(id, |state| {
        Ok((!state.oneshot).then(|| lock(&state.schedule).period))
    }))
}

/// Whether a fire is scheduled.
///
/// # Errors
///
/// Returns `InvalidRef` for a killed timer.
pub fn is_active(id: TimerId) -> Result<bool> {
    record(with_state(id, |state| Ok(lock(&state.schedule).deadline.is_some())))
}

/// Fires a due arming. Returns the next arming for interval timers.
///
/// Runs on the owning queue's thread.
pub(crate) fn fire(entry: &TimerEntry, now: Instant) -> Option<TimerEntry> {
    refobj::hold::<TimerState, _>(entry.timer, |access| {
        let Access::Live(state) = access else {
            return None;
        };

        let rearm = {
            let mut schedule = lock(&state.schedule);
            if schedule.epoch != entry.epoch || schedule.deadline.is_none() {
                return None;
            }
            if state.oneshot {
                schedule.deadline = None;
                None
            } else {
                let mut next = entry.deadline + schedule.period;
                if next <= now {
                    // fell behind, skip the missed fires
                    next = now + schedule.period;
                }
                schedule.deadline = Some(next);
                Some(TimerEntry { deadline: next, ..*entry })
            }
        };

        tracing::trace!(timer = %entry.timer, name = state.name, "timer fired");
        let mut on_timer = lock(&state.on_timer);
        let callback = &mut *on_timer;
        callback(now);
        rearm
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(validate(Duration::ZERO), Err(AoslError::InvalidArgument(_))));
        assert!(validate(Duration::from_millis(5)).unwrap() >= Duration::from_millis(1));
    }

    #[test]
    fn test_create_on_unknown_queue_fails() {
        let gone = mpq::create("timer-unit-gone").unwrap();
        mpq::destroy(gone, true).unwrap();
        let err = set_timer(gone, "nowhere", Duration::from_millis(10), |_| {}).unwrap_err();
        assert!(matches!(err, AoslError::InvalidQueue(_)));
    }
}
