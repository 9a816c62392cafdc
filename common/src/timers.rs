use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::debug;

use crate::config::{DeviceConfig, LightingProgram};

/// Provisioning gives up and restarts after this long without credentials.
pub const ACCESS_POINT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Heartbeat,
    PwmStep,
    PwmRandomize,
    AccessPoint,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Heartbeat,
        TimerKind::PwmStep,
        TimerKind::PwmRandomize,
        TimerKind::AccessPoint,
    ];

    fn index(self) -> usize {
        match self {
            TimerKind::Heartbeat => 0,
            TimerKind::PwmStep => 1,
            TimerKind::PwmRandomize => 2,
            TimerKind::AccessPoint => 3,
        }
    }
}

/// One flag per timer kind. Timer contexts raise, the tick consumes.
#[derive(Debug, Clone, Default)]
pub struct PendingWork {
    flags: Arc<[AtomicBool; 4]>,
}

impl PendingWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, kind: TimerKind) -> DueSignal {
        DueSignal {
            flags: Arc::clone(&self.flags),
            kind,
        }
    }

    /// Clears the flag and reports whether it was raised.
    pub fn take(&self, kind: TimerKind) -> bool {
        self.flags[kind.index()].swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.flags[kind.index()].load(Ordering::Acquire)
    }

    pub fn clear(&self, kind: TimerKind) {
        self.flags[kind.index()].store(false, Ordering::Release);
    }
}

/// Raise-only handle to one flag, safe to move into a timer callback.
#[derive(Debug, Clone)]
pub struct DueSignal {
    flags: Arc<[AtomicBool; 4]>,
    kind: TimerKind,
}

impl DueSignal {
    pub fn raise(&self) {
        self.flags[self.kind.index()].store(true, Ordering::Release);
    }

    pub fn kind(&self) -> TimerKind {
        self.kind
    }
}

pub trait TimerDriver: Send {
    /// Starts (or restarts) a periodic timer raising `signal` every `period`.
    fn arm(&mut self, kind: TimerKind, period: Duration, signal: DueSignal);
    fn disarm(&mut self, kind: TimerKind);
    /// Drivers backed by real timer contexts leave this empty.
    fn poll(&mut self, _now_ms: u64) {}
    /// Earliest deadline the tick loop has to wake for, if the driver
    /// depends on being polled.
    fn next_due_ms(&self) -> Option<u64> {
        None
    }
}

/// How long the tick loop may idle before the next deadline, capped at
/// `ceiling`. Zero means a timer is due now.
pub fn idle_until(next_due_ms: Option<u64>, now_ms: u64, ceiling: Duration) -> Duration {
    match next_due_ms {
        Some(due) => Duration::from_millis(due.saturating_sub(now_ms)).min(ceiling),
        None => ceiling,
    }
}

struct PolledSlot {
    period_ms: u64,
    next_due_ms: Option<u64>,
    signal: DueSignal,
}

/// Deadline-based timers checked from the tick loop.
///
/// A freshly armed timer is anchored at the first `poll` after arming.
#[derive(Default)]
pub struct PolledTimers {
    slots: [Option<PolledSlot>; 4],
}

impl PolledTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].is_some()
    }
}

impl TimerDriver for PolledTimers {
    fn arm(&mut self, kind: TimerKind, period: Duration, signal: DueSignal) {
        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX).max(1);
        self.slots[kind.index()] = Some(PolledSlot {
            period_ms,
            next_due_ms: None,
            signal,
        });
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.slots[kind.index()] = None;
    }

    fn poll(&mut self, now_ms: u64) {
        for slot in self.slots.iter_mut().flatten() {
            let Some(due) = slot.next_due_ms else {
                slot.next_due_ms = Some(now_ms.saturating_add(slot.period_ms));
                continue;
            };
            if now_ms < due {
                continue;
            }
            slot.signal.raise();
            let next = due.saturating_add(slot.period_ms);
            slot.next_due_ms = Some(if next <= now_ms {
                now_ms.saturating_add(slot.period_ms)
            } else {
                next
            });
        }
    }

    // An unanchored slot wants the very next poll.
    fn next_due_ms(&self) -> Option<u64> {
        self.slots
            .iter()
            .flatten()
            .map(|slot| slot.next_due_ms.unwrap_or(0))
            .min()
    }
}

/// Owns the timer driver and the pending-work flags it feeds.
pub struct TaskScheduler {
    driver: Box<dyn TimerDriver>,
    pending: PendingWork,
}

impl TaskScheduler {
    pub fn new(driver: Box<dyn TimerDriver>) -> Self {
        Self {
            driver,
            pending: PendingWork::new(),
        }
    }

    pub fn pending(&self) -> &PendingWork {
        &self.pending
    }

    pub fn take(&self, kind: TimerKind) -> bool {
        self.pending.take(kind)
    }

    pub fn poll(&mut self, now_ms: u64) {
        self.driver.poll(now_ms);
    }

    pub fn next_due_ms(&self) -> Option<u64> {
        self.driver.next_due_ms()
    }

    pub fn arm_boot(&mut self, config: &DeviceConfig) {
        self.rearm_heartbeat(config);
        self.rearm_animation(config);
    }

    pub fn rearm_heartbeat(&mut self, config: &DeviceConfig) {
        let period = Duration::from_secs(u64::from(config.heartbeat_interval_s));
        self.arm(TimerKind::Heartbeat, period);
    }

    /// Re-arms the step timer and arms or disarms randomize per program.
    pub fn rearm_animation(&mut self, config: &DeviceConfig) {
        let step = Duration::from_millis(u64::from(config.pwm_adjustment_speed_ms));
        self.arm(TimerKind::PwmStep, step);

        match config.program() {
            LightingProgram::Randomize => {
                let change = Duration::from_secs(u64::from(config.pwm_change_speed_s));
                self.arm(TimerKind::PwmRandomize, change);
            }
            LightingProgram::Manual => self.disarm(TimerKind::PwmRandomize),
        }
    }

    pub fn enter_provisioning(&mut self) {
        self.disarm(TimerKind::Heartbeat);
        self.arm(TimerKind::AccessPoint, ACCESS_POINT_TIMEOUT);
    }

    fn arm(&mut self, kind: TimerKind, period: Duration) {
        debug!("arming {kind:?} every {period:?}");
        let signal = self.pending.signal(kind);
        self.driver.arm(kind, period, signal);
    }

    fn disarm(&mut self, kind: TimerKind) {
        self.driver.disarm(kind);
        self.pending.clear(kind);
    }
}
