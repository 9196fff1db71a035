//! Timer ticks and alarms.
//!
//! Sleeping threads wait on per-alarm conditions kept in a list sorted by
//! wake time. `mtimecmp` always holds the earlier of the next periodic
//! tick and the earliest alarm deadline; the timer interrupt broadcasts
//! every alarm whose deadline has passed and re-arms the comparator.

use crate::sync::Condition;
use crate::thread::{ThreadManager, Tid};
use ember_machine::devices::clint::{CLINT_BASE, MTIME, MTIMECMP};
use ember_machine::{Memory, PhysAddr, TIMER_FREQ};
use log::debug;

/// Periodic tick rate while any thread is sleeping.
pub const TICK_FREQ: u64 = 50;
pub const TICK_PERIOD: u64 = TIMER_FREQ / TICK_FREQ;

/// One sleeping thread: its wake-up condition and absolute wake time in
/// mtime ticks.
pub struct Alarm {
    pub cond: Condition,
    pub twake: u64,
}

pub fn get_mtime(mem: &mut dyn Memory) -> u64 {
    mem.read_dword(PhysAddr::new(CLINT_BASE + MTIME))
        .expect("mtime unreadable")
}

fn set_mtime(mem: &mut dyn Memory, val: u64) {
    mem.write_dword(PhysAddr::new(CLINT_BASE + MTIME), val)
        .expect("mtime unwritable")
}

fn set_mtimecmp(mem: &mut dyn Memory, val: u64) {
    mem.write_dword(PhysAddr::new(CLINT_BASE + MTIMECMP), val)
        .expect("mtimecmp unwritable")
}

pub struct Timer {
    sleep_list: Vec<Alarm>,
    next_tick: u64,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            sleep_list: Vec::new(),
            next_tick: TICK_PERIOD,
        }
    }

    pub fn init(&mut self, mem: &mut dyn Memory) {
        set_mtime(mem, 0);
        self.next_tick = TICK_PERIOD;
        set_mtimecmp(mem, self.next_tick);
    }

    pub fn sleeper_count(&self) -> usize {
        self.sleep_list.len()
    }

    /// Earliest pending wake time, if any thread is sleeping.
    pub fn earliest_wake(&self) -> Option<u64> {
        self.sleep_list.first().map(|al| al.twake)
    }

    /// Put the current thread to sleep for `ticks` mtime ticks
    /// (saturating). The caller must already have arranged the thread's
    /// saved context for resumption. Returns false when the deadline has
    /// effectively already passed and the thread was not suspended.
    pub fn alarm_sleep(
        &mut self,
        threads: &mut ThreadManager,
        mem: &mut dyn Memory,
        cpu: &ember_machine::Cpu,
        ticks: u64,
    ) -> bool {
        let now = get_mtime(mem);
        let twake = now.saturating_add(ticks);
        if twake <= now {
            return false;
        }

        let tid = threads.current();
        let mut alarm = Alarm {
            cond: Condition::new("alarm"),
            twake,
        };
        threads.condition_wait(&mut alarm.cond, cpu);
        debug!("[{now}] thread {tid} sleeping until {twake}");

        // Keep the list sorted by wake time; re-arm the comparator when
        // this becomes the earliest deadline.
        let at = self
            .sleep_list
            .iter()
            .position(|al| twake <= al.twake)
            .unwrap_or(self.sleep_list.len());
        self.sleep_list.insert(at, alarm);
        if at == 0 && twake < self.next_tick {
            set_mtimecmp(mem, twake);
        }
        true
    }

    /// Drop a thread from any alarm it is waiting on (its process was
    /// terminated from outside).
    pub fn remove_waiter(&mut self, tid: Tid) {
        for alarm in &mut self.sleep_list {
            alarm.cond.waiters.retain(|&t| t != tid);
        }
        self.sleep_list.retain(|al| al.cond.has_waiters());
    }

    /// Timer interrupt: wake the expired prefix of the sleep list and
    /// re-arm the comparator for the next tick or deadline.
    pub fn intr_handler(&mut self, mem: &mut dyn Memory, threads: &mut ThreadManager) {
        let now = get_mtime(mem);

        while let Some(alarm) = self.sleep_list.first_mut() {
            if alarm.twake > now {
                break;
            }
            let mut alarm = self.sleep_list.remove(0);
            debug!("[{now}] alarm due at {} fired", alarm.twake);
            threads.condition_broadcast(&mut alarm.cond);
        }

        while self.next_tick <= now {
            self.next_tick += TICK_PERIOD;
        }

        match self.earliest_wake() {
            Some(twake) if twake < self.next_tick => set_mtimecmp(mem, twake),
            _ => set_mtimecmp(mem, self.next_tick),
        }
    }

    /// Idle support: advance `mtime` straight to the earliest deadline
    /// (the hosted equivalent of the idle thread's `wfi`).
    pub fn fast_forward(&mut self, mem: &mut dyn Memory) -> bool {
        let Some(twake) = self.earliest_wake() else {
            return false;
        };
        if get_mtime(mem) < twake {
            set_mtime(mem, twake);
        }
        true
    }
}
