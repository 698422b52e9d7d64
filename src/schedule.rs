//! Explicit timer table for the single-threaded engine
//!
//! All asynchrony in the core is timer-driven continuation: dwell-progress
//! ticks, the mutation debounce, and the auto-export interval. Timers are
//! plain table entries evaluated against timestamps supplied by the caller,
//! which keeps firing deterministic and cancellation explicit.

use chrono::{DateTime, Duration, Utc};

/// Cap on catch-up fires for one periodic entry in a single poll. A long gap
/// between ingested events would otherwise replay an unbounded tick history.
const MAX_CATCHUP_FIRES: usize = 1000;

/// Cancellation handle for a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// What a timer firing means to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTask {
    /// Periodic progress tick for an open viewing session
    DwellProgress { target: String },
    /// Quiet-period flush of the pending mutation queue
    DebounceFlush,
    /// Periodic metrics snapshot and export
    MetricsExport,
}

/// A due timer returned by `poll`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFire {
    pub id: TimerId,
    /// Name of the component that scheduled the timer
    pub owner: &'static str,
    pub task: TimerTask,
    /// The deadline the fire corresponds to (not the poll time)
    pub at: DateTime<Utc>,
}

struct TimerEntry {
    id: TimerId,
    owner: &'static str,
    task: TimerTask,
    due: DateTime<Utc>,
    period_ms: Option<i64>,
}

/// Timer table polled by the engine
#[derive(Default)]
pub struct Scheduler {
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a one-shot timer
    pub fn schedule_once(
        &mut self,
        owner: &'static str,
        task: TimerTask,
        due: DateTime<Utc>,
    ) -> TimerId {
        self.insert(owner, task, due, None)
    }

    /// Schedule a periodic timer; the first fire is one period after `now`
    pub fn schedule_interval(
        &mut self,
        owner: &'static str,
        task: TimerTask,
        now: DateTime<Utc>,
        period_ms: i64,
    ) -> TimerId {
        let due = now + Duration::milliseconds(period_ms);
        self.insert(owner, task, due, Some(period_ms))
    }

    fn insert(
        &mut self,
        owner: &'static str,
        task: TimerTask,
        due: DateTime<Utc>,
        period_ms: Option<i64>,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.entries.push(TimerEntry {
            id,
            owner,
            task,
            due,
            period_ms,
        });
        id
    }

    /// Push a timer's deadline forward (debounce reset); returns whether the
    /// timer is still live
    pub fn rearm(&mut self, id: TimerId, due: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.due = due;
                true
            }
            None => false,
        }
    }

    /// Cancel a timer; returns whether it was live
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Cancel every timer scheduled by `owner`; returns how many were dropped
    pub fn cancel_owned(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != owner);
        before - self.entries.len()
    }

    /// Cancel every timer
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Collect every fire due at or before `now`, ordered by deadline.
    /// Periodic timers fire once per elapsed period so consumers observe each
    /// scheduled tick; one-shot timers are removed when they fire.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Vec<TimerFire> {
        let mut fires = Vec::new();

        for entry in &mut self.entries {
            match entry.period_ms {
                Some(period_ms) => {
                    let period = Duration::milliseconds(period_ms);
                    let mut ticks = 0;
                    while entry.due <= now {
                        if ticks >= MAX_CATCHUP_FIRES {
                            log::warn!(
                                "timer {:?} owned by '{}' skipped ticks beyond catch-up cap",
                                entry.task,
                                entry.owner
                            );
                            entry.due = now + period;
                            break;
                        }
                        fires.push(TimerFire {
                            id: entry.id,
                            owner: entry.owner,
                            task: entry.task.clone(),
                            at: entry.due,
                        });
                        entry.due += period;
                        ticks += 1;
                    }
                }
                None => {
                    if entry.due <= now {
                        fires.push(TimerFire {
                            id: entry.id,
                            owner: entry.owner,
                            task: entry.task.clone(),
                            at: entry.due,
                        });
                    }
                }
            }
        }

        // One-shot entries are spent once collected
        self.entries
            .retain(|e| e.period_ms.is_some() || e.due > now);

        fires.sort_by_key(|f| (f.at, f.id.0));
        fires
    }

    /// Number of live timers
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Earliest live deadline
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|e| e.due).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, sec).unwrap()
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_once("mutations", TimerTask::DebounceFlush, at(1));

        assert!(scheduler.poll(at(0)).is_empty());
        let fires = scheduler.poll(at(2));
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].task, TimerTask::DebounceFlush);
        assert!(scheduler.poll(at(3)).is_empty());
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_interval_fires_each_period() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_interval(
            "visibility",
            TimerTask::DwellProgress {
                target: "hero".to_string(),
            },
            at(0),
            1000,
        );

        // Three seconds elapse: ticks at 1s, 2s and 3s are all observed
        let fires = scheduler.poll(at(3));
        assert_eq!(fires.len(), 3);
        assert_eq!(fires[0].at, at(1));
        assert_eq!(fires[1].at, at(2));
        assert_eq!(fires[2].at, at(3));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_cancel_prevents_fire() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.schedule_once("mutations", TimerTask::DebounceFlush, at(1));

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(scheduler.poll(at(5)).is_empty());
    }

    #[test]
    fn test_rearm_pushes_deadline() {
        let mut scheduler = Scheduler::new();
        let id = scheduler.schedule_once("mutations", TimerTask::DebounceFlush, at(1));

        assert!(scheduler.rearm(id, at(4)));
        assert!(scheduler.poll(at(2)).is_empty());
        assert_eq!(scheduler.poll(at(4)).len(), 1);
    }

    #[test]
    fn test_cancel_owned_drops_all_of_owner() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_interval(
            "visibility",
            TimerTask::DwellProgress {
                target: "a".to_string(),
            },
            at(0),
            1000,
        );
        scheduler.schedule_interval(
            "visibility",
            TimerTask::DwellProgress {
                target: "b".to_string(),
            },
            at(0),
            1000,
        );
        scheduler.schedule_once("mutations", TimerTask::DebounceFlush, at(1));

        assert_eq!(scheduler.cancel_owned("visibility"), 2);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn test_fires_ordered_by_deadline() {
        let mut scheduler = Scheduler::new();
        scheduler.schedule_once("engine", TimerTask::MetricsExport, at(3));
        scheduler.schedule_once("mutations", TimerTask::DebounceFlush, at(1));

        let fires = scheduler.poll(at(5));
        assert_eq!(fires[0].task, TimerTask::DebounceFlush);
        assert_eq!(fires[1].task, TimerTask::MetricsExport);
    }
}
