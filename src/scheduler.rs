use crate::error::ClockError;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Upper bound on simultaneously pending timers per subsystem clock.
pub const MAX_TIMERS: usize = 64;

const_assert!(MAX_TIMERS >= 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTimer<K> {
    pub id: TimerId,
    pub key: K,
    pub due_at: u64,
    pub period_ms: Option<u64>,
    pub scheduled_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClockStats {
    pub total_scheduled: u32,
    pub total_fired: u32,
    pub total_cancelled: u32,
    pub currently_pending: u8,
}

/// Virtual millisecond clock driving one subsystem's periodic and one-shot work.
///
/// Timers are kept sorted by due time, then by arming order, so two timers
/// due at the same instant fire in the order they were scheduled. Handlers
/// pull due timers one at a time with [`ScheduledClock::pop_due`], which lets
/// a handler cancel or arm timers before the next one is considered.
#[derive(Debug)]
pub struct ScheduledClock<K> {
    timers: Vec<ScheduledTimer<K>, MAX_TIMERS>,
    stats: ClockStats,
    now_ms: u64,
    next_id: u64,
}

impl<K: Clone + PartialEq> ScheduledClock<K> {
    pub fn new() -> Self {
        Self {
            timers: Vec::new(),
            stats: ClockStats::default(),
            now_ms: 0,
            next_id: 1,
        }
    }

    /// Arm a timer that fires once, `delay_ms` after the current clock time.
    pub fn schedule_once(&mut self, key: K, delay_ms: u64) -> Result<TimerId, ClockError> {
        self.insert(key, self.now_ms.saturating_add(delay_ms), None)
    }

    /// Arm a timer that fires every `period_ms`, first one period from now.
    pub fn schedule_every(&mut self, key: K, period_ms: u64) -> Result<TimerId, ClockError> {
        if period_ms == 0 {
            return Err(ClockError::ZeroPeriod);
        }
        self.insert(key, self.now_ms.saturating_add(period_ms), Some(period_ms))
    }

    fn insert(&mut self, key: K, due_at: u64, period_ms: Option<u64>) -> Result<TimerId, ClockError> {
        if self.timers.is_full() {
            return Err(ClockError::QueueFull { capacity: MAX_TIMERS });
        }

        let id = TimerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let timer = ScheduledTimer {
            id,
            key,
            due_at,
            period_ms,
            scheduled_at: self.now_ms,
        };

        // heapless::Vec::push then re-sort keeps chronological order; ids break ties
        let _ = self.timers.push(timer);
        self.timers.sort_by_key(|t| (t.due_at, t.id.0));

        self.stats.total_scheduled += 1;
        self.stats.currently_pending = self.timers.len() as u8;

        Ok(id)
    }

    /// Cancel every pending timer carrying `key`. Returns how many were removed.
    pub fn cancel(&mut self, key: &K) -> usize {
        let before = self.timers.len();
        self.timers.retain(|t| t.key != *key);
        let removed = before - self.timers.len();

        self.stats.total_cancelled += removed as u32;
        self.stats.currently_pending = self.timers.len() as u8;
        removed
    }

    pub fn cancel_id(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|t| t.id == id) {
            Some(index) => {
                self.timers.remove(index);
                self.stats.total_cancelled += 1;
                self.stats.currently_pending = self.timers.len() as u8;
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.timers.iter().any(|t| t.key == *key)
    }

    /// Drop every pending timer, e.g. on subsystem shutdown.
    pub fn clear_all(&mut self) {
        let cleared = self.timers.len();
        self.timers.clear();
        self.stats.total_cancelled += cleared as u32;
        self.stats.currently_pending = 0;
    }

    /// Pop the earliest timer due at or before `now_ms`.
    ///
    /// The clock moves to the timer's due time, so anything the handler arms
    /// is measured from the moment the timer fired rather than from `now_ms`.
    /// Recurring timers are re-armed at `due_at + period` before returning.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<K> {
        let first = self.timers.first()?;
        if first.due_at > now_ms {
            return None;
        }

        let timer = self.timers.remove(0);
        if timer.due_at > self.now_ms {
            self.now_ms = timer.due_at;
        }

        if let Some(period) = timer.period_ms {
            let rearmed = ScheduledTimer {
                id: timer.id,
                key: timer.key.clone(),
                due_at: timer.due_at.saturating_add(period),
                period_ms: timer.period_ms,
                scheduled_at: timer.scheduled_at,
            };
            // A slot was just freed, so this cannot overflow
            let _ = self.timers.push(rearmed);
            self.timers.sort_by_key(|t| (t.due_at, t.id.0));
        }

        self.stats.total_fired += 1;
        self.stats.currently_pending = self.timers.len() as u8;

        Some(timer.key)
    }

    /// Move the clock forward to `now_ms` once no more timers are due.
    pub fn settle(&mut self, now_ms: u64) {
        if now_ms > self.now_ms {
            self.now_ms = now_ms;
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn next_due(&self) -> Option<u64> {
        self.timers.first().map(|t| t.due_at)
    }

    pub fn get_stats(&self) -> &ClockStats {
        &self.stats
    }

    pub fn get_pending_timers(&self) -> &[ScheduledTimer<K>] {
        &self.timers
    }
}

impl<K: Clone + PartialEq> Default for ScheduledClock<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Key {
        Tick,
        Once(u32),
    }

    fn drain(clock: &mut ScheduledClock<Key>, now: u64) -> std::vec::Vec<Key> {
        let mut fired = std::vec::Vec::new();
        while let Some(key) = clock.pop_due(now) {
            fired.push(key);
        }
        clock.settle(now);
        fired
    }

    #[test]
    fn test_clock_creation() {
        let clock: ScheduledClock<Key> = ScheduledClock::new();
        assert_eq!(clock.now_ms(), 0);
        assert_eq!(clock.get_stats().total_scheduled, 0);
        assert!(clock.next_due().is_none());
    }

    #[test]
    fn test_one_shot_fires_once() {
        let mut clock = ScheduledClock::new();
        clock.schedule_once(Key::Once(1), 1000).unwrap();

        assert!(drain(&mut clock, 999).is_empty());
        assert_eq!(drain(&mut clock, 1000), vec![Key::Once(1)]);
        assert!(drain(&mut clock, 5000).is_empty());
        assert_eq!(clock.get_stats().total_fired, 1);
    }

    #[test]
    fn test_recurring_timer_rearms_without_drift() {
        let mut clock = ScheduledClock::new();
        clock.schedule_every(Key::Tick, 3000).unwrap();

        // Advancing in one big jump still fires each period
        let fired = drain(&mut clock, 10_000);
        assert_eq!(fired.len(), 3);
        assert_eq!(clock.next_due(), Some(12_000));
    }

    #[test]
    fn test_same_due_time_fires_in_arming_order() {
        let mut clock = ScheduledClock::new();
        clock.schedule_once(Key::Once(2), 500).unwrap();
        clock.schedule_once(Key::Once(1), 500).unwrap();
        clock.schedule_once(Key::Once(0), 100).unwrap();

        assert_eq!(
            drain(&mut clock, 500),
            vec![Key::Once(0), Key::Once(2), Key::Once(1)]
        );
    }

    #[test]
    fn test_cancel_by_key() {
        let mut clock = ScheduledClock::new();
        clock.schedule_once(Key::Once(7), 100).unwrap();
        clock.schedule_every(Key::Tick, 50).unwrap();

        assert!(clock.is_scheduled(&Key::Once(7)));
        assert_eq!(clock.cancel(&Key::Once(7)), 1);
        assert!(!clock.is_scheduled(&Key::Once(7)));
        assert_eq!(clock.cancel(&Key::Once(7)), 0);

        let fired = drain(&mut clock, 100);
        assert_eq!(fired, vec![Key::Tick, Key::Tick]);
    }

    #[test]
    fn test_cancel_by_id() {
        let mut clock = ScheduledClock::new();
        let id = clock.schedule_once(Key::Once(1), 10).unwrap();
        assert!(clock.cancel_id(id));
        assert!(!clock.cancel_id(id));
        assert!(drain(&mut clock, 100).is_empty());
    }

    #[test]
    fn test_delay_measured_from_fire_time() {
        let mut clock = ScheduledClock::new();
        clock.schedule_once(Key::Once(1), 1000).unwrap();

        assert_eq!(clock.pop_due(5000), Some(Key::Once(1)));
        assert_eq!(clock.now_ms(), 1000);

        // Armed from inside the handler: relative to t=1000, not t=5000
        clock.schedule_once(Key::Once(2), 500).unwrap();
        assert_eq!(clock.pop_due(5000), Some(Key::Once(2)));
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut clock: ScheduledClock<Key> = ScheduledClock::new();
        assert_eq!(clock.schedule_every(Key::Tick, 0), Err(ClockError::ZeroPeriod));
    }

    #[test]
    fn test_queue_full() {
        let mut clock = ScheduledClock::new();
        for i in 0..MAX_TIMERS {
            clock.schedule_once(Key::Once(i as u32), 10).unwrap();
        }
        assert_eq!(
            clock.schedule_once(Key::Tick, 10),
            Err(ClockError::QueueFull { capacity: MAX_TIMERS })
        );
    }

    #[test]
    fn test_clear_all() {
        let mut clock = ScheduledClock::new();
        clock.schedule_every(Key::Tick, 10).unwrap();
        clock.schedule_once(Key::Once(1), 10).unwrap();
        clock.clear_all();

        assert!(drain(&mut clock, 1000).is_empty());
        assert_eq!(clock.get_stats().total_cancelled, 2);
        assert_eq!(clock.get_stats().currently_pending, 0);
    }
}
