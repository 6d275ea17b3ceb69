//! Notification delivery to the UI layer.
//!
//! Subsystems never call into UI code. Each one appends notifications to its
//! own [`EventQueue`] right after the state change they describe, and the UI
//! layer drains the queue from the same event loop. The orchestrator merges
//! the three queues into [`Notification`]s.

use crate::subsystems::bluetooth::BluetoothEvent;
use crate::subsystems::sensor::SensorEvent;
use crate::subsystems::usb::UsbEvent;
use serde::Serialize;
use static_assertions::assert_impl_all;
use std::collections::VecDeque;
use tracing::warn;

/// Pending notifications kept per subsystem before the oldest are dropped.
pub const MAX_PENDING_EVENTS: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subsystem", content = "event", rename_all = "snake_case")]
pub enum Notification {
    Sensor(SensorEvent),
    Bluetooth(BluetoothEvent),
    Usb(UsbEvent),
}

assert_impl_all!(Notification: Send, Clone);

impl From<SensorEvent> for Notification {
    fn from(event: SensorEvent) -> Self {
        Self::Sensor(event)
    }
}

impl From<BluetoothEvent> for Notification {
    fn from(event: BluetoothEvent) -> Self {
        Self::Bluetooth(event)
    }
}

impl From<UsbEvent> for Notification {
    fn from(event: UsbEvent) -> Self {
        Self::Usb(event)
    }
}

/// Bounded FIFO outbox.
#[derive(Debug)]
pub struct EventQueue<E> {
    events: VecDeque<E>,
    capacity: usize,
    dropped: u64,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_PENDING_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: E) {
        if self.events.len() >= self.capacity {
            // Nobody is draining; keep the newest
            self.events.pop_front();
            self.dropped += 1;
            if self.dropped.is_power_of_two() {
                warn!("Event queue full, {} notifications dropped so far", self.dropped);
            }
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<E> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = EventQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = EventQueue::with_capacity(2);
        queue.push("a");
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.drain(), vec!["b", "c"]);
    }
}
