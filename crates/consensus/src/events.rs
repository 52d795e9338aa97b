//! Stabilization events and the collaborators that consume them

use crate::types::{Sequence, StabilizedUnit, UnitId, UnitNode};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of the async stabilization channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Receives a call when a unit becomes stable
///
/// Calls arrive in increasing MCI order and only after the batch that
/// stabilized the unit is durable. Delivery is at-least-once: events still in
/// the outbox when the process stops are delivered again on the next open, so
/// implementations must be idempotent per `unit_id`.
pub trait StabilityListener: Send + Sync {
    fn on_unit_stabilized(&self, unit_id: &UnitId, mci: u64, sequence: Sequence);
}

/// Decides the final sequence of a `temp-bad` unit when it becomes stable
pub trait SequenceResolver: Send + Sync {
    fn resolve(&self, unit: &UnitNode, mci: u64) -> Sequence;
}

/// Resolves every provisional unit to `final-bad`
#[derive(Debug, Default, Clone, Copy)]
pub struct FinalBadResolver;

impl SequenceResolver for FinalBadResolver {
    fn resolve(&self, _unit: &UnitNode, _mci: u64) -> Sequence {
        Sequence::FinalBad
    }
}

/// Fan-out for stabilization notifications
pub struct EventBus {
    sender: broadcast::Sender<StabilizedUnit>,
    listeners: Vec<Arc<dyn StabilityListener>>,
}

impl EventBus {
    pub fn new(listeners: Vec<Arc<dyn StabilityListener>>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender, listeners }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StabilizedUnit> {
        self.sender.subscribe()
    }

    /// Hand committed notifications to listeners and subscribers, in order
    pub fn deliver(&self, events: &[StabilizedUnit]) {
        for event in events {
            for listener in &self.listeners {
                listener.on_unit_stabilized(&event.unit, event.mci, event.sequence);
            }
            // No subscribers is fine
            let _ = self.sender.send(event.clone());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
