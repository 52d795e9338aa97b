//! Ingest loop
//!
//! Drains submitted units on a fixed tick, records them in the unit store and
//! admits them through the coordinator. Units that reference something not
//! yet recorded are parked until it arrives.

use crate::unit_log::RecordUnits;
use crate::{DEFAULT_TICK_MS, MAX_UNITS_PER_TICK, PARK_CAPACITY, SUBMIT_QUEUE_CAPACITY, UPDATE_CHANNEL_CAPACITY};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use dag_consensus::{Coordinator, Unit, UnitId, WitnessListRef};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Ingest loop configuration
#[derive(Clone, Debug)]
pub struct IngestConfig {
    pub tick_ms: u64,
    pub max_units_per_tick: usize,
    /// Maximum units waiting for a missing dependency
    pub park_capacity: usize,
    pub verbose: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            max_units_per_tick: MAX_UNITS_PER_TICK,
            park_capacity: PARK_CAPACITY,
            verbose: false,
        }
    }
}

/// Summary of one tick, sent to subscribers
#[derive(Clone, Debug)]
pub struct IngestUpdate {
    pub admitted: Vec<UnitId>,
    /// Units still waiting for a dependency after this tick
    pub parked: usize,
    pub rejected: Vec<(UnitId, String)>,
    pub last_stable_mci: u64,
    pub tip: Option<UnitId>,
    pub processing_time_us: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("submission queue is full")]
    QueueFull,
    #[error("ingest loop has shut down")]
    Disconnected,
}

/// Handle for submitting units to the ingest loop
#[derive(Clone)]
pub struct UnitSender {
    sender: Sender<Unit>,
}

impl UnitSender {
    pub fn send(&self, unit: Unit) -> Result<(), IngestError> {
        self.sender.try_send(unit).map_err(|e| match e {
            TrySendError::Full(_) => IngestError::QueueFull,
            TrySendError::Disconnected(_) => IngestError::Disconnected,
        })
    }
}

/// Units waiting for a dependency, keyed by the first missing one
#[derive(Default)]
struct ParkingArea {
    waiting: HashMap<UnitId, Vec<Unit>>,
    ids: HashSet<UnitId>,
}

impl ParkingArea {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn contains(&self, id: &UnitId) -> bool {
        self.ids.contains(id)
    }

    fn park(&mut self, missing: UnitId, unit: Unit) {
        self.ids.insert(unit.id);
        self.waiting.entry(missing).or_default().push(unit);
    }

    fn release(&mut self, arrived: &UnitId) -> Vec<Unit> {
        let released = self.waiting.remove(arrived).unwrap_or_default();
        for unit in &released {
            self.ids.remove(&unit.id);
        }
        released
    }
}

/// Ingest loop driving the coordinator
pub struct Ingestor<S: RecordUnits> {
    coordinator: Arc<Coordinator>,
    units: Arc<S>,
    receiver: Receiver<Unit>,
    sender: Sender<Unit>,
    update_sender: broadcast::Sender<IngestUpdate>,
    parked: ParkingArea,
    /// Recorded units whose admission failed with a retryable error
    deferred: HashSet<UnitId>,
    config: IngestConfig,
    running: Arc<AtomicBool>,
}

impl<S: RecordUnits> Ingestor<S> {
    /// `units` must be the unit store the coordinator reads from
    pub fn new(coordinator: Arc<Coordinator>, units: Arc<S>, config: IngestConfig) -> Self {
        let (sender, receiver) = bounded(SUBMIT_QUEUE_CAPACITY);
        let (update_sender, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            coordinator,
            units,
            receiver,
            sender,
            update_sender,
            parked: ParkingArea::default(),
            deferred: HashSet::new(),
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn unit_sender(&self) -> UnitSender {
        UnitSender {
            sender: self.sender.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestUpdate> {
        self.update_sender.subscribe()
    }

    /// Flag shared with the running loop; clearing it stops the loop
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    /// Recorded units still waiting to be admitted
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// First dependency of `unit` that is not recorded yet
    fn missing_dependency(&self, unit: &Unit) -> Option<UnitId> {
        let witness_source = match &unit.witness_list {
            WitnessListRef::SameAs(source) => Some(source),
            WitnessListRef::Inline(_) => None,
        };
        unit.parents
            .iter()
            .chain(witness_source)
            .find(|id| !self.units.is_recorded(id))
            .copied()
    }

    /// Process one tick worth of submissions
    ///
    /// Returns `None` when nothing was submitted or released.
    pub fn process_pending(&mut self) -> Option<IngestUpdate> {
        let tick_start = Instant::now();
        if !self.deferred.is_empty() {
            self.retry_deferred();
        }

        let mut ready: VecDeque<Unit> = VecDeque::new();
        while ready.len() < self.config.max_units_per_tick {
            match self.receiver.try_recv() {
                Ok(unit) => ready.push_back(unit),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if ready.is_empty() {
            return None;
        }

        let mut admitted = Vec::new();
        let mut rejected = Vec::new();
        while let Some(unit) = ready.pop_front() {
            let id = unit.id;
            if self.units.is_recorded(&id) || self.parked.contains(&id) {
                rejected.push((id, "duplicate unit".to_string()));
                continue;
            }

            if let Some(missing) = self.missing_dependency(&unit) {
                if self.parked.len() >= self.config.park_capacity {
                    tracing::warn!("Parking area full, dropping unit {}", id.short());
                    rejected.push((id, "parking area full".to_string()));
                } else {
                    tracing::warn!("Parked unit {} until {} arrives", id.short(), missing.short());
                    self.parked.park(missing, unit);
                }
                continue;
            }

            if let Err(e) = self.units.record_unit(unit) {
                tracing::warn!("Rejected unit {}: {}", id.short(), e);
                rejected.push((id, e.to_string()));
                continue;
            }
            // Recorded units release their dependents even if admission fails
            ready.extend(self.parked.release(&id));

            match self.coordinator.add_unit(&id) {
                Ok(_) => admitted.push(id),
                Err(e) if e.is_retryable() => {
                    // Stays recorded; catch_up admits it on a later tick
                    tracing::warn!("Admission of {} deferred: {}", id.short(), e);
                    self.deferred.insert(id);
                    rejected.push((id, e.to_string()));
                }
                Err(e) => {
                    tracing::warn!("Unit {} not admitted: {}", id.short(), e);
                    rejected.push((id, e.to_string()));
                }
            }
        }

        let update = IngestUpdate {
            admitted,
            parked: self.parked.len(),
            rejected,
            last_stable_mci: self.coordinator.last_stable_mci(),
            tip: self.coordinator.tip(),
            processing_time_us: tick_start.elapsed().as_micros() as u64,
        };
        if self.config.verbose || !update.rejected.is_empty() {
            tracing::debug!(
                "Ingested {} units, {} rejected, {} parked, last stable MCI {}",
                update.admitted.len(),
                update.rejected.len(),
                update.parked,
                update.last_stable_mci
            );
        }

        // No subscribers is fine
        let _ = self.update_sender.send(update.clone());
        Some(update)
    }

    /// Admit units recorded earlier but not admitted
    ///
    /// Deferred ids are dropped once admitted, or once a successful catch-up
    /// has refused them for good.
    fn retry_deferred(&mut self) {
        let coordinator = &self.coordinator;
        match coordinator.catch_up() {
            Ok(n) => {
                if n > 0 {
                    tracing::info!("Admitted {} deferred units", n);
                }
                for id in self.deferred.drain() {
                    if !coordinator.contains(&id) {
                        tracing::warn!("Deferred unit {} was not admitted", id.short());
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Catch-up failed, {} units still deferred: {}", self.deferred.len(), e);
                self.deferred.retain(|id| !coordinator.contains(id));
            }
        }
    }

    /// Run the ingest loop on the tokio runtime until stopped
    pub async fn run_async(mut self) {
        let tick = Duration::from_millis(self.config.tick_ms);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!("Ingest loop started ({}ms ticks)", self.config.tick_ms);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            let tick_start = Instant::now();

            self.process_pending();

            let elapsed = tick_start.elapsed();
            if elapsed > tick {
                tracing::warn!(
                    "Ingest tick took {:.2}ms (target: {}ms)",
                    elapsed.as_secs_f64() * 1000.0,
                    self.config.tick_ms
                );
            }
        }

        tracing::info!("Ingest loop stopped with {} units parked", self.parked.len());
    }
}
