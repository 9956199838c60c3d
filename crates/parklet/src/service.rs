//! ParkingService: transport-agnostic wrapper around the allocation engine.
//!
//! This service owns:
//! - The engine (registry, store, codec, fee policy)
//! - The clock stamping arrivals and departures
//! - Health tracking
//! - Shutdown coordination
//!
//! Transports delegate here; the engine itself never awaits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, watch};

use crate::clock::{Clock, SystemClock};
use crate::engine::{
    AllocationEngine, Arrival, ArrivalError, Departure, DepartureError, ReconcileReport,
    TicketError,
};
use crate::health::Health;
use crate::registry::SlotCounts;
use crate::slot::{SlotClass, SlotId};
use crate::ticket::{Ticket, TicketId};
use crate::version::VersionInfo;

/// Where an arriving vehicle should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrivalTarget {
    /// Any free slot able to hold this class.
    Class(SlotClass),
    /// This slot only.
    Slot(SlotId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArriveError {
    #[error("Service not ready")]
    NotReady,
    #[error(transparent)]
    Arrival(#[from] ArrivalError),
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub slots: SlotCounts,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_ready(&self) -> bool {
        self.state == Health::Ready
    }

    /// FULL state: ready but no free slot of any class.
    pub fn is_full(&self) -> bool {
        self.state == Health::Ready && self.slots.free == 0
    }
}

pub struct ParkingService {
    engine: Arc<AllocationEngine>,
    clock: Arc<dyn Clock>,

    health: RwLock<Health>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    version: VersionInfo,
}

impl ParkingService {
    /// Service over a loaded engine, READY, stamped by the system clock.
    pub fn new(engine: Arc<AllocationEngine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            clock: Arc::new(SystemClock),
            health: RwLock::new(Health::Ready),
            shutdown_tx,
            shutdown_rx,
            version: VersionInfo::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_health(mut self, health: Health) -> Self {
        self.health = RwLock::new(health);
        self
    }

    pub fn with_version(mut self, version: VersionInfo) -> Self {
        self.version = version;
        self
    }

    pub fn engine(&self) -> &Arc<AllocationEngine> {
        &self.engine
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: *self.health.read().await,
            slots: self.engine.registry().counts(),
            version: self.version.clone(),
        }
    }

    pub async fn set_health(&self, health: Health) {
        *self.health.write().await = health;
    }

    /// Issue a ticket. Refused unless READY; an invariant violation marks the service DEFUNCT.
    pub async fn arrive(
        &self,
        vehicle_id: &str,
        target: ArrivalTarget,
    ) -> Result<Arrival, ArriveError> {
        if *self.health.read().await != Health::Ready {
            return Err(ArriveError::NotReady);
        }

        let now = self.now();
        let result = match &target {
            ArrivalTarget::Class(class) => self.engine.handle_arrival(vehicle_id, *class, now),
            ArrivalTarget::Slot(slot) => self.engine.handle_arrival_at(vehicle_id, slot, now),
        };

        self.observe_arrival(&result).await;
        Ok(result?)
    }

    async fn observe_arrival(&self, result: &Result<Arrival, ArrivalError>) {
        if let Err(ArrivalError::InternalInvariantViolation(violation)) = result {
            tracing::error!(error = %violation, "Invariant violated - marking service DEFUNCT");
            self.set_health(Health::Defunct).await;
        }
    }

    /// Close a scanned ticket. Allowed in every health state so vehicles can always leave.
    pub fn depart(&self, payload: &[u8]) -> Result<Departure, DepartureError> {
        self.engine.handle_departure(payload, self.now())
    }

    pub fn void(&self, ticket_id: TicketId) -> Result<Ticket, TicketError> {
        self.engine.void_ticket(ticket_id, self.now())
    }

    pub fn reconcile(&self) -> ReconcileReport {
        let report = self.engine.reconcile();
        tracing::info!(
            released = report.released.len(),
            occupied = report.occupied.len(),
            dangling = report.dangling.len(),
            pending = report.pending.len(),
            "Reconcile complete"
        );
        report
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}
