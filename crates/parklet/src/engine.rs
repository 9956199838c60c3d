//! AllocationEngine: arrival and departure workflows over the registry and store.
//!
//! The engine is synchronous; every critical section is a per-slot mutex or a
//! per-ticket map shard, so the async service calls it directly.
//!
//! Ordering rules:
//! - A ticket is only created after its slot is reserved for it.
//! - On departure the ticket is closed before the slot is released, so a slot
//!   is never Free while an Active ticket still points at it.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::Serialize;

use crate::codec::{CodecError, PayloadFields, TicketCodec};
use crate::fee::{Amount, FeePolicy};
use crate::registry::{RegistryError, SlotCounts, SlotRegistry};
use crate::slot::{Occupancy, Slot, SlotClass, SlotId};
use crate::store::{StoreError, TicketStore};
use crate::ticket::{Ticket, TicketId, TicketStatus};

pub const DEFAULT_MAX_RESERVE_ATTEMPTS: usize = 16;

/// Registry and store disagree in a way no caller can cause.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("ticket id {0} already exists")]
    TicketIdCollision(TicketId),
    #[error("reservation of slot {slot} for ticket {ticket} was lost: {source}")]
    ReservationLost {
        slot: SlotId,
        ticket: TicketId,
        source: RegistryError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArrivalError {
    #[error("vehicle id must not be empty")]
    EmptyVehicleId,
    #[error("no {0} slot available")]
    NoSlotAvailable(SlotClass),
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("slot {0} is not available")]
    SlotUnavailable(SlotId),
    #[error("internal invariant violation: {0}")]
    InternalInvariantViolation(#[from] InvariantViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepartureError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("forged payload")]
    Forged,
    #[error("ticket {0} not found")]
    NotFound(TicketId),
    #[error("ticket {ticket_id} is already {status}")]
    AlreadyClosed {
        ticket_id: TicketId,
        status: TicketStatus,
    },
}

impl From<CodecError> for DepartureError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Malformed(reason) => Self::Malformed(reason),
            CodecError::Forged => Self::Forged,
        }
    }
}

/// Failure of an administrative operation on an existing ticket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("ticket {0} not found")]
    NotFound(TicketId),
    #[error("ticket {id} is {status}")]
    InvalidState { id: TicketId, status: TicketStatus },
}

impl From<StoreError> for TicketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) | StoreError::Conflict(id) => Self::NotFound(id),
            StoreError::InvalidState { id, status } => Self::InvalidState { id, status },
        }
    }
}

/// A successfully issued ticket, ready to be rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub ticket_id: TicketId,
    pub slot_id: SlotId,
    pub slot_class: SlotClass,
    pub issued_at: DateTime<Utc>,
    pub payload: Bytes,
}

/// A closed ticket and what it was billed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Departure {
    pub ticket_id: TicketId,
    pub slot_id: SlotId,
    pub slot_class: SlotClass,
    pub fee: Amount,
    pub issued_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl Departure {
    pub fn duration(&self) -> TimeDelta {
        self.closed_at - self.issued_at
    }
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Slots freed because their ticket was missing or no longer active.
    pub released: Vec<SlotId>,
    /// Reserved slots promoted to Occupied because their ticket is active.
    pub occupied: Vec<SlotId>,
    /// Active tickets whose slot does not hold them. Reported, not repaired.
    pub dangling: Vec<TicketId>,
    /// Reserved slots whose ticket does not exist yet: an arrival in flight,
    /// or one interrupted before `create`. Only `recover` releases them.
    pub pending: Vec<SlotId>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.released.is_empty() && self.occupied.is_empty() && self.dangling.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OccupancySummary {
    #[serde(flatten)]
    pub slots: SlotCounts,
    pub active_tickets: usize,
    pub revenue: Amount,
}

pub struct AllocationEngine {
    registry: Arc<SlotRegistry>,
    store: Arc<TicketStore>,
    codec: TicketCodec,
    fees: Arc<dyn FeePolicy>,
    max_reserve_attempts: usize,
}

impl AllocationEngine {
    pub fn new(
        registry: Arc<SlotRegistry>,
        store: Arc<TicketStore>,
        codec: TicketCodec,
        fees: Arc<dyn FeePolicy>,
    ) -> Self {
        Self {
            registry,
            store,
            codec,
            fees,
            max_reserve_attempts: DEFAULT_MAX_RESERVE_ATTEMPTS,
        }
    }

    /// Bound on reservation attempts per arrival (at least one).
    pub fn with_max_reserve_attempts(mut self, attempts: usize) -> Self {
        self.max_reserve_attempts = attempts.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TicketStore> {
        &self.store
    }

    /// Issue a ticket on any free slot able to hold `class`.
    pub fn handle_arrival(
        &self,
        vehicle_id: &str,
        class: SlotClass,
        now: DateTime<Utc>,
    ) -> Result<Arrival, ArrivalError> {
        let vehicle_id = validate_vehicle(vehicle_id)?;
        let ticket_id = TicketId::new();
        let (slot, slot_class) =
            self.reserve_any(class, |slot| self.registry.reserve(slot, ticket_id))?;
        self.issue(ticket_id, vehicle_id, slot, slot_class, now)
    }

    /// Bounded search-and-reserve loop. A slot lost to another lane is not
    /// offered again within the same arrival.
    fn reserve_any(
        &self,
        class: SlotClass,
        reserve: impl Fn(&SlotId) -> Result<SlotClass, RegistryError>,
    ) -> Result<(SlotId, SlotClass), ArrivalError> {
        let mut lost: Vec<SlotId> = Vec::new();

        for attempt in 1..=self.max_reserve_attempts {
            let Some(slot) = self.registry.find_available(class, &lost) else {
                tracing::debug!(%class, attempt, "No free slot");
                return Err(ArrivalError::NoSlotAvailable(class));
            };
            match reserve(&slot) {
                Ok(slot_class) => return Ok((slot, slot_class)),
                Err(error) => {
                    tracing::debug!(%slot, %class, attempt, %error, "Lost reservation race");
                    lost.push(slot);
                }
            }
        }

        tracing::warn!(
            %class,
            attempts = self.max_reserve_attempts,
            "Reservation retries exhausted"
        );
        Err(ArrivalError::NoSlotAvailable(class))
    }

    /// Issue a ticket on a specific slot. No retry and no fallback.
    pub fn handle_arrival_at(
        &self,
        vehicle_id: &str,
        slot: &SlotId,
        now: DateTime<Utc>,
    ) -> Result<Arrival, ArrivalError> {
        let vehicle_id = validate_vehicle(vehicle_id)?;
        let ticket_id = TicketId::new();

        let slot_class = self
            .registry
            .reserve(slot, ticket_id)
            .map_err(|error| match error {
                RegistryError::UnknownSlot(slot) => ArrivalError::UnknownSlot(slot),
                _ => ArrivalError::SlotUnavailable(slot.clone()),
            })?;
        self.issue(ticket_id, vehicle_id, slot.clone(), slot_class, now)
    }

    /// Second half of an arrival: the slot is already Reserved for `ticket_id`.
    fn issue(
        &self,
        ticket_id: TicketId,
        vehicle_id: String,
        slot: SlotId,
        slot_class: SlotClass,
        now: DateTime<Utc>,
    ) -> Result<Arrival, ArrivalError> {
        // The payload carries milliseconds; keep the record identical to it.
        let issued_at = now.trunc_subsecs(3);
        let integrity_tag = self.codec.tag(&ticket_id, issued_at);
        let ticket = Ticket::issue(
            ticket_id,
            vehicle_id,
            slot.clone(),
            slot_class,
            issued_at,
            integrity_tag,
        );

        if self.store.create(ticket).is_err() {
            if let Err(error) = self.registry.release_held(&slot, ticket_id) {
                tracing::error!(%slot, ticket = %ticket_id, %error, "Failed to release slot after id collision");
            }
            tracing::error!(ticket = %ticket_id, %slot, "Ticket id collision");
            return Err(InvariantViolation::TicketIdCollision(ticket_id).into());
        }

        if let Err(source) = self.registry.mark_occupied(&slot, ticket_id) {
            tracing::error!(%slot, ticket = %ticket_id, error = %source, "Reservation lost before occupancy");
            if let Err(error) = self.store.void(&ticket_id, issued_at) {
                tracing::error!(ticket = %ticket_id, %error, "Failed to void orphaned ticket");
            }
            return Err(InvariantViolation::ReservationLost {
                slot,
                ticket: ticket_id,
                source,
            }
            .into());
        }

        let payload = TicketCodec::encode(&PayloadFields {
            ticket_id,
            issued_at,
            integrity_tag,
        });

        tracing::info!(ticket = %ticket_id, %slot, class = %slot_class, "Ticket issued");

        Ok(Arrival {
            ticket_id,
            slot_id: slot,
            slot_class,
            issued_at,
            payload,
        })
    }

    /// Close the ticket a scanned payload identifies and free its slot.
    ///
    /// A re-scan of a closed ticket reports `AlreadyClosed` and changes nothing.
    pub fn handle_departure(
        &self,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Departure, DepartureError> {
        let fields = self.codec.decode(payload)?;
        let ticket_id = fields.ticket_id;

        let ticket = self
            .store
            .get(&ticket_id)
            .map_err(|_| DepartureError::NotFound(ticket_id))?;

        if ticket.integrity_tag != fields.integrity_tag || ticket.issued_at != fields.issued_at {
            tracing::warn!(ticket = %ticket_id, "Payload does not match stored ticket");
            return Err(DepartureError::Forged);
        }

        if !ticket.is_active() {
            tracing::debug!(ticket = %ticket_id, status = %ticket.status, "Re-scan of terminal ticket");
            return Err(DepartureError::AlreadyClosed {
                ticket_id,
                status: ticket.status,
            });
        }

        let closed_at = now.max(ticket.issued_at);
        let fee = self
            .fees
            .compute_fee(ticket.slot_class, ticket.issued_at, closed_at);

        let closed = self
            .store
            .close(&ticket_id, closed_at, fee)
            .map_err(|error| match error {
                StoreError::InvalidState { status, .. } => DepartureError::AlreadyClosed {
                    ticket_id,
                    status,
                },
                StoreError::NotFound(_) | StoreError::Conflict(_) => {
                    DepartureError::NotFound(ticket_id)
                }
            })?;

        // The ticket is closed either way; a stray slot is left for reconcile.
        if let Err(error) = self.registry.release_held(&closed.slot_id, ticket_id) {
            tracing::error!(
                ticket = %ticket_id,
                slot = %closed.slot_id,
                %error,
                "Closed ticket did not hold its slot"
            );
        }

        tracing::info!(
            ticket = %ticket_id,
            slot = %closed.slot_id,
            %fee,
            "Ticket closed"
        );

        Ok(Departure {
            ticket_id,
            slot_id: closed.slot_id,
            slot_class: closed.slot_class,
            fee,
            issued_at: closed.issued_at,
            closed_at,
        })
    }

    /// Cancel an Active ticket without billing and free its slot.
    pub fn void_ticket(&self, ticket_id: TicketId, now: DateTime<Utc>) -> Result<Ticket, TicketError> {
        let voided = self.store.void(&ticket_id, now)?;
        if let Err(error) = self.registry.release_held(&voided.slot_id, ticket_id) {
            tracing::error!(
                ticket = %ticket_id,
                slot = %voided.slot_id,
                %error,
                "Voided ticket did not hold its slot"
            );
        }
        tracing::info!(ticket = %ticket_id, slot = %voided.slot_id, "Ticket voided");
        Ok(voided)
    }

    /// Bring registry and store back into agreement while serving.
    ///
    /// Slots Reserved for a ticket that does not exist yet are reported as
    /// `pending` and left alone: an arrival between `reserve` and `create`
    /// looks exactly like an interrupted one.
    pub fn reconcile(&self) -> ReconcileReport {
        self.repair(false)
    }

    /// Reconcile after a rebuild, before any arrival is accepted. Pending
    /// reservations are released too.
    pub fn recover(&self) -> ReconcileReport {
        self.repair(true)
    }

    fn repair(&self, release_pending: bool) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for slot in self.registry.snapshot() {
            let Some(ticket_id) = slot.current_ticket_id else {
                continue;
            };
            let stored = self.store.get(&ticket_id).ok();
            let holds = stored
                .as_ref()
                .is_some_and(|ticket| ticket.is_active() && ticket.slot_id == slot.id);
            let reserved = matches!(slot.occupancy(), Some(Occupancy::Reserved(_)));

            if holds {
                if reserved && self.registry.mark_occupied(&slot.id, ticket_id).is_ok() {
                    tracing::warn!(slot = %slot.id, ticket = %ticket_id, "Promoted reserved slot to occupied");
                    report.occupied.push(slot.id);
                }
            } else if stored.is_none() && reserved && !release_pending {
                tracing::debug!(slot = %slot.id, ticket = %ticket_id, "Reservation has no ticket yet");
                report.pending.push(slot.id);
            } else if self.registry.release_held(&slot.id, ticket_id).is_ok() {
                tracing::warn!(slot = %slot.id, ticket = %ticket_id, "Released slot with no active ticket");
                report.released.push(slot.id);
            }
        }

        for ticket in self.store.active() {
            let held = self.registry.current_ticket(&ticket.slot_id).ok().flatten();
            if held != Some(ticket.id) {
                tracing::warn!(ticket = %ticket.id, slot = %ticket.slot_id, "Active ticket does not hold its slot");
                report.dangling.push(ticket.id);
            }
        }

        if report.is_clean() {
            tracing::debug!("Reconcile found nothing to repair");
        }
        report
    }

    pub fn summary(&self) -> OccupancySummary {
        OccupancySummary {
            slots: self.registry.counts(),
            active_tickets: self.store.active_count(),
            revenue: self.store.revenue(),
        }
    }

    /// Payment ledger: closed tickets, most recent first.
    pub fn closed_tickets(&self) -> Vec<Ticket> {
        self.store.closed()
    }

    /// Re-encode the payload of an Active ticket for reprinting.
    pub fn reissue_payload(&self, ticket_id: TicketId) -> Result<Bytes, TicketError> {
        let ticket = self.store.get(&ticket_id)?;
        if !ticket.is_active() {
            return Err(TicketError::InvalidState {
                id: ticket_id,
                status: ticket.status,
            });
        }
        Ok(TicketCodec::encode(&PayloadFields {
            ticket_id,
            issued_at: ticket.issued_at,
            integrity_tag: ticket.integrity_tag,
        }))
    }

    pub fn ticket(&self, ticket_id: TicketId) -> Result<Ticket, TicketError> {
        Ok(self.store.get(&ticket_id)?)
    }

    /// The Active ticket holding `slot`, if any.
    pub fn ticket_for_slot(&self, slot: &SlotId) -> Result<Option<Ticket>, RegistryError> {
        let Some(ticket_id) = self.registry.current_ticket(slot)? else {
            return Ok(None);
        };
        Ok(self.store.get(&ticket_id).ok().filter(Ticket::is_active))
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.registry.snapshot()
    }

    pub fn set_out_of_service(&self, slot: &SlotId) -> Result<(), RegistryError> {
        self.registry.set_out_of_service(slot)?;
        tracing::info!(%slot, "Slot out of service");
        Ok(())
    }

    pub fn return_to_service(&self, slot: &SlotId) -> Result<(), RegistryError> {
        self.registry.return_to_service(slot)?;
        tracing::info!(%slot, "Slot returned to service");
        Ok(())
    }
}

fn validate_vehicle(vehicle_id: &str) -> Result<String, ArrivalError> {
    let trimmed = vehicle_id.trim();
    if trimmed.is_empty() {
        return Err(ArrivalError::EmptyVehicleId);
    }
    Ok(trimmed.to_string())
}
