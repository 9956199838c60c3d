//! Ticket store with lock-free concurrent access via DashMap.
//!
//! Each ticket's record is mutated under its shard entry, so transitions on one
//! ticket are linearizable and distinct tickets never block each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::fee::Amount;
use crate::ticket::{Ticket, TicketId, TicketStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("ticket {0} already exists")]
    Conflict(TicketId),
    #[error("ticket {0} not found")]
    NotFound(TicketId),
    #[error("ticket {id} is {status}")]
    InvalidState { id: TicketId, status: TicketStatus },
}

#[derive(Debug, Default)]
pub struct TicketStore {
    tickets: DashMap<TicketId, Ticket>,
}

impl TicketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted records. Duplicate ids are rejected.
    pub fn from_tickets(tickets: impl IntoIterator<Item = Ticket>) -> Result<Self, StoreError> {
        let store = Self::new();
        for ticket in tickets {
            store.create(ticket)?;
        }
        Ok(store)
    }

    pub fn create(&self, ticket: Ticket) -> Result<(), StoreError> {
        match self.tickets.entry(ticket.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(ticket.id)),
            Entry::Vacant(slot) => {
                slot.insert(ticket);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: &TicketId) -> Result<Ticket, StoreError> {
        self.tickets
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::NotFound(*id))
    }

    /// Active → Closed with the billed fee. Returns the closed record.
    pub fn close(
        &self,
        id: &TicketId,
        closed_at: DateTime<Utc>,
        fee: Amount,
    ) -> Result<Ticket, StoreError> {
        self.transition(id, |ticket| ticket.close(closed_at, fee))
    }

    /// Active → Voided. Returns the voided record.
    pub fn void(&self, id: &TicketId, voided_at: DateTime<Utc>) -> Result<Ticket, StoreError> {
        self.transition(id, |ticket| ticket.void(voided_at))
    }

    fn transition(
        &self,
        id: &TicketId,
        apply: impl FnOnce(&mut Ticket) -> Result<(), TicketStatus>,
    ) -> Result<Ticket, StoreError> {
        let mut entry = self.tickets.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        apply(entry.value_mut()).map_err(|status| StoreError::InvalidState { id: *id, status })?;
        Ok(entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.tickets.iter().filter(|e| e.is_active()).count()
    }

    pub fn active(&self) -> Vec<Ticket> {
        self.filtered(|t| t.is_active())
    }

    /// Closed tickets, most recently closed first.
    pub fn closed(&self) -> Vec<Ticket> {
        let mut closed = self.filtered(|t| t.status == TicketStatus::Closed);
        closed.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        closed
    }

    /// Sum of fees billed on closed tickets.
    pub fn revenue(&self) -> Amount {
        self.tickets.iter().filter_map(|e| e.fee).sum()
    }

    /// Every ticket, for a persistence collaborator.
    pub fn snapshot(&self) -> Vec<Ticket> {
        self.filtered(|_| true)
    }

    fn filtered(&self, keep: impl Fn(&Ticket) -> bool) -> Vec<Ticket> {
        self.tickets
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect()
    }
}
