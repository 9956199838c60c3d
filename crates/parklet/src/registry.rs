//! Slot registry: per-slot occupancy behind one mutex per slot.
//!
//! There is no registry-wide lock. `find_available` is advisory; `reserve` is
//! the authoritative Free→Reserved transition and callers that lose the race
//! retry with another slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::slot::{Occupancy, Slot, SlotClass, SlotId, SlotStatus};
use crate::ticket::TicketId;

/// Which classes an arrival may spill into when its own class is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Smallest class at least as large as the requested one.
    #[default]
    NextLarger,
    /// Requested class only.
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("slot {slot} is {status}, not free")]
    Conflict { slot: SlotId, status: SlotStatus },
    #[error("slot {slot} is {status}")]
    InvalidState { slot: SlotId, status: SlotStatus },
    #[error("slot {slot} does not hold ticket {ticket}")]
    NotHeldBy { slot: SlotId, ticket: TicketId },
    #[error("duplicate slot id {0}")]
    DuplicateSlot(SlotId),
    #[error("slot {0} record has inconsistent status and ticket")]
    InconsistentRecord(SlotId),
}

/// Slot totals by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub total: usize,
    pub free: usize,
    pub reserved: usize,
    pub occupied: usize,
    pub out_of_service: usize,
}

impl SlotCounts {
    fn add(&mut self, status: SlotStatus) {
        self.total += 1;
        match status {
            SlotStatus::Free => self.free += 1,
            SlotStatus::Reserved => self.reserved += 1,
            SlotStatus::Occupied => self.occupied += 1,
            SlotStatus::OutOfService => self.out_of_service += 1,
        }
    }

    /// Reserved plus occupied: slots held by a ticket.
    pub fn held(&self) -> usize {
        self.reserved + self.occupied
    }
}

struct SlotCell {
    id: SlotId,
    class: SlotClass,
    state: Mutex<Occupancy>,
}

impl SlotCell {
    /// Lock the slot, recovering the state if a holder panicked.
    ///
    /// Critical sections only assign a `Copy` value, so a poisoned state is
    /// still a valid occupancy.
    fn lock(&self) -> MutexGuard<'_, Occupancy> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(slot = %self.id, "Slot mutex poisoned - recovering state");
                poisoned.into_inner()
            }
        }
    }
}

pub struct SlotRegistry {
    cells: Vec<SlotCell>,
    index: HashMap<SlotId, usize>,
    by_class: [Vec<usize>; SlotClass::COUNT],
    fallback: FallbackPolicy,
    cursor: AtomicUsize,
}

impl SlotRegistry {
    /// Registry with every slot Free.
    pub fn new(
        slots: impl IntoIterator<Item = (SlotId, SlotClass)>,
        fallback: FallbackPolicy,
    ) -> Result<Self, RegistryError> {
        Self::from_slots(
            slots.into_iter().map(|(id, class)| Slot::free(id, class)),
            fallback,
        )
    }

    /// Rebuild from persisted records. Run a reconciliation pass afterwards.
    pub fn from_slots(
        slots: impl IntoIterator<Item = Slot>,
        fallback: FallbackPolicy,
    ) -> Result<Self, RegistryError> {
        let mut cells = Vec::new();
        let mut index = HashMap::new();
        let mut by_class: [Vec<usize>; SlotClass::COUNT] = Default::default();

        for slot in slots {
            let occupancy = slot
                .occupancy()
                .ok_or_else(|| RegistryError::InconsistentRecord(slot.id.clone()))?;
            let position = cells.len();
            if index.insert(slot.id.clone(), position).is_some() {
                return Err(RegistryError::DuplicateSlot(slot.id));
            }
            by_class[slot.class.index()].push(position);
            cells.push(SlotCell {
                id: slot.id,
                class: slot.class,
                state: Mutex::new(occupancy),
            });
        }

        Ok(Self {
            cells,
            index,
            by_class,
            fallback,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn fallback(&self) -> FallbackPolicy {
        self.fallback
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn cell(&self, slot: &SlotId) -> Result<&SlotCell, RegistryError> {
        self.index
            .get(slot)
            .map(|&i| &self.cells[i])
            .ok_or_else(|| RegistryError::UnknownSlot(slot.clone()))
    }

    /// A Free slot able to hold `class`, skipping `exclude`.
    ///
    /// Classes are tried smallest first per the fallback policy. Within a
    /// class the scan starts at a rotating offset so concurrent arrivals
    /// spread over free slots.
    pub fn find_available(&self, class: SlotClass, exclude: &[SlotId]) -> Option<SlotId> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let classes: Vec<SlotClass> = match self.fallback {
            FallbackPolicy::NextLarger => class.at_least().collect(),
            FallbackPolicy::Exact => vec![class],
        };

        for candidate_class in classes {
            let positions = &self.by_class[candidate_class.index()];
            if positions.is_empty() {
                continue;
            }
            for step in 0..positions.len() {
                let cell = &self.cells[positions[(start + step) % positions.len()]];
                if exclude.contains(&cell.id) {
                    continue;
                }
                if cell.lock().is_free() {
                    return Some(cell.id.clone());
                }
            }
        }
        None
    }

    /// Free → Reserved for `ticket`. Returns the slot's class.
    pub fn reserve(&self, slot: &SlotId, ticket: TicketId) -> Result<SlotClass, RegistryError> {
        let cell = self.cell(slot)?;
        let mut state = cell.lock();
        if !state.is_free() {
            return Err(RegistryError::Conflict {
                slot: slot.clone(),
                status: state.status(),
            });
        }
        *state = Occupancy::Reserved(ticket);
        Ok(cell.class)
    }

    /// Reserved(ticket) → Occupied(ticket).
    ///
    /// Fails with `NotHeldBy` if another ticket holds the slot. A slot already
    /// Occupied by `ticket` is left as is.
    pub fn mark_occupied(&self, slot: &SlotId, ticket: TicketId) -> Result<(), RegistryError> {
        let cell = self.cell(slot)?;
        let mut state = cell.lock();
        match *state {
            Occupancy::Reserved(held) | Occupancy::Occupied(held) if held == ticket => {
                *state = Occupancy::Occupied(ticket);
                Ok(())
            }
            Occupancy::Reserved(_) | Occupancy::Occupied(_) => Err(RegistryError::NotHeldBy {
                slot: slot.clone(),
                ticket,
            }),
            other => Err(RegistryError::InvalidState {
                slot: slot.clone(),
                status: other.status(),
            }),
        }
    }

    /// Reserved/Occupied → Free. Returns the ticket that held the slot.
    pub fn release(&self, slot: &SlotId) -> Result<TicketId, RegistryError> {
        let cell = self.cell(slot)?;
        let mut state = cell.lock();
        match state.ticket() {
            Some(ticket) => {
                *state = Occupancy::Free;
                Ok(ticket)
            }
            None => Err(RegistryError::InvalidState {
                slot: slot.clone(),
                status: state.status(),
            }),
        }
    }

    /// Release only if the slot is held by `ticket`.
    pub fn release_held(&self, slot: &SlotId, ticket: TicketId) -> Result<(), RegistryError> {
        let cell = self.cell(slot)?;
        let mut state = cell.lock();
        match state.ticket() {
            Some(held) if held == ticket => {
                *state = Occupancy::Free;
                Ok(())
            }
            Some(_) => Err(RegistryError::NotHeldBy {
                slot: slot.clone(),
                ticket,
            }),
            None => Err(RegistryError::InvalidState {
                slot: slot.clone(),
                status: state.status(),
            }),
        }
    }

    pub fn set_out_of_service(&self, slot: &SlotId) -> Result<(), RegistryError> {
        self.toggle_service(slot, Occupancy::Free, Occupancy::OutOfService)
    }

    pub fn return_to_service(&self, slot: &SlotId) -> Result<(), RegistryError> {
        self.toggle_service(slot, Occupancy::OutOfService, Occupancy::Free)
    }

    fn toggle_service(
        &self,
        slot: &SlotId,
        from: Occupancy,
        to: Occupancy,
    ) -> Result<(), RegistryError> {
        let cell = self.cell(slot)?;
        let mut state = cell.lock();
        if *state != from {
            return Err(RegistryError::InvalidState {
                slot: slot.clone(),
                status: state.status(),
            });
        }
        *state = to;
        Ok(())
    }

    pub fn occupancy(&self, slot: &SlotId) -> Result<Occupancy, RegistryError> {
        Ok(*self.cell(slot)?.lock())
    }

    pub fn current_ticket(&self, slot: &SlotId) -> Result<Option<TicketId>, RegistryError> {
        Ok(self.occupancy(slot)?.ticket())
    }

    pub fn class_of(&self, slot: &SlotId) -> Result<SlotClass, RegistryError> {
        Ok(self.cell(slot)?.class)
    }

    /// Point-in-time view of every slot, in inventory order.
    ///
    /// Each slot is read under its own lock; the view as a whole is not atomic.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.cells
            .iter()
            .map(|cell| Slot::from_occupancy(cell.id.clone(), cell.class, *cell.lock()))
            .collect()
    }

    pub fn counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for cell in &self.cells {
            counts.add(cell.lock().status());
        }
        counts
    }

    /// True if no Free slot of any class remains.
    pub fn is_full(&self) -> bool {
        !self.cells.iter().any(|cell| cell.lock().is_free())
    }
}

impl std::fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("slots", &self.cells.len())
            .field("fallback", &self.fallback)
            .finish()
    }
}
