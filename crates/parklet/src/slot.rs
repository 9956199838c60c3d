//! Slot identity, size classes and occupancy state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ticket::TicketId;

/// Identifier of a physical parking slot, as painted on the bay (e.g. `"A12"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SlotId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Size class of a slot, ordered smallest to largest.
///
/// A vehicle that asked for class `c` fits any slot whose class is `>= c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotClass {
    Compact,
    Standard,
    Oversized,
}

impl SlotClass {
    pub const COUNT: usize = 3;

    /// Every class, smallest first.
    pub const ALL: [SlotClass; Self::COUNT] = [Self::Compact, Self::Standard, Self::Oversized];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Standard => "standard",
            Self::Oversized => "oversized",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Classes able to hold a vehicle of this class, smallest first.
    pub fn at_least(self) -> impl Iterator<Item = SlotClass> {
        Self::ALL.into_iter().filter(move |class| *class >= self)
    }
}

impl fmt::Display for SlotClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown slot class '{0}' (expected compact, standard or oversized)")]
pub struct UnknownSlotClass(pub String);

impl FromStr for SlotClass {
    type Err = UnknownSlotClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "standard" => Ok(Self::Standard),
            "oversized" => Ok(Self::Oversized),
            _ => Err(UnknownSlotClass(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Free,
    Reserved,
    Occupied,
    OutOfService,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Reserved => "reserved",
            Self::Occupied => "occupied",
            Self::OutOfService => "out_of_service",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Occupancy of a slot.
///
/// The holding ticket lives inside `Reserved`/`Occupied`, so a slot can never
/// carry a ticket while free or lack one while held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Reserved(TicketId),
    Occupied(TicketId),
    OutOfService,
}

impl Occupancy {
    pub fn status(&self) -> SlotStatus {
        match self {
            Self::Free => SlotStatus::Free,
            Self::Reserved(_) => SlotStatus::Reserved,
            Self::Occupied(_) => SlotStatus::Occupied,
            Self::OutOfService => SlotStatus::OutOfService,
        }
    }

    pub fn ticket(&self) -> Option<TicketId> {
        match self {
            Self::Reserved(id) | Self::Occupied(id) => Some(*id),
            Self::Free | Self::OutOfService => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }
}

/// Point-in-time view of a slot, also the record a storage backend persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub class: SlotClass,
    pub status: SlotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_ticket_id: Option<TicketId>,
}

impl Slot {
    pub fn free(id: impl Into<SlotId>, class: SlotClass) -> Self {
        Self {
            id: id.into(),
            class,
            status: SlotStatus::Free,
            current_ticket_id: None,
        }
    }

    pub(crate) fn from_occupancy(id: SlotId, class: SlotClass, occupancy: Occupancy) -> Self {
        Self {
            id,
            class,
            status: occupancy.status(),
            current_ticket_id: occupancy.ticket(),
        }
    }

    /// Occupancy described by this record, or `None` when status and ticket disagree.
    pub fn occupancy(&self) -> Option<Occupancy> {
        match (self.status, self.current_ticket_id) {
            (SlotStatus::Free, None) => Some(Occupancy::Free),
            (SlotStatus::OutOfService, None) => Some(Occupancy::OutOfService),
            (SlotStatus::Reserved, Some(id)) => Some(Occupancy::Reserved(id)),
            (SlotStatus::Occupied, Some(id)) => Some(Occupancy::Occupied(id)),
            _ => None,
        }
    }
}
