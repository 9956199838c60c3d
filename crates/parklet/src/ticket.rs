//! Ticket records and their lifecycle.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::IntegrityTag;
use crate::fee::Amount;
use crate::slot::{SlotClass, SlotId};

/// Unique identifier for a ticket.
///
/// UUID v4: 122 random bits, so ids are unguessable and a collision means the
/// entropy source is broken rather than bad luck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(uuid::Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Active,
    Closed,
    Voided,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Voided)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Voided => "voided",
        }
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vehicle's stay, from issuance to closure.
///
/// `closed_at` and `fee` are set iff the ticket is `Closed`; `voided_at` iff it
/// is `Voided`. Terminal tickets never return to `Active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub vehicle_id: String,
    pub slot_id: SlotId,
    pub slot_class: SlotClass,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<DateTime<Utc>>,
    pub status: TicketStatus,
    pub integrity_tag: IntegrityTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<Amount>,
}

impl Ticket {
    pub(crate) fn issue(
        id: TicketId,
        vehicle_id: String,
        slot_id: SlotId,
        slot_class: SlotClass,
        issued_at: DateTime<Utc>,
        integrity_tag: IntegrityTag,
    ) -> Self {
        Self {
            id,
            vehicle_id,
            slot_id,
            slot_class,
            issued_at,
            closed_at: None,
            voided_at: None,
            status: TicketStatus::Active,
            integrity_tag,
            fee: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TicketStatus::Active
    }

    /// Billed stay length, once closed.
    pub fn duration(&self) -> Option<TimeDelta> {
        self.closed_at.map(|closed_at| closed_at - self.issued_at)
    }

    /// Active → Closed. On failure returns the status that blocked the transition.
    pub(crate) fn close(&mut self, closed_at: DateTime<Utc>, fee: Amount) -> Result<(), TicketStatus> {
        if !self.is_active() {
            return Err(self.status);
        }
        self.status = TicketStatus::Closed;
        self.closed_at = Some(closed_at);
        self.fee = Some(fee);
        Ok(())
    }

    /// Active → Voided. On failure returns the status that blocked the transition.
    pub(crate) fn void(&mut self, voided_at: DateTime<Utc>) -> Result<(), TicketStatus> {
        if !self.is_active() {
            return Err(self.status);
        }
        self.status = TicketStatus::Voided;
        self.voided_at = Some(voided_at);
        Ok(())
    }
}
