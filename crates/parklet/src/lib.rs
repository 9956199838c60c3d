//! parklet: slot allocation and ticket lifecycle engine for parking facilities.

mod health;
mod version;

pub mod clock;
pub mod codec;
pub mod config;
pub mod engine;
pub mod fee;
pub mod registry;
pub mod service;
pub mod slot;
pub mod store;
pub mod ticket;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{
    CodecError, IntegrityKey, IntegrityTag, KeyError, PAYLOAD_LEN, PayloadFields, TicketCodec,
    payload_from_text, payload_to_text,
};
pub use config::{ConfigError, ParkletConfig};
pub use engine::{
    AllocationEngine, Arrival, ArrivalError, DEFAULT_MAX_RESERVE_ATTEMPTS, Departure,
    DepartureError, InvariantViolation, OccupancySummary, ReconcileReport, TicketError,
};
pub use fee::{Amount, FeePolicy, RateTable, Rounding};
pub use health::{Health, HealthResponse};
pub use registry::{FallbackPolicy, RegistryError, SlotCounts, SlotRegistry};
pub use service::{ArrivalTarget, ArriveError, HealthSnapshot, ParkingService};
pub use slot::{Occupancy, Slot, SlotClass, SlotId, SlotStatus};
pub use store::{StoreError, TicketStore};
pub use ticket::{Ticket, TicketId, TicketStatus};
pub use transport::{ServerConfig, serve};
pub use version::{PARKLET_VERSION, VersionInfo};
