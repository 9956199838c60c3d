//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{payload_from_text, payload_to_text};
use crate::engine::{ArrivalError, DepartureError, TicketError};
use crate::fee::Amount;
use crate::health::HealthResponse;
use crate::registry::{RegistryError, SlotCounts};
use crate::service::{ArrivalTarget, ArriveError, HealthSnapshot, ParkingService};
use crate::slot::{SlotClass, SlotId, SlotStatus};
use crate::ticket::{Ticket, TicketId, TicketStatus};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: HealthResponse,
    pub version: VersionInfo,
    pub slots: SlotCounts,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        let status = if snapshot.is_full() {
            HealthResponse::Full
        } else {
            snapshot.state.into()
        };
        Self {
            status,
            version: snapshot.version,
            slots: snapshot.slots,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ArrivalRequest {
    pub vehicle_id: String,
    #[serde(default)]
    pub class: Option<SlotClass>,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
}

#[derive(Debug, Serialize)]
pub struct ArrivalResponse {
    pub ticket_id: TicketId,
    pub slot_id: SlotId,
    pub slot_class: SlotClass,
    pub issued_at: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct DepartureRequest {
    pub payload: String,
}

/// Ticket as shown to operators; the integrity tag never leaves the process.
#[derive(Debug, Serialize)]
pub struct TicketView {
    pub id: TicketId,
    pub vehicle_id: String,
    pub slot_id: SlotId,
    pub slot_class: SlotClass,
    pub status: TicketStatus,
    pub issued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voided_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<Amount>,
}

impl From<Ticket> for TicketView {
    fn from(ticket: Ticket) -> Self {
        Self {
            id: ticket.id,
            vehicle_id: ticket.vehicle_id,
            slot_id: ticket.slot_id,
            slot_class: ticket.slot_class,
            status: ticket.status,
            issued_at: ticket.issued_at,
            closed_at: ticket.closed_at,
            voided_at: ticket.voided_at,
            fee: ticket.fee,
        }
    }
}

/// One row of the payments ledger.
#[derive(Debug, Serialize)]
pub struct PaymentView {
    pub ticket_id: TicketId,
    pub vehicle_id: String,
    pub slot_id: SlotId,
    pub fee: Amount,
    pub closed_at: Option<DateTime<Utc>>,
}

fn error_response(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}

fn arrive_error_response(error: ArriveError) -> Response {
    let status = match &error {
        ArriveError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        ArriveError::Arrival(ArrivalError::EmptyVehicleId) => StatusCode::UNPROCESSABLE_ENTITY,
        ArriveError::Arrival(
            ArrivalError::NoSlotAvailable(_) | ArrivalError::SlotUnavailable(_),
        ) => StatusCode::CONFLICT,
        ArriveError::Arrival(ArrivalError::UnknownSlot(_)) => StatusCode::NOT_FOUND,
        ArriveError::Arrival(ArrivalError::InternalInvariantViolation(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(status, error)
}

fn departure_error_response(error: DepartureError) -> Response {
    let status = match &error {
        DepartureError::Malformed(_) => StatusCode::BAD_REQUEST,
        DepartureError::Forged => StatusCode::FORBIDDEN,
        DepartureError::NotFound(_) => StatusCode::NOT_FOUND,
        DepartureError::AlreadyClosed { .. } => StatusCode::CONFLICT,
    };
    error_response(status, error)
}

fn ticket_error_response(error: TicketError) -> Response {
    let status = match &error {
        TicketError::NotFound(_) => StatusCode::NOT_FOUND,
        TicketError::InvalidState { .. } => StatusCode::CONFLICT,
    };
    error_response(status, error)
}

fn registry_error_response(error: RegistryError) -> Response {
    let status = match &error {
        RegistryError::UnknownSlot(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::CONFLICT,
    };
    error_response(status, error)
}

fn parse_ticket_id(raw: &str) -> Result<TicketId, Response> {
    TicketId::parse(raw).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid ticket id '{raw}': {e}"),
        )
    })
}

async fn health_check(State(service): State<Arc<ParkingService>>) -> Json<HealthCheckResponse> {
    Json(service.health().await.into())
}

async fn create_arrival(
    State(service): State<Arc<ParkingService>>,
    Json(request): Json<ArrivalRequest>,
) -> Response {
    let target = match request.slot_id {
        Some(slot) => ArrivalTarget::Slot(slot),
        None => ArrivalTarget::Class(request.class.unwrap_or(SlotClass::Standard)),
    };

    match service.arrive(&request.vehicle_id, target).await {
        Ok(arrival) => (
            StatusCode::CREATED,
            Json(ArrivalResponse {
                ticket_id: arrival.ticket_id,
                slot_id: arrival.slot_id,
                slot_class: arrival.slot_class,
                issued_at: arrival.issued_at,
                payload: payload_to_text(&arrival.payload),
            }),
        )
            .into_response(),
        Err(e) => arrive_error_response(e),
    }
}

async fn create_departure(
    State(service): State<Arc<ParkingService>>,
    Json(request): Json<DepartureRequest>,
) -> Response {
    let payload = match payload_from_text(&request.payload) {
        Ok(payload) => payload,
        Err(e) => return departure_error_response(e.into()),
    };

    match service.depart(&payload) {
        Ok(departure) => (StatusCode::OK, Json(departure)).into_response(),
        Err(e) => departure_error_response(e),
    }
}

async fn get_ticket(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    let ticket_id = match parse_ticket_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match service.engine().ticket(ticket_id) {
        Ok(ticket) => Json(TicketView::from(ticket)).into_response(),
        Err(e) => ticket_error_response(e),
    }
}

async fn get_ticket_payload(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    let ticket_id = match parse_ticket_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match service.engine().reissue_payload(ticket_id) {
        Ok(payload) => Json(serde_json::json!({
            "ticket_id": ticket_id,
            "payload": payload_to_text(&payload),
        }))
        .into_response(),
        Err(e) => ticket_error_response(e),
    }
}

async fn void_ticket(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    let ticket_id = match parse_ticket_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match service.void(ticket_id) {
        Ok(ticket) => Json(TicketView::from(ticket)).into_response(),
        Err(e) => ticket_error_response(e),
    }
}

async fn list_slots(State(service): State<Arc<ParkingService>>) -> Response {
    Json(service.engine().slots()).into_response()
}

async fn slot_out_of_service(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    let slot = SlotId::new(id);
    match service.engine().set_out_of_service(&slot) {
        Ok(()) => slot_status_response(slot, SlotStatus::OutOfService),
        Err(e) => registry_error_response(e),
    }
}

async fn slot_in_service(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    let slot = SlotId::new(id);
    match service.engine().return_to_service(&slot) {
        Ok(()) => slot_status_response(slot, SlotStatus::Free),
        Err(e) => registry_error_response(e),
    }
}

async fn slot_ticket(
    State(service): State<Arc<ParkingService>>,
    Path(id): Path<String>,
) -> Response {
    match service.engine().ticket_for_slot(&SlotId::new(id)) {
        Ok(Some(ticket)) => Json(TicketView::from(ticket)).into_response(),
        Ok(None) => Json(serde_json::Value::Null).into_response(),
        Err(e) => registry_error_response(e),
    }
}

fn slot_status_response(slot: SlotId, status: SlotStatus) -> Response {
    Json(serde_json::json!({ "id": slot, "status": status })).into_response()
}

async fn summary(State(service): State<Arc<ParkingService>>) -> Response {
    Json(service.engine().summary()).into_response()
}

async fn payments(State(service): State<Arc<ParkingService>>) -> Response {
    let ledger: Vec<PaymentView> = service
        .engine()
        .closed_tickets()
        .into_iter()
        .map(|ticket| PaymentView {
            ticket_id: ticket.id,
            vehicle_id: ticket.vehicle_id,
            slot_id: ticket.slot_id,
            fee: ticket.fee.unwrap_or(Amount::ZERO),
            closed_at: ticket.closed_at,
        })
        .collect();
    Json(ledger).into_response()
}

async fn reconcile(State(service): State<Arc<ParkingService>>) -> Response {
    Json(service.reconcile()).into_response()
}

async fn shutdown(State(service): State<Arc<ParkingService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<ParkingService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/arrivals", post(create_arrival))
        .route("/departures", post(create_departure))
        .route("/tickets/{id}", get(get_ticket))
        .route("/tickets/{id}/payload", get(get_ticket_payload))
        .route("/tickets/{id}/void", post(void_ticket))
        .route("/slots", get(list_slots))
        .route("/slots/{id}/ticket", get(slot_ticket))
        .route("/slots/{id}/out-of-service", post(slot_out_of_service))
        .route("/slots/{id}/in-service", post(slot_in_service))
        .route("/summary", get(summary))
        .route("/payments", get(payments))
        .route("/reconcile", post(reconcile))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::TimeDelta;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::clock::ManualClock;
    use crate::codec::{IntegrityKey, TicketCodec};
    use crate::engine::AllocationEngine;
    use crate::fee::RateTable;
    use crate::health::Health;
    use crate::registry::{FallbackPolicy, SlotRegistry};
    use crate::store::TicketStore;

    struct Harness {
        service: Arc<ParkingService>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(slots: &[(&str, SlotClass)]) -> Self {
            let registry = SlotRegistry::new(
                slots.iter().map(|(id, class)| (SlotId::new(*id), *class)),
                FallbackPolicy::NextLarger,
            )
            .unwrap();
            let engine = AllocationEngine::new(
                Arc::new(registry),
                Arc::new(TicketStore::new()),
                TicketCodec::new(IntegrityKey::generate().unwrap()),
                Arc::new(RateTable::uniform(Amount::new(20))),
            );
            let clock = Arc::new(ManualClock::new(
                DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            ));
            let service = ParkingService::new(Arc::new(engine)).with_clock(clock.clone());
            Self {
                service: Arc::new(service),
                clock,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, serde_json::Value) {
            let response = routes(Arc::clone(&self.service))
                .oneshot(request)
                .await
                .unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let json = if bytes.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, json)
        }

        async fn get(&self, uri: &str) -> (StatusCode, serde_json::Value) {
            self.send(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn post(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
            self.send(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn arrive(&self, vehicle: &str) -> (StatusCode, serde_json::Value) {
            self.post("/arrivals", serde_json::json!({ "vehicle_id": vehicle }))
                .await
        }
    }

    fn one_slot() -> Harness {
        Harness::new(&[("1", SlotClass::Standard)])
    }

    #[tokio::test]
    async fn health_check_returns_status_and_version() {
        let h = one_slot();
        let (status, json) = h.get("/health-check").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "READY");
        assert!(json["version"]["parklet"].is_string());
        assert_eq!(json["slots"]["total"], 1);
    }

    #[tokio::test]
    async fn health_check_reports_full() {
        let h = one_slot();
        h.arrive("car-1").await;
        let (_, json) = h.get("/health-check").await;
        assert_eq!(json["status"], "FULL");
    }

    #[tokio::test]
    async fn arrival_then_departure_bills_stay() {
        let h = one_slot();
        let (status, arrival) = h.arrive("car-1").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(arrival["slot_id"], "1");
        assert_eq!(arrival["slot_class"], "standard");

        h.clock.advance(TimeDelta::minutes(150));
        let (status, departure) = h
            .post(
                "/departures",
                serde_json::json!({ "payload": arrival["payload"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(departure["ticket_id"], arrival["ticket_id"]);
        assert_eq!(departure["fee"], 40);
    }

    #[tokio::test]
    async fn second_scan_conflicts() {
        let h = one_slot();
        let (_, arrival) = h.arrive("car-1").await;
        let body = serde_json::json!({ "payload": arrival["payload"] });

        let (first, _) = h.post("/departures", body.clone()).await;
        let (second, json) = h.post("/departures", body).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("closed"));
    }

    #[tokio::test]
    async fn departure_errors_map_to_status_codes() {
        let h = one_slot();
        let (_, arrival) = h.arrive("car-1").await;

        let (status, _) = h
            .post("/departures", serde_json::json!({ "payload": "@@@" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut forged = payload_from_text(arrival["payload"].as_str().unwrap()).unwrap();
        let last = forged.len() - 1;
        forged[last] ^= 0x01;
        let (status, _) = h
            .post(
                "/departures",
                serde_json::json!({ "payload": payload_to_text(&forged) }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let other = one_slot();
        let (_, foreign) = other.arrive("car-9").await;
        let (status, _) = h
            .post(
                "/departures",
                serde_json::json!({ "payload": foreign["payload"] }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn arrival_errors_map_to_status_codes() {
        let h = one_slot();

        let (status, _) = h.arrive("  ").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        h.arrive("car-1").await;
        let (status, json) = h.arrive("car-2").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("no standard slot"));

        let (status, _) = h
            .post(
                "/arrivals",
                serde_json::json!({ "vehicle_id": "car-3", "slot_id": "99" }),
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn arrivals_unavailable_when_defunct() {
        let h = one_slot();
        h.service.set_health(Health::Defunct).await;
        let (status, _) = h.arrive("car-1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn preferred_slot_and_class() {
        let h = Harness::new(&[("C1", SlotClass::Compact), ("O1", SlotClass::Oversized)]);
        let (status, json) = h
            .post(
                "/arrivals",
                serde_json::json!({ "vehicle_id": "van-1", "class": "oversized" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["slot_id"], "O1");

        let (status, json) = h
            .post(
                "/arrivals",
                serde_json::json!({ "vehicle_id": "car-1", "slot_id": "C1" }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["slot_class"], "compact");
    }

    #[tokio::test]
    async fn ticket_lookup_void_and_reprint() {
        let h = one_slot();
        let (_, arrival) = h.arrive("car-1").await;
        let id = arrival["ticket_id"].as_str().unwrap().to_string();

        let (status, ticket) = h.get(&format!("/tickets/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ticket["status"], "active");
        assert!(ticket.get("integrity_tag").is_none());

        let (status, reprint) = h.get(&format!("/tickets/{id}/payload")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reprint["payload"], arrival["payload"]);

        let (status, voided) = h.post(&format!("/tickets/{id}/void"), serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(voided["status"], "voided");

        let (status, _) = h.get(&format!("/tickets/{id}/payload")).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = h.get("/tickets/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = h.get(&format!("/tickets/{}", TicketId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn slot_service_toggle() {
        let h = one_slot();
        let (status, json) = h
            .post("/slots/1/out-of-service", serde_json::json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "out_of_service");

        let (status, _) = h.arrive("car-1").await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = h.post("/slots/1/in-service", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = h.post("/slots/9/in-service", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, slots) = h.get("/slots").await;
        assert_eq!(slots[0]["status"], "free");
    }

    #[tokio::test]
    async fn slot_ticket_lookup() {
        let h = one_slot();
        let (_, json) = h.get("/slots/1/ticket").await;
        assert!(json.is_null());

        let (_, arrival) = h.arrive("car-1").await;
        let (status, json) = h.get("/slots/1/ticket").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], arrival["ticket_id"]);
        assert_eq!(json["vehicle_id"], "car-1");

        let (status, _) = h.get("/slots/9/ticket").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summary_and_payments() {
        let h = Harness::new(&[("1", SlotClass::Standard), ("2", SlotClass::Standard)]);
        let (_, a) = h.arrive("car-1").await;
        h.arrive("car-2").await;
        h.clock.advance(TimeDelta::hours(2));
        h.post("/departures", serde_json::json!({ "payload": a["payload"] }))
            .await;

        let (_, summary) = h.get("/summary").await;
        assert_eq!(summary["total"], 2);
        assert_eq!(summary["occupied"], 1);
        assert_eq!(summary["active_tickets"], 1);
        assert_eq!(summary["revenue"], 40);

        let (_, payments) = h.get("/payments").await;
        assert_eq!(payments.as_array().unwrap().len(), 1);
        assert_eq!(payments[0]["vehicle_id"], "car-1");
        assert_eq!(payments[0]["fee"], 40);
    }

    #[tokio::test]
    async fn reconcile_reports_clean_state() {
        let h = one_slot();
        h.arrive("car-1").await;
        let (status, report) = h.post("/reconcile", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["released"], serde_json::json!([]));
        assert_eq!(report["dangling"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn shutdown_triggers_signal() {
        let h = one_slot();
        let rx = h.service.shutdown_rx();
        let (status, _) = h.post("/shutdown", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(*rx.borrow());
    }
}
