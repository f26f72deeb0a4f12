use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info, warn};

use devlease_protocol::{
    BOOKED_COLOR, BookingRequest, CalendarEntry, ClientEvent, DenialReason, ServerEvent,
};

use crate::authorizer::{CommandAuthorizer, Decision};
use crate::broker::{RealtimeBroker, Session};
use crate::error::{BookingError, StorageError};
use crate::ledger::{NewReservation, Reservation, ReservationLedger};
use crate::principal::Principal;

#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Device targeted by control commands that do not name one.
    pub default_device_id: String,
    /// How far back the calendar listing reaches.
    pub listing_window: TimeDelta,
    /// Role that bypasses the booking check. `None` disables the bypass.
    pub admin_role: Option<String>,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            default_device_id: "ESP-Real-Hardware".to_string(),
            listing_window: TimeDelta::days(7),
            admin_role: None,
        }
    }
}

/// Routes inbound events and booking requests through the ledger, the
/// authorizer and the broker.
pub struct Hub {
    ledger: Arc<ReservationLedger>,
    authorizer: CommandAuthorizer,
    broker: Arc<RealtimeBroker>,
    options: HubOptions,
}

impl Hub {
    pub fn new(
        ledger: Arc<ReservationLedger>,
        broker: Arc<RealtimeBroker>,
        options: HubOptions,
    ) -> Self {
        let mut authorizer = CommandAuthorizer::new(ledger.clone());
        if let Some(role) = options.admin_role.as_deref() {
            authorizer = authorizer.with_admin_override(role);
        }
        Self {
            ledger,
            authorizer,
            broker,
            options,
        }
    }

    pub fn broker(&self) -> &Arc<RealtimeBroker> {
        &self.broker
    }

    pub fn ledger(&self) -> &Arc<ReservationLedger> {
        &self.ledger
    }

    /// Register a freshly authenticated connection and greet it.
    pub fn open_session(
        &self,
        principal: Principal,
    ) -> (Session, tokio::sync::mpsc::Receiver<ServerEvent>) {
        let (session, rx) = self.broker.connect(principal);
        let principal = session.principal();
        info!(
            session = %session.id(),
            user = %principal.display_name(),
            tier = ?principal.tier(),
            "client connected"
        );
        self.broker.unicast(
            session.id(),
            ServerEvent::Welcome {
                name: principal.display_name().to_string(),
                tier: principal.tier(),
                roles: principal.roles().iter().cloned().collect(),
            },
        );
        (session, rx)
    }

    pub fn close_session(&self, session: &Session) {
        self.broker.disconnect(session.id());
        info!(session = %session.id(), "client disconnected");
    }

    /// Admit a reservation for `principal` and tell every session the ledger changed.
    pub async fn book(
        &self,
        principal: &Principal,
        request: BookingRequest,
    ) -> Result<Reservation, BookingError> {
        let holder_id = principal.id().ok_or(BookingError::NoIdentity)?;
        let new = NewReservation {
            device_id: request.device_id,
            holder_id: holder_id.to_string(),
            holder_name: principal.display_name().to_string(),
            start: request.start,
            end: request.end,
        };

        match self.ledger.admit_and_create(new).await {
            Ok(reservation) => {
                info!(
                    id = reservation.id,
                    device_id = %reservation.device_id,
                    user = %reservation.holder_name,
                    start = %reservation.start,
                    end = %reservation.end,
                    "reservation admitted"
                );
                self.broker.broadcast(ServerEvent::LedgerChanged);
                Ok(reservation)
            }
            Err(err) => {
                let err = BookingError::from(err);
                match &err {
                    BookingError::Storage(e) => error!(error = %e, "reservation store failure"),
                    other => info!(user = %principal.display_name(), reason = %other, "reservation rejected"),
                }
                Err(err)
            }
        }
    }

    /// Calendar projection of recent and upcoming reservations.
    pub async fn calendar(&self) -> Result<Vec<CalendarEntry>, StorageError> {
        let reservations = self.ledger.list_recent(self.options.listing_window).await?;
        Ok(reservations.into_iter().map(calendar_entry).collect())
    }

    /// Handle one inbound real-time event from `session`.
    pub async fn dispatch(&self, session: &Session, event: ClientEvent) {
        self.dispatch_at(session, event, Utc::now()).await
    }

    pub async fn dispatch_at(&self, session: &Session, event: ClientEvent, now: DateTime<Utc>) {
        match event {
            ClientEvent::Telemetry { payload } => {
                self.broker
                    .broadcast(ServerEvent::TelemetryBroadcast { payload });
            }
            ClientEvent::Status { payload } => {
                self.broker.broadcast(ServerEvent::StatusBroadcast { payload });
            }
            ClientEvent::ControlCommand { device_id, payload } => {
                let device_id =
                    device_id.unwrap_or_else(|| self.options.default_device_id.clone());
                self.control(session, device_id, payload, now).await;
            }
        }
    }

    async fn control(
        &self,
        session: &Session,
        device_id: String,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let principal = session.principal();
        match self.authorizer.authorize(principal, &device_id, now).await {
            Ok(Decision::Allow) => {
                info!(user = %principal.display_name(), %device_id, "control command allowed");
                self.broker
                    .broadcast(ServerEvent::ControlBroadcast { device_id, payload });
            }
            Ok(Decision::Deny {
                reason,
                holder_name,
            }) => {
                warn!(
                    user = %principal.display_name(),
                    %device_id,
                    ?reason,
                    holder = holder_name.as_deref().unwrap_or("-"),
                    "control command denied"
                );
                self.broker.unicast(
                    session.id(),
                    ServerEvent::Denial {
                        reason,
                        message: denial_message(reason, holder_name.as_deref()),
                    },
                );
            }
            Err(err) => {
                error!(error = %err, %device_id, "authorization lookup failed");
                self.broker.unicast(
                    session.id(),
                    ServerEvent::Error {
                        message: "internal server error".to_string(),
                    },
                );
            }
        }
    }
}

fn calendar_entry(reservation: Reservation) -> CalendarEntry {
    CalendarEntry {
        title: format!("Booked: {}", reservation.holder_name),
        start: reservation.start,
        end: reservation.end,
        color: BOOKED_COLOR.to_string(),
    }
}

fn denial_message(reason: DenialReason, holder_name: Option<&str>) -> String {
    match reason {
        DenialReason::NoIdentity => "user is not identified; log in to control the device".to_string(),
        DenialReason::NotBooked => {
            "device is not booked right now; reserve a slot in the calendar first".to_string()
        }
        DenialReason::HeldByOther => format!(
            "locked: currently booked by {}",
            holder_name.unwrap_or("another user")
        ),
    }
}
