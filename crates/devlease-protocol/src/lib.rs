use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a controlled device (e.g. `ESP-Real-Hardware`).
pub type DeviceId = String;

/// Colour used for every booked slot in the calendar view.
pub const BOOKED_COLOR: &str = "#e74c3c";

/// Events a connected client sends over the real-time channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Sensor readings pushed by the device (position, etc).
    Telemetry { payload: Value },
    /// UI status mirrored from the device (e.g. current LED state).
    Status { payload: Value },
    /// A command for the device. Only the active reservation holder may send it.
    ControlCommand {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<DeviceId>,
        payload: Value,
    },
}

/// Events the server pushes to connected clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once after the handshake so the client knows who it is.
    Welcome {
        name: String,
        tier: Tier,
        roles: Vec<String>,
    },
    TelemetryBroadcast {
        payload: Value,
    },
    StatusBroadcast {
        payload: Value,
    },
    ControlBroadcast {
        device_id: DeviceId,
        payload: Value,
    },
    /// A control command was rejected; sent to the originating session only.
    Denial {
        reason: DenialReason,
        message: String,
    },
    /// The reservation ledger changed; observers should refresh their view.
    LedgerChanged,
    Error {
        message: String,
    },
}

/// Coarse trust classification of a connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Anonymous,
    Device,
    Guest,
    User,
}

/// Why a control command was refused.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The principal has no user identity and cannot hold reservations.
    NoIdentity,
    /// No reservation is active for the device right now.
    NotBooked,
    /// Someone else holds the active reservation.
    HeldByOther,
}

/// Body of `POST /api/bookings`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    #[serde(alias = "espId")]
    pub device_id: DeviceId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Successful response of `POST /api/bookings`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BookingResponse {
    pub success: bool,
    pub id: i64,
}

/// One entry of `GET /api/bookings`, shaped for calendar widgets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CalendarEntry {
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub color: String,
}

/// Error body returned by every failing HTTP endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_command_without_device_defaults_to_none() {
        let evt: ClientEvent =
            serde_json::from_str(r#"{"event":"control-command","payload":{"value":1}}"#).unwrap();
        assert_eq!(
            evt,
            ClientEvent::ControlCommand {
                device_id: None,
                payload: json!({"value": 1}),
            }
        );
    }

    #[test]
    fn server_events_use_kebab_case_tags() {
        let json = serde_json::to_value(ServerEvent::LedgerChanged).unwrap();
        assert_eq!(json, json!({"event": "ledger-changed"}));

        let json = serde_json::to_value(ServerEvent::Denial {
            reason: DenialReason::HeldByOther,
            message: "busy".to_string(),
        })
        .unwrap();
        assert_eq!(json["event"], "denial");
        assert_eq!(json["reason"], "held_by_other");
    }

    #[test]
    fn booking_request_accepts_legacy_esp_id() {
        let req: BookingRequest = serde_json::from_str(
            r#"{"espId":"ESP-1","start":"2026-01-05T10:00:00Z","end":"2026-01-05T11:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(req.device_id, "ESP-1");
        assert_eq!((req.end - req.start).num_minutes(), 60);
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"event":"reboot"}"#).is_err());
    }
}
