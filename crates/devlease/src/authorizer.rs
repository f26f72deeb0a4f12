use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use devlease_protocol::DenialReason;

use crate::error::StorageError;
use crate::ledger::ReservationLedger;
use crate::principal::Principal;

/// Outcome of a control-command authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny {
        reason: DenialReason,
        /// Display name of the current holder when `reason` is `HeldByOther`.
        holder_name: Option<String>,
    },
}

impl Decision {
    fn deny(reason: DenialReason) -> Self {
        Decision::Deny {
            reason,
            holder_name: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Decides whether a principal may control a device right now.
///
/// Evaluated per command against the ledger; no decision is cached.
pub struct CommandAuthorizer {
    ledger: Arc<ReservationLedger>,
    admin_role: Option<String>,
}

impl CommandAuthorizer {
    pub fn new(ledger: Arc<ReservationLedger>) -> Self {
        Self {
            ledger,
            admin_role: None,
        }
    }

    /// Principals holding `role` are allowed regardless of bookings.
    /// They still need a user identity.
    pub fn with_admin_override(mut self, role: impl Into<String>) -> Self {
        self.admin_role = Some(role.into());
        self
    }

    pub async fn authorize(
        &self,
        principal: &Principal,
        device_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Decision, StorageError> {
        let Some(principal_id) = principal.id() else {
            return Ok(Decision::deny(DenialReason::NoIdentity));
        };

        if let Some(role) = self.admin_role.as_deref() {
            if principal.has_role(role) {
                debug!(user = %principal.display_name(), device_id, "admin override");
                return Ok(Decision::Allow);
            }
        }

        let Some(active) = self.ledger.active_for(device_id, as_of).await? else {
            return Ok(Decision::deny(DenialReason::NotBooked));
        };

        if active.holder_id == principal_id {
            Ok(Decision::Allow)
        } else {
            Ok(Decision::Deny {
                reason: DenialReason::HeldByOther,
                holder_name: Some(active.holder_name),
            })
        }
    }
}
