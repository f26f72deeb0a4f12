pub mod authorizer;
pub mod broker;
pub mod error;
pub mod hub;
pub mod jwks;
pub mod ledger;
pub mod principal;

pub use authorizer::{CommandAuthorizer, Decision};
pub use broker::{RealtimeBroker, Session, SessionId};
pub use error::{
    AdmissionError, AuthenticationError, BookingError, LedgerError, StorageError, VerifyError,
};
pub use hub::{Hub, HubOptions};
pub use jwks::{JwksConfig, JwksVerifier};
pub use ledger::{BookingPolicy, NewReservation, Reservation, ReservationLedger};
pub use principal::{Credentials, Principal, PrincipalResolver, Tier, TokenClaims, TokenVerifier};
