use std::fmt;

use bon::Builder;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of a cached EDR as seen by the read path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(i32)]
pub enum EdrState {
    #[display("NEGOTIATED")]
    Negotiated = 50,
    #[display("REFRESHING")]
    Refreshing = 100,
}

impl EdrState {
    /// Entries in these states hand out their credential to readers.
    pub fn is_active(&self) -> bool {
        matches!(self, EdrState::Negotiated | EdrState::Refreshing)
    }
}

/// Metadata of a cached endpoint data reference, one per transfer process.
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrEntry {
    #[builder(into)]
    pub transfer_process_id: String,
    #[builder(into)]
    pub asset_id: String,
    #[builder(into)]
    pub agreement_id: String,
    #[builder(into)]
    pub contract_negotiation_id: Option<String>,
    #[builder(into)]
    pub provider_id: String,
    #[builder(default = EdrState::Negotiated)]
    pub state: EdrState,
    #[builder(default = 1)]
    pub state_count: i32,
    #[builder(default = now())]
    pub state_timestamp: DateTime<Utc>,
    #[builder(default = now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = now())]
    pub updated_at: DateTime<Utc>,
    #[builder(into)]
    pub error_detail: Option<String>,
    /// Fencing token, bumped by the store on every write and lease grant.
    #[builder(default)]
    pub version: i64,
}

impl EdrEntry {
    pub fn id(&self) -> &str {
        &self.transfer_process_id
    }

    pub fn transition_to_refreshing(&mut self) -> Result<(), StateError> {
        self.transition(
            EdrState::Refreshing,
            &[EdrState::Negotiated, EdrState::Refreshing],
        )
    }

    pub fn transition_to_negotiated(&mut self) -> Result<(), StateError> {
        self.transition(
            EdrState::Negotiated,
            &[EdrState::Refreshing, EdrState::Negotiated],
        )
    }

    /// Puts the entry in the shape a store persists on `save`: `NEGOTIATED`
    /// and stamped with `at`.
    pub fn mark_saved(&mut self, at: DateTime<Utc>) {
        if self.state != EdrState::Negotiated {
            self.state = EdrState::Negotiated;
            self.state_count = 1;
        }
        self.state_timestamp = at;
        self.updated_at = at;
    }

    fn transition(&mut self, to: EdrState, from: &[EdrState]) -> Result<(), StateError> {
        if !from.contains(&self.state) {
            return Err(StateError::InvalidTransition {
                id: self.transfer_process_id.clone(),
                from: self.state,
                to,
            });
        }

        self.state_count = if self.state == to {
            self.state_count + 1
        } else {
            1
        };
        self.state = to;
        self.state_timestamp = now();
        self.updated_at = self.state_timestamp;
        Ok(())
    }
}

/// The cached secret: where to call and which token to present.
#[derive(Builder, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdrCredential {
    #[builder(into)]
    pub endpoint: String,
    #[builder(into, default = "Authorization".to_string())]
    #[serde(default = "default_auth_key")]
    pub auth_key: String,
    #[builder(into)]
    pub auth_token: String,
    #[builder(into)]
    pub refresh_token: Option<String>,
    #[builder(into)]
    pub refresh_endpoint: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    /// Lifetime in seconds, counted from `issued_at` or, failing that, from the
    /// creation of the owning entry.
    pub expires_in: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EdrCredential {
    /// The instant from which this credential must no longer be used, `None`
    /// when it never expires.
    pub fn expiry(&self, entry: &EdrEntry) -> Option<DateTime<Utc>> {
        if let Some(expires_at) = self.expires_at {
            return Some(expires_at);
        }
        let expires_in = self.expires_in?;
        let issued_at = self.issued_at.unwrap_or(entry.created_at);
        issued_at.checked_add_signed(Duration::seconds(expires_in))
    }
}

impl fmt::Debug for EdrCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdrCredential")
            .field("endpoint", &self.endpoint)
            .field("auth_key", &self.auth_key)
            .field("auth_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("refresh_endpoint", &self.refresh_endpoint)
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// An entry together with its credential, as returned by point lookups.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedEdr {
    pub entry: EdrEntry,
    pub credential: EdrCredential,
}

impl CachedEdr {
    pub fn new(entry: EdrEntry, credential: EdrCredential) -> Self {
        Self { entry, credential }
    }
}

/// Short lived claim on a single entry, fenced by `token`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdrLease {
    pub transfer_process_id: String,
    pub holder: String,
    pub token: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct LeasedEdr {
    pub edr: CachedEdr,
    pub lease: EdrLease,
}

#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("Cannot transition EDR {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: EdrState,
        to: EdrState,
    },
}

/// Current time truncated to the millisecond precision the stores persist.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn default_auth_key() -> String {
    "Authorization".to_string()
}
