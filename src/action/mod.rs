//! Canonical request and result types.
//!
//! Every transport works on these types so that the dispatcher never sees a
//! protocol-specific shape:
//! - `CanonicalRequest`: an action plus exactly one matching payload
//! - `CanonicalResult`: success flag, human-readable message, optional data
//! - `InboundRequest`: the wire document accepted at the gateway boundary

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while turning an inbound document into a canonical request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action '{0}' requires a '{0}' payload")]
    MissingPayload(Action),

    #[error("action '{action}' does not match payload '{payload}'")]
    PayloadMismatch { action: Action, payload: Action },

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// The intended action of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Auth,
    Log,
    Mail,
}

impl Action {
    /// All known actions, in routing-table order.
    pub const ALL: [Action; 3] = [Action::Auth, Action::Log, Action::Mail];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Auth => "auth",
            Action::Log => "log",
            Action::Mail => "mail",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Action::Auth),
            "log" => Ok(Action::Log),
            "mail" => Ok(Action::Mail),
            other => Err(ValidationError::UnknownAction(other.to_string())),
        }
    }
}

/// Credentials forwarded to the authentication service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthPayload")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Log severity. Selects the routing key on the async path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }

    fn is_default(&self) -> bool {
        *self == Severity::Info
    }
}

/// A log entry for the logger service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub name: String,
    pub data: String,
    /// Omitted on the wire when INFO; the routing key carries it on the async path.
    #[serde(default, skip_serializing_if = "Severity::is_default")]
    pub level: Severity,
}

impl LogPayload {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            level: Severity::Info,
        }
    }

    pub fn with_level(mut self, level: Severity) -> Self {
        self.level = level;
        self
    }
}

/// An outbound mail message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailPayload {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub message: String,
}

/// Exactly one payload variant.
///
/// Serializes as the bare inner document, which is the body every
/// downstream service expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ActionPayload {
    Auth(AuthPayload),
    Log(LogPayload),
    Mail(MailPayload),
}

impl ActionPayload {
    /// The action this payload belongs to.
    pub fn action(&self) -> Action {
        match self {
            ActionPayload::Auth(_) => Action::Auth,
            ActionPayload::Log(_) => Action::Log,
            ActionPayload::Mail(_) => Action::Mail,
        }
    }
}

/// Transport-agnostic request handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalRequest {
    pub action: Action,
    pub payload: ActionPayload,
}

impl CanonicalRequest {
    /// Build a request whose action is derived from the payload.
    pub fn new(payload: ActionPayload) -> Self {
        Self {
            action: payload.action(),
            payload,
        }
    }

    /// Check that the payload variant matches the declared action.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let payload = self.payload.action();
        if payload != self.action {
            return Err(ValidationError::PayloadMismatch {
                action: self.action,
                payload,
            });
        }
        Ok(())
    }

    /// Parse a raw JSON document into a canonical request.
    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        let inbound: InboundRequest =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::try_from(inbound)
    }
}

/// Wire document accepted at the gateway boundary.
///
/// `{"action":"auth","auth":{"email":"...","password":"..."}}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundRequest {
    pub action: String,
    #[serde(default)]
    pub auth: Option<AuthPayload>,
    #[serde(default)]
    pub log: Option<LogPayload>,
    #[serde(default)]
    pub mail: Option<MailPayload>,
}

impl TryFrom<InboundRequest> for CanonicalRequest {
    type Error = ValidationError;

    fn try_from(inbound: InboundRequest) -> Result<Self, Self::Error> {
        let action: Action = inbound.action.parse()?;

        let populated = [
            inbound.auth.is_some(),
            inbound.log.is_some(),
            inbound.mail.is_some(),
        ]
        .iter()
        .filter(|p| **p)
        .count();
        if populated > 1 {
            return Err(ValidationError::Malformed(
                "more than one payload populated".to_string(),
            ));
        }

        let payload = match action {
            Action::Auth => inbound.auth.map(ActionPayload::Auth),
            Action::Log => inbound.log.map(ActionPayload::Log),
            Action::Mail => inbound.mail.map(ActionPayload::Mail),
        };

        payload
            .map(|payload| CanonicalRequest { action, payload })
            .ok_or(ValidationError::MissingPayload(action))
    }
}

/// Uniform outcome of every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CanonicalResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}
