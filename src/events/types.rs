//--------------------------------------------------------------------------------------------------
// STRUCTS & TRAITS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | DomainEvent             | Immutable business event with routing metadata    | new, json         |
// | EventEnvelope           | JSON wire form of an event                        | to_bytes, decode  |
// | EventError              | Error types for event encoding and processing     |                   |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use rabbitmq::MessageContext;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use thiserror::Error;
use uuid::Uuid;

/// Schema version stamped on events that do not set one
pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Errors that can occur in the event system
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The payload could not be encoded, or is not valid JSON
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// A wire message or payload could not be decoded
    #[error("Failed to decode event: {0}")]
    Decode(String),

    /// A handler failed to process an event
    #[error("Failed to process event: {0}")]
    ProcessingError(String),

    /// The caller's context was cancelled or expired before the event was accepted
    #[error("Event not accepted: {0}")]
    Cancelled(String),
}

/// Type alias for Result with EventError
pub type EventResult<T> = Result<T, EventError>;

/// Something that happened in the business domain
///
/// The payload is carried pre-serialized (JSON bytes) so the bus never inspects it; the event type
/// tells consumers how to decode it. Empty tenant and trace ids mean "not set".
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEvent {
    id: String,
    event_type: String,
    aggregate_id: String,
    version: String,
    occurred_at: DateTime<Utc>,
    payload: Vec<u8>,
    tenant_id: String,
    trace_id: String,
}

impl DomainEvent {
    /// Creates an event with a fresh id and the current time
    ///
    /// `payload` must hold JSON; it is checked when the event is encoded for the wire.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            version: DEFAULT_EVENT_VERSION.to_owned(),
            occurred_at: Utc::now(),
            payload: payload.into(),
            tenant_id: String::new(),
            trace_id: String::new(),
        }
    }

    /// Creates an event whose payload is `data` encoded as JSON
    pub fn json<T: Serialize + ?Sized>(
        event_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        data: &T,
    ) -> EventResult<Self> {
        let payload =
            serde_json::to_vec(data).map_err(|err| EventError::Serialization(err.to_string()))?;
        Ok(Self::new(event_type, aggregate_id, payload))
    }

    /// Rebuilds an event received from the broker, keeping its original identity
    pub(crate) fn restore(
        id: String,
        envelope: &EventEnvelope,
        tenant_id: String,
        trace_id: String,
    ) -> Self {
        Self {
            id,
            event_type: envelope.event_type.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            version: envelope.event_version.clone(),
            occurred_at: envelope.occurred_at,
            payload: envelope.payload.get().as_bytes().to_vec(),
            tenant_id,
            trace_id,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Fills the tenant and trace ids the event does not carry yet from `ctx`
    pub fn inherit_metadata(mut self, ctx: &MessageContext) -> Self {
        if self.tenant_id.is_empty() {
            self.tenant_id = ctx.tenant_id().to_owned();
        }
        if self.trace_id.is_empty() {
            self.trace_id = ctx.trace_id().to_owned();
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Decodes the payload into the type the event type stands for
    pub fn decode_payload<T: DeserializeOwned>(&self) -> EventResult<T> {
        serde_json::from_slice(&self.payload).map_err(|err| EventError::Decode(err.to_string()))
    }

    /// Wire representation of the event
    ///
    /// # Errors
    /// `EventError::Serialization` if the payload is not valid JSON
    pub fn to_envelope(&self) -> EventResult<EventEnvelope> {
        let text = std::str::from_utf8(&self.payload)
            .map_err(|err| EventError::Serialization(format!("payload is not utf-8: {err}")))?;
        let payload = RawValue::from_string(text.to_owned())
            .map_err(|err| EventError::Serialization(format!("payload is not json: {err}")))?;

        Ok(EventEnvelope {
            event_type: self.event_type.clone(),
            event_version: self.version.clone(),
            aggregate_id: self.aggregate_id.clone(),
            occurred_at: self.occurred_at,
            payload,
        })
    }
}

/// The unit placed on the wire; the payload is embedded verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub event_version: String,
    pub aggregate_id: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Box<RawValue>,
}

impl EventEnvelope {
    pub fn to_bytes(&self) -> EventResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| EventError::Serialization(err.to_string()))
    }

    pub fn from_slice(body: &[u8]) -> EventResult<Self> {
        serde_json::from_slice(body).map_err(|err| EventError::Decode(err.to_string()))
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> EventResult<T> {
        serde_json::from_str(self.payload.get()).map_err(|err| EventError::Decode(err.to_string()))
    }
}
