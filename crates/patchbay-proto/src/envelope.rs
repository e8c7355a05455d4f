//! Message envelopes and the validating parser.
//!
//! Every payload on the wire is exactly one envelope. The `type` field
//! alone selects the variant; the parser then checks that every required
//! field is present with the right shape and that no unknown field rides
//! along. Parse failures always name the offending field.

use crate::topics::Operation;
use crate::value::Value;
use std::collections::BTreeMap;

/// Out-of-band metadata attached to resource transfers.
pub type MetaMap = BTreeMap<String, Value>;

/// Fire-and-forget event emission.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventEmission {
    /// Correlation id
    pub id: String,
    /// Emitting peer
    pub sender: Option<String>,
    /// Directed-delivery target
    pub receiver: Option<String>,
    /// Event name
    pub event: String,
    /// Positional parameters
    pub params: Option<Vec<Value>>,
}

/// Service call request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceRequest {
    /// Correlation id, echoed by the response
    pub id: String,
    /// Calling peer
    pub sender: Option<String>,
    /// Directed-delivery target
    pub receiver: Option<String>,
    /// Service name
    pub service: String,
    /// Positional parameters
    pub params: Option<Vec<Value>>,
}

/// Service call response.
///
/// Exactly one of `result` and `error` is meaningful: `error` present
/// means remote failure.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServiceResponse {
    /// Correlation id of the request being answered
    pub id: String,
    /// Responding peer
    pub sender: Option<String>,
    /// Directed-delivery target
    pub receiver: Option<String>,
    /// Return value on success
    pub result: Option<Value>,
    /// Failure message on error
    pub error: Option<String>,
}

/// Resource fetch request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceRequest {
    /// Correlation id shared by all chunks of the transfer
    pub id: String,
    /// Fetching peer
    pub sender: Option<String>,
    /// Directed-delivery target
    pub receiver: Option<String>,
    /// Resource name
    pub resource: String,
    /// Positional parameters
    pub params: Option<Vec<Value>>,
}

/// One chunk of a resource transfer.
///
/// Fetch responses leave `resource` unset; push traffic carries `resource`
/// (and `params`) so the receiving provisioner can route it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceResponse {
    /// Correlation id shared by all chunks of the transfer
    pub id: String,
    /// Sending peer
    pub sender: Option<String>,
    /// Directed-delivery target
    pub receiver: Option<String>,
    /// Resource name; present only on push traffic
    pub resource: Option<String>,
    /// Positional parameters; present only on push traffic
    pub params: Option<Vec<Value>>,
    /// Chunk payload
    pub chunk: Option<Vec<u8>>,
    /// First-chunk metadata
    pub meta: Option<MetaMap>,
    /// Failure message terminating the transfer
    pub error: Option<String>,
    /// True on the terminating chunk (wire field `final`)
    pub last: bool,
}

/// A typed wire message, one of the five protocol kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// `event-emission`
    Event(EventEmission),
    /// `service-call-request`
    ServiceRequest(ServiceRequest),
    /// `service-call-response`
    ServiceResponse(ServiceResponse),
    /// `resource-transfer-request`
    ResourceRequest(ResourceRequest),
    /// `resource-transfer-response`
    ResourceResponse(ResourceResponse),
}

impl Envelope {
    /// The operation label doubling as this envelope's `type` tag.
    #[must_use]
    pub fn operation(&self) -> Operation {
        match self {
            Envelope::Event(_) => Operation::EventEmission,
            Envelope::ServiceRequest(_) => Operation::ServiceCallRequest,
            Envelope::ServiceResponse(_) => Operation::ServiceCallResponse,
            Envelope::ResourceRequest(_) => Operation::ResourceTransferRequest,
            Envelope::ResourceResponse(_) => Operation::ResourceTransferResponse,
        }
    }

    /// The correlation id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Envelope::Event(e) => &e.id,
            Envelope::ServiceRequest(e) => &e.id,
            Envelope::ServiceResponse(e) => &e.id,
            Envelope::ResourceRequest(e) => &e.id,
            Envelope::ResourceResponse(e) => &e.id,
        }
    }

    /// Lower this envelope into the generic value form for encoding.
    ///
    /// Optional fields are omitted when absent.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert(
            "type".to_string(),
            Value::Text(self.operation().as_str().to_string()),
        );
        match self {
            Envelope::Event(e) => {
                put_common(&mut map, &e.id, &e.sender, &e.receiver);
                map.insert("event".to_string(), Value::Text(e.event.clone()));
                put_params(&mut map, &e.params);
            }
            Envelope::ServiceRequest(e) => {
                put_common(&mut map, &e.id, &e.sender, &e.receiver);
                map.insert("service".to_string(), Value::Text(e.service.clone()));
                put_params(&mut map, &e.params);
            }
            Envelope::ServiceResponse(e) => {
                put_common(&mut map, &e.id, &e.sender, &e.receiver);
                if let Some(result) = &e.result {
                    map.insert("result".to_string(), result.clone());
                }
                if let Some(error) = &e.error {
                    map.insert("error".to_string(), Value::Text(error.clone()));
                }
            }
            Envelope::ResourceRequest(e) => {
                put_common(&mut map, &e.id, &e.sender, &e.receiver);
                map.insert("resource".to_string(), Value::Text(e.resource.clone()));
                put_params(&mut map, &e.params);
            }
            Envelope::ResourceResponse(e) => {
                put_common(&mut map, &e.id, &e.sender, &e.receiver);
                if let Some(resource) = &e.resource {
                    map.insert("resource".to_string(), Value::Text(resource.clone()));
                }
                put_params(&mut map, &e.params);
                if let Some(chunk) = &e.chunk {
                    map.insert("chunk".to_string(), Value::Bytes(chunk.clone()));
                }
                if let Some(meta) = &e.meta {
                    map.insert("meta".to_string(), Value::Map(meta.clone()));
                }
                if let Some(error) = &e.error {
                    map.insert("error".to_string(), Value::Text(error.clone()));
                }
                map.insert("final".to_string(), Value::Bool(e.last));
            }
        }
        Value::Map(map)
    }

    /// Parse a decoded generic value into a typed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] naming the missing, malformed or unknown
    /// field.
    pub fn parse(value: Value) -> Result<Envelope, ProtocolError> {
        let Value::Map(mut map) = value else {
            return Err(ProtocolError::NotAMap);
        };
        let label = take_text(&mut map, "type")?;
        let operation =
            Operation::parse(&label).ok_or(ProtocolError::UnknownType(label))?;
        let id = take_text(&mut map, "id")?;
        let sender = take_optional_text(&mut map, "sender")?;
        let receiver = take_optional_text(&mut map, "receiver")?;

        let envelope = match operation {
            Operation::EventEmission => Envelope::Event(EventEmission {
                id,
                sender,
                receiver,
                event: take_text(&mut map, "event")?,
                params: take_params(&mut map)?,
            }),
            Operation::ServiceCallRequest => Envelope::ServiceRequest(ServiceRequest {
                id,
                sender,
                receiver,
                service: take_text(&mut map, "service")?,
                params: take_params(&mut map)?,
            }),
            Operation::ServiceCallResponse => Envelope::ServiceResponse(ServiceResponse {
                id,
                sender,
                receiver,
                result: map.remove("result"),
                error: take_optional_text(&mut map, "error")?,
            }),
            Operation::ResourceTransferRequest => Envelope::ResourceRequest(ResourceRequest {
                id,
                sender,
                receiver,
                resource: take_text(&mut map, "resource")?,
                params: take_params(&mut map)?,
            }),
            Operation::ResourceTransferResponse => Envelope::ResourceResponse(ResourceResponse {
                id,
                sender,
                receiver,
                resource: take_optional_text(&mut map, "resource")?,
                params: take_params(&mut map)?,
                chunk: take_chunk(&mut map)?,
                meta: take_meta(&mut map)?,
                error: take_optional_text(&mut map, "error")?,
                last: take_bool(&mut map, "final")?,
            }),
        };

        if let Some(stray) = map.into_keys().next() {
            return Err(ProtocolError::UnknownField(stray));
        }
        Ok(envelope)
    }
}

fn put_common(
    map: &mut BTreeMap<String, Value>,
    id: &str,
    sender: &Option<String>,
    receiver: &Option<String>,
) {
    map.insert("id".to_string(), Value::Text(id.to_string()));
    if let Some(sender) = sender {
        map.insert("sender".to_string(), Value::Text(sender.clone()));
    }
    if let Some(receiver) = receiver {
        map.insert("receiver".to_string(), Value::Text(receiver.clone()));
    }
}

fn put_params(map: &mut BTreeMap<String, Value>, params: &Option<Vec<Value>>) {
    if let Some(params) = params {
        map.insert("params".to_string(), Value::Array(params.clone()));
    }
}

fn take_text(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<String, ProtocolError> {
    match map.remove(field) {
        Some(Value::Text(text)) => Ok(text),
        Some(other) => Err(ProtocolError::invalid(field, "string", &other)),
        None => Err(ProtocolError::MissingField(field)),
    }
}

fn take_optional_text(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match map.remove(field) {
        Some(Value::Text(text)) => Ok(Some(text)),
        Some(other) => Err(ProtocolError::invalid(field, "string", &other)),
        None => Ok(None),
    }
}

fn take_params(map: &mut BTreeMap<String, Value>) -> Result<Option<Vec<Value>>, ProtocolError> {
    match map.remove("params") {
        Some(Value::Array(items)) => Ok(Some(items)),
        Some(other) => Err(ProtocolError::invalid("params", "array", &other)),
        None => Ok(None),
    }
}

fn take_chunk(map: &mut BTreeMap<String, Value>) -> Result<Option<Vec<u8>>, ProtocolError> {
    match map.remove("chunk") {
        Some(Value::Bytes(bytes)) => Ok(Some(bytes)),
        // An explicit null chunk is permitted and means "no payload".
        Some(Value::Null) => Ok(None),
        Some(other) => Err(ProtocolError::invalid("chunk", "bytes or null", &other)),
        None => Ok(None),
    }
}

fn take_meta(map: &mut BTreeMap<String, Value>) -> Result<Option<MetaMap>, ProtocolError> {
    match map.remove("meta") {
        Some(Value::Map(meta)) => Ok(Some(meta)),
        Some(other) => Err(ProtocolError::invalid("meta", "map", &other)),
        None => Ok(None),
    }
}

fn take_bool(
    map: &mut BTreeMap<String, Value>,
    field: &'static str,
) -> Result<bool, ProtocolError> {
    match map.remove(field) {
        Some(Value::Bool(flag)) => Ok(flag),
        Some(other) => Err(ProtocolError::invalid(field, "bool", &other)),
        None => Err(ProtocolError::MissingField(field)),
    }
}

/// Errors raised by the envelope parser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The decoded value is not a map
    #[error("envelope is not a map")]
    NotAMap,
    /// The `type` tag names no known envelope kind
    #[error("unknown envelope type: {0}")]
    UnknownType(String),
    /// A required field is absent
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// A field carries the wrong shape
    #[error("invalid field {field}: expected {expected}, found {found}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Expected shape
        expected: &'static str,
        /// Shape actually found
        found: &'static str,
    },
    /// A field not defined for this envelope kind
    #[error("unknown field: {0}")]
    UnknownField(String),
}

impl ProtocolError {
    fn invalid(field: &'static str, expected: &'static str, found: &Value) -> Self {
        ProtocolError::InvalidField {
            field,
            expected,
            found: found.type_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Codec;

    fn samples() -> Vec<Envelope> {
        vec![
            Envelope::Event(EventEmission {
                id: "r1".to_string(),
                sender: Some("p1".to_string()),
                receiver: None,
                event: "example/sample".to_string(),
                params: Some(vec![Value::from("world"), Value::from(42)]),
            }),
            Envelope::ServiceRequest(ServiceRequest {
                id: "r2".to_string(),
                sender: Some("p1".to_string()),
                receiver: Some("p2".to_string()),
                service: "example/hello".to_string(),
                params: Some(vec![Value::from("world")]),
            }),
            Envelope::ServiceResponse(ServiceResponse {
                id: "r2".to_string(),
                sender: Some("p2".to_string()),
                receiver: None,
                result: Some(Value::from("world:42")),
                error: None,
            }),
            Envelope::ResourceRequest(ResourceRequest {
                id: "r3".to_string(),
                sender: Some("p1".to_string()),
                receiver: None,
                resource: "example/download".to_string(),
                params: Some(vec![Value::from("foo")]),
            }),
            Envelope::ResourceResponse(ResourceResponse {
                id: "r3".to_string(),
                sender: Some("p2".to_string()),
                receiver: None,
                resource: Some("example/upload".to_string()),
                params: Some(vec![]),
                chunk: Some(vec![9, 8, 7]),
                meta: Some(MetaMap::from([(
                    "name".to_string(),
                    Value::from("file.bin"),
                )])),
                error: None,
                last: true,
            }),
        ]
    }

    #[test]
    fn parse_roundtrip_through_both_codecs() {
        for envelope in samples() {
            for codec in [Codec::Cbor, Codec::Json] {
                let wire = codec.encode(&envelope.to_value()).unwrap();
                let parsed = Envelope::parse(codec.decode(&wire).unwrap()).unwrap();
                assert_eq!(parsed, envelope, "codec {codec:?}");
            }
        }
    }

    #[test]
    fn parse_requires_type_and_id() {
        let err = Envelope::parse(Value::Map(BTreeMap::new())).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("type"));

        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("event-emission"));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("id"));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("telemetry"));
        map.insert("id".to_string(), Value::from("r1"));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("telemetry".to_string()));
    }

    #[test]
    fn parse_rejects_unknown_field() {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("event-emission"));
        map.insert("id".to_string(), Value::from("r1"));
        map.insert("event".to_string(), Value::from("example/sample"));
        map.insert("ttl".to_string(), Value::from(5));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownField("ttl".to_string()));
    }

    #[test]
    fn parse_rejects_cross_kind_field() {
        // A service field on an event envelope is unknown for that kind.
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("event-emission"));
        map.insert("id".to_string(), Value::from("r1"));
        map.insert("event".to_string(), Value::from("example/sample"));
        map.insert("service".to_string(), Value::from("example/hello"));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownField("service".to_string()));
    }

    #[test]
    fn parse_rejects_non_array_params() {
        let mut map = BTreeMap::new();
        map.insert("type".to_string(), Value::from("service-call-request"));
        map.insert("id".to_string(), Value::from("r1"));
        map.insert("service".to_string(), Value::from("example/hello"));
        map.insert("params".to_string(), Value::from("oops"));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidField {
                field: "params",
                expected: "array",
                found: "string",
            }
        );
    }

    #[test]
    fn parse_rejects_tagged_type() {
        let mut map = BTreeMap::new();
        map.insert(
            "type".to_string(),
            Value::Tagged(1040, Box::new(Value::from("event-emission"))),
        );
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidField {
                field: "type",
                expected: "string",
                found: "tagged",
            }
        );
    }

    #[test]
    fn parse_accepts_null_chunk() {
        let mut map = BTreeMap::new();
        map.insert(
            "type".to_string(),
            Value::from("resource-transfer-response"),
        );
        map.insert("id".to_string(), Value::from("r1"));
        map.insert("chunk".to_string(), Value::Null);
        map.insert("final".to_string(), Value::Bool(true));
        let parsed = Envelope::parse(Value::Map(map)).unwrap();
        let Envelope::ResourceResponse(response) = parsed else {
            panic!("wrong kind");
        };
        assert_eq!(response.chunk, None);
        assert!(response.last);
    }

    #[test]
    fn resource_response_requires_final() {
        let mut map = BTreeMap::new();
        map.insert(
            "type".to_string(),
            Value::from("resource-transfer-response"),
        );
        map.insert("id".to_string(), Value::from("r1"));
        let err = Envelope::parse(Value::Map(map)).unwrap_err();
        assert_eq!(err, ProtocolError::MissingField("final"));
    }
}
