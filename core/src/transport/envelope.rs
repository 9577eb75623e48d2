use std::collections::HashMap;

use uuid::Uuid;

use crate::config::SerializerKind;
use crate::event::Event;
use crate::ids::{ContextId, SpaceId};
use crate::scope::Scope;
use crate::transport::codec::{cipher_for, serializer_for, EnvelopeCipher, EventSerializer, Headers};
use crate::{KernelError, Result};

/// Reserved envelope header keys.
pub mod headers {
    /// Type of the carried event, readable without decoding the body
    pub const EVENT_TYPE: &str = "x-event-type";
    /// Serializer the sender used for the envelope fields
    pub const SERIALIZER: &str = "x-serializer";
    /// Publish URI of the sending kernel
    pub const KERNEL: &str = "x-kernel";
    /// Marks a space announcement; the body is not a domain event
    pub const DISCOVER: &str = "x-discover";
}

/// Number of frame parts of a data message: topic plus five envelope fields.
pub const PARTS: usize = 6;

/// Event type of the placeholder body carried by announcements.
const DISCOVERY_BODY: &str = "space.discovery";

/// Decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub context_id: ContextId,
    pub space_id: SpaceId,
    pub scope: Scope,
    pub headers: HashMap<String, String>,
    pub event: Event,
}

/// What came off the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Envelope),
    /// Space announcement; carries no event.
    Discovery {
        space_id: SpaceId,
        headers: HashMap<String, String>,
    },
}

impl Inbound {
    pub fn space_id(&self) -> &SpaceId {
        match self {
            Inbound::Message(envelope) => &envelope.space_id,
            Inbound::Discovery { space_id, .. } => space_id,
        }
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        match self {
            Inbound::Message(envelope) => &envelope.headers,
            Inbound::Discovery { headers, .. } => headers,
        }
    }
}

/// Turns (space, scope, event) triples into frame parts and back.
///
/// Parts are `[topic, contextId, spaceId, scope, headers, body]`. The topic is
/// the context id text and travels in clear for subscription matching; each of
/// the five other fields is serialized and encrypted on its own.
pub struct EnvelopeCodec {
    serializer: Box<dyn EventSerializer>,
    cipher: Box<dyn EnvelopeCipher>,
    kernel: String,
}

impl EnvelopeCodec {
    pub fn new(kind: SerializerKind, key: Option<&str>, kernel: impl Into<String>) -> Result<Self> {
        Ok(Self {
            serializer: serializer_for(kind),
            cipher: cipher_for(key)?,
            kernel: kernel.into(),
        })
    }

    pub fn with_parts(
        serializer: Box<dyn EventSerializer>,
        cipher: Box<dyn EnvelopeCipher>,
        kernel: impl Into<String>,
    ) -> Self {
        Self {
            serializer,
            cipher,
            kernel: kernel.into(),
        }
    }

    pub fn serializer_kind(&self) -> SerializerKind {
        self.serializer.kind()
    }

    fn base_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(
            headers::SERIALIZER.to_string(),
            self.serializer.kind().as_str().to_string(),
        );
        if !self.kernel.is_empty() {
            headers.insert(headers::KERNEL.to_string(), self.kernel.clone());
        }
        headers
    }

    pub fn encode(&self, space_id: &SpaceId, scope: &Scope, event: &Event) -> Result<Vec<Vec<u8>>> {
        let mut headers = self.base_headers();
        headers.insert(headers::EVENT_TYPE.to_string(), event.r#type.clone());
        let body = self.serializer.serialize_event(event)?;
        self.seal(space_id, scope, &headers, &body)
    }

    /// Announcement of `space_id` to the subscribers of its context.
    pub fn encode_discovery(&self, space_id: &SpaceId) -> Result<Vec<Vec<u8>>> {
        let mut headers = self.base_headers();
        headers.insert(headers::DISCOVER.to_string(), "true".to_string());
        let body = self
            .serializer
            .serialize_event(&Event::signal(DISCOVERY_BODY))?;
        self.seal(space_id, &Scope::All, &headers, &body)
    }

    fn seal(
        &self,
        space_id: &SpaceId,
        scope: &Scope,
        headers: &Headers,
        body: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        let context_id = space_id.context_id;
        Ok(vec![
            context_id.topic(),
            self.cipher.encrypt(context_id.as_uuid().as_bytes())?,
            self.cipher
                .encrypt(&self.serializer.serialize_space_id(space_id)?)?,
            self.cipher.encrypt(&self.serializer.serialize_scope(scope)?)?,
            self.cipher
                .encrypt(&self.serializer.serialize_headers(headers)?)?,
            self.cipher.encrypt(body)?,
        ])
    }

    /// Decodes frame parts. Any missing, empty or inconsistent field is malformed.
    pub fn decode(&self, parts: &[Vec<u8>]) -> Result<Inbound> {
        if parts.len() != PARTS {
            return Err(KernelError::MalformedEnvelope(format!(
                "expected {PARTS} parts, got {}",
                parts.len()
            )));
        }
        if let Some(idx) = parts.iter().position(Vec::is_empty) {
            return Err(KernelError::MalformedEnvelope(format!("part {idx} is empty")));
        }

        let context_id = ContextId::from_uuid(
            Uuid::from_slice(&self.cipher.decrypt(&parts[1])?)
                .map_err(|e| KernelError::MalformedEnvelope(format!("context id: {e}")))?,
        );
        if parts[0] != context_id.topic() {
            return Err(KernelError::MalformedEnvelope(
                "topic does not match context id".into(),
            ));
        }

        let space_id = self
            .serializer
            .deserialize_space_id(&self.cipher.decrypt(&parts[2])?)?;
        if space_id.context_id != context_id {
            return Err(KernelError::MalformedEnvelope(format!(
                "space {space_id} outside context {context_id}"
            )));
        }

        let headers = self
            .serializer
            .deserialize_headers(&self.cipher.decrypt(&parts[4])?)?;
        if let Some(kind) = headers.get(headers::SERIALIZER) {
            if kind != self.serializer.kind().as_str() {
                return Err(KernelError::MalformedEnvelope(format!(
                    "sender used serializer '{kind}'"
                )));
            }
        }
        if headers.contains_key(headers::DISCOVER) {
            return Ok(Inbound::Discovery { space_id, headers });
        }

        let scope = self
            .serializer
            .deserialize_scope(&self.cipher.decrypt(&parts[3])?)?;
        let event = self
            .serializer
            .deserialize_event(&self.cipher.decrypt(&parts[5])?)?;
        Ok(Inbound::Message(Envelope {
            context_id,
            space_id,
            scope,
            headers,
            event,
        }))
    }
}

impl std::fmt::Debug for EnvelopeCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCodec")
            .field("serializer", &self.serializer.kind())
            .field("kernel", &self.kernel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{Address, ParticipantId};

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn triple() -> (SpaceId, Scope, Event) {
        let space = SpaceId::random(ContextId::new_v4());
        let from = Address::new(space.clone(), ParticipantId::new_v4());
        let scope = Scope::except([from.clone()]);
        let event = Event::new("greeting", serde_json::json!({"hello": "world"})).with_source(from);
        (space, scope, event)
    }

    #[test]
    fn encrypted_protobuf_envelope_decodes_field_for_field() {
        let codec = EnvelopeCodec::new(SerializerKind::Protobuf, Some(KEY), "tcp://a:1").unwrap();
        let (space, scope, event) = triple();
        let parts = codec.encode(&space, &scope, &event).unwrap();
        assert_eq!(parts.len(), PARTS);
        assert_eq!(parts[0], space.context_id.topic());

        let Inbound::Message(envelope) = codec.decode(&parts).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(envelope.context_id, space.context_id);
        assert_eq!(envelope.space_id, space);
        assert_eq!(envelope.scope, scope);
        assert_eq!(envelope.event, event);
        assert_eq!(envelope.headers.get(headers::EVENT_TYPE), Some(&"greeting".to_string()));
        assert_eq!(envelope.headers.get(headers::KERNEL), Some(&"tcp://a:1".to_string()));
    }

    #[test]
    fn discovery_is_recognised_without_a_domain_body() {
        let codec = EnvelopeCodec::new(SerializerKind::Json, None, "").unwrap();
        let (space, _, _) = triple();
        let mut parts = codec.encode_discovery(&space).unwrap();
        parts[5] = b"not an event".to_vec();
        match codec.decode(&parts).unwrap() {
            Inbound::Discovery { space_id, headers } => {
                assert_eq!(space_id, space);
                assert!(!headers.contains_key(headers::KERNEL));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_or_missing_parts_are_malformed() {
        let codec = EnvelopeCodec::new(SerializerKind::Json, None, "k").unwrap();
        let (space, scope, event) = triple();
        let parts = codec.encode(&space, &scope, &event).unwrap();

        assert!(matches!(
            codec.decode(&parts[..5]),
            Err(KernelError::MalformedEnvelope(_))
        ));
        let mut emptied = parts.clone();
        emptied[3].clear();
        assert!(matches!(
            codec.decode(&emptied),
            Err(KernelError::MalformedEnvelope(_))
        ));
        let mut retopiced = parts;
        retopiced[0] = ContextId::new_v4().topic();
        assert!(matches!(
            codec.decode(&retopiced),
            Err(KernelError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn mismatched_key_or_serializer_fails() {
        let sender = EnvelopeCodec::new(SerializerKind::Json, Some(KEY), "k").unwrap();
        let (space, scope, event) = triple();
        let parts = sender.encode(&space, &scope, &event).unwrap();

        let clear = EnvelopeCodec::new(SerializerKind::Json, None, "k").unwrap();
        assert!(clear.decode(&parts).is_err());

        let plain_json = clear.encode(&space, &scope, &event).unwrap();
        let proto = EnvelopeCodec::new(SerializerKind::Protobuf, None, "k").unwrap();
        assert!(proto.decode(&plain_json).is_err());
    }
}
