//! Envelope field serializers and ciphers.
//!
//! Every envelope field goes through an [`EventSerializer`] and then through an
//! [`EnvelopeCipher`]. Both ends of a link must agree on the serializer and the
//! key; the serializer name also travels in the `x-serializer` header so a
//! mismatch is reported instead of producing garbage.

use std::collections::HashMap;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use uuid::Uuid;

use crate::config::{SerializerKind, KEY_LEN};
use crate::event::Event;
use crate::ids::{Address, ParticipantId, SpaceId, SpaceSpecification};
use crate::scope::Scope;
use crate::{KernelError, Result};

pub type Headers = HashMap<String, String>;

pub trait EventSerializer: Send + Sync {
    fn kind(&self) -> SerializerKind;
    fn serialize_space_id(&self, space_id: &SpaceId) -> Result<Vec<u8>>;
    fn deserialize_space_id(&self, bytes: &[u8]) -> Result<SpaceId>;
    fn serialize_scope(&self, scope: &Scope) -> Result<Vec<u8>>;
    fn deserialize_scope(&self, bytes: &[u8]) -> Result<Scope>;
    fn serialize_headers(&self, headers: &Headers) -> Result<Vec<u8>>;
    fn deserialize_headers(&self, bytes: &[u8]) -> Result<Headers>;
    fn serialize_event(&self, event: &Event) -> Result<Vec<u8>>;
    fn deserialize_event(&self, bytes: &[u8]) -> Result<Event>;
}

pub fn serializer_for(kind: SerializerKind) -> Box<dyn EventSerializer> {
    match kind {
        SerializerKind::Json => Box::new(JsonEventSerializer),
        SerializerKind::Protobuf => Box::new(ProtobufEventSerializer),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEventSerializer;

impl EventSerializer for JsonEventSerializer {
    fn kind(&self) -> SerializerKind {
        SerializerKind::Json
    }

    fn serialize_space_id(&self, space_id: &SpaceId) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(space_id)?)
    }

    fn deserialize_space_id(&self, bytes: &[u8]) -> Result<SpaceId> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_scope(&self, scope: &Scope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(scope)?)
    }

    fn deserialize_scope(&self, bytes: &[u8]) -> Result<Scope> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_headers(&self, headers: &Headers) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(headers)?)
    }

    fn deserialize_headers(&self, bytes: &[u8]) -> Result<Headers> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_event(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }

    fn deserialize_event(&self, bytes: &[u8]) -> Result<Event> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// Protobuf messages for the wire, kept apart from the domain types.
mod wire {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SpaceId {
        #[prost(bytes = "vec", tag = "1")]
        pub context_id: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub id: Vec<u8>,
        /// Absent for the open event space.
        #[prost(string, optional, tag = "3")]
        pub specification: Option<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Address {
        #[prost(message, optional, tag = "1")]
        pub space_id: Option<SpaceId>,
        #[prost(bytes = "vec", tag = "2")]
        pub participant_id: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AddressList {
        #[prost(message, repeated, tag = "1")]
        pub addresses: Vec<Address>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct IdList {
        #[prost(bytes = "vec", repeated, tag = "1")]
        pub ids: Vec<Vec<u8>>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ScopeList {
        #[prost(message, repeated, tag = "1")]
        pub scopes: Vec<Scope>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Empty {}

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Scope {
        #[prost(oneof = "scope::Kind", tags = "1, 2, 3, 4, 5, 6")]
        pub kind: Option<scope::Kind>,
    }

    pub mod scope {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            All(super::Empty),
            #[prost(message, tag = "2")]
            Addresses(super::AddressList),
            #[prost(message, tag = "3")]
            Participants(super::IdList),
            #[prost(message, tag = "4")]
            Except(super::AddressList),
            #[prost(message, tag = "5")]
            AnyOf(super::ScopeList),
            /// Single-element list.
            #[prost(message, tag = "6")]
            Not(super::ScopeList),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Headers {
        #[prost(map = "string, string", tag = "1")]
        pub entries: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Event {
        #[prost(bytes = "vec", tag = "1")]
        pub id: Vec<u8>,
        #[prost(string, tag = "2")]
        pub r#type: String,
        #[prost(message, optional, tag = "3")]
        pub source: Option<Address>,
        #[prost(map = "string, string", tag = "4")]
        pub metadata: HashMap<String, String>,
        /// JSON text of the payload value.
        #[prost(bytes = "vec", tag = "5")]
        pub payload: Vec<u8>,
        #[prost(int64, tag = "6")]
        pub timestamp_ms: i64,
    }
}

fn uuid_from(bytes: &[u8], what: &str) -> Result<Uuid> {
    Uuid::from_slice(bytes)
        .map_err(|e| KernelError::Serialization(format!("invalid {what} uuid: {e}")))
}

fn space_id_to_wire(space_id: &SpaceId) -> wire::SpaceId {
    wire::SpaceId {
        context_id: space_id.context_id.as_uuid().as_bytes().to_vec(),
        id: space_id.id.as_bytes().to_vec(),
        specification: match &space_id.specification {
            SpaceSpecification::OpenEvent => None,
            SpaceSpecification::Named(name) => Some(name.clone()),
        },
    }
}

fn space_id_from_wire(msg: wire::SpaceId) -> Result<SpaceId> {
    Ok(SpaceId::new(
        crate::ids::ContextId::from_uuid(uuid_from(&msg.context_id, "context")?),
        uuid_from(&msg.id, "space")?,
        msg.specification
            .map(SpaceSpecification::Named)
            .unwrap_or_default(),
    ))
}

fn address_to_wire(address: &Address) -> wire::Address {
    wire::Address {
        space_id: Some(space_id_to_wire(&address.space_id)),
        participant_id: address.participant_id.as_uuid().as_bytes().to_vec(),
    }
}

fn address_from_wire(msg: wire::Address) -> Result<Address> {
    let space_id = msg
        .space_id
        .ok_or_else(|| KernelError::Serialization("address without space".into()))?;
    Ok(Address::new(
        space_id_from_wire(space_id)?,
        ParticipantId::from_uuid(uuid_from(&msg.participant_id, "participant")?),
    ))
}

fn addresses_to_wire<'a>(addresses: impl IntoIterator<Item = &'a Address>) -> wire::AddressList {
    wire::AddressList {
        addresses: addresses.into_iter().map(address_to_wire).collect(),
    }
}

fn addresses_from_wire(msg: wire::AddressList) -> Result<std::collections::BTreeSet<Address>> {
    msg.addresses.into_iter().map(address_from_wire).collect()
}

fn scope_to_wire(scope: &Scope) -> wire::Scope {
    use wire::scope::Kind;
    let kind = match scope {
        Scope::All => Kind::All(wire::Empty {}),
        Scope::Addresses(set) => Kind::Addresses(addresses_to_wire(set)),
        Scope::Participants(set) => Kind::Participants(wire::IdList {
            ids: set.iter().map(|p| p.as_uuid().as_bytes().to_vec()).collect(),
        }),
        Scope::Except(set) => Kind::Except(addresses_to_wire(set)),
        Scope::AnyOf(scopes) => Kind::AnyOf(wire::ScopeList {
            scopes: scopes.iter().map(scope_to_wire).collect(),
        }),
        Scope::Not(inner) => Kind::Not(wire::ScopeList {
            scopes: vec![scope_to_wire(inner)],
        }),
    };
    wire::Scope { kind: Some(kind) }
}

fn scope_from_wire(msg: wire::Scope) -> Result<Scope> {
    use wire::scope::Kind;
    match msg.kind {
        None => Err(KernelError::Serialization("scope without kind".into())),
        Some(Kind::All(_)) => Ok(Scope::All),
        Some(Kind::Addresses(list)) => Ok(Scope::Addresses(addresses_from_wire(list)?)),
        Some(Kind::Participants(list)) => Ok(Scope::Participants(
            list.ids
                .iter()
                .map(|id| uuid_from(id, "participant").map(ParticipantId::from_uuid))
                .collect::<Result<_>>()?,
        )),
        Some(Kind::Except(list)) => Ok(Scope::Except(addresses_from_wire(list)?)),
        Some(Kind::AnyOf(list)) => Ok(Scope::AnyOf(
            list.scopes
                .into_iter()
                .map(scope_from_wire)
                .collect::<Result<_>>()?,
        )),
        Some(Kind::Not(list)) => {
            let [inner]: [wire::Scope; 1] = list.scopes.try_into().map_err(|_| {
                KernelError::Serialization("negated scope needs exactly one operand".into())
            })?;
            Ok(Scope::Not(Box::new(scope_from_wire(inner)?)))
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProtobufEventSerializer;

impl EventSerializer for ProtobufEventSerializer {
    fn kind(&self) -> SerializerKind {
        SerializerKind::Protobuf
    }

    fn serialize_space_id(&self, space_id: &SpaceId) -> Result<Vec<u8>> {
        Ok(prost::Message::encode_to_vec(&space_id_to_wire(space_id)))
    }

    fn deserialize_space_id(&self, bytes: &[u8]) -> Result<SpaceId> {
        space_id_from_wire(prost::Message::decode(bytes)?)
    }

    fn serialize_scope(&self, scope: &Scope) -> Result<Vec<u8>> {
        Ok(prost::Message::encode_to_vec(&scope_to_wire(scope)))
    }

    fn deserialize_scope(&self, bytes: &[u8]) -> Result<Scope> {
        scope_from_wire(prost::Message::decode(bytes)?)
    }

    fn serialize_headers(&self, headers: &Headers) -> Result<Vec<u8>> {
        Ok(prost::Message::encode_to_vec(&wire::Headers {
            entries: headers.clone(),
        }))
    }

    fn deserialize_headers(&self, bytes: &[u8]) -> Result<Headers> {
        let msg: wire::Headers = prost::Message::decode(bytes)?;
        Ok(msg.entries)
    }

    fn serialize_event(&self, event: &Event) -> Result<Vec<u8>> {
        let msg = wire::Event {
            id: event.id.as_bytes().to_vec(),
            r#type: event.r#type.clone(),
            source: event.source.as_ref().map(address_to_wire),
            metadata: event.metadata.clone(),
            payload: serde_json::to_vec(&event.payload)?,
            timestamp_ms: event.timestamp_ms,
        };
        Ok(prost::Message::encode_to_vec(&msg))
    }

    fn deserialize_event(&self, bytes: &[u8]) -> Result<Event> {
        let msg: wire::Event = prost::Message::decode(bytes)?;
        Ok(Event {
            id: uuid_from(&msg.id, "event")?,
            r#type: msg.r#type,
            source: msg.source.map(address_from_wire).transpose()?,
            metadata: msg.metadata,
            payload: serde_json::from_slice(&msg.payload)?,
            timestamp_ms: msg.timestamp_ms,
        })
    }
}

pub trait EnvelopeCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identity cipher used when no key is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl EnvelopeCipher for PlainCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        Ok(plain.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// AES-256-GCM with a fresh 96-bit nonce prefixed to each ciphertext.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

const NONCE_LEN: usize = 12;

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(KernelError::Config(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| KernelError::Config(format!("invalid encryption key: {e}")))?;
        Ok(Self { cipher })
    }
}

impl EnvelopeCipher for AesGcmCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain)
            .map_err(|_| KernelError::Encryption("encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return Err(KernelError::Encryption("ciphertext too short".into()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| KernelError::Encryption("authentication failed".into()))
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesGcmCipher")
    }
}

pub fn cipher_for(key: Option<&str>) -> Result<Box<dyn EnvelopeCipher>> {
    Ok(match key {
        Some(key) => Box::new(AesGcmCipher::new(key.as_bytes())?),
        None => Box::new(PlainCipher),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ContextId;

    fn sample() -> (SpaceId, Scope, Event) {
        let ctx = ContextId::new_v4();
        let space = SpaceId::new(ctx, Uuid::new_v4(), SpaceSpecification::Named("room".into()));
        let from = Address::new(space.clone(), ParticipantId::new_v4());
        let to = Address::new(space.clone(), ParticipantId::new_v4());
        let scope = Scope::AnyOf(vec![
            Scope::addresses([to.clone()]),
            Scope::Not(Box::new(Scope::participants([from.participant_id]))),
            Scope::except([to]),
        ]);
        let event = Event::new("chat.message", serde_json::json!({"text": "hi", "n": [1, 2]}))
            .with_source(from)
            .with_metadata("k", "v");
        (space, scope, event)
    }

    fn check(serializer: &dyn EventSerializer) {
        let (space, scope, event) = sample();
        let bytes = serializer.serialize_space_id(&space).unwrap();
        assert_eq!(serializer.deserialize_space_id(&bytes).unwrap(), space);
        let bytes = serializer.serialize_scope(&scope).unwrap();
        assert_eq!(serializer.deserialize_scope(&bytes).unwrap(), scope);
        let bytes = serializer.serialize_event(&event).unwrap();
        assert_eq!(serializer.deserialize_event(&bytes).unwrap(), event);
    }

    #[test]
    fn json_preserves_fields() {
        check(&JsonEventSerializer);
    }

    #[test]
    fn protobuf_preserves_fields() {
        check(&ProtobufEventSerializer);
    }

    #[test]
    fn protobuf_rejects_bad_ids() {
        let msg = wire::Event {
            id: vec![1, 2, 3],
            ..Default::default()
        };
        let bytes = prost::Message::encode_to_vec(&msg);
        assert!(matches!(
            ProtobufEventSerializer.deserialize_event(&bytes),
            Err(KernelError::Serialization(_))
        ));
    }

    #[test]
    fn aes_gcm_detects_tampering() {
        let cipher = AesGcmCipher::new(&[7u8; KEY_LEN]).unwrap();
        let sealed = cipher.encrypt(b"payload").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"payload");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"payload");

        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(matches!(cipher.decrypt(&tampered), Err(KernelError::Encryption(_))));

        let other = AesGcmCipher::new(&[8u8; KEY_LEN]).unwrap();
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn wrong_key_length_is_a_config_error() {
        assert!(matches!(AesGcmCipher::new(b"short"), Err(KernelError::Config(_))));
    }
}
