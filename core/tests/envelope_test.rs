use loom_kernel::{
    Address, ContextId, EnvelopeCodec, Event, Inbound, KernelError, ParticipantId, Scope,
    SerializerKind, SpaceId,
};
use serde_json::json;

const KEY: &str = "0123456789abcdef0123456789abcdef";

fn sample() -> (SpaceId, Scope, Event) {
    let ctx = ContextId::new_v4();
    let space = SpaceId::random(ctx);
    let alice = Address::new(space.clone(), ParticipantId::new_v4());
    let bob = Address::new(space.clone(), ParticipantId::new_v4());
    let scope = Scope::AnyOf(vec![
        Scope::addresses([alice.clone()]),
        Scope::Not(Box::new(Scope::except([bob.clone()]))),
        Scope::participants([ParticipantId::new_v4()]),
    ]);
    let event = Event::new(
        "chat.message",
        json!({ "text": "hi", "tags": ["a", "b"], "n": 3 }),
    )
    .with_source(alice)
    .with_metadata("lang", "en");
    (space, scope, event)
}

fn message(inbound: Inbound) -> loom_kernel::Envelope {
    match inbound {
        Inbound::Message(envelope) => envelope,
        other => panic!("expected a message, got {other:?}"),
    }
}

#[test]
fn envelope_survives_every_wire_setting() {
    let (space, scope, event) = sample();
    for kind in [SerializerKind::Json, SerializerKind::Protobuf] {
        for key in [None, Some(KEY)] {
            let sender = EnvelopeCodec::new(kind, key, "tcp://127.0.0.1:7001").unwrap();
            let receiver = EnvelopeCodec::new(kind, key, "tcp://127.0.0.1:7002").unwrap();

            let parts = sender.encode(&space, &scope, &event).unwrap();
            let envelope = message(receiver.decode(&parts).unwrap());
            assert_eq!(envelope.context_id, space.context_id);
            assert_eq!(envelope.space_id, space);
            assert_eq!(envelope.scope, scope);
            assert_eq!(envelope.event, event, "{kind:?} key={key:?}");
            assert_eq!(
                envelope.headers.get("x-kernel").map(String::as_str),
                Some("tcp://127.0.0.1:7001")
            );
        }
    }
}

#[test]
fn encrypted_parts_hide_the_payload() {
    let (space, scope, event) = sample();
    let codec = EnvelopeCodec::new(SerializerKind::Json, Some(KEY), "k").unwrap();
    let parts = codec.encode(&space, &scope, &event).unwrap();
    // the topic stays readable for prefix routing
    assert_eq!(parts[0], space.context_id.topic());
    let body = String::from_utf8_lossy(&parts[5]);
    assert!(!body.contains("chat.message"));

    let intruder =
        EnvelopeCodec::new(SerializerKind::Json, Some("fedcba9876543210fedcba9876543210"), "k")
            .unwrap();
    assert!(matches!(
        intruder.decode(&parts),
        Err(KernelError::Encryption(_))
    ));
    let plain = EnvelopeCodec::new(SerializerKind::Json, None, "k").unwrap();
    assert!(plain.decode(&parts).is_err());
}

#[test]
fn serializer_mismatch_is_malformed() {
    let (space, scope, event) = sample();
    let json = EnvelopeCodec::new(SerializerKind::Json, None, "k").unwrap();
    let proto = EnvelopeCodec::new(SerializerKind::Protobuf, None, "k").unwrap();
    let parts = json.encode(&space, &scope, &event).unwrap();
    assert!(proto.decode(&parts).is_err());
}

#[test]
fn discovery_announcement_carries_only_the_space() {
    let (space, _, _) = sample();
    let codec = EnvelopeCodec::new(SerializerKind::Protobuf, Some(KEY), "k").unwrap();
    let parts = codec.encode_discovery(&space).unwrap();
    match codec.decode(&parts).unwrap() {
        Inbound::Discovery { space_id, headers } => {
            assert_eq!(space_id, space);
            assert!(headers.contains_key("x-discover"));
        }
        other => panic!("expected a discovery, got {other:?}"),
    }
}

#[test]
fn tampered_topic_is_rejected() {
    let (space, scope, event) = sample();
    let codec = EnvelopeCodec::new(SerializerKind::Json, None, "k").unwrap();
    let mut parts = codec.encode(&space, &scope, &event).unwrap();
    parts[0] = ContextId::new_v4().topic();
    assert!(matches!(
        codec.decode(&parts),
        Err(KernelError::MalformedEnvelope(_))
    ));

    parts.pop();
    assert!(matches!(
        codec.decode(&parts),
        Err(KernelError::MalformedEnvelope(_))
    ));
}
