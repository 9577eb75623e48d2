// Loom Kernel Library
// Distributed event kernel: guarded dispatch, spaces and cluster transport

pub mod agent;
pub mod cluster;
pub mod config;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod event;
pub mod guard;
pub mod ids;
pub mod kernel;
pub mod scope;
pub mod space;
pub mod telemetry;
pub mod transport;

// Export core types
pub use agent::{Agent, SpawnService};
pub use cluster::{
    ClusterDirectory, InMemoryMap, InMemorySet, MapEvent, ReplicatedMap, ReplicatedSet, SetEvent,
};
pub use config::{KernelConfig, SerializerKind};
pub use context::Context;
pub use directory::{DirectoryEvent, SpaceDirectory, SpaceRepositoryListener};
pub use dispatcher::{DispatcherStats, EntityState, InternalDispatcher};
pub use event::Event;
pub use guard::{BehaviorError, GuardEvaluator, GuardRegistry, PerceptionGuards};
pub use ids::{Address, ContextId, ParticipantId, SpaceId, SpaceSpecification};
pub use kernel::Kernel;
pub use scope::Scope;
pub use space::{EventListener, ParticipantChange, Space, SpaceNetwork};
pub use transport::{Envelope, EnvelopeCodec, Inbound, Transport, TransportStats};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Object {0} is not registered in the guard registry")]
    NotRegistered(String),

    #[error("Guard of {target} failed on event {event_type}: {source}")]
    GuardInvocation {
        target: String,
        event_type: String,
        #[source]
        source: BehaviorError,
    },

    #[error("Handler of {target} failed on event {event_type}: {source}")]
    HandlerInvocation {
        target: String,
        event_type: String,
        #[source]
        source: BehaviorError,
    },

    #[error("Dispatcher is closed")]
    DispatcherClosed,

    #[error("Participant {participant} already joined space {space}")]
    DuplicateParticipant {
        participant: ParticipantId,
        space: SpaceId,
    },

    #[error("Participant {participant} is not a member of space {space}")]
    NotAParticipant {
        participant: ParticipantId,
        space: SpaceId,
    },

    #[error("Unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("Space already exists: {0}")]
    SpaceAlreadyExists(SpaceId),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Frame part of {size} bytes exceeds the limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Connection error with {uri}: {reason}")]
    Connection { uri: String, reason: String },

    #[error("Peer not connected: {0}")]
    PeerNotConnected(String),

    #[error("Invalid endpoint uri: {0}")]
    InvalidUri(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

pub type Result<T> = std::result::Result<T, KernelError>;
