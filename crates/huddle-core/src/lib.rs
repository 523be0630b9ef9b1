//! Huddle core: room-session participant lifecycle.
//!
//! Tracks which participants a session expects, reconciles that list
//! against transport joins and leaves, and evicts those who never show up.
//! Consumed by native UI shells via UniFFI bindings.

pub mod directory;
pub mod errors;
pub mod events;
pub mod expectation;
pub mod fanout;
pub mod listeners;
pub mod livekit_transport;
pub mod participant;
pub mod provisioning;
pub mod session;
pub mod settings;
pub mod transport;

pub use directory::ParticipantDirectory;
pub use errors::HuddleError;
pub use events::{
    ConnectionQuality, ConnectionStatus, LeaveReason, ParticipantEvent, StatusChange, TrackSource,
};
pub use expectation::{RtcType, SessionExpectation};
pub use listeners::ListenerToken;
pub use livekit_transport::LiveKitTransport;
pub use participant::{Participant, ParticipantHandle, ParticipantSnapshot, PublicationInfo};
pub use provisioning::{ProvisioningClient, RoomResponse};
pub use session::{MediaOptions, Session, SessionPhase};
pub use settings::{Settings, SettingsStore};
pub use transport::{ConnectOptions, Connection, RemoteParticipant, Transport, TransportEvent};
