/// Session-level connection status delivered to status listeners.
///
/// A transport reconnect is reported as `Connecting` followed by `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Payload of a connection status notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub room_name: String,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Excellent,
    Good,
    Poor,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

/// Why a participant record fired its Left event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// The participant disconnected from the room.
    Left,
    /// The participant never joined before the session's join timeout.
    Timeout,
    /// The local transport connection was lost.
    Disconnected,
}

/// Everything the transport can report about one participant.
///
/// Dispatched through `Participant::handle_event`, which fans each variant
/// out to the matching typed listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantEvent {
    ConnectionQualityChanged(ConnectionQuality),
    SpeakingChanged(bool),
    PublicationMuteChanged { source: TrackSource, muted: bool },
    Subscribed { source: TrackSource, muted: bool },
    Unsubscribed(TrackSource),
    Published(TrackSource),
    Unpublished(TrackSource),
}
