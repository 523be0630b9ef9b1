use std::future::Future;

use tokio::sync::mpsc;

use crate::errors::HuddleError;
use crate::events::ParticipantEvent;
use crate::participant::ParticipantHandle;

/// Room options passed through to the media transport on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub auto_subscribe: bool,
    pub adaptive_stream: bool,
    pub dynacast: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            auto_subscribe: true,
            adaptive_stream: true,
            dynacast: true,
        }
    }
}

/// A remote participant that was already in the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub identity: String,
    pub handle: ParticipantHandle,
}

/// Events a connected transport reports, keyed by participant identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Reconnecting,
    Reconnected {
        local: ParticipantHandle,
        remotes: Vec<RemoteParticipant>,
    },
    Disconnected {
        reason: String,
    },
    ParticipantConnected {
        identity: String,
        handle: ParticipantHandle,
    },
    ParticipantDisconnected {
        identity: String,
    },
    Participant {
        identity: String,
        event: ParticipantEvent,
    },
}

/// Result of a successful connect: who is in the room, and the event stream.
#[derive(Debug)]
pub struct Connection {
    pub local: ParticipantHandle,
    pub remotes: Vec<RemoteParticipant>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// The media transport a session drives.
pub trait Transport: Send + Sync + 'static {
    fn connect(
        &self,
        url: &str,
        token: &str,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<Connection, HuddleError>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    fn set_microphone_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send;

    fn set_camera_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send;

    fn set_screen_share_enabled(
        &self,
        enabled: bool,
    ) -> impl Future<Output = Result<(), HuddleError>> + Send;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{Mutex, PoisonError};

    use tokio::sync::oneshot;

    use super::*;
    use crate::events::TrackSource;

    #[derive(Default)]
    struct Script {
        connect_error: Option<String>,
        remotes: Vec<RemoteParticipant>,
        gate: Option<oneshot::Receiver<()>>,
        fail_media: bool,
        events: Option<mpsc::UnboundedSender<TransportEvent>>,
        connects: usize,
        disconnects: usize,
        media_calls: Vec<(TrackSource, bool)>,
    }

    /// Scripted transport for session tests.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        script: Mutex<Script>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_remotes(self, remotes: Vec<RemoteParticipant>) -> Self {
            self.lock().remotes = remotes;
            self
        }

        pub(crate) fn failing_connect(self, message: &str) -> Self {
            self.lock().connect_error = Some(message.to_string());
            self
        }

        pub(crate) fn failing_media(self) -> Self {
            self.lock().fail_media = true;
            self
        }

        /// Hold the next connect until the returned sender fires.
        pub(crate) fn hold_connect(&self) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.lock().gate = Some(rx);
            tx
        }

        /// Push an event into the current connection's stream.
        pub(crate) fn emit(&self, event: TransportEvent) -> bool {
            match &self.lock().events {
                Some(tx) => tx.send(event).is_ok(),
                None => false,
            }
        }

        pub(crate) fn connects(&self) -> usize {
            self.lock().connects
        }

        pub(crate) fn disconnects(&self) -> usize {
            self.lock().disconnects
        }

        pub(crate) fn media_calls(&self) -> Vec<(TrackSource, bool)> {
            self.lock().media_calls.clone()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
            self.script.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn toggle(&self, source: TrackSource, enabled: bool) -> Result<(), HuddleError> {
            let mut script = self.lock();
            script.media_calls.push((source, enabled));
            if script.fail_media {
                Err(HuddleError::Media(format!("{source:?} unavailable")))
            } else {
                Ok(())
            }
        }
    }

    impl Transport for MockTransport {
        async fn connect(
            &self,
            _url: &str,
            _token: &str,
            _options: ConnectOptions,
        ) -> Result<Connection, HuddleError> {
            let gate = {
                let mut script = self.lock();
                script.connects += 1;
                script.gate.take()
            };
            if let Some(gate) = gate {
                let _ = gate.await;
            }

            let mut script = self.lock();
            if let Some(message) = &script.connect_error {
                return Err(HuddleError::Connection(message.clone()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            script.events = Some(tx);
            Ok(Connection {
                local: ParticipantHandle {
                    sid: "PA_local".to_string(),
                    ..Default::default()
                },
                remotes: script.remotes.clone(),
                events: rx,
            })
        }

        async fn disconnect(&self) {
            let mut script = self.lock();
            script.disconnects += 1;
            script.events = None;
        }

        async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
            self.toggle(TrackSource::Microphone, enabled)
        }

        async fn set_camera_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
            self.toggle(TrackSource::Camera, enabled)
        }

        async fn set_screen_share_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
            self.toggle(TrackSource::ScreenShare, enabled)
        }
    }
}
