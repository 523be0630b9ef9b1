use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::events::{ConnectionQuality, LeaveReason, ParticipantEvent, TrackSource};
use crate::fanout::Fanout;
use crate::listeners::{ListenerRegistry, ListenerToken};

/// Mute state of one published track, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationInfo {
    pub source: TrackSource,
    pub muted: bool,
}

/// The transport's view of a participant at the moment it is bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantHandle {
    pub sid: String,
    pub publications: Vec<PublicationInfo>,
    pub speaking: bool,
}

impl ParticipantHandle {
    /// True when a publication for `source` exists and is not muted.
    pub fn is_enabled(&self, source: TrackSource) -> bool {
        self.publications
            .iter()
            .any(|p| p.source == source && !p.muted)
    }
}

/// What a record is bound to. Bound variants carry the transport SID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Local { sid: String },
    RemotePending,
    RemoteBound { sid: String },
}

/// Plain copy of a record's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantSnapshot {
    pub identity: String,
    pub is_local: bool,
    pub is_joined: bool,
    pub is_timed_out: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_share_enabled: bool,
    pub speaking: bool,
    pub connection_quality: ConnectionQuality,
}

struct State {
    role: Role,
    mic_enabled: bool,
    camera_enabled: bool,
    screen_share_enabled: bool,
    speaking: bool,
    connection_quality: ConnectionQuality,
    timed_out: bool,
    joined: bool,
    disposed: bool,
    joined_at: Option<DateTime<Utc>>,
    published: BTreeSet<TrackSource>,
}

/// One participant of a session, local or remote.
///
/// A record starts pending, becomes joined when bound to a transport
/// participant, and ends either through [`Participant::notify_leave`] or
/// [`Participant::dispose`]. After disposal every call is ignored and no
/// listener fires again.
pub struct Participant {
    identity: String,
    created_at: Instant,
    state: Mutex<State>,
    microphone: ListenerRegistry<bool>,
    camera: ListenerRegistry<bool>,
    speaking: ListenerRegistry<bool>,
    quality: ListenerRegistry<ConnectionQuality>,
    joined: ListenerRegistry<()>,
    left: ListenerRegistry<LeaveReason>,
    timeout: ListenerRegistry<()>,
    track_published: ListenerRegistry<TrackSource>,
    track_unpublished: ListenerRegistry<TrackSource>,
}

impl Participant {
    /// Create a pending remote record.
    pub fn new(identity: impl Into<String>, fanout: &Fanout) -> Self {
        Self {
            identity: identity.into(),
            created_at: Instant::now(),
            state: Mutex::new(State {
                role: Role::RemotePending,
                mic_enabled: false,
                camera_enabled: false,
                screen_share_enabled: false,
                speaking: false,
                connection_quality: ConnectionQuality::Unknown,
                timed_out: false,
                joined: false,
                disposed: false,
                joined_at: None,
                published: BTreeSet::new(),
            }),
            microphone: ListenerRegistry::new(fanout.clone()),
            camera: ListenerRegistry::new(fanout.clone()),
            speaking: ListenerRegistry::new(fanout.clone()),
            quality: ListenerRegistry::new(fanout.clone()),
            joined: ListenerRegistry::new(fanout.clone()),
            left: ListenerRegistry::new(fanout.clone()),
            timeout: ListenerRegistry::new(fanout.clone()),
            track_published: ListenerRegistry::new(fanout.clone()),
            track_unpublished: ListenerRegistry::new(fanout.clone()),
        }
    }

    // ── Transitions ──────────────────────────────────────────────────

    /// Bind to the local transport participant.
    ///
    /// Fires Joined on every call, including re-binds after a reconnect.
    pub fn bind_local(&self, handle: ParticipantHandle) {
        let role = Role::Local {
            sid: handle.sid.clone(),
        };
        self.bind(role, &handle, false);
    }

    /// Bind to a remote transport participant.
    ///
    /// Clears any timeout mark, fires Joined, then TrackPublished once per
    /// source the participant already publishes.
    pub fn bind_remote(&self, handle: ParticipantHandle) {
        let role = Role::RemoteBound {
            sid: handle.sid.clone(),
        };
        self.bind(role, &handle, true);
    }

    fn bind(&self, role: Role, handle: &ParticipantHandle, announce_tracks: bool) {
        let mut state = self.lock();
        if state.disposed {
            tracing::debug!("bind ignored, record {} is disposed", self.identity);
            return;
        }

        state.role = role;
        state.joined = true;
        state.timed_out = false;
        state.joined_at = Some(Utc::now());
        state.screen_share_enabled = handle.is_enabled(TrackSource::ScreenShare);
        state.published = handle.publications.iter().map(|p| p.source).collect();
        set_flag(&self.microphone, &mut state.mic_enabled, handle.is_enabled(TrackSource::Microphone));
        set_flag(&self.camera, &mut state.camera_enabled, handle.is_enabled(TrackSource::Camera));
        set_flag(&self.speaking, &mut state.speaking, handle.speaking);

        tracing::debug!("participant {} joined ({:?})", self.identity, state.role);
        self.joined.notify(());
        if announce_tracks {
            for source in &state.published {
                self.track_published.notify(*source);
            }
        }
    }

    /// Set or clear the timeout mark.
    ///
    /// TimedOut fires only on the false → true transition. A joined record
    /// cannot be marked timed out.
    pub fn mark_timed_out(&self, value: bool) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        if !value {
            state.timed_out = false;
            return;
        }
        if state.joined {
            tracing::debug!("timeout ignored, {} already joined", self.identity);
            return;
        }
        if !state.timed_out {
            state.timed_out = true;
            self.timeout.notify(());
        }
    }

    /// Apply a publication mute change for the microphone or camera.
    ///
    /// Other sources are ignored.
    pub fn apply_track_mute(&self, source: TrackSource, muted: bool) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        self.apply_mute_locked(&mut state, source, muted);
    }

    fn apply_mute_locked(&self, state: &mut State, source: TrackSource, muted: bool) {
        match source {
            TrackSource::Microphone => set_flag(&self.microphone, &mut state.mic_enabled, !muted),
            TrackSource::Camera => set_flag(&self.camera, &mut state.camera_enabled, !muted),
            _ => {}
        }
    }

    /// Route one transport event to the matching state field and listeners.
    pub fn handle_event(&self, event: ParticipantEvent) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        match event {
            ParticipantEvent::ConnectionQualityChanged(quality) => {
                if state.connection_quality != quality {
                    state.connection_quality = quality;
                    self.quality.notify(quality);
                }
            }
            ParticipantEvent::SpeakingChanged(speaking) => {
                set_flag(&self.speaking, &mut state.speaking, speaking);
            }
            ParticipantEvent::PublicationMuteChanged { source, muted } => {
                self.apply_mute_locked(&mut state, source, muted);
            }
            ParticipantEvent::Subscribed { source, muted } => {
                self.set_enabled_locked(&mut state, source, !muted);
                state.published.insert(source);
                self.track_published.notify(source);
            }
            ParticipantEvent::Published(source) => {
                self.set_enabled_locked(&mut state, source, true);
                state.published.insert(source);
                self.track_published.notify(source);
            }
            ParticipantEvent::Unsubscribed(source) | ParticipantEvent::Unpublished(source) => {
                self.set_enabled_locked(&mut state, source, false);
                state.published.remove(&source);
                self.track_unpublished.notify(source);
            }
        }
    }

    /// Record the outcome of a local media toggle.
    pub(crate) fn set_media_enabled(&self, source: TrackSource, enabled: bool) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        self.set_enabled_locked(&mut state, source, enabled);
    }

    fn set_enabled_locked(&self, state: &mut State, source: TrackSource, enabled: bool) {
        match source {
            TrackSource::Microphone => set_flag(&self.microphone, &mut state.mic_enabled, enabled),
            TrackSource::Camera => set_flag(&self.camera, &mut state.camera_enabled, enabled),
            TrackSource::ScreenShare => state.screen_share_enabled = enabled,
            TrackSource::Unknown => {}
        }
    }

    /// Fire Left once and dispose the record.
    pub fn notify_leave(&self, reason: LeaveReason) {
        {
            let state = self.lock();
            if state.disposed {
                return;
            }
            tracing::debug!("participant {} left: {reason:?}", self.identity);
            self.left.notify(reason);
        }
        self.dispose();
    }

    /// Drop every listener and stop reacting to transport events.
    pub fn dispose(&self) {
        let mut state = self.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.published.clear();

        self.microphone.clear();
        self.camera.clear();
        self.speaking.clear();
        self.quality.clear();
        self.joined.clear();
        self.left.clear();
        self.timeout.clear();
        self.track_published.clear();
        self.track_unpublished.clear();
    }

    // ── Getters ──────────────────────────────────────────────────────

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.lock().joined_at
    }

    pub fn role(&self) -> Role {
        self.lock().role.clone()
    }

    /// Transport SID once bound.
    pub fn sid(&self) -> Option<String> {
        match &self.lock().role {
            Role::Local { sid } | Role::RemoteBound { sid } => Some(sid.clone()),
            Role::RemotePending => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.lock().role, Role::Local { .. })
    }

    pub fn is_joined(&self) -> bool {
        self.lock().joined
    }

    pub fn is_timed_out(&self) -> bool {
        self.lock().timed_out
    }

    /// Neither joined nor timed out.
    pub fn is_pending(&self) -> bool {
        let state = self.lock();
        !state.joined && !state.timed_out
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    pub fn mic_enabled(&self) -> bool {
        self.lock().mic_enabled
    }

    pub fn camera_enabled(&self) -> bool {
        self.lock().camera_enabled
    }

    pub fn screen_share_enabled(&self) -> bool {
        self.lock().screen_share_enabled
    }

    pub fn speaking(&self) -> bool {
        self.lock().speaking
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.lock().connection_quality
    }

    pub fn published_tracks(&self) -> Vec<TrackSource> {
        self.lock().published.iter().copied().collect()
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        let state = self.lock();
        ParticipantSnapshot {
            identity: self.identity.clone(),
            is_local: matches!(state.role, Role::Local { .. }),
            is_joined: state.joined,
            is_timed_out: state.timed_out,
            mic_enabled: state.mic_enabled,
            camera_enabled: state.camera_enabled,
            screen_share_enabled: state.screen_share_enabled,
            speaking: state.speaking,
            connection_quality: state.connection_quality,
        }
    }

    // ── Listeners ────────────────────────────────────────────────────
    //
    // Property listeners and the joined/track-published listeners get the
    // current state queued before the call returns, ahead of any later
    // change. Leave, timeout and track-unpublished listeners only see
    // future transitions.

    pub fn add_microphone_listener(
        &self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.microphone, move |v| listener(*v), |s| vec![s.mic_enabled])
    }

    pub fn add_camera_listener(
        &self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.camera, move |v| listener(*v), |s| vec![s.camera_enabled])
    }

    pub fn add_speaking_listener(
        &self,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.speaking, move |v| listener(*v), |s| vec![s.speaking])
    }

    pub fn add_connection_quality_listener(
        &self,
        listener: impl Fn(ConnectionQuality) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.quality, move |v| listener(*v), |s| {
            vec![s.connection_quality]
        })
    }

    pub fn add_joined_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerToken {
        self.subscribe_live(&self.joined, move |_| listener(), |s| {
            if s.joined { vec![()] } else { Vec::new() }
        })
    }

    pub fn add_leave_listener(
        &self,
        listener: impl Fn(LeaveReason) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.left, move |reason| listener(*reason), |_| Vec::new())
    }

    pub fn add_timeout_listener(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerToken {
        self.subscribe_live(&self.timeout, move |_| listener(), |_| Vec::new())
    }

    pub fn add_track_published_listener(
        &self,
        listener: impl Fn(TrackSource) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.track_published, move |source| listener(*source), |s| {
            s.published.iter().copied().collect()
        })
    }

    pub fn add_track_unpublished_listener(
        &self,
        listener: impl Fn(TrackSource) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.subscribe_live(&self.track_unpublished, move |source| listener(*source), |_| {
            Vec::new()
        })
    }

    /// Subscribe while holding the state lock, which every transition also
    /// holds when it notifies. No change can slip between reading `initial`
    /// and the callback being registered.
    fn subscribe_live<E: Send + 'static>(
        &self,
        registry: &ListenerRegistry<E>,
        callback: impl Fn(&E) + Send + Sync + 'static,
        initial: impl FnOnce(&State) -> Vec<E>,
    ) -> ListenerToken {
        let state = self.lock();
        if state.disposed {
            return ListenerToken::inert();
        }
        registry.subscribe_with(callback, initial(&state))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("identity", &self.identity)
            .field("role", &self.lock().role)
            .finish_non_exhaustive()
    }
}

fn set_flag(listeners: &ListenerRegistry<bool>, slot: &mut bool, value: bool) {
    if *slot != value {
        *slot = value;
        listeners.notify(value);
    }
}
