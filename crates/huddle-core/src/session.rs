use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::directory::ParticipantDirectory;
use crate::errors::HuddleError;
use crate::events::{ConnectionStatus, LeaveReason, StatusChange, TrackSource};
use crate::expectation::SessionExpectation;
use crate::fanout::Fanout;
use crate::listeners::{ListenerRegistry, ListenerToken};
use crate::participant::Participant;
use crate::transport::{ConnectOptions, RemoteParticipant, Transport, TransportEvent};

/// How often pending participants are checked against the join timeout.
pub const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Local media to enable once the room is connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaOptions {
    pub microphone: bool,
    pub camera: bool,
    pub screen_share: bool,
}

impl MediaOptions {
    fn requested(self) -> Vec<TrackSource> {
        let mut sources = Vec::new();
        if self.microphone {
            sources.push(TrackSource::Microphone);
        }
        if self.camera {
            sources.push(TrackSource::Camera);
        }
        if self.screen_share {
            sources.push(TrackSource::ScreenShare);
        }
        sources
    }
}

struct SessionState {
    phase: SessionPhase,
    /// Bumped on every join and leave. Async work tagged with an older
    /// epoch is discarded when it comes back.
    epoch: u64,
    expectation: Option<SessionExpectation>,
    directory: ParticipantDirectory,
    media: MediaOptions,
    ticker: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl SessionState {
    fn timeout_checker_active(&self) -> bool {
        self.ticker.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn stop_timeout_checker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
            tracing::debug!("timeout checker stopped");
        }
    }

    fn stop_event_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

struct Shared<T> {
    transport: Arc<T>,
    options: ConnectOptions,
    fanout: Fanout,
    status: ListenerRegistry<StatusChange>,
    state: Mutex<SessionState>,
}

/// Drives one room session at a time over a [`Transport`].
///
/// Every mutation (public calls, transport events, timeout ticks) runs
/// under one async lock. Listener callbacks run on the session's
/// [`Fanout`] worker, never under that lock.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Session<T> {
    /// Create an idle session. Must be called inside a tokio runtime.
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, ConnectOptions::default())
    }

    pub fn with_options(transport: T, options: ConnectOptions) -> Self {
        let fanout = Fanout::spawn();
        Self {
            shared: Arc::new(Shared {
                transport: Arc::new(transport),
                options,
                status: ListenerRegistry::new(fanout.clone()),
                state: Mutex::new(SessionState {
                    phase: SessionPhase::Idle,
                    epoch: 0,
                    expectation: None,
                    directory: ParticipantDirectory::new(fanout.clone()),
                    media: MediaOptions::default(),
                    ticker: None,
                    pump: None,
                }),
                fanout,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Start joining the room described by `expectation`.
    ///
    /// Returns once pending records exist and the connect is in flight; the
    /// outcome is reported through status listeners. Ignored unless idle.
    pub async fn join(&self, expectation: SessionExpectation, media: MediaOptions) {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        if state.phase != SessionPhase::Idle {
            tracing::warn!(
                "join to {} ignored, session is {:?}",
                expectation.room_name,
                state.phase
            );
            return;
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let pending = state.directory.initialize_pending(&expectation);
        tracing::info!(
            "joining room {} with {pending} pending participants",
            expectation.room_name
        );

        let url = expectation.url.clone();
        let token = expectation.token.clone();
        state.phase = SessionPhase::Connecting;
        self.shared
            .notify_status(&expectation.room_name, ConnectionStatus::Connecting);
        state.expectation = Some(expectation);
        state.media = media;

        tokio::spawn(self.shared.clone().complete_connect(epoch, url, token));
    }

    /// Leave the current room and release every record.
    pub async fn leave_room(&self) {
        {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let Some(expectation) = state.expectation.take() else {
                tracing::debug!("leave_room: not in a room");
                return;
            };
            state.epoch += 1;
            state.stop_timeout_checker();
            state.stop_event_pump();
            state.directory.clear();
            let previous = state.phase;
            state.phase = SessionPhase::Idle;
            tracing::info!("leaving room {}", expectation.room_name);
            if previous != SessionPhase::Disconnected {
                self.shared
                    .notify_status(&expectation.room_name, ConnectionStatus::Disconnected);
            }
        }
        self.shared.transport.disconnect().await;
    }

    /// Expect more participants in the current room.
    ///
    /// Restarts the timeout checker when it had stopped.
    pub async fn invite_participants(
        &self,
        identities: &[String],
    ) -> Result<Vec<Arc<Participant>>, HuddleError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let expectation = state.expectation.as_mut().ok_or(HuddleError::NotInRoom)?;
        let invited = state.directory.invite(expectation, identities)?;
        self.shared.ensure_timeout_checker(state);
        Ok(invited)
    }

    /// Give up on participants that have not joined yet.
    pub async fn missed_participants(
        &self,
        identities: &[String],
    ) -> Result<Vec<String>, HuddleError> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let expectation = state.expectation.as_mut().ok_or(HuddleError::NotInRoom)?;
        Ok(state.directory.evict_timed_out(expectation, identities))
    }

    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        self.set_media_enabled(TrackSource::Microphone, enabled).await
    }

    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        self.set_media_enabled(TrackSource::Camera, enabled).await
    }

    pub async fn set_screen_share_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        self.set_media_enabled(TrackSource::ScreenShare, enabled).await
    }

    async fn set_media_enabled(&self, source: TrackSource, enabled: bool) -> Result<(), HuddleError> {
        let epoch = {
            let state = self.shared.state.lock().await;
            if state.directory.local_participant().is_none() {
                return Err(HuddleError::NotInRoom);
            }
            state.epoch
        };
        self.shared.set_media(epoch, source, enabled).await
    }

    // ── Getters ──────────────────────────────────────────────────────

    pub async fn phase(&self) -> SessionPhase {
        self.shared.state.lock().await.phase
    }

    pub async fn room_name(&self) -> Option<String> {
        let state = self.shared.state.lock().await;
        state.expectation.as_ref().map(|e| e.room_name.clone())
    }

    pub async fn expectation(&self) -> Option<SessionExpectation> {
        self.shared.state.lock().await.expectation.clone()
    }

    pub async fn local_participant(&self) -> Option<Arc<Participant>> {
        self.shared.state.lock().await.directory.local_participant()
    }

    pub async fn all_participants(&self, include_timed_out: bool) -> Vec<Arc<Participant>> {
        let state = self.shared.state.lock().await;
        state.directory.all_participants(include_timed_out)
    }

    pub async fn remote_participants(&self, include_timed_out: bool) -> Vec<Arc<Participant>> {
        let state = self.shared.state.lock().await;
        state.directory.remote_participants(include_timed_out)
    }

    pub async fn participant(&self, identity: &str) -> Option<Arc<Participant>> {
        self.shared.state.lock().await.directory.participant(identity)
    }

    pub async fn timeout_checker_active(&self) -> bool {
        self.shared.state.lock().await.timeout_checker_active()
    }

    // ── Listeners ────────────────────────────────────────────────────

    pub fn add_status_listener(
        &self,
        listener: impl Fn(StatusChange) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.shared
            .status
            .subscribe(move |change| listener(change.clone()))
    }

    /// Fires for invited participants and for unexpected joins.
    pub async fn add_new_participant_listener(
        &self,
        listener: impl Fn(Arc<Participant>) + Send + Sync + 'static,
    ) -> ListenerToken {
        let state = self.shared.state.lock().await;
        state.directory.add_new_participant_listener(listener)
    }

    /// Wait until every notification queued so far has been delivered.
    pub async fn flush(&self) {
        self.shared.fanout.flush().await;
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.try_lock() {
            state.stop_timeout_checker();
            state.stop_event_pump();
        }
    }
}

impl<T: Transport> Shared<T> {
    fn notify_status(&self, room_name: &str, status: ConnectionStatus) {
        tracing::info!("room {room_name}: {status:?}");
        self.status.notify(StatusChange {
            room_name: room_name.to_string(),
            status,
        });
    }

    async fn complete_connect(self: Arc<Self>, epoch: u64, url: String, token: String) {
        let result = self.transport.connect(&url, &token, self.options).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.epoch != epoch {
            tracing::debug!("discarding connect result from a previous session");
            let idle = state.phase == SessionPhase::Idle;
            drop(guard);
            if result.is_ok() && idle {
                self.transport.disconnect().await;
            }
            return;
        }
        let Some(expectation) = state.expectation.as_mut() else {
            return;
        };
        let room_name = expectation.room_name.clone();

        let connection = match result {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!("failed to connect to room {room_name}: {e}");
                state.phase = SessionPhase::Idle;
                state.expectation = None;
                state.directory.clear();
                self.notify_status(&room_name, ConnectionStatus::Disconnected);
                return;
            }
        };

        state.phase = SessionPhase::Connected;
        self.notify_status(&room_name, ConnectionStatus::Connected);
        let login = expectation.login_identity.clone();
        state
            .directory
            .bind_transport_participant(expectation, &login, connection.local, true);
        bind_remotes(&mut state.directory, expectation, connection.remotes);
        self.ensure_timeout_checker(state);
        state.pump = Some(tokio::spawn(pump_events(
            Arc::downgrade(&self),
            epoch,
            connection.events,
        )));

        let media = state.media;
        drop(guard);
        for source in media.requested() {
            if let Err(e) = self.set_media(epoch, source, true).await {
                tracing::warn!("could not enable {source:?} on join: {e}");
            }
        }
    }

    fn apply_event(self: &Arc<Self>, state: &mut SessionState, event: TransportEvent) {
        let Some(expectation) = state.expectation.as_mut() else {
            return;
        };
        match event {
            TransportEvent::Reconnecting => {
                if state.phase == SessionPhase::Connected {
                    state.phase = SessionPhase::Connecting;
                    self.notify_status(&expectation.room_name, ConnectionStatus::Connecting);
                }
            }
            TransportEvent::Reconnected { local, remotes } => {
                state.phase = SessionPhase::Connected;
                self.notify_status(&expectation.room_name, ConnectionStatus::Connected);
                let login = expectation.login_identity.clone();
                state
                    .directory
                    .bind_transport_participant(expectation, &login, local, true);
                bind_remotes(&mut state.directory, expectation, remotes);
                self.ensure_timeout_checker(state);
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!("lost connection to {}: {reason}", expectation.room_name);
                state.phase = SessionPhase::Disconnected;
                self.notify_status(&expectation.room_name, ConnectionStatus::Disconnected);
                state.stop_timeout_checker();
                state.directory.mark_local_left(LeaveReason::Disconnected);
            }
            TransportEvent::ParticipantConnected { identity, handle } => {
                if identity == expectation.login_identity {
                    tracing::debug!("ignoring remote connection of login identity {identity}");
                    return;
                }
                state
                    .directory
                    .bind_transport_participant(expectation, &identity, handle, false);
            }
            TransportEvent::ParticipantDisconnected { identity } => {
                state.directory.mark_left(expectation, &identity);
            }
            TransportEvent::Participant { identity, event } => {
                match state.directory.participant(&identity) {
                    Some(participant) => participant.handle_event(event),
                    None => tracing::debug!("event for unknown participant {identity}: {event:?}"),
                }
            }
        }
    }

    /// Start the timeout checker if connected, records are pending and it
    /// is not already running.
    fn ensure_timeout_checker(self: &Arc<Self>, state: &mut SessionState) {
        if state.phase != SessionPhase::Connected
            || state.timeout_checker_active()
            || !state.directory.has_pending()
        {
            return;
        }
        tracing::debug!("starting timeout checker");
        state.ticker = Some(tokio::spawn(run_timeout_checker(
            Arc::downgrade(self),
            state.epoch,
        )));
    }

    async fn set_media(
        &self,
        epoch: u64,
        source: TrackSource,
        enabled: bool,
    ) -> Result<(), HuddleError> {
        match source {
            TrackSource::Microphone => self.transport.set_microphone_enabled(enabled).await?,
            TrackSource::Camera => self.transport.set_camera_enabled(enabled).await?,
            TrackSource::ScreenShare => self.transport.set_screen_share_enabled(enabled).await?,
            TrackSource::Unknown => {
                return Err(HuddleError::Media("unknown track source".to_string()));
            }
        }

        let state = self.state.lock().await;
        if state.epoch != epoch {
            return Ok(());
        }
        if let Some(local) = state.directory.local_participant() {
            local.set_media_enabled(source, enabled);
        }
        Ok(())
    }
}

fn bind_remotes(
    directory: &mut ParticipantDirectory,
    expectation: &mut SessionExpectation,
    remotes: Vec<RemoteParticipant>,
) {
    for remote in remotes {
        if remote.identity == expectation.login_identity {
            continue;
        }
        directory.bind_transport_participant(expectation, &remote.identity, remote.handle, false);
    }
}

/// Evict pending records older than the join timeout.
///
/// Returns whether any record is still pending.
fn evict_expired(state: &mut SessionState) -> bool {
    if state.phase != SessionPhase::Connected {
        return state.directory.has_pending();
    }
    let Some(expectation) = state.expectation.as_mut() else {
        return false;
    };
    let timeout = expectation.timeout();
    let now = Instant::now();
    let expired: Vec<String> = state
        .directory
        .pending_participants()
        .iter()
        .filter(|p| now.saturating_duration_since(p.created_at()) >= timeout)
        .map(|p| p.identity().to_string())
        .collect();
    if !expired.is_empty() {
        state.directory.evict_timed_out(expectation, &expired);
    }
    state.directory.has_pending()
}

async fn run_timeout_checker<T: Transport>(shared: Weak<Shared<T>>, epoch: u64) {
    let mut interval = tokio::time::interval_at(
        Instant::now() + TIMEOUT_CHECK_INTERVAL,
        TIMEOUT_CHECK_INTERVAL,
    );
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().await;
        if state.epoch != epoch {
            return;
        }
        if !evict_expired(&mut state) {
            tracing::debug!("no pending participants left, timeout checker exiting");
            state.ticker = None;
            return;
        }
    }
}

async fn pump_events<T: Transport>(
    shared: Weak<Shared<T>>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let mut state = shared.state.lock().await;
        if state.epoch != epoch {
            tracing::debug!("dropping transport event from a previous session");
            break;
        }
        shared.apply_event(&mut state, event);
    }
    tracing::debug!("transport event pump ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ParticipantEvent;
    use crate::participant::{ParticipantHandle, PublicationInfo};
    use crate::transport::mock::MockTransport;

    type Log<T> = Arc<std::sync::Mutex<Vec<T>>>;

    fn log<T>() -> Log<T> {
        Arc::new(std::sync::Mutex::new(Vec::new()))
    }

    fn expectation(identities: &[&str], timeout_secs: u64) -> SessionExpectation {
        SessionExpectation {
            room_name: "room-1".into(),
            url: "wss://rtc.example.test".into(),
            token: "token".into(),
            max_participants: 4,
            identities: identities.iter().map(|s| s.to_string()).collect(),
            creator: "alice".into(),
            login_identity: "alice".into(),
            timeout_secs,
            ..Default::default()
        }
    }

    fn remote(identity: &str, mic_muted: bool) -> RemoteParticipant {
        RemoteParticipant {
            identity: identity.to_string(),
            handle: ParticipantHandle {
                sid: format!("PA_{identity}"),
                publications: vec![PublicationInfo {
                    source: TrackSource::Microphone,
                    muted: mic_muted,
                }],
                speaking: false,
            },
        }
    }

    fn record_status<T: Transport>(session: &Session<T>) -> (Log<ConnectionStatus>, ListenerToken) {
        let statuses = log();
        let s = statuses.clone();
        let token = session.add_status_listener(move |change| {
            assert_eq!(change.room_name, "room-1");
            s.lock().unwrap().push(change.status)
        });
        (statuses, token)
    }

    async fn wait_for_phase<T: Transport>(session: &Session<T>, phase: SessionPhase) {
        for _ in 0..1000 {
            if session.phase().await == phase {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("session never reached {phase:?}");
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    /// Let spawned tasks drain, then deliver queued notifications.
    async fn settle<T: Transport>(session: &Session<T>) {
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }
        session.flush().await;
    }

    #[tokio::test]
    async fn join_binds_local_participant() {
        let session = Session::new(MockTransport::new());
        let (statuses, _token) = record_status(&session);

        assert!(session.local_participant().await.is_none());
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        assert_eq!(session.phase().await, SessionPhase::Connecting);
        wait_for_phase(&session, SessionPhase::Connected).await;

        let local = session.local_participant().await.unwrap();
        assert_eq!(local.identity(), "alice");
        assert!(local.is_local());
        assert!(local.is_joined());
        let joins = log();
        let j = joins.clone();
        let _joined = local.add_joined_listener(move || j.lock().unwrap().push(()));
        session.flush().await;

        assert_eq!(joins.lock().unwrap().len(), 1);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Connected]
        );
        assert_eq!(session.room_name().await.as_deref(), Some("room-1"));
        assert!(session.timeout_checker_active().await);

        let all: Vec<String> = session
            .all_participants(false)
            .await
            .iter()
            .map(|p| p.identity().to_string())
            .collect();
        assert_eq!(all, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn remotes_already_in_room_are_bound_on_connect() {
        let mock = MockTransport::new().with_remotes(vec![remote("bob", false), remote("carol", true)]);
        let session = Session::new(mock);

        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;

        let bob = session.participant("bob").await.unwrap();
        let carol = session.participant("carol").await.unwrap();
        assert!(bob.is_joined());
        assert!(bob.mic_enabled());
        assert!(carol.is_joined());
        assert!(!carol.mic_enabled());
        assert_eq!(
            session.expectation().await.unwrap().identities,
            vec!["alice", "bob", "carol"]
        );
        assert!(!session.timeout_checker_active().await);
    }

    #[tokio::test]
    async fn second_join_is_ignored() {
        let session = Session::new(MockTransport::new());
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        let mut other = expectation(&["alice", "dave"], 30);
        other.room_name = "room-2".into();
        session.join(other, MediaOptions::default()).await;
        wait_for_phase(&session, SessionPhase::Connected).await;

        assert_eq!(session.transport().connects(), 1);
        assert_eq!(session.room_name().await.as_deref(), Some("room-1"));
        assert!(session.participant("dave").await.is_none());
    }

    #[tokio::test]
    async fn connect_failure_returns_to_idle() {
        let session = Session::new(MockTransport::new().failing_connect("unreachable"));
        let (statuses, _token) = record_status(&session);

        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_until(|| session.transport().connects() == 1).await;
        settle(&session).await;

        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert!(session.expectation().await.is_none());
        assert!(session.all_participants(true).await.is_empty());
        assert!(!session.timeout_checker_active().await);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_checker_stops_once_nothing_is_pending() {
        let session = Session::new(MockTransport::new());
        session
            .join(expectation(&["alice", "bob"], 3), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let bob = session.participant("bob").await.unwrap();
        let timeouts = log();
        let t = timeouts.clone();
        let _timeout = bob.add_timeout_listener(move || t.lock().unwrap().push(()));
        assert!(session.timeout_checker_active().await);

        tokio::time::sleep(Duration::from_secs(4)).await;
        session.flush().await;

        assert!(!session.timeout_checker_active().await);
        assert!(session.participant("bob").await.is_none());
        assert!(bob.is_disposed());
        assert_eq!(timeouts.lock().unwrap().len(), 1);
        assert_eq!(session.expectation().await.unwrap().identities, vec!["alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_bind_beats_timeout() {
        let session = Session::new(MockTransport::new());
        session
            .join(expectation(&["alice", "bob"], 3), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let bob = session.participant("bob").await.unwrap();
        let timeouts = log();
        let t = timeouts.clone();
        let _timeout = bob.add_timeout_listener(move || t.lock().unwrap().push(()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let bob_handle = remote("bob", false).handle;
        assert!(session.transport().emit(TransportEvent::ParticipantConnected {
            identity: "bob".into(),
            handle: bob_handle,
        }));
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.flush().await;

        assert!(bob.is_joined());
        assert!(!bob.is_timed_out());
        assert!(session.participant("bob").await.is_some());
        assert!(timeouts.lock().unwrap().is_empty());
        assert!(!session.timeout_checker_active().await);
    }

    #[tokio::test]
    async fn leave_room_tears_down_session() {
        let session = Session::new(MockTransport::new());
        let (statuses, _token) = record_status(&session);
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let bob = session.participant("bob").await.unwrap();

        session.leave_room().await;
        session.flush().await;

        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert!(!session.timeout_checker_active().await);
        assert!(session.expectation().await.is_none());
        assert!(session.local_participant().await.is_none());
        assert!(bob.is_disposed());
        assert_eq!(session.transport().disconnects(), 1);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Disconnected
            ]
        );

        // a fresh join works after leaving
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        assert_eq!(session.transport().connects(), 2);
    }

    #[tokio::test]
    async fn connect_completing_after_leave_is_discarded() {
        let session = Session::new(MockTransport::new());
        let release = session.transport().hold_connect();
        let (statuses, _token) = record_status(&session);

        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_until(|| session.transport().connects() == 1).await;
        session.leave_room().await;
        release.send(()).unwrap();
        wait_until(|| session.transport().disconnects() == 2).await;
        session.flush().await;

        assert_eq!(session.phase().await, SessionPhase::Idle);
        assert!(session.local_participant().await.is_none());
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![ConnectionStatus::Connecting, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test]
    async fn invite_restarts_timeout_checker() {
        let session = Session::new(MockTransport::new().with_remotes(vec![remote("bob", false)]));
        let announced = log();
        let a = announced.clone();
        let _new = session
            .add_new_participant_listener(move |p| a.lock().unwrap().push(p.identity().to_string()))
            .await;
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        assert!(!session.timeout_checker_active().await);

        let invited = session
            .invite_participants(&["carol".to_string()])
            .await
            .unwrap();
        session.flush().await;

        assert_eq!(invited.len(), 1);
        assert!(invited[0].is_pending());
        assert!(session.timeout_checker_active().await);
        assert_eq!(*announced.lock().unwrap(), vec!["carol"]);
    }

    #[tokio::test]
    async fn operations_outside_a_session_fail() {
        let session = Session::new(MockTransport::new());

        let invite = session.invite_participants(&["bob".to_string()]).await;
        assert!(matches!(invite, Err(HuddleError::NotInRoom)));
        let missed = session.missed_participants(&["bob".to_string()]).await;
        assert!(matches!(missed, Err(HuddleError::NotInRoom)));
        let mic = session.set_microphone_enabled(true).await;
        assert!(matches!(mic, Err(HuddleError::NotInRoom)));

        session.leave_room().await;
        assert_eq!(session.transport().disconnects(), 0);
    }

    #[tokio::test]
    async fn missed_participants_evicts_only_pending() {
        let session = Session::new(MockTransport::new().with_remotes(vec![remote("bob", false)]));
        session
            .join(expectation(&["alice", "bob", "carol"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;

        let evicted = session
            .missed_participants(&["bob".to_string(), "carol".to_string()])
            .await
            .unwrap();

        assert_eq!(evicted, vec!["carol"]);
        assert!(session.participant("bob").await.unwrap().is_joined());
        assert!(session.participant("carol").await.is_none());
    }

    #[tokio::test]
    async fn transport_events_reach_records() {
        let session = Session::new(MockTransport::new().with_remotes(vec![remote("bob", false)]));
        let announced = log();
        let a = announced.clone();
        let _new = session
            .add_new_participant_listener(move |p| a.lock().unwrap().push(p.identity().to_string()))
            .await;
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let bob = session.participant("bob").await.unwrap();
        assert!(bob.mic_enabled());

        let mock = session.transport();
        mock.emit(TransportEvent::Participant {
            identity: "bob".into(),
            event: ParticipantEvent::PublicationMuteChanged {
                source: TrackSource::Microphone,
                muted: true,
            },
        });
        mock.emit(TransportEvent::ParticipantConnected {
            identity: "dave".into(),
            handle: remote("dave", false).handle,
        });
        settle(&session).await;
        assert!(!bob.mic_enabled());

        mock.emit(TransportEvent::ParticipantDisconnected {
            identity: "bob".into(),
        });
        settle(&session).await;

        assert!(bob.is_disposed());
        assert!(session.participant("bob").await.is_none());
        assert!(session.participant("dave").await.unwrap().is_joined());
        assert_eq!(session.expectation().await.unwrap().identities, vec!["alice", "dave"]);
        assert_eq!(*announced.lock().unwrap(), vec!["dave"]);
    }

    #[tokio::test]
    async fn reconnect_rebinds_local_participant() {
        let session = Session::new(MockTransport::new());
        let (statuses, _token) = record_status(&session);
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let local = session.local_participant().await.unwrap();
        let joins = log();
        let j = joins.clone();
        let _joined = local.add_joined_listener(move || j.lock().unwrap().push(()));

        session.transport().emit(TransportEvent::Reconnecting);
        settle(&session).await;
        assert_eq!(session.phase().await, SessionPhase::Connecting);
        assert!(session.expectation().await.is_some());

        session.transport().emit(TransportEvent::Reconnected {
            local: ParticipantHandle {
                sid: "PA_local".into(),
                ..Default::default()
            },
            remotes: vec![remote("bob", false)],
        });
        settle(&session).await;

        assert_eq!(session.phase().await, SessionPhase::Connected);
        assert_eq!(joins.lock().unwrap().len(), 2);
        assert!(Arc::ptr_eq(&local, &session.local_participant().await.unwrap()));
        assert!(session.participant("bob").await.unwrap().is_joined());
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected,
                ConnectionStatus::Connecting,
                ConnectionStatus::Connected
            ]
        );
    }

    #[tokio::test]
    async fn transport_disconnect_ends_local_participant() {
        let session = Session::new(MockTransport::new());
        session
            .join(expectation(&["alice", "bob"], 30), MediaOptions::default())
            .await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let local = session.local_participant().await.unwrap();
        let leaves = log();
        let l = leaves.clone();
        let _left = local.add_leave_listener(move |reason| l.lock().unwrap().push(reason));
        assert!(session.timeout_checker_active().await);

        session.transport().emit(TransportEvent::Disconnected {
            reason: "server shutdown".into(),
        });
        settle(&session).await;

        assert_eq!(session.phase().await, SessionPhase::Disconnected);
        assert!(session.local_participant().await.is_none());
        assert!(!session.timeout_checker_active().await);
        assert_eq!(*leaves.lock().unwrap(), vec![LeaveReason::Disconnected]);

        session.leave_room().await;
        assert_eq!(session.phase().await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn join_media_is_enabled_after_connect() {
        let session = Session::new(MockTransport::new());
        let media = MediaOptions {
            microphone: true,
            ..Default::default()
        };
        session.join(expectation(&["alice"], 30), media).await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        let local = session.local_participant().await.unwrap();

        wait_until(|| local.mic_enabled()).await;
        assert!(!local.camera_enabled());
        assert_eq!(
            session.transport().media_calls(),
            vec![(TrackSource::Microphone, true)]
        );

        session.set_camera_enabled(true).await.unwrap();
        assert!(local.camera_enabled());
    }

    #[tokio::test]
    async fn join_media_failure_is_not_fatal() {
        let session = Session::new(MockTransport::new().failing_media());
        let media = MediaOptions {
            microphone: true,
            camera: true,
            screen_share: false,
        };
        session.join(expectation(&["alice"], 30), media).await;
        wait_for_phase(&session, SessionPhase::Connected).await;
        wait_until(|| session.transport().media_calls().len() == 2).await;
        settle(&session).await;

        let local = session.local_participant().await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Connected);
        assert!(!local.mic_enabled());
        assert!(!local.camera_enabled());
        assert!(matches!(
            session.set_screen_share_enabled(true).await,
            Err(HuddleError::Media(_))
        ));
        assert!(!local.screen_share_enabled());
    }
}
