//! UniFFI bindings for huddle-core.
//!
//! Exposes a HuddleClient object that wraps the room session, the settings
//! store and the provisioning client behind a single FFI-safe interface.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use huddle_core::{
    ConnectionQuality as CoreConnectionQuality, ConnectionStatus as CoreConnectionStatus,
    HuddleError as CoreHuddleError, LeaveReason as CoreLeaveReason, LiveKitTransport, Participant,
    ProvisioningClient, RtcType as CoreRtcType, Session, SessionExpectation,
    SessionPhase as CoreSessionPhase, SettingsStore, TrackSource as CoreTrackSource,
};

uniffi::include_scaffolding!("huddle");

// ── Android WebRTC initialization ────────────────────────────────────
//
// Called from Kotlin after System.loadLibrary and before the first join.
// webrtc::InitAndroid needs a JNI class loader context, which JNI_OnLoad
// does not have.

#[cfg(target_os = "android")]
#[unsafe(no_mangle)]
pub extern "C" fn Java_io_huddle_mobile_HuddleApplication_nativeInitWebrtc(
    env: *mut std::ffi::c_void,
    _class: *mut std::ffi::c_void,
) {
    huddle_log("HUDDLE FFI: nativeInitWebrtc called");
    let Ok(env) = (unsafe { jni::JNIEnv::from_raw(env as *mut jni::sys::JNIEnv) }) else {
        huddle_log("HUDDLE FFI: nativeInitWebrtc got an invalid JNIEnv");
        return;
    };
    let Ok(jvm) = env.get_java_vm() else {
        huddle_log("HUDDLE FFI: nativeInitWebrtc could not get the JavaVM");
        return;
    };

    libwebrtc::android::initialize_android(&jvm);

    // Dropping the JavaVM would call DestroyJavaVM.
    std::mem::forget(jvm);
    huddle_log("HUDDLE FFI: WebRTC initialized");
}

// ── Platform log helper ──────────────────────────────────────────────

/// Write a message to logcat on Android, syslog on iOS, stderr elsewhere.
///
/// Used before tracing is initialized and around the FFI boundary.
fn huddle_log(msg: &str) {
    #[cfg(target_os = "android")]
    {
        use std::ffi::CString;
        unsafe extern "C" {
            fn __android_log_write(
                prio: i32,
                tag: *const std::ffi::c_char,
                text: *const std::ffi::c_char,
            ) -> i32;
        }
        let text = CString::new(msg).unwrap_or_else(|_| c"(invalid utf8)".to_owned());
        unsafe {
            __android_log_write(4 /* INFO */, c"HUDDLE_FFI".as_ptr(), text.as_ptr());
        }
    }
    #[cfg(target_os = "ios")]
    {
        use std::ffi::CString;
        unsafe extern "C" {
            fn syslog(priority: i32, message: *const std::ffi::c_char, ...);
        }
        let text = CString::new(msg).unwrap_or_else(|_| c"(invalid utf8)".to_owned());
        unsafe {
            syslog(6 /* LOG_INFO */, text.as_ptr());
        }
    }
    #[cfg(not(any(target_os = "android", target_os = "ios")))]
    eprintln!("{msg}");
}

// ── Namespace functions ──────────────────────────────────────────────

fn default_filter(debug: bool) -> &'static str {
    if debug {
        "huddle_core=debug,huddle_ffi=debug"
    } else {
        "huddle_core=info,huddle_ffi=info"
    }
}

/// Initialize tracing. Call once from the host before creating a client,
/// passing the persisted `debug_logging` setting. `RUST_LOG` wins when set.
fn init_logging(debug: bool) {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter(debug)));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
        if installed.is_err() {
            huddle_log("HUDDLE FFI: a tracing subscriber was already installed");
        }
    });
}

fn new_room_id() -> String {
    huddle_core::provisioning::new_room_id()
}

// ── FFI-safe type conversions ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl From<CoreConnectionStatus> for ConnectionStatus {
    fn from(s: CoreConnectionStatus) -> Self {
        match s {
            CoreConnectionStatus::Connecting => Self::Connecting,
            CoreConnectionStatus::Connected => Self::Connected,
            CoreConnectionStatus::Disconnected => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Unknown,
    Excellent,
    Good,
    Poor,
    Lost,
}

impl From<CoreConnectionQuality> for ConnectionQuality {
    fn from(q: CoreConnectionQuality) -> Self {
        match q {
            CoreConnectionQuality::Unknown => Self::Unknown,
            CoreConnectionQuality::Excellent => Self::Excellent,
            CoreConnectionQuality::Good => Self::Good,
            CoreConnectionQuality::Poor => Self::Poor,
            CoreConnectionQuality::Lost => Self::Lost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    ScreenShare,
    Unknown,
}

impl From<CoreTrackSource> for TrackSource {
    fn from(s: CoreTrackSource) -> Self {
        match s {
            CoreTrackSource::Microphone => Self::Microphone,
            CoreTrackSource::Camera => Self::Camera,
            CoreTrackSource::ScreenShare => Self::ScreenShare,
            CoreTrackSource::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Left,
    Timeout,
    Disconnected,
}

impl From<CoreLeaveReason> for LeaveReason {
    fn from(r: CoreLeaveReason) -> Self {
        match r {
            CoreLeaveReason::Left => Self::Left,
            CoreLeaveReason::Timeout => Self::Timeout,
            CoreLeaveReason::Disconnected => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl From<CoreSessionPhase> for SessionPhase {
    fn from(p: CoreSessionPhase) -> Self {
        match p {
            CoreSessionPhase::Idle => Self::Idle,
            CoreSessionPhase::Connecting => Self::Connecting,
            CoreSessionPhase::Connected => Self::Connected,
            CoreSessionPhase::Disconnected => Self::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcType {
    Audio,
    Video,
}

impl From<CoreRtcType> for RtcType {
    fn from(t: CoreRtcType) -> Self {
        match t {
            CoreRtcType::Audio => Self::Audio,
            CoreRtcType::Video => Self::Video,
        }
    }
}

impl From<RtcType> for CoreRtcType {
    fn from(t: RtcType) -> Self {
        match t {
            RtcType::Audio => Self::Audio,
            RtcType::Video => Self::Video,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub identity: String,
    pub sid: Option<String>,
    pub is_local: bool,
    pub is_joined: bool,
    pub is_timed_out: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub screen_share_enabled: bool,
    pub speaking: bool,
    pub connection_quality: ConnectionQuality,
}

impl From<&Participant> for ParticipantInfo {
    fn from(p: &Participant) -> Self {
        let snapshot = p.snapshot();
        Self {
            identity: snapshot.identity,
            sid: p.sid(),
            is_local: snapshot.is_local,
            is_joined: snapshot.is_joined,
            is_timed_out: snapshot.is_timed_out,
            mic_enabled: snapshot.mic_enabled,
            camera_enabled: snapshot.camera_enabled,
            screen_share_enabled: snapshot.screen_share_enabled,
            speaking: snapshot.speaking,
            connection_quality: snapshot.connection_quality.into(),
        }
    }
}

fn participant_infos(records: Vec<Arc<Participant>>) -> Vec<ParticipantInfo> {
    records.iter().map(|p| ParticipantInfo::from(p.as_ref())).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub room_name: String,
    pub url: String,
    pub token: String,
    pub max_participants: u32,
    pub rtc_type: RtcType,
    pub is_p2p: bool,
    pub identities: Vec<String>,
    pub creator: String,
    pub login_identity: String,
    pub timeout_secs: u64,
}

impl From<SessionExpectation> for SessionInfo {
    fn from(e: SessionExpectation) -> Self {
        Self {
            room_name: e.room_name,
            url: e.url,
            token: e.token,
            max_participants: u32::try_from(e.max_participants).unwrap_or(u32::MAX),
            rtc_type: e.rtc_type.into(),
            is_p2p: e.is_p2p,
            identities: e.identities,
            creator: e.creator,
            login_identity: e.login_identity,
            timeout_secs: e.timeout_secs,
        }
    }
}

impl From<SessionInfo> for SessionExpectation {
    fn from(s: SessionInfo) -> Self {
        Self {
            room_name: s.room_name,
            url: s.url,
            token: s.token,
            max_participants: s.max_participants as usize,
            rtc_type: s.rtc_type.into(),
            is_p2p: s.is_p2p,
            identities: s.identities,
            creator: s.creator,
            login_identity: s.login_identity,
            timeout_secs: s.timeout_secs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaOptions {
    pub microphone: bool,
    pub camera: bool,
    pub screen_share: bool,
}

impl From<MediaOptions> for huddle_core::MediaOptions {
    fn from(m: MediaOptions) -> Self {
        Self {
            microphone: m.microphone,
            camera: m.camera,
            screen_share: m.screen_share,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub display_name: Option<String>,
    pub mic_enabled_on_join: bool,
    pub camera_enabled_on_join: bool,
    pub screen_share_on_join: bool,
    pub join_timeout_secs: u64,
    pub debug_logging: bool,
}

impl From<huddle_core::Settings> for Settings {
    fn from(s: huddle_core::Settings) -> Self {
        Self {
            display_name: s.display_name,
            mic_enabled_on_join: s.mic_enabled_on_join,
            camera_enabled_on_join: s.camera_enabled_on_join,
            screen_share_on_join: s.screen_share_on_join,
            join_timeout_secs: s.join_timeout_secs,
            debug_logging: s.debug_logging,
        }
    }
}

// ── Error conversion ─────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HuddleError {
    #[error("Connection error: {msg}")]
    Connection { msg: String },
    #[error("Room error: {msg}")]
    Room { msg: String },
    #[error("Room is full: at most {max} participants")]
    CapacityExceeded { max: u32 },
    #[error("Not in a room: {msg}")]
    NotInRoom { msg: String },
    #[error("Media error: {msg}")]
    Media { msg: String },
    #[error("HTTP error: {msg}")]
    Http { msg: String },
    #[error("Server error: {msg}")]
    Server { msg: String },
    #[error("Invalid URL: {msg}")]
    InvalidUrl { msg: String },
    #[error("Invalid response: {msg}")]
    Decode { msg: String },
}

impl From<CoreHuddleError> for HuddleError {
    fn from(e: CoreHuddleError) -> Self {
        tracing::error!("HuddleError: {e}");
        match e {
            CoreHuddleError::Connection(msg) => Self::Connection { msg },
            CoreHuddleError::Room(msg) => Self::Room { msg },
            CoreHuddleError::CapacityExceeded { max } => Self::CapacityExceeded {
                max: u32::try_from(max).unwrap_or(u32::MAX),
            },
            CoreHuddleError::NotInRoom => Self::NotInRoom {
                msg: "no local participant".to_string(),
            },
            CoreHuddleError::Media(msg) => Self::Media { msg },
            CoreHuddleError::Http(msg) => Self::Http { msg },
            CoreHuddleError::Server(msg) => Self::Server { msg },
            CoreHuddleError::InvalidUrl(msg) => Self::InvalidUrl { msg },
            CoreHuddleError::Decode(msg) => Self::Decode { msg },
        }
    }
}

// ── Callback interfaces ──────────────────────────────────────────────

pub trait SessionListener: Send + Sync {
    fn on_status_changed(&self, room_name: String, status: ConnectionStatus);
    fn on_new_participant(&self, participant: ParticipantInfo);
}

pub trait ParticipantListener: Send + Sync {
    fn on_microphone_changed(&self, enabled: bool);
    fn on_camera_changed(&self, enabled: bool);
    fn on_speaking_changed(&self, speaking: bool);
    fn on_connection_quality_changed(&self, quality: ConnectionQuality);
    fn on_joined(&self);
    fn on_left(&self, reason: LeaveReason);
    fn on_timed_out(&self);
    fn on_track_published(&self, source: TrackSource);
    fn on_track_unpublished(&self, source: TrackSource);
}

/// Keeps a group of core subscriptions alive until cancelled or dropped.
pub struct ListenerHandle {
    tokens: Vec<huddle_core::ListenerToken>,
}

impl ListenerHandle {
    fn new(tokens: Vec<huddle_core::ListenerToken>) -> Self {
        Self { tokens }
    }

    pub fn cancel(&self) {
        for token in &self.tokens {
            token.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.tokens.iter().any(|t| t.is_active())
    }
}

fn subscribe_participant(
    record: &Participant,
    listener: Arc<dyn ParticipantListener>,
) -> Vec<huddle_core::ListenerToken> {
    let l = listener.clone();
    let microphone = record.add_microphone_listener(move |v| l.on_microphone_changed(v));
    let l = listener.clone();
    let camera = record.add_camera_listener(move |v| l.on_camera_changed(v));
    let l = listener.clone();
    let speaking = record.add_speaking_listener(move |v| l.on_speaking_changed(v));
    let l = listener.clone();
    let quality =
        record.add_connection_quality_listener(move |q| l.on_connection_quality_changed(q.into()));
    let l = listener.clone();
    let joined = record.add_joined_listener(move || l.on_joined());
    let l = listener.clone();
    let left = record.add_leave_listener(move |r| l.on_left(r.into()));
    let l = listener.clone();
    let timeout = record.add_timeout_listener(move || l.on_timed_out());
    let l = listener.clone();
    let published = record.add_track_published_listener(move |s| l.on_track_published(s.into()));
    let l = listener;
    let unpublished =
        record.add_track_unpublished_listener(move |s| l.on_track_unpublished(s.into()));

    vec![
        microphone,
        camera,
        speaking,
        quality,
        joined,
        left,
        timeout,
        published,
        unpublished,
    ]
}

// ── HuddleClient: main FFI object ────────────────────────────────────

pub struct HuddleClient {
    session: Session<LiveKitTransport>,
    settings: SettingsStore,
    provisioning: StdMutex<Option<Arc<ProvisioningClient>>>,
    rt: tokio::runtime::Runtime,
}

impl HuddleClient {
    pub fn new(data_dir: String) -> Result<Self, HuddleError> {
        huddle_log("HUDDLE FFI: HuddleClient::new() called");
        let rt = tokio::runtime::Runtime::new().map_err(|e| HuddleError::Connection {
            msg: format!("failed to create tokio runtime: {e}"),
        })?;
        let settings = SettingsStore::new(&data_dir);

        // The session spawns its notification worker on the current runtime.
        let session = {
            let _guard = rt.enter();
            Session::new(LiveKitTransport::new())
        };

        #[cfg(target_os = "android")]
        {
            *capture::TRANSPORT.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(session.transport().clone());
        }

        huddle_log("HUDDLE FFI: HuddleClient::new() completed");
        Ok(Self {
            session,
            settings,
            provisioning: StdMutex::new(None),
            rt,
        })
    }

    /// Join using the media preferences stored in settings.
    pub fn join(&self, session: SessionInfo) {
        let media = huddle_core::MediaOptions::from(&self.settings.get());
        self.start_join(session, media);
    }

    pub fn join_with_media(&self, session: SessionInfo, media: MediaOptions) {
        self.start_join(session, media.into());
    }

    fn start_join(&self, session: SessionInfo, media: huddle_core::MediaOptions) {
        let mut expectation = SessionExpectation::from(session);
        if expectation.timeout_secs == 0 {
            expectation.timeout_secs = self.settings.get().join_timeout_secs;
        }
        let room = expectation.room_name.clone();
        huddle_log(&format!("HUDDLE FFI: join() entered, room={room}"));

        // A panic must not unwind across the FFI boundary.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.rt.block_on(self.session.join(expectation, media));
        }));
        if result.is_err() {
            huddle_log(&format!("HUDDLE FFI: join() panicked, room={room}"));
        }
    }

    pub fn leave_room(&self) {
        self.rt.block_on(self.session.leave_room());
    }

    pub fn invite_participants(
        &self,
        identities: Vec<String>,
    ) -> Result<Vec<ParticipantInfo>, HuddleError> {
        let invited = self
            .rt
            .block_on(self.session.invite_participants(&identities))?;
        Ok(participant_infos(invited))
    }

    pub fn missed_participants(&self, identities: Vec<String>) -> Result<Vec<String>, HuddleError> {
        Ok(self
            .rt
            .block_on(self.session.missed_participants(&identities))?)
    }

    pub fn phase(&self) -> SessionPhase {
        self.rt.block_on(self.session.phase()).into()
    }

    pub fn room_name(&self) -> Option<String> {
        self.rt.block_on(self.session.room_name())
    }

    pub fn local_participant(&self) -> Option<ParticipantInfo> {
        self.rt
            .block_on(self.session.local_participant())
            .map(|p| ParticipantInfo::from(p.as_ref()))
    }

    pub fn participant(&self, identity: String) -> Option<ParticipantInfo> {
        self.rt
            .block_on(self.session.participant(&identity))
            .map(|p| ParticipantInfo::from(p.as_ref()))
    }

    pub fn all_participants(&self, include_timed_out: bool) -> Vec<ParticipantInfo> {
        participant_infos(self.rt.block_on(self.session.all_participants(include_timed_out)))
    }

    pub fn remote_participants(&self, include_timed_out: bool) -> Vec<ParticipantInfo> {
        participant_infos(
            self.rt
                .block_on(self.session.remote_participants(include_timed_out)),
        )
    }

    pub fn add_session_listener(&self, listener: Box<dyn SessionListener>) -> Arc<ListenerHandle> {
        let listener: Arc<dyn SessionListener> = Arc::from(listener);

        let l = listener.clone();
        let status = self.session.add_status_listener(move |change| {
            l.on_status_changed(change.room_name, change.status.into())
        });
        let l = listener;
        let joined = self
            .rt
            .block_on(self.session.add_new_participant_listener(move |p| {
                l.on_new_participant(ParticipantInfo::from(p.as_ref()))
            }));

        Arc::new(ListenerHandle::new(vec![status, joined]))
    }

    pub fn add_participant_listener(
        &self,
        identity: String,
        listener: Box<dyn ParticipantListener>,
    ) -> Result<Arc<ListenerHandle>, HuddleError> {
        let record = self
            .rt
            .block_on(self.session.participant(&identity))
            .ok_or_else(|| HuddleError::Room {
                msg: format!("unknown participant {identity}"),
            })?;
        let tokens = subscribe_participant(&record, Arc::from(listener));
        Ok(Arc::new(ListenerHandle::new(tokens)))
    }

    pub fn set_microphone_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        Ok(self.rt.block_on(self.session.set_microphone_enabled(enabled))?)
    }

    pub fn set_camera_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        Ok(self.rt.block_on(self.session.set_camera_enabled(enabled))?)
    }

    pub fn set_screen_share_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        Ok(self
            .rt
            .block_on(self.session.set_screen_share_enabled(enabled))?)
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn get_settings(&self) -> Settings {
        self.settings.get().into()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.settings.set_display_name(name);
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.settings.set_mic_enabled_on_join(enabled);
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.settings.set_camera_enabled_on_join(enabled);
    }

    pub fn set_screen_share_on_join(&self, enabled: bool) {
        self.settings.set_screen_share_on_join(enabled);
    }

    pub fn set_join_timeout_secs(&self, secs: u64) {
        self.settings.set_join_timeout_secs(secs);
    }

    pub fn set_debug_logging(&self, enabled: bool) {
        self.settings.set_debug_logging(enabled);
    }

    // ── Provisioning ─────────────────────────────────────────────────

    pub fn set_server_url(&self, url: String) -> Result<(), HuddleError> {
        let client = ProvisioningClient::new(&url)?;
        tracing::info!("provisioning server set to {}", client.base_url());
        *self.provisioning_slot() = Some(Arc::new(client));
        Ok(())
    }

    /// Create a room under a fresh id and describe it for `creator` to join.
    pub fn create_room(
        &self,
        creator: String,
        uids: Vec<String>,
        max_participants: u32,
        rtc_type: RtcType,
    ) -> Result<SessionInfo, HuddleError> {
        let client = self.provisioning()?;
        let room_id = new_room_id();
        let room = self.guarded("create_room", || {
            self.rt.block_on(client.create_room(
                &room_id,
                &creator,
                &uids,
                max_participants as usize,
                rtc_type.into(),
            ))
        })?;
        Ok(room.into_expectation(&creator).into())
    }

    pub fn join_room(&self, room_id: String, uid: String) -> Result<SessionInfo, HuddleError> {
        let client = self.provisioning()?;
        let room = self.guarded("join_room", || {
            self.rt.block_on(client.join_room(&room_id, &uid))
        })?;
        Ok(room.into_expectation(&uid).into())
    }

    /// Tell the provisioning server `uid` left `room_id`. Best effort.
    pub fn notify_room_left(&self, room_id: String, uid: String) {
        match self.provisioning() {
            Ok(client) => self.rt.block_on(client.leave_room(&room_id, &uid)),
            Err(_) => tracing::warn!("notify_room_left: no provisioning server configured"),
        }
    }

    fn provisioning(&self) -> Result<Arc<ProvisioningClient>, HuddleError> {
        self.provisioning_slot()
            .clone()
            .ok_or_else(|| HuddleError::InvalidUrl {
                msg: "provisioning server URL is not set".to_string(),
            })
    }

    fn provisioning_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<ProvisioningClient>>> {
        self.provisioning.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f`, turning a panic into an error instead of unwinding into the host.
    fn guarded<R>(
        &self,
        what: &str,
        f: impl FnOnce() -> Result<R, CoreHuddleError>,
    ) -> Result<R, HuddleError> {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
            Ok(result) => Ok(result?),
            Err(_) => {
                huddle_log(&format!("HUDDLE FFI: {what}() panicked"));
                Err(HuddleError::Connection {
                    msg: format!("internal panic in {what}"),
                })
            }
        }
    }
}

impl Drop for HuddleClient {
    fn drop(&mut self) {
        #[cfg(target_os = "android")]
        {
            *capture::TRANSPORT.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }
}

// ── JNI: microphone capture (Android AudioRecord → LiveKit) ──────────

#[cfg(target_os = "android")]
mod capture {
    use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

    use huddle_core::LiveKitTransport;
    use livekit::webrtc::prelude::AudioFrame;

    use super::huddle_log;

    /// Transport of the live client; capture threads read its sources.
    pub(crate) static TRANSPORT: StdMutex<Option<Arc<LiveKitTransport>>> = StdMutex::new(None);

    /// Single-thread runtime for the async `capture_frame` calls.
    static AUDIO_RT: OnceLock<Option<tokio::runtime::Runtime>> = OnceLock::new();

    fn audio_runtime() -> Option<&'static tokio::runtime::Runtime> {
        AUDIO_RT
            .get_or_init(|| {
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .inspect_err(|e| huddle_log(&format!("HUDDLE FFI: audio runtime failed: {e}")))
                    .ok()
            })
            .as_ref()
    }

    /// Feed 16-bit PCM captured by Kotlin into the published microphone track.
    ///
    /// Frames are dropped while the microphone has never been enabled.
    ///
    /// # Safety
    /// - `env` must be a valid JNI environment pointer.
    /// - `data_buf` must be a direct ByteBuffer holding `num_samples` i16 samples.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn Java_io_huddle_mobile_NativeMedia_nativePushAudioFrame(
        env: *mut jni::sys::JNIEnv,
        _class: jni::sys::jobject,
        data_buf: jni::sys::jobject,
        num_samples: jni::sys::jint,
        sample_rate: jni::sys::jint,
        num_channels: jni::sys::jint,
    ) {
        if num_samples <= 0 || sample_rate <= 0 || num_channels <= 0 {
            return;
        }
        let source = {
            let guard = TRANSPORT.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref().and_then(|t| t.audio_source()) {
                Some(source) => source,
                None => return,
            }
        };
        let Some(rt) = audio_runtime() else {
            return;
        };

        let Ok(jni_env) = (unsafe { jni::JNIEnv::from_raw(env) }) else {
            return;
        };
        let buffer = unsafe { jni::objects::JByteBuffer::from_raw(data_buf) };
        let Ok(ptr) = jni_env.get_direct_buffer_address(&buffer) else {
            return;
        };

        let sample_count = num_samples as usize;
        let pcm = unsafe { std::slice::from_raw_parts(ptr as *const i16, sample_count) };
        let frame = AudioFrame {
            data: pcm.into(),
            sample_rate: sample_rate as u32,
            num_channels: num_channels as u32,
            samples_per_channel: sample_count as u32 / num_channels as u32,
        };

        if let Err(e) = rt.block_on(source.capture_frame(&frame)) {
            tracing::debug!("dropped microphone frame: {e}");
        }
    }
}
