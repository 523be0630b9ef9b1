use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use livekit::options::TrackPublishOptions;
use livekit::participant::ConnectionQuality as LkConnectionQuality;
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, LocalTrackPublication, LocalVideoTrack,
    RemoteParticipant as LkRemoteParticipant, Room, RoomEvent, RoomOptions,
};
use livekit::track::TrackSource as LkTrackSource;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::{AudioSourceOptions, RtcAudioSource, RtcVideoSource, VideoResolution};
use livekit::webrtc::video_source::native::NativeVideoSource;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::errors::HuddleError;
use crate::events::{ConnectionQuality, ParticipantEvent, TrackSource};
use crate::participant::{ParticipantHandle, PublicationInfo};
use crate::transport::{ConnectOptions, Connection, RemoteParticipant, Transport, TransportEvent};

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;

#[derive(Default)]
struct LocalSources {
    microphone: Option<NativeAudioSource>,
    camera: Option<NativeVideoSource>,
    screen_share: Option<NativeVideoSource>,
}

/// [`Transport`] over a LiveKit room.
///
/// Local tracks are published from native sources the first time they are
/// enabled and muted or unmuted afterwards. Host capture pipelines push
/// frames into the sources returned by [`LiveKitTransport::audio_source`]
/// and friends.
#[derive(Default)]
pub struct LiveKitTransport {
    room: Mutex<Option<Arc<Room>>>,
    events_task: StdMutex<Option<JoinHandle<()>>>,
    sources: StdMutex<LocalSources>,
}

impl LiveKitTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audio_source(&self) -> Option<NativeAudioSource> {
        self.sources().microphone.clone()
    }

    pub fn camera_source(&self) -> Option<NativeVideoSource> {
        self.sources().camera.clone()
    }

    pub fn screen_share_source(&self) -> Option<NativeVideoSource> {
        self.sources().screen_share.clone()
    }

    fn sources(&self) -> std::sync::MutexGuard<'_, LocalSources> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn room(&self) -> Result<Arc<Room>, HuddleError> {
        self.room
            .lock()
            .await
            .clone()
            .ok_or_else(|| HuddleError::Room("not connected".into()))
    }

    async fn set_video_enabled(&self, source: LkTrackSource, enabled: bool) -> Result<(), HuddleError> {
        let room = self.room().await?;
        if let Some(publication) = find_publication(&room, source) {
            toggle(&publication, enabled);
            return Ok(());
        }
        if !enabled {
            return Ok(());
        }

        let is_screencast = source == LkTrackSource::Screenshare;
        let name = if is_screencast { "screen_share" } else { "camera" };
        let video_source = NativeVideoSource::new(
            VideoResolution {
                width: VIDEO_WIDTH,
                height: VIDEO_HEIGHT,
            },
            is_screencast,
        );
        let track =
            LocalVideoTrack::create_video_track(name, RtcVideoSource::Native(video_source.clone()));
        room.local_participant()
            .publish_track(
                LocalTrack::Video(track),
                TrackPublishOptions {
                    source,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HuddleError::Media(format!("publish {name}: {e}")))?;

        let mut sources = self.sources();
        if is_screencast {
            sources.screen_share = Some(video_source);
        } else {
            sources.camera = Some(video_source);
        }
        tracing::info!("{name} track published");
        Ok(())
    }
}

impl Transport for LiveKitTransport {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        options: ConnectOptions,
    ) -> Result<Connection, HuddleError> {
        let mut room_options = RoomOptions::default();
        room_options.auto_subscribe = options.auto_subscribe;
        room_options.adaptive_stream = options.adaptive_stream;
        room_options.dynacast = options.dynacast;

        let (room, room_events) = Room::connect(url, token, room_options)
            .await
            .map_err(|e| HuddleError::Connection(e.to_string()))?;
        let room = Arc::new(room);

        let local = local_handle(&room);
        let remotes = remote_participants(&room);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(translate_events(room.clone(), room_events, tx));

        let previous = self.room.lock().await.replace(room);
        if let Some(stale) = self
            .events_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            stale.abort();
        }
        if let Some(previous) = previous {
            tracing::warn!("replacing a room that was still connected");
            if let Err(e) = previous.close().await {
                tracing::warn!("error closing room: {e}");
            }
        }

        tracing::info!("connected as {} with {} remote participants", local.sid, remotes.len());
        Ok(Connection {
            local,
            remotes,
            events: rx,
        })
    }

    async fn disconnect(&self) {
        if let Some(task) = self
            .events_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let room = self.room.lock().await.take();
        if let Some(room) = room {
            if let Err(e) = room.close().await {
                tracing::warn!("error closing room: {e}");
            }
        }
        *self.sources() = LocalSources::default();
    }

    async fn set_microphone_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        let room = self.room().await?;
        if let Some(publication) = find_publication(&room, LkTrackSource::Microphone) {
            toggle(&publication, enabled);
            return Ok(());
        }
        if !enabled {
            return Ok(());
        }

        let source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
            AUDIO_SAMPLE_RATE,
            AUDIO_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );
        let track =
            LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source.clone()));
        room.local_participant()
            .publish_track(
                LocalTrack::Audio(track),
                TrackPublishOptions {
                    source: LkTrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| HuddleError::Media(format!("publish microphone: {e}")))?;

        self.sources().microphone = Some(source);
        tracing::info!("microphone track published");
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        self.set_video_enabled(LkTrackSource::Camera, enabled).await
    }

    async fn set_screen_share_enabled(&self, enabled: bool) -> Result<(), HuddleError> {
        self.set_video_enabled(LkTrackSource::Screenshare, enabled).await
    }
}

fn find_publication(room: &Room, source: LkTrackSource) -> Option<LocalTrackPublication> {
    room.local_participant()
        .track_publications()
        .into_values()
        .find(|publication| publication.source() == source)
}

fn toggle(publication: &LocalTrackPublication, enabled: bool) {
    if enabled {
        publication.unmute();
    } else {
        publication.mute();
    }
    tracing::info!("{:?} enabled: {enabled}", publication.source());
}

fn source_from_lk(source: LkTrackSource) -> TrackSource {
    match source {
        LkTrackSource::Microphone => TrackSource::Microphone,
        LkTrackSource::Camera => TrackSource::Camera,
        LkTrackSource::Screenshare => TrackSource::ScreenShare,
        _ => TrackSource::Unknown,
    }
}

fn quality_from_lk(quality: LkConnectionQuality) -> ConnectionQuality {
    match quality {
        LkConnectionQuality::Excellent => ConnectionQuality::Excellent,
        LkConnectionQuality::Good => ConnectionQuality::Good,
        LkConnectionQuality::Poor => ConnectionQuality::Poor,
        LkConnectionQuality::Lost => ConnectionQuality::Lost,
    }
}

fn local_handle(room: &Room) -> ParticipantHandle {
    let local = room.local_participant();
    ParticipantHandle {
        sid: local.sid().to_string(),
        publications: local
            .track_publications()
            .values()
            .map(|p| PublicationInfo {
                source: source_from_lk(p.source()),
                muted: p.is_muted(),
            })
            .collect(),
        speaking: local.is_speaking(),
    }
}

fn remote_handle(participant: &LkRemoteParticipant) -> ParticipantHandle {
    ParticipantHandle {
        sid: participant.sid().to_string(),
        publications: participant
            .track_publications()
            .values()
            .map(|p| PublicationInfo {
                source: source_from_lk(p.source()),
                muted: p.is_muted(),
            })
            .collect(),
        speaking: participant.is_speaking(),
    }
}

fn remote_participants(room: &Room) -> Vec<RemoteParticipant> {
    room.remote_participants()
        .values()
        .map(|p| RemoteParticipant {
            identity: p.identity().to_string(),
            handle: remote_handle(p),
        })
        .collect()
}

/// Per-identity speaking transitions between two active-speaker sets.
///
/// Identities that stopped speaking come first, each group sorted.
fn diff_speakers(previous: &HashSet<String>, current: &HashSet<String>) -> Vec<(String, bool)> {
    let mut stopped: Vec<&String> = previous.difference(current).collect();
    let mut started: Vec<&String> = current.difference(previous).collect();
    stopped.sort();
    started.sort();
    stopped
        .into_iter()
        .map(|id| (id.clone(), false))
        .chain(started.into_iter().map(|id| (id.clone(), true)))
        .collect()
}

fn participant_event(identity: String, event: ParticipantEvent) -> TransportEvent {
    TransportEvent::Participant { identity, event }
}

fn translate(
    room: &Room,
    speakers: &mut HashSet<String>,
    event: RoomEvent,
) -> Vec<TransportEvent> {
    match event {
        RoomEvent::Reconnecting => vec![TransportEvent::Reconnecting],
        RoomEvent::Reconnected => vec![TransportEvent::Reconnected {
            local: local_handle(room),
            remotes: remote_participants(room),
        }],
        RoomEvent::Disconnected { reason } => vec![TransportEvent::Disconnected {
            reason: format!("{reason:?}"),
        }],
        RoomEvent::ParticipantConnected(participant) => vec![TransportEvent::ParticipantConnected {
            identity: participant.identity().to_string(),
            handle: remote_handle(&participant),
        }],
        RoomEvent::ParticipantDisconnected(participant) => {
            let identity = participant.identity().to_string();
            speakers.remove(&identity);
            vec![TransportEvent::ParticipantDisconnected { identity }]
        }
        RoomEvent::TrackSubscribed {
            publication,
            participant,
            ..
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::Subscribed {
                source: source_from_lk(publication.source()),
                muted: publication.is_muted(),
            },
        )],
        RoomEvent::TrackUnsubscribed {
            publication,
            participant,
            ..
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::Unsubscribed(source_from_lk(publication.source())),
        )],
        RoomEvent::LocalTrackPublished {
            publication,
            participant,
            ..
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::Published(source_from_lk(publication.source())),
        )],
        RoomEvent::LocalTrackUnpublished {
            publication,
            participant,
            ..
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::Unpublished(source_from_lk(publication.source())),
        )],
        RoomEvent::TrackMuted {
            participant,
            publication,
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::PublicationMuteChanged {
                source: source_from_lk(publication.source()),
                muted: true,
            },
        )],
        RoomEvent::TrackUnmuted {
            participant,
            publication,
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::PublicationMuteChanged {
                source: source_from_lk(publication.source()),
                muted: false,
            },
        )],
        RoomEvent::ActiveSpeakersChanged { speakers: active } => {
            let current: HashSet<String> = active.iter().map(|p| p.identity().to_string()).collect();
            let events = diff_speakers(speakers, &current)
                .into_iter()
                .map(|(identity, speaking)| {
                    participant_event(identity, ParticipantEvent::SpeakingChanged(speaking))
                })
                .collect();
            *speakers = current;
            events
        }
        RoomEvent::ConnectionQualityChanged {
            quality,
            participant,
        } => vec![participant_event(
            participant.identity().to_string(),
            ParticipantEvent::ConnectionQualityChanged(quality_from_lk(quality)),
        )],
        other => {
            tracing::trace!("unhandled room event: {other:?}");
            Vec::new()
        }
    }
}

async fn translate_events(
    room: Arc<Room>,
    mut room_events: mpsc::UnboundedReceiver<RoomEvent>,
    tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut speakers = HashSet::new();
    while let Some(event) = room_events.recv().await {
        for translated in translate(&room, &mut speakers, event) {
            if tx.send(translated).is_err() {
                tracing::debug!("session stopped listening, ending room event loop");
                return;
            }
        }
    }
    tracing::info!("room event loop ended");
}
