//! Media pipeline adapter.
//!
//! Capture itself is a host capability behind [`MediaCapture`]; this module
//! owns what the call core does with the captured tracks: mute and
//! camera-off via track-enable flags, in-place camera switching through the
//! live transport, and idempotent release.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::PeerTransport;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,
    #[error("media device unavailable: {0}")]
    Unavailable(String),
    #[error("call has no video track")]
    NoVideoTrack,
    #[error("camera switch failed: {0}")]
    SwitchFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Rear,
}

impl CameraFacing {
    pub fn opposite(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Rear,
            CameraFacing::Rear => CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing: CameraFacing,
}

impl MediaConstraints {
    pub fn voice() -> Self {
        Self {
            audio: true,
            video: false,
            facing: CameraFacing::Front,
        }
    }

    pub fn video(facing: CameraFacing) -> Self {
        Self {
            audio: true,
            video: true,
            facing,
        }
    }

    pub fn video_only(facing: CameraFacing) -> Self {
        Self {
            audio: false,
            video: true,
            facing,
        }
    }
}

/// Handle to one captured local track. The enable flag gates the sample
/// feed without detaching the track; `stop` releases the device.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    facing: Option<CameraFacing>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl MediaTrack {
    pub fn audio() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TrackKind::Audio,
            facing: None,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn video(facing: CameraFacing) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TrackKind::Video,
            facing: Some(facing),
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn facing(&self) -> Option<CameraFacing> {
        self.facing
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Host capture capability. A denied permission prompt surfaces as
/// [`MediaError::PermissionDenied`] and aborts the call attempt.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>, MediaError>;
}

/// Capture source that fabricates tracks instead of opening devices. Hosts
/// with real microphones and cameras supply their own [`MediaCapture`]; the
/// bundled binary runs on this one.
pub struct SyntheticCapture;

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn open(&self, constraints: &MediaConstraints) -> Result<Vec<MediaTrack>, MediaError> {
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::audio());
        }
        if constraints.video {
            tracks.push(MediaTrack::video(constraints.facing));
        }
        Ok(tracks)
    }
}

/// The local media owned by one call. Exclusively held by the active call;
/// never shared between sessions.
pub struct LocalMedia {
    capture: Arc<dyn MediaCapture>,
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
    facing: CameraFacing,
    released: bool,
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("audio", &self.audio)
            .field("video", &self.video)
            .field("facing", &self.facing)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LocalMedia {
    pub async fn acquire(
        capture: Arc<dyn MediaCapture>,
        constraints: MediaConstraints,
    ) -> Result<Self, MediaError> {
        let tracks = capture.open(&constraints).await?;
        let mut audio = None;
        let mut video = None;
        for track in tracks {
            match track.kind() {
                TrackKind::Audio => audio = Some(track),
                TrackKind::Video => video = Some(track),
            }
        }
        if constraints.audio && audio.is_none() {
            return Err(MediaError::Unavailable("no audio track captured".into()));
        }
        if constraints.video && video.is_none() {
            return Err(MediaError::Unavailable("no video track captured".into()));
        }
        Ok(Self {
            capture,
            audio,
            video,
            facing: constraints.facing,
            released: false,
        })
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    pub fn facing(&self) -> CameraFacing {
        self.facing
    }

    /// Toggle the audio track's enable flag. The track stays attached so
    /// unmuting needs no renegotiation.
    pub fn set_muted(&self, muted: bool) {
        if let Some(audio) = &self.audio {
            audio.set_enabled(!muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.audio.as_ref().map(|t| !t.is_enabled()).unwrap_or(false)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        let video = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        video.set_enabled(enabled);
        Ok(())
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video.as_ref().map(|t| t.is_enabled()).unwrap_or(false)
    }

    /// Capture the opposite-facing camera, swap the outgoing video track on
    /// the live connection, then stop the old capture. The audio track and
    /// the connection itself are untouched and no offer/answer exchange is
    /// triggered.
    pub async fn switch_camera(
        &mut self,
        transport: &dyn PeerTransport,
    ) -> Result<CameraFacing, MediaError> {
        let old = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?.clone();
        let facing = self.facing.opposite();
        let tracks = self
            .capture
            .open(&MediaConstraints::video_only(facing))
            .await?;
        let new = tracks
            .into_iter()
            .find(|t| t.kind() == TrackKind::Video)
            .ok_or_else(|| MediaError::Unavailable("no video track captured".into()))?;
        new.set_enabled(old.is_enabled());

        transport
            .replace_video_track(&new)
            .await
            .map_err(|err| MediaError::SwitchFailed(err.to_string()))?;

        old.stop();
        self.video = Some(new);
        self.facing = facing;
        Ok(facing)
    }

    /// Stop and drop every local track. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for track in self.audio.iter().chain(self.video.iter()) {
            track.stop();
        }
        self.audio = None;
        self.video = None;
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}
