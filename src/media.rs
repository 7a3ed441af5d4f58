//! Local and remote media stream handles

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::error::MediaError;

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One captured track. Clones share the same live flag.
#[derive(Clone)]
pub struct MediaTrack {
    kind: TrackKind,
    id: String,
    live: Arc<AtomicBool>,
    rtc: Option<Arc<TrackLocalStaticSample>>,
}

impl MediaTrack {
    /// A live track with no WebRTC backing
    pub fn new(kind: TrackKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            live: Arc::new(AtomicBool::new(true)),
            rtc: None,
        }
    }

    /// A track backed by a WebRTC sample writer
    pub fn with_rtc(kind: TrackKind, id: impl Into<String>, rtc: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            rtc: Some(rtc),
            ..Self::new(kind, id)
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once stopped
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn rtc(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.rtc.as_ref()
    }

    /// Returns true only for the call that actually ended the track
    fn stop(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("live", &self.is_live())
            .field("rtc", &self.rtc.is_some())
            .finish()
    }
}

/// Captured audio/video owned by the session.
///
/// Only the orchestrator stops it; the negotiator holds a clone for sending.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    /// A stream with a random id
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), tracks)
    }

    pub fn with_id(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// True while any track is live
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(MediaTrack::is_live)
    }

    /// Stop every live track, returning how many were stopped by this call
    pub fn stop(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Media received from the peer. Never stopped locally, only dropped.
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    kind: Option<TrackKind>,
    /// Held so the track outlives the negotiator's callback
    _track: Arc<TrackRemote>,
}

impl RemoteStream {
    /// Wrap a track announced by the peer connection
    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        Self {
            id: track.stream_id(),
            kind,
            _track: track,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> Option<TrackKind> {
        self.kind
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Source of the local camera/microphone stream
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream, MediaError>;
}
