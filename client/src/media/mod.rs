mod errors;

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use errors::MediaErrors;

const STREAM_ID: &str = "roulette";

/// Local tracks attached to every peer connection the client creates.
#[derive(Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[Arc<TrackLocalStaticSample>] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia, MediaErrors>;
}

/// Hands out sample tracks that an encoder outside the client writes into.
pub struct SampleTrackProvider {
    audio: bool,
    video: bool,
}

impl SampleTrackProvider {
    pub fn new(audio: bool, video: bool) -> Self {
        Self { audio, video }
    }

    fn track(mime_type: &str, id: &str) -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            STREAM_ID.to_owned(),
        ))
    }
}

#[async_trait]
impl MediaProvider for SampleTrackProvider {
    async fn acquire(&self) -> Result<LocalMedia, MediaErrors> {
        if !self.audio && !self.video {
            return Err(MediaErrors::Denied(
                "both audio and video capture are disabled".to_owned(),
            ));
        }

        let mut tracks = Vec::new();
        if self.video {
            tracks.push(Self::track(MIME_TYPE_VP8, "video"));
        }
        if self.audio {
            tracks.push(Self::track(MIME_TYPE_OPUS, "audio"));
        }
        tracing::info!("Local media ready with {} track(s)", tracks.len());
        Ok(LocalMedia::new(tracks))
    }
}
