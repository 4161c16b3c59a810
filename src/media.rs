//! Граница с захватом медиа.
//!
//! Ядру нужно только одно: получить набор локальных треков и прикрепить
//! или открепить их от соединения. Настоящий захват камеры здесь не делается.

use crate::error::Result;
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Локальный поток: набор треков с общим stream id
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.tracks.iter().map(|t| t.id()).collect();
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &ids)
            .finish()
    }
}

/// Источник медиа. Может вернуть `PermissionDenied` или `MediaDeviceUnavailable`.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn get_user_media(&self) -> Result<MediaStream>;
}

/// Opus + VP8 треки без захвата. Достаточно для пересогласования.
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    pub audio: bool,
    pub video: bool,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaProvider for SyntheticMedia {
    async fn get_user_media(&self) -> Result<MediaStream> {
        let id = format!("ssc-{}", random_id());
        let mut tracks: Vec<LocalTrack> = Vec::new();

        if self.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                format!("audio-{}", random_id()),
                id.clone(),
            )));
        }
        if self.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                format!("video-{}", random_id()),
                id.clone(),
            )));
        }
        Ok(MediaStream { id, tracks })
    }
}
