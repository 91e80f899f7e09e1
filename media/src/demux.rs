// Matroska demuxing. The container is parsed off the async runtime on a
// blocking task fed through the pipe reader; demuxed packets flow to the
// paced senders over bounded channels whose back-pressure stalls the
// reader and, through it, the upstream byte source.

use bytes::Bytes;
use matroska_demuxer::{Frame, MatroskaFile, TrackType};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use codec::params::ParameterSets;
use codec::{VideoCodec, OPUS_CODEC_ID};

use crate::error::MediaError;
use crate::pipe::PipeReader;

/// Object high-water mark of each packet channel.
pub const PACKET_CHANNEL_CAPACITY: usize = 128;

/// Opus frames carry 20ms of audio.
pub const AUDIO_FRAME_TIME_MS: f64 = 20.0;

const DEFAULT_VIDEO_FRAME_TIME_MS: f64 = 1000.0 / 30.0;

pub struct MediaPacket {
    pub data: Bytes,
    pub pts_us: i64,
}

pub struct VideoSource {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_time_ms: f64,
    pub packets: mpsc::Receiver<MediaPacket>,
}

pub struct AudioSource {
    pub sample_rate: u32,
    pub channels: u32,
    pub frame_time_ms: f64,
    pub packets: mpsc::Receiver<MediaPacket>,
}

pub struct DemuxOutput {
    pub video: Option<VideoSource>,
    pub audio: Option<AudioSource>,
}

struct TrackSink {
    track: u64,
    tx: mpsc::Sender<MediaPacket>,
}

/// Open the container, validate the first video/audio tracks against the
/// codec whitelist and start the packet producer. The returned receivers
/// end when the container ends, on fatal error, or on cancellation.
pub async fn demux(
    input: PipeReader,
    cancel: CancellationToken,
) -> Result<DemuxOutput, MediaError> {
    let mkv = task::spawn_blocking(move || MatroskaFile::open(input))
        .await
        .map_err(|e| MediaError::Demux(e.to_string()))?
        .map_err(|e| MediaError::Demux(e.to_string()))?;

    let timestamp_scale = mkv.info().timestamp_scale().get();

    let mut video = None;
    let mut video_sink = None;
    let mut param_sets = None;
    let mut audio = None;
    let mut audio_sink = None;

    for track in mkv.tracks() {
        match track.track_type() {
            TrackType::Video if video.is_none() => {
                let codec = VideoCodec::from_track_codec_id(track.codec_id())
                    .ok_or_else(|| {
                        MediaError::UnsupportedCodec(track.codec_id().to_string())
                    })?;
                param_sets =
                    ParameterSets::parse(codec, track.codec_private())?;
                let (width, height) = track
                    .video()
                    .map(|v| {
                        (
                            v.pixel_width().get() as u32,
                            v.pixel_height().get() as u32,
                        )
                    })
                    .unwrap_or((0, 0));
                let frame_time_ms = track
                    .default_duration()
                    .map(|d| d.get() as f64 / 1e6)
                    .unwrap_or(DEFAULT_VIDEO_FRAME_TIME_MS);
                let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
                video_sink = Some(TrackSink {
                    track: track.track_number().get(),
                    tx,
                });
                info!(
                    codec = %codec,
                    width,
                    height,
                    frame_time_ms,
                    "selected video track"
                );
                video = Some(VideoSource {
                    codec,
                    width,
                    height,
                    frame_time_ms,
                    packets: rx,
                });
            }
            TrackType::Audio if audio.is_none() => {
                if track.codec_id() != OPUS_CODEC_ID {
                    return Err(MediaError::UnsupportedCodec(
                        track.codec_id().to_string(),
                    ));
                }
                let (sample_rate, channels) = track
                    .audio()
                    .map(|a| {
                        (
                            a.sampling_frequency() as u32,
                            a.channels().get() as u32,
                        )
                    })
                    .unwrap_or((48_000, 2));
                let (tx, rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
                audio_sink = Some(TrackSink {
                    track: track.track_number().get(),
                    tx,
                });
                info!(sample_rate, channels, "selected audio track");
                audio = Some(AudioSource {
                    sample_rate,
                    channels,
                    frame_time_ms: AUDIO_FRAME_TIME_MS,
                    packets: rx,
                });
            }
            _ => {}
        }
    }

    task::spawn_blocking(move || {
        run_packet_loop(
            mkv,
            timestamp_scale,
            video_sink,
            param_sets,
            audio_sink,
            cancel,
        )
    });

    Ok(DemuxOutput { video, audio })
}

fn run_packet_loop(
    mut mkv: MatroskaFile<PipeReader>,
    timestamp_scale: u64,
    video: Option<TrackSink>,
    param_sets: Option<ParameterSets>,
    audio: Option<TrackSink>,
    cancel: CancellationToken,
) {
    let mut frame = Frame::default();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match mkv.next_frame(&mut frame) {
            Ok(true) => {
                let pts_us = (frame
                    .timestamp
                    .saturating_mul(timestamp_scale)
                    / 1_000) as i64;
                if let Some(sink) =
                    video.as_ref().filter(|s| s.track == frame.track)
                {
                    let data = match &param_sets {
                        Some(sets) => match sets.inject(&frame.data) {
                            Ok(data) => data,
                            Err(e) => {
                                warn!("closing streams on bitstream error: {e}");
                                break;
                            }
                        },
                        None => Bytes::copy_from_slice(&frame.data),
                    };
                    if sink
                        .tx
                        .blocking_send(MediaPacket { data, pts_us })
                        .is_err()
                    {
                        break;
                    }
                } else if let Some(sink) =
                    audio.as_ref().filter(|s| s.track == frame.track)
                {
                    let data = Bytes::copy_from_slice(&frame.data);
                    if sink
                        .tx
                        .blocking_send(MediaPacket { data, pts_us })
                        .is_err()
                    {
                        break;
                    }
                }
            }
            Ok(false) => {
                info!("container ended");
                break;
            }
            Err(e) => {
                warn!("closing streams on demux error: {e}");
                break;
            }
        }
    }
    // dropping the senders ends both packet streams
}
