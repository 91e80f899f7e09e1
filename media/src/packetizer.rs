// Frame-to-datagram packetization. A frame becomes one or more sealed
// RTP packets plus, on the sender-report cadence, one RTCP SR. All
// payloads of a frame are sealed before any is sent so the sequence
// numbers leave in index order.

use std::sync::Arc;
use std::time::SystemTime;

use codec::{h264, h265, nal, vp8, VideoCodec, MTU, OPUS_PAYLOAD_TYPE};

use crate::crypto::{TransportCipher, NONCE_PREFIX_LEN};
use crate::error::MediaError;
use crate::packet::{playout_delay_extension, RtpSession};
use crate::rtcp;
use crate::transport::PacketSink;

pub const DEFAULT_SR_INTERVAL_MS: f64 = 1000.0;

/// 90kHz video clock ticks per millisecond.
const VIDEO_CLOCK_PER_MS: f64 = 90.0;
/// 48kHz audio clock ticks per millisecond.
const AUDIO_CLOCK_PER_MS: f64 = 48.0;

/// State shared by both packetizers: RTP session, cipher, and the
/// sender-report cadence over media time.
struct PacketizerState {
    sink: Arc<PacketSink>,
    rtp: RtpSession,
    cipher: TransportCipher,
    media_ms: f64,
    last_rtcp_media_ms: f64,
    sr_interval_ms: f64,
    rtcp_enabled: bool,
}

impl PacketizerState {
    fn new(sink: Arc<PacketSink>, rtp: RtpSession, cipher: TransportCipher) -> Self {
        PacketizerState {
            sink,
            rtp,
            cipher,
            media_ms: 0.0,
            last_rtcp_media_ms: 0.0,
            sr_interval_ms: DEFAULT_SR_INTERVAL_MS,
            rtcp_enabled: true,
        }
    }

    /// Header + optional extension + sealed payload + truncated nonce.
    /// Advances the sequence number once.
    fn seal_packet(
        &mut self,
        payload: &[u8],
        marker: bool,
        extension: bool,
    ) -> Result<Vec<u8>, MediaError> {
        let header = self.rtp.header(marker, extension);
        let (ciphertext, nonce) = self.cipher.encrypt(payload, &header)?;
        let ext = extension.then(|| playout_delay_extension(0));
        let ext_len = ext.map(|e| e.len()).unwrap_or(0);
        let mut packet = Vec::with_capacity(
            header.len() + ext_len + ciphertext.len() + NONCE_PREFIX_LEN,
        );
        packet.extend_from_slice(&header);
        if let Some(ext) = ext {
            packet.extend_from_slice(&ext);
        }
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&nonce[..NONCE_PREFIX_LEN]);
        Ok(packet)
    }

    async fn send_all(&self, packets: &[Vec<u8>]) {
        for packet in packets {
            self.sink.send(packet).await;
        }
    }

    /// Post-frame bookkeeping: update the counters, emit an SR when a
    /// cadence boundary was crossed, then advance media time and the RTP
    /// clock for the next frame.
    async fn on_frame_sent(
        &mut self,
        packets: u32,
        bytes: u32,
        frame_time_ms: f64,
        clock_per_ms: f64,
    ) -> Result<(), MediaError> {
        self.rtp.record_sent(packets, bytes);
        self.maybe_send_report().await?;
        self.media_ms += frame_time_ms;
        self.rtp
            .advance_timestamp((clock_per_ms * frame_time_ms).round() as u32);
        Ok(())
    }

    async fn maybe_send_report(&mut self) -> Result<(), MediaError> {
        if !self.rtcp_enabled || self.rtp.total_packets() == 0 {
            return Ok(());
        }
        let crossed = (self.media_ms / self.sr_interval_ms).floor()
            > (self.last_rtcp_media_ms / self.sr_interval_ms).floor();
        if !crossed {
            return Ok(());
        }
        let report = self.build_sender_report(SystemTime::now())?;
        self.sink.send(&report).await;
        self.last_rtcp_media_ms = self.media_ms;
        Ok(())
    }

    fn build_sender_report(
        &mut self,
        now: SystemTime,
    ) -> Result<Vec<u8>, MediaError> {
        let header = rtcp::sender_report_header(self.rtp.ssrc());
        let body = rtcp::sender_report_body(
            now,
            self.rtp.timestamp(),
            self.rtp.total_packets(),
            self.rtp.total_bytes(),
        );
        let (ciphertext, nonce) = self.cipher.encrypt(&body, &header)?;
        let mut packet = Vec::with_capacity(
            header.len() + ciphertext.len() + NONCE_PREFIX_LEN,
        );
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&nonce[..NONCE_PREFIX_LEN]);
        Ok(packet)
    }
}

pub struct VideoPacketizer {
    state: PacketizerState,
    codec: VideoCodec,
    picture_id: u16,
}

impl VideoPacketizer {
    pub fn new(
        sink: Arc<PacketSink>,
        ssrc: u32,
        codec: VideoCodec,
        cipher: TransportCipher,
    ) -> VideoPacketizer {
        let rtp = RtpSession::new(ssrc, codec.payload_type());
        VideoPacketizer {
            state: PacketizerState::new(sink, rtp, cipher),
            codec,
            picture_id: 0,
        }
    }

    pub async fn send_frame(
        &mut self,
        frame: &[u8],
        frame_time_ms: f64,
    ) -> Result<(), MediaError> {
        let packets = self.seal_frame(frame)?;
        let count = packets.len() as u32;
        let bytes = packets
            .iter()
            .fold(0u32, |sum, p| sum.wrapping_add(p.len() as u32));
        self.state.send_all(&packets).await;
        self.state
            .on_frame_sent(count, bytes, frame_time_ms, VIDEO_CLOCK_PER_MS)
            .await
    }

    /// Split one access unit into sealed packets, in send order.
    fn seal_frame(&mut self, frame: &[u8]) -> Result<Vec<Vec<u8>>, MediaError> {
        let payloads = match self.codec {
            VideoCodec::Vp8 => self.vp8_payloads(frame),
            VideoCodec::H264 | VideoCodec::H265 => {
                self.annex_b_payloads(frame)?
            }
            VideoCodec::Vp9 | VideoCodec::Av1 => chunk_payloads(frame),
        };
        if self.codec == VideoCodec::Vp8 {
            self.picture_id = self.picture_id.wrapping_add(1);
        }
        payloads
            .into_iter()
            .map(|(payload, marker)| {
                self.state.seal_packet(&payload, marker, true)
            })
            .collect()
    }

    /// MTU-sized chunks, each prefixed with the VP8 payload descriptor;
    /// the S bit marks the first chunk, the RTP marker the last.
    fn vp8_payloads(&self, frame: &[u8]) -> Vec<(Vec<u8>, bool)> {
        let chunks: Vec<&[u8]> = frame.chunks(MTU).collect();
        let last = chunks.len().saturating_sub(1);
        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut payload =
                    vp8::descriptor(i == 0, self.picture_id).to_vec();
                payload.extend_from_slice(chunk);
                (payload, i == last)
            })
            .collect()
    }

    /// Single NAL unit packets for NALs within the MTU, FU fragments
    /// otherwise; the marker goes on the very last packet of the unit.
    fn annex_b_payloads(
        &self,
        frame: &[u8],
    ) -> Result<Vec<(Vec<u8>, bool)>, MediaError> {
        let units = nal::split(frame)?;
        let last_unit = units.len().saturating_sub(1);
        let mut payloads = Vec::with_capacity(units.len());
        for (u, unit) in units.iter().enumerate() {
            if unit.len() <= MTU {
                payloads.push((unit.to_vec(), u == last_unit));
                continue;
            }
            let fragments = match self.codec {
                VideoCodec::H264 => h264::fragment(unit, MTU),
                _ => h265::fragment(unit, MTU),
            };
            let last_fragment = fragments.len() - 1;
            for (f, fragment) in fragments.into_iter().enumerate() {
                payloads
                    .push((fragment, u == last_unit && f == last_fragment));
            }
        }
        Ok(payloads)
    }
}

/// Raw MTU chunking for codecs without a payload descriptor here.
fn chunk_payloads(frame: &[u8]) -> Vec<(Vec<u8>, bool)> {
    let chunks: Vec<&[u8]> = frame.chunks(MTU).collect();
    let last = chunks.len().saturating_sub(1);
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| (chunk.to_vec(), i == last))
        .collect()
}

pub struct AudioPacketizer {
    state: PacketizerState,
}

impl AudioPacketizer {
    pub fn new(
        sink: Arc<PacketSink>,
        ssrc: u32,
        cipher: TransportCipher,
    ) -> AudioPacketizer {
        let rtp = RtpSession::new(ssrc, OPUS_PAYLOAD_TYPE);
        AudioPacketizer {
            state: PacketizerState::new(sink, rtp, cipher),
        }
    }

    /// One Opus frame, one packet: marker set, no extension.
    pub async fn send_frame(
        &mut self,
        frame: &[u8],
        frame_time_ms: f64,
    ) -> Result<(), MediaError> {
        let packet = self.state.seal_packet(frame, true, false)?;
        let bytes = packet.len() as u32;
        self.state.sink.send(&packet).await;
        self.state
            .on_frame_sent(1, bytes, frame_time_ms, AUDIO_CLOCK_PER_MS)
            .await
    }
}
