// Paced delivery. Each stream measures presentation time against the
// wall clock started by its first packet: late packets are sent at
// once, very late streams re-base the clock, early packets sleep.
// Audio and video pace independently against the same kind of clock;
// the sibling link only exposes the other stream's position.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::demux::{MediaPacket, AUDIO_FRAME_TIME_MS};
use crate::error::MediaError;
use crate::transport::UdpTransport;

/// Packets this far behind the wall clock stop pacing entirely.
const CATCH_UP_THRESHOLD_MS: i64 = -200;

/// Drift between siblings worth noting.
const DRIFT_WARN_MS: i64 = 1000;

pub struct StreamClock {
    start: Mutex<Option<Instant>>,
    last_pts_ms: AtomicI64,
}

impl StreamClock {
    fn new() -> StreamClock {
        StreamClock {
            start: Mutex::new(None),
            last_pts_ms: AtomicI64::new(0),
        }
    }

    pub fn last_pts_ms(&self) -> i64 {
        self.last_pts_ms.load(Ordering::Acquire)
    }

    /// Sleep needed before sending a packet with this presentation time.
    /// `None` means send immediately; a stream more than the catch-up
    /// threshold behind re-bases its start instant instead of sleeping.
    fn pace_delay(&self, pts_ms: i64, now: Instant) -> Option<Duration> {
        let mut start = self.start.lock().unwrap();
        let base = *start.get_or_insert(now);
        let elapsed = now.duration_since(base).as_millis() as i64;
        let diff = pts_ms - elapsed;
        if diff < CATCH_UP_THRESHOLD_MS {
            *start = Some(now - Duration::from_millis(pts_ms.max(0) as u64));
            None
        } else if diff > 0 {
            Some(Duration::from_millis(diff as u64))
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

pub struct MediaStream {
    kind: StreamKind,
    frame_time_ms: f64,
    clock: Arc<StreamClock>,
    sibling: Option<Arc<StreamClock>>,
}

impl MediaStream {
    pub fn video(frame_time_ms: f64) -> MediaStream {
        MediaStream {
            kind: StreamKind::Video,
            frame_time_ms,
            clock: Arc::new(StreamClock::new()),
            sibling: None,
        }
    }

    pub fn audio() -> MediaStream {
        MediaStream {
            kind: StreamKind::Audio,
            frame_time_ms: AUDIO_FRAME_TIME_MS,
            clock: Arc::new(StreamClock::new()),
            sibling: None,
        }
    }

    /// Link two streams for A/V sync; installing the target on one
    /// installs the back-reference on the other.
    pub fn set_sync_target(a: &mut MediaStream, b: &mut MediaStream) {
        a.sibling = Some(b.clock.clone());
        b.sibling = Some(a.clock.clone());
    }

    pub fn clock(&self) -> Arc<StreamClock> {
        self.clock.clone()
    }

    /// Drain the packet channel through the pacer into the packetizer.
    /// Ends when the channel closes or the token fires; packetizer
    /// errors propagate.
    pub async fn run(
        self,
        mut packets: mpsc::Receiver<MediaPacket>,
        transport: Arc<UdpTransport>,
        cancel: CancellationToken,
    ) -> Result<(), MediaError> {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => break,
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };
            let pts_ms = packet.pts_us / 1000;
            if let Some(delay) = self.clock.pace_delay(pts_ms, Instant::now())
            {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.kind {
                StreamKind::Video => {
                    transport
                        .send_video_frame(&packet.data, self.frame_time_ms)
                        .await?
                }
                StreamKind::Audio => {
                    transport
                        .send_audio_frame(&packet.data, self.frame_time_ms)
                        .await?
                }
            }
            self.clock.last_pts_ms.store(pts_ms, Ordering::Release);
            if let Some(sibling) = &self.sibling {
                let gap = pts_ms - sibling.last_pts_ms();
                if gap.abs() > DRIFT_WARN_MS {
                    debug!(gap, "a/v streams drifting apart");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_pacing_sleeps_until_pts() {
        let clock = StreamClock::new();
        let t0 = Instant::now();
        // first packet starts the clock, no sleep
        assert_eq!(clock.pace_delay(0, t0), None);
        // 20ms ahead of the wall clock
        assert_eq!(
            clock.pace_delay(20, t0),
            Some(Duration::from_millis(20))
        );
        tokio::time::advance(Duration::from_millis(25)).await;
        // now 5ms late: send immediately
        assert_eq!(clock.pace_delay(20, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_very_late_stream_rebases_without_sleep() {
        let clock = StreamClock::new();
        let t0 = Instant::now();
        clock.pace_delay(0, t0);
        tokio::time::advance(Duration::from_millis(400)).await;
        // 100 - 400 = -300: no sleep, clock re-bases
        let now = Instant::now();
        assert_eq!(clock.pace_delay(100, now), None);
        // after the re-base the stream is on time again
        assert_eq!(clock.pace_delay(100, now), None);
        assert_eq!(
            clock.pace_delay(120, now),
            Some(Duration::from_millis(20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_cadence_20ms() {
        let clock = StreamClock::new();
        let mut total_sleep = Duration::ZERO;
        for k in 0..=50i64 {
            if let Some(delay) = clock.pace_delay(20 * k, Instant::now()) {
                total_sleep += delay;
                tokio::time::advance(delay).await;
            }
        }
        // the k-th packet completes at T0 + 20k
        assert_eq!(total_sleep, Duration::from_millis(1000));
    }

    #[test]
    fn test_sync_target_is_bidirectional() {
        let mut video = MediaStream::video(33.0);
        let mut audio = MediaStream::audio();
        MediaStream::set_sync_target(&mut video, &mut audio);
        let video_clock = video.clock();
        let audio_clock = audio.clock();
        assert!(Arc::ptr_eq(
            video.sibling.as_ref().unwrap(),
            &audio_clock
        ));
        assert!(Arc::ptr_eq(
            audio.sibling.as_ref().unwrap(),
            &video_clock
        ));
    }
}
