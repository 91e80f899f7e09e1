// Broadcast session. One Broadcaster owns the voice-channel gateway and
// the stream gateway, copies the session between them, and runs the
// demux → pace → packetize → send pipeline once the stream side has a
// transport key. Cancellation resolves the play call cleanly.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use beam_gateway::bridge::{
    self, AppEvent, GatewayCommand,
};
use beam_gateway::payloads::{speaking, VideoLayer};
use beam_gateway::voice::{VoiceEvent, VoiceGateway, WebRtcParams};
use beam_gateway::StreamKey;
use beam_media::crypto::{EncryptionMode, TransportCipher};
use beam_media::demux::{self, DemuxOutput};
use beam_media::pipe::{pipe, PipeWriter};
use beam_media::stream::MediaStream;
use beam_media::UdpTransport;
use codec::VideoCodec;

const FEED_CHUNK: usize = 64 * 1024;

/// How often the end-of-stream safety poll re-checks the sink tasks.
const FINISH_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub bitrate: u32,
    pub force_chacha: bool,
}

impl Default for StreamOptions {
    fn default() -> StreamOptions {
        StreamOptions {
            width: 1280,
            height: 720,
            framerate: 30,
            bitrate: 2_500_000,
            force_chacha: false,
        }
    }
}

pub struct Broadcaster {
    user_id: String,
    stream_key: StreamKey,
    commands: UnboundedSender<GatewayCommand>,
    voice: VoiceGateway,
    voice_events: UnboundedReceiver<VoiceEvent>,
    stream: VoiceGateway,
    stream_events: UnboundedReceiver<VoiceEvent>,
    session_id: Option<String>,
}

impl Broadcaster {
    /// Commands for the application gateway come out of the returned
    /// receiver; the host forwards them on its own socket and pushes
    /// the four matching events back through `handle_event`.
    pub fn new(
        user_id: impl Into<String>,
        guild_id: Option<String>,
        channel_id: impl Into<String>,
    ) -> (Broadcaster, UnboundedReceiver<GatewayCommand>) {
        let user_id = user_id.into();
        let channel_id = channel_id.into();
        let stream_key = match guild_id {
            Some(guild_id) => StreamKey::Guild {
                guild_id,
                channel_id: channel_id.clone(),
                user_id: user_id.clone(),
            },
            None => StreamKey::Call {
                channel_id: channel_id.clone(),
                user_id: user_id.clone(),
            },
        };
        let (commands, command_rx) = unbounded_channel();
        let (voice, voice_events) =
            VoiceGateway::new(stream_key.server_id(), &user_id);
        let (stream, stream_events) =
            VoiceGateway::new(stream_key.server_id(), &user_id);
        (
            Broadcaster {
                user_id,
                stream_key,
                commands,
                voice,
                voice_events,
                stream,
                stream_events,
                session_id: None,
            },
            command_rx,
        )
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    /// op 4: join the voice channel (deafened, no camera).
    pub fn join_voice(&self) -> Result<()> {
        let guild_id = match &self.stream_key {
            StreamKey::Guild { guild_id, .. } => Some(guild_id.as_str()),
            StreamKey::Call { .. } => None,
        };
        self.send_command(bridge::join_voice(
            guild_id,
            self.stream_key.channel_id(),
        ))
    }

    /// op 18: ask the service for a Go Live stream.
    pub fn create_stream(&self) -> Result<()> {
        self.send_command(bridge::stream_create(&self.stream_key))
    }

    /// Push one of the four application-gateway events into the session.
    pub async fn handle_event(&mut self, event: AppEvent) -> Result<()> {
        match event {
            AppEvent::VoiceStateUpdate {
                user_id,
                session_id,
                ..
            } => {
                if user_id != self.user_id {
                    return Ok(());
                }
                info!("voice state received");
                self.session_id = Some(session_id.clone());
                self.voice.set_session_id(session_id).await;
            }
            AppEvent::VoiceServerUpdate {
                endpoint, token, ..
            } => {
                info!(%endpoint, "voice server received");
                self.voice.set_server(endpoint, token).await;
            }
            AppEvent::StreamCreate { stream_key, .. } => {
                if StreamKey::from_str(&stream_key)? != self.stream_key {
                    return Ok(());
                }
                // the stream session reuses the voice session id
                let session_id = self
                    .session_id
                    .clone()
                    .ok_or_else(|| anyhow!("stream created before voice state"))?;
                info!(%stream_key, "stream created");
                self.stream.set_session_id(session_id).await;
                self.send_command(bridge::stream_set_paused(
                    &self.stream_key,
                    false,
                ))?;
            }
            AppEvent::StreamServerUpdate {
                stream_key,
                endpoint,
                token,
            } => {
                if StreamKey::from_str(&stream_key)? != self.stream_key {
                    return Ok(());
                }
                info!(%endpoint, "stream server received");
                self.stream.set_server(endpoint, token).await;
            }
        }
        Ok(())
    }

    /// Run the whole media pipeline over a Matroska byte source until it
    /// ends, fails, or the token fires. Cancellation is not an error.
    pub async fn play<R>(
        &mut self,
        input: R,
        options: StreamOptions,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        // a dead voice-channel gateway means the stream side never comes up
        while let Ok(event) = self.voice_events.try_recv() {
            match event {
                VoiceEvent::Closed { code } => {
                    bail!("voice channel gateway closed with code {code}")
                }
                VoiceEvent::Error(e) => {
                    bail!("voice channel gateway failure: {e}")
                }
                _ => {}
            }
        }

        let params = match wait_ready(&mut self.stream_events, &cancel).await? {
            Some(params) => params,
            None => return Ok(()),
        };

        let transport =
            Arc::new(UdpTransport::connect(&params.address, params.port).await?);
        let (external_ip, external_port) = transport
            .discover_ip(params.audio_ssrc)
            .await
            .context("ip discovery")?;

        // demux ahead of protocol selection: the codec list names the
        // video codec actually present in the container
        let pipeline_cancel = cancel.child_token();
        let (writer, reader) = pipe();
        let feeder = spawn_feeder(input, writer, pipeline_cancel.clone());
        let DemuxOutput { video, audio } =
            demux::demux(reader, pipeline_cancel.clone()).await?;
        let video_codec = video
            .as_ref()
            .map(|v| v.codec)
            .unwrap_or(VideoCodec::H264);

        let mode =
            EncryptionMode::select(&params.supported_modes, options.force_chacha);
        self.stream
            .select_protocol(
                &external_ip,
                external_port,
                &mode.to_string(),
                video_codec,
            )
            .await?;

        let secret_key =
            match wait_session_description(&mut self.stream_events, &cancel)
                .await?
            {
                Some((acked_mode, key)) => {
                    if acked_mode != mode {
                        warn!(
                            acked = %acked_mode,
                            selected = %mode,
                            "server acked a different mode"
                        );
                    }
                    key
                }
                None => {
                    feeder.abort();
                    return Ok(());
                }
            };

        transport
            .setup_packetizers(
                params.audio_ssrc,
                params.video_ssrc,
                video_codec,
                TransportCipher::new(mode, &secret_key),
                TransportCipher::new(mode, &secret_key),
            )
            .await;

        self.stream.start();
        self.stream.set_speaking(speaking::SOUNDSHARE).await?;
        if let Some(source) = &video {
            let layer = VideoLayer {
                width: if source.width > 0 {
                    source.width
                } else {
                    options.width
                },
                height: if source.height > 0 {
                    source.height
                } else {
                    options.height
                },
                framerate: options.framerate,
                bitrate: options.bitrate,
            };
            self.stream.set_video(Some(layer)).await?;
        }

        let mut sinks = JoinSet::new();
        let mut video_stream = video.as_ref().map(|v| MediaStream::video(v.frame_time_ms));
        let mut audio_stream = audio.as_ref().map(|_| MediaStream::audio());
        if let (Some(video_stream), Some(audio_stream)) =
            (video_stream.as_mut(), audio_stream.as_mut())
        {
            MediaStream::set_sync_target(video_stream, audio_stream);
        }
        if let (Some(stream), Some(source)) = (video_stream, video) {
            sinks.spawn(stream.run(
                source.packets,
                transport.clone(),
                pipeline_cancel.clone(),
            ));
        }
        if let (Some(stream), Some(source)) = (audio_stream, audio) {
            sinks.spawn(stream.run(
                source.packets,
                transport.clone(),
                pipeline_cancel.clone(),
            ));
        }

        let result = drive_sinks(&mut sinks, &cancel).await;

        // teardown runs on every exit path, cancellation included
        pipeline_cancel.cancel();
        feeder.abort();
        sinks.shutdown().await;
        if let Err(e) = self.stream.set_speaking(speaking::NONE).await {
            warn!("failed to clear speaking state: {e}");
        }
        if let Err(e) = self.stream.set_video(None).await {
            warn!("failed to deactivate video: {e}");
        }
        transport.shutdown();
        info!("playback finished");
        result
    }

    /// op 19 + the all-null op 4, then drop both gateways.
    pub async fn stop(&mut self) -> Result<()> {
        self.send_command(bridge::stream_delete(&self.stream_key))?;
        self.send_command(bridge::leave_voice())?;
        self.stream.stop().await;
        self.voice.stop().await;
        Ok(())
    }

    fn send_command(&self, command: GatewayCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("application gateway command channel closed"))
    }
}

fn spawn_feeder<R>(
    mut input: R,
    writer: PipeWriter,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; FEED_CHUNK];
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = input.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break,
                Ok(n) => writer.feed(&buf[..n]).await,
                Err(e) => {
                    warn!("input source failed: {e}");
                    break;
                }
            }
        }
        writer.finish();
    })
}

async fn wait_ready(
    events: &mut UnboundedReceiver<VoiceEvent>,
    cancel: &CancellationToken,
) -> Result<Option<WebRtcParams>> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            event = events.recv() => event,
        };
        match event {
            Some(VoiceEvent::Ready(params)) => return Ok(Some(params)),
            Some(VoiceEvent::Closed { code }) => {
                bail!("voice gateway closed with code {code}")
            }
            Some(VoiceEvent::Error(e)) => bail!("voice gateway failure: {e}"),
            Some(_) => continue,
            None => bail!("voice gateway event channel closed"),
        }
    }
}

async fn wait_session_description(
    events: &mut UnboundedReceiver<VoiceEvent>,
    cancel: &CancellationToken,
) -> Result<Option<(EncryptionMode, [u8; 32])>> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            event = events.recv() => event,
        };
        match event {
            Some(VoiceEvent::SessionDescription { mode, secret_key }) => {
                let mode = EncryptionMode::from_wire(&mode)
                    .ok_or_else(|| anyhow!("unknown encryption mode {mode}"))?;
                return Ok(Some((mode, secret_key)));
            }
            Some(VoiceEvent::Closed { code }) => {
                bail!("voice gateway closed with code {code}")
            }
            Some(VoiceEvent::Error(e)) => bail!("voice gateway failure: {e}"),
            Some(_) => continue,
            None => bail!("voice gateway event channel closed"),
        }
    }
}

/// Wait for both sinks; a 2-second poll covers the case where the
/// finish notification goes missing.
async fn drive_sinks(
    sinks: &mut JoinSet<Result<(), beam_media::MediaError>>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut poll = tokio::time::interval(FINISH_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            joined = sinks.join_next() => match joined {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(e))) => return Err(e.into()),
                Some(Err(e)) if e.is_cancelled() => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            },
            _ = poll.tick() => {
                if sinks.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}
