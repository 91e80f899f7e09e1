// Voice-gateway v8 WebSocket client. One task reads the socket, one
// drives the heartbeat; outbound sends are serialized behind the sink
// mutex. The session resumes on close 4015 and pre-4000 codes and
// surfaces everything else to the owner.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{
    unbounded_channel, UnboundedReceiver, UnboundedSender,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use codec::VideoCodec;

use crate::error::GatewayError;
use crate::payloads::{
    opcode, CodecDescription, GatewayMessage, Heartbeat, Hello, Identify,
    IdentifyStream, ProtocolData, Ready, Resume, SelectProtocol,
    SessionDescription, Speaking, Video, VideoLayer,
};

pub const GATEWAY_VERSION: u8 = 8;

pub const SECRET_KEY_LEN: usize = 32;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum State {
    Idle,
    Connecting,
    Identifying,
    Ready,
    ProtocolNegotiated,
    Running,
    Resuming,
    Closed,
}

/// Transport parameters learned from READY.
#[derive(Debug, Clone)]
pub struct WebRtcParams {
    pub address: String,
    pub port: u16,
    pub audio_ssrc: u32,
    pub video_ssrc: u32,
    pub rtx_ssrc: u32,
    pub supported_modes: Vec<String>,
}

#[derive(Debug)]
pub enum VoiceEvent {
    Ready(WebRtcParams),
    SessionDescription {
        mode: String,
        secret_key: [u8; SECRET_KEY_LEN],
    },
    Resumed,
    /// Closed with a non-resumable code.
    Closed { code: u16 },
    Error(String),
}

/// Close codes we recover from by resuming instead of re-identifying.
pub fn resumable(code: u16) -> bool {
    code == 4015 || code < 4000
}

pub struct VoiceGateway {
    inner: Arc<Inner>,
}

struct Inner {
    server_id: String,
    user_id: String,
    session_id: StdMutex<Option<String>>,
    server: StdMutex<Option<(String, String)>>,
    state: StdMutex<State>,
    params: StdMutex<Option<WebRtcParams>>,
    sequence: AtomicI64,
    resuming: AtomicBool,
    started: AtomicBool,
    sink: Mutex<Option<WsSink>>,
    heartbeat: StdMutex<Option<JoinHandle<()>>>,
    events: UnboundedSender<VoiceEvent>,
}

impl VoiceGateway {
    pub fn new(
        server_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> (VoiceGateway, UnboundedReceiver<VoiceEvent>) {
        let (events, receiver) = unbounded_channel();
        let inner = Arc::new(Inner {
            server_id: server_id.into(),
            user_id: user_id.into(),
            session_id: StdMutex::new(None),
            server: StdMutex::new(None),
            state: StdMutex::new(State::Idle),
            params: StdMutex::new(None),
            sequence: AtomicI64::new(-1),
            resuming: AtomicBool::new(false),
            started: AtomicBool::new(false),
            sink: Mutex::new(None),
            heartbeat: StdMutex::new(None),
            events,
        });
        (VoiceGateway { inner }, receiver)
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap()
    }

    pub fn params(&self) -> Option<WebRtcParams> {
        self.inner.params.lock().unwrap().clone()
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Idempotent: the socket opens once both the session id and the
    /// server endpoint are known.
    pub async fn set_session_id(&self, session_id: impl Into<String>) {
        {
            *self.inner.session_id.lock().unwrap() = Some(session_id.into());
        }
        Inner::try_connect(&self.inner).await;
    }

    /// Idempotent counterpart fed from VOICE_SERVER_UPDATE.
    pub async fn set_server(
        &self,
        endpoint: impl Into<String>,
        token: impl Into<String>,
    ) {
        {
            *self.inner.server.lock().unwrap() =
                Some((endpoint.into(), token.into()));
        }
        Inner::try_connect(&self.inner).await;
    }

    pub async fn select_protocol(
        &self,
        address: &str,
        port: u16,
        mode: &str,
        video: VideoCodec,
    ) -> Result<(), GatewayError> {
        let payload = SelectProtocol {
            protocol: "udp",
            codecs: CodecDescription::list(video),
            data: ProtocolData {
                address: address.to_string(),
                port,
                mode: mode.to_string(),
            },
        };
        self.inner
            .send_opcode(opcode::SELECT_PROTOCOL, serde_json::to_value(payload)?)
            .await
    }

    /// op 5 with the audio SSRC; pass one of the `payloads::speaking`
    /// values (soundshare while broadcasting, none on teardown).
    pub async fn set_speaking(&self, speaking: u8) -> Result<(), GatewayError> {
        let ssrc = self
            .params()
            .map(|p| p.audio_ssrc)
            .ok_or(GatewayError::NotConnected)?;
        let payload = Speaking {
            delay: 0,
            speaking,
            ssrc,
        };
        self.inner
            .send_opcode(opcode::SPEAKING, serde_json::to_value(payload)?)
            .await
    }

    /// op 12: advertise the active layer, or the zeroed form when the
    /// broadcast stops.
    pub async fn set_video(
        &self,
        layer: Option<VideoLayer>,
    ) -> Result<(), GatewayError> {
        let params = self.params().ok_or(GatewayError::NotConnected)?;
        let payload = match layer {
            Some(layer) => Video::active(
                params.audio_ssrc,
                params.video_ssrc,
                params.rtx_ssrc,
                layer,
            ),
            None => Video::deactivated(params.audio_ssrc),
        };
        self.inner
            .send_opcode(opcode::VIDEO, serde_json::to_value(payload)?)
            .await
    }

    /// Mark the pipeline live once packets start flowing.
    pub fn start(&self) {
        *self.inner.state.lock().unwrap() = State::Running;
    }

    /// Tear the connection down. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.inner.stop_heartbeat();
        {
            let mut sink = self.inner.sink.lock().await;
            if let Some(mut sink) = sink.take() {
                let _ = sink.send(Message::Close(None)).await;
            }
        }
        *self.inner.state.lock().unwrap() = State::Closed;
        self.inner.started.store(false, Ordering::Release);
    }
}

impl Inner {
    async fn try_connect(inner: &Arc<Inner>) {
        let ready = {
            inner.session_id.lock().unwrap().is_some()
                && inner.server.lock().unwrap().is_some()
        };
        if !ready || inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = Inner::connect(&inner).await {
                error!("voice gateway connect failed: {e}");
                *inner.state.lock().unwrap() = State::Closed;
                inner.started.store(false, Ordering::Release);
                let _ = inner.events.send(VoiceEvent::Error(e.to_string()));
            }
        });
    }

    fn connect(
        inner: &Arc<Inner>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<(), GatewayError>> + Send + '_>,
    > {
        Box::pin(async move {
            let (endpoint, token) = inner
                .server
                .lock()
                .unwrap()
                .clone()
                .ok_or(GatewayError::NotConnected)?;
            let session_id = inner
                .session_id
                .lock()
                .unwrap()
                .clone()
                .ok_or(GatewayError::NotConnected)?;

            *inner.state.lock().unwrap() = State::Connecting;
            let host = endpoint
                .strip_suffix(":443")
                .or_else(|| endpoint.strip_suffix(":80"))
                .unwrap_or(&endpoint);
            let url = format!("wss://{host}/?v={GATEWAY_VERSION}");
            info!(%url, "connecting voice gateway");

            let (socket, _) = connect_async(url.as_str()).await?;
            let (sink, stream) = socket.split();
            *inner.sink.lock().await = Some(sink);

            {
                let inner = inner.clone();
                tokio::spawn(async move {
                    Inner::read_pump(inner, stream).await;
                });
            }

            if inner.resuming.load(Ordering::Acquire) {
                let payload = Resume {
                    server_id: &inner.server_id,
                    session_id: &session_id,
                    token: &token,
                    seq_ack: inner.sequence.load(Ordering::Acquire),
                };
                *inner.state.lock().unwrap() = State::Resuming;
                inner
                    .send_opcode(
                        opcode::RESUME,
                        serde_json::to_value(payload)?,
                    )
                    .await?;
            } else {
                let payload = Identify {
                    server_id: &inner.server_id,
                    user_id: &inner.user_id,
                    session_id: &session_id,
                    token: &token,
                    video: true,
                    streams: vec![IdentifyStream::screen()],
                };
                *inner.state.lock().unwrap() = State::Identifying;
                inner
                    .send_opcode(
                        opcode::IDENTIFY,
                        serde_json::to_value(payload)?,
                    )
                    .await?;
            }
            Ok(())
        })
    }

    async fn read_pump(inner: Arc<Inner>, mut stream: WsStream) {
        let mut close_code = None;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = Inner::handle_message(&inner, &text).await
                    {
                        warn!("dropping bad gateway message: {e}");
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    close_code = frame.map(|f| u16::from(f.code));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("voice gateway read error: {e}");
                    break;
                }
                None => break,
            }
        }
        Inner::handle_close(inner, close_code).await;
    }

    async fn handle_message(
        inner: &Arc<Inner>,
        text: &str,
    ) -> Result<(), GatewayError> {
        let message: GatewayMessage = serde_json::from_str(text)?;
        if let Some(seq) = message.seq {
            inner.sequence.store(seq, Ordering::Release);
        }
        match message.op {
            opcode::HELLO => {
                let hello: Hello = serde_json::from_value(message.d)?;
                Inner::start_heartbeat(inner, hello.heartbeat_interval);
            }
            opcode::READY => {
                let ready: Ready = serde_json::from_value(message.d)?;
                let params = webrtc_params(&ready);
                info!(
                    address = %params.address,
                    port = params.port,
                    audio_ssrc = params.audio_ssrc,
                    video_ssrc = params.video_ssrc,
                    "voice gateway ready"
                );
                *inner.params.lock().unwrap() = Some(params.clone());
                *inner.state.lock().unwrap() = State::Ready;
                let _ = inner.events.send(VoiceEvent::Ready(params));
            }
            opcode::SESSION_DESCRIPTION => {
                let description: SessionDescription =
                    serde_json::from_value(message.d)?;
                let secret_key: [u8; SECRET_KEY_LEN] = description
                    .secret_key
                    .as_slice()
                    .try_into()
                    .map_err(|_| {
                        GatewayError::Fatal(
                            "secret key is not 32 bytes".to_string(),
                        )
                    })?;
                info!(mode = %description.mode, "protocol selected");
                *inner.state.lock().unwrap() = State::ProtocolNegotiated;
                let _ = inner.events.send(VoiceEvent::SessionDescription {
                    mode: description.mode,
                    secret_key,
                });
            }
            opcode::RESUMED => {
                info!("voice gateway resumed");
                inner.resuming.store(false, Ordering::Release);
                *inner.state.lock().unwrap() = State::Running;
                let _ = inner.events.send(VoiceEvent::Resumed);
            }
            opcode::SPEAKING | opcode::HEARTBEAT_ACK => {}
            other => debug!(op = other, "ignoring voice gateway opcode"),
        }
        Ok(())
    }

    fn start_heartbeat(inner: &Arc<Inner>, interval_ms: f64) {
        inner.stop_heartbeat();
        let timer = inner.clone();
        let interval = Duration::from_millis(interval_ms.max(1.0) as u64);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let payload = Heartbeat {
                    t: Utc::now().timestamp_millis(),
                    seq_ack: timer.sequence.load(Ordering::Acquire),
                };
                let payload = match serde_json::to_value(payload) {
                    Ok(payload) => payload,
                    Err(_) => break,
                };
                if timer
                    .send_opcode(opcode::HEARTBEAT, payload)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        *inner.heartbeat.lock().unwrap() = Some(handle);
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    async fn handle_close(inner: Arc<Inner>, close_code: Option<u16>) {
        inner.stop_heartbeat();
        inner.sink.lock().await.take();
        let already_closed = *inner.state.lock().unwrap() == State::Closed;
        if already_closed {
            // local teardown, not a remote close
            return;
        }

        // treat an abnormal drop without a close frame like 1006
        let code = close_code.unwrap_or(1006);
        if resumable(code) {
            info!(code, "voice gateway closed, resuming");
            inner.resuming.store(true, Ordering::Release);
            if let Err(e) = Inner::connect(&inner).await {
                error!("voice gateway resume failed: {e}");
                *inner.state.lock().unwrap() = State::Closed;
                inner.started.store(false, Ordering::Release);
                let _ = inner.events.send(VoiceEvent::Error(e.to_string()));
            }
        } else {
            error!(code, "voice gateway closed");
            *inner.state.lock().unwrap() = State::Closed;
            inner.started.store(false, Ordering::Release);
            let _ = inner.events.send(VoiceEvent::Closed { code });
        }
    }

    /// Serialized opcode send; sends race only for the sink lock.
    async fn send_opcode(
        &self,
        op: u8,
        d: Value,
    ) -> Result<(), GatewayError> {
        let text =
            serde_json::to_string(&GatewayMessage::new(op, d))?;
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(GatewayError::NotConnected)?;
        sink.send(Message::Text(text)).await?;
        Ok(())
    }
}

fn webrtc_params(ready: &Ready) -> WebRtcParams {
    let stream = ready.streams.first();
    WebRtcParams {
        address: ready.ip.clone(),
        port: ready.port,
        audio_ssrc: ready.ssrc,
        video_ssrc: stream.map(|s| s.ssrc).unwrap_or(0),
        rtx_ssrc: stream.map(|s| s.rtx_ssrc).unwrap_or(0),
        supported_modes: ready.modes.clone(),
    }
}
