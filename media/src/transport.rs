// UDP transport: one ephemeral IPv4 socket per session, the IP
// discovery handshake, and ownership of the packetizers and their
// ciphers. Sending a datagram is fire-and-forget.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::info;

use codec::VideoCodec;

use crate::crypto::TransportCipher;
use crate::error::MediaError;
use crate::packetizer::{AudioPacketizer, VideoPacketizer};

pub const DISCOVERY_REQUEST_LEN: usize = 74;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Datagram sender shared with the packetizers. Packets are dropped
/// silently until discovery completes and after shutdown.
pub struct PacketSink {
    socket: UdpSocket,
    remote: SocketAddr,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl PacketSink {
    pub async fn send(&self, packet: &[u8]) {
        if !self.ready.load(Ordering::Acquire)
            || self.closed.load(Ordering::Acquire)
        {
            return;
        }
        let _ = self.socket.send_to(packet, self.remote).await;
    }
}

pub struct UdpTransport {
    sink: Arc<PacketSink>,
    video: Mutex<Option<VideoPacketizer>>,
    audio: Mutex<Option<AudioPacketizer>>,
}

impl UdpTransport {
    pub async fn connect(
        remote_ip: &str,
        remote_port: u16,
    ) -> Result<UdpTransport, MediaError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let remote: SocketAddr = format!("{remote_ip}:{remote_port}")
            .parse()
            .map_err(|e| {
                MediaError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("bad remote address: {e}"),
                ))
            })?;
        Ok(UdpTransport {
            sink: Arc::new(PacketSink {
                socket,
                remote,
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            video: Mutex::new(None),
            audio: Mutex::new(None),
        })
    }

    pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_REQUEST_LEN] {
        let mut request = [0u8; DISCOVERY_REQUEST_LEN];
        BigEndian::write_u16(&mut request[0..2], 1); // request
        BigEndian::write_u16(&mut request[2..4], 70); // payload length
        BigEndian::write_u32(&mut request[4..8], ssrc);
        request
    }

    pub fn parse_discovery_response(
        response: &[u8],
    ) -> Result<(String, u16), MediaError> {
        if response.len() < DISCOVERY_REQUEST_LEN {
            return Err(MediaError::InvalidDiscoveryResponse);
        }
        let ip = response[8..72]
            .split(|b| *b == 0)
            .next()
            .unwrap_or(&[]);
        let ip = std::str::from_utf8(ip)
            .map_err(|_| MediaError::InvalidDiscoveryResponse)?
            .trim()
            .to_string();
        if ip.is_empty() {
            return Err(MediaError::InvalidDiscoveryResponse);
        }
        let port = BigEndian::read_u16(&response[72..74]);
        Ok((ip, port))
    }

    /// Run the IP discovery handshake against the voice server and mark
    /// the sink ready. Fails after ten seconds without a reply.
    pub async fn discover_ip(
        &self,
        ssrc: u32,
    ) -> Result<(String, u16), MediaError> {
        let request = Self::discovery_request(ssrc);
        self.sink
            .socket
            .send_to(&request, self.sink.remote)
            .await?;

        let mut buf = [0u8; 128];
        let (n, _) = tokio::time::timeout(
            DISCOVERY_TIMEOUT,
            self.sink.socket.recv_from(&mut buf),
        )
        .await
        .map_err(|_| MediaError::DiscoveryTimeout)??;

        let (ip, port) = Self::parse_discovery_response(&buf[..n])?;
        self.sink.ready.store(true, Ordering::Release);
        info!(%ip, port, "discovered external address");
        Ok((ip, port))
    }

    /// Install the packetizer pair once the transport key is known. Each
    /// direction gets its own cipher so the nonce counters never meet.
    pub async fn setup_packetizers(
        &self,
        audio_ssrc: u32,
        video_ssrc: u32,
        video_codec: VideoCodec,
        audio_cipher: TransportCipher,
        video_cipher: TransportCipher,
    ) {
        *self.video.lock().await = Some(VideoPacketizer::new(
            self.sink.clone(),
            video_ssrc,
            video_codec,
            video_cipher,
        ));
        *self.audio.lock().await = Some(AudioPacketizer::new(
            self.sink.clone(),
            audio_ssrc,
            audio_cipher,
        ));
    }

    pub async fn send_video_frame(
        &self,
        frame: &[u8],
        frame_time_ms: f64,
    ) -> Result<(), MediaError> {
        let mut guard = self.video.lock().await;
        let packetizer = guard.as_mut().ok_or(MediaError::EncryptorMissing)?;
        packetizer.send_frame(frame, frame_time_ms).await
    }

    pub async fn send_audio_frame(
        &self,
        frame: &[u8],
        frame_time_ms: f64,
    ) -> Result<(), MediaError> {
        let mut guard = self.audio.lock().await;
        let packetizer = guard.as_mut().ok_or(MediaError::EncryptorMissing)?;
        packetizer.send_frame(frame, frame_time_ms).await
    }

    /// Fire-and-forget datagram write.
    pub async fn send_packet(&self, packet: &[u8]) {
        self.sink.send(packet).await;
    }

    /// Stop sending. Safe to call more than once.
    pub fn shutdown(&self) {
        self.sink.closed.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn test_sink(&self) -> Arc<PacketSink> {
        self.sink.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{EncryptionMode, SECRET_KEY_LEN};

    #[test]
    fn test_discovery_request_bytes() {
        let request = UdpTransport::discovery_request(0xdeadbeef);
        assert_eq!(request.len(), 74);
        assert_eq!(&request[..4], &[0x00, 0x01, 0x00, 0x46]);
        assert_eq!(&request[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(request[8..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_discovery_response() {
        let mut response = [0u8; 74];
        response[..4].copy_from_slice(&[0x00, 0x02, 0x00, 0x46]);
        BigEndian::write_u32(&mut response[4..8], 0xdeadbeef);
        response[8..15].copy_from_slice(b"1.2.3.4");
        response[72] = 0x1f;
        response[73] = 0x90;
        let (ip, port) =
            UdpTransport::parse_discovery_response(&response).unwrap();
        assert_eq!(ip, "1.2.3.4");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_parse_discovery_response_too_short() {
        assert!(matches!(
            UdpTransport::parse_discovery_response(&[0u8; 10]),
            Err(MediaError::InvalidDiscoveryResponse)
        ));
    }

    #[tokio::test]
    async fn test_discovery_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, DISCOVERY_REQUEST_LEN);
            let ssrc = BigEndian::read_u32(&buf[4..8]);
            let mut response = [0u8; DISCOVERY_REQUEST_LEN];
            response[..4].copy_from_slice(&[0x00, 0x02, 0x00, 0x46]);
            BigEndian::write_u32(&mut response[4..8], ssrc);
            response[8..17].copy_from_slice(b"10.0.0.42");
            BigEndian::write_u16(&mut response[72..74], 50_000);
            server.send_to(&response, peer).await.unwrap();
        });

        let transport = UdpTransport::connect(
            &server_addr.ip().to_string(),
            server_addr.port(),
        )
        .await
        .unwrap();
        let (ip, port) = transport.discover_ip(0x1234).await.unwrap();
        assert_eq!(ip, "10.0.0.42");
        assert_eq!(port, 50_000);
    }

    #[tokio::test]
    async fn test_send_before_setup_is_programmer_error() {
        let transport = UdpTransport::connect("127.0.0.1", 9).await.unwrap();
        assert!(matches!(
            transport.send_video_frame(&[0, 0, 0, 1, 0x65], 33.0).await,
            Err(MediaError::EncryptorMissing)
        ));
        assert!(matches!(
            transport.send_audio_frame(&[1, 2, 3], 20.0).await,
            Err(MediaError::EncryptorMissing)
        ));
    }

    #[tokio::test]
    async fn test_setup_then_send() {
        let transport = UdpTransport::connect("127.0.0.1", 9).await.unwrap();
        let key = [0u8; SECRET_KEY_LEN];
        transport
            .setup_packetizers(
                1,
                2,
                VideoCodec::Vp8,
                TransportCipher::new(EncryptionMode::Aes256Gcm, &key),
                TransportCipher::new(EncryptionMode::Aes256Gcm, &key),
            )
            .await;
        // sink not ready (no discovery): packets drop silently, no error
        transport.send_audio_frame(&[1, 2, 3], 20.0).await.unwrap();
        transport.send_video_frame(&[9u8; 100], 33.0).await.unwrap();
        transport.shutdown();
        transport.shutdown();
    }
}
