// Go Live broadcast driver. The application gateway lives in the host
// process; this binary takes the session credentials it would supply as
// flags, prints the opcodes it would send as JSON lines on stdout, and
// streams a Matroska file until it ends or ctrl-c.

use anyhow::{Context, Result};
use structopt::StructOpt;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::info;

use beam_cast::{Broadcaster, StreamOptions};
use beam_gateway::bridge::AppEvent;

#[derive(StructOpt, Debug, Clone)]
#[structopt(name = "beam-cast")]
struct Config {
    /// Bot user id the voice state belongs to.
    #[structopt(long, env = "BEAM_USER_ID")]
    user_id: String,

    /// Guild to broadcast in; omit for a DM call.
    #[structopt(long, env = "BEAM_GUILD_ID")]
    guild_id: Option<String>,

    /// Voice channel id.
    #[structopt(long, env = "BEAM_CHANNEL_ID")]
    channel_id: String,

    /// Voice session id from VOICE_STATE_UPDATE.
    #[structopt(long, env = "BEAM_SESSION_ID")]
    session_id: String,

    /// Voice server endpoint from VOICE_SERVER_UPDATE.
    #[structopt(long, env = "BEAM_ENDPOINT")]
    endpoint: String,

    /// Voice server token from VOICE_SERVER_UPDATE.
    #[structopt(long, env = "BEAM_TOKEN", hide_env_values = true)]
    token: String,

    /// Stream server endpoint from STREAM_SERVER_UPDATE.
    #[structopt(long, env = "BEAM_STREAM_ENDPOINT")]
    stream_endpoint: String,

    /// Stream server token from STREAM_SERVER_UPDATE.
    #[structopt(long, env = "BEAM_STREAM_TOKEN", hide_env_values = true)]
    stream_token: String,

    /// Matroska input; `-` reads stdin.
    #[structopt(long, default_value = "-")]
    input: String,

    /// Advertised resolution when the container does not carry one.
    #[structopt(long, default_value = "1280")]
    width: u32,

    #[structopt(long, default_value = "720")]
    height: u32,

    /// Declared framerate cap.
    #[structopt(long, default_value = "30")]
    framerate: u32,

    /// Declared bitrate cap in bits per second.
    #[structopt(long, default_value = "2500000")]
    bitrate: u32,

    /// Use XChaCha20-Poly1305 even when the server offers AES-GCM.
    #[structopt(long)]
    force_chacha: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    beam_log::init();
    let config = Config::from_args();

    let (mut broadcaster, mut commands) = Broadcaster::new(
        config.user_id.clone(),
        config.guild_id.clone(),
        config.channel_id.clone(),
    );
    let stream_key = broadcaster.stream_key().to_string();

    // surface outbound opcodes for the host gateway
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            println!(
                "{}",
                serde_json::json!({"op": command.op, "d": command.d})
            );
        }
    });

    broadcaster.join_voice()?;
    broadcaster.create_stream()?;

    // replay the credentials the host gateway observed
    broadcaster
        .handle_event(AppEvent::VoiceStateUpdate {
            user_id: config.user_id.clone(),
            session_id: config.session_id.clone(),
            guild_id: config.guild_id.clone(),
            channel_id: Some(config.channel_id.clone()),
        })
        .await?;
    broadcaster
        .handle_event(AppEvent::VoiceServerUpdate {
            guild_id: config.guild_id.clone(),
            endpoint: config.endpoint.clone(),
            token: config.token.clone(),
        })
        .await?;
    broadcaster
        .handle_event(AppEvent::StreamCreate {
            stream_key: stream_key.clone(),
            rtc_server_id: None,
        })
        .await?;
    broadcaster
        .handle_event(AppEvent::StreamServerUpdate {
            stream_key,
            endpoint: config.stream_endpoint.clone(),
            token: config.stream_token.clone(),
        })
        .await?;

    let input: Box<dyn AsyncRead + Send + Unpin> = if config.input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&config.input)
                .await
                .with_context(|| format!("opening {}", config.input))?,
        )
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received, stopping broadcast");
            cancel.cancel();
        });
    }

    let options = StreamOptions {
        width: config.width,
        height: config.height,
        framerate: config.framerate,
        bitrate: config.bitrate,
        force_chacha: config.force_chacha,
    };
    let result = broadcaster.play(input, options, cancel).await;
    broadcaster.stop().await?;
    result
}
