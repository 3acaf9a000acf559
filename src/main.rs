use tracing::info;

use anyhow::anyhow;
use clap::Parser;
use tokio::net::TcpListener;

use voicebridge::{AppState, BridgeConfig, routes};

/// Voice bridge - telephony to conversational AI relay
#[derive(Parser, Debug)]
#[command(name = "voicebridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Override the listen host
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Override the listen port
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let mut config = BridgeConfig::from_env().map_err(|e| anyhow!(e.to_string()))?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    if config.backend_api_key.is_none() {
        tracing::warn!("BACKEND_API_KEY is not set; incoming calls will be rejected");
    }
    if config.auth_token.is_none() {
        info!("STREAM_AUTH_TOKEN is not set; stream authentication disabled");
    }

    let address = config.address();
    let stream_path = config.stream_path.clone();
    let app_state = AppState::new(config)?;

    let app = routes::create_stream_router(&stream_path).with_state(app_state);

    info!("Listening on {address}, media stream at {stream_path}");
    let listener = TcpListener::bind(&address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
