use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use chorus_sfu::{SfuConfig, UdpServer};
use chorus_voice::{HeartbeatReport, RegisterRequest};

#[derive(Parser, Debug)]
#[command(name = "chorus-sfu-node", about = "Standalone chorus media server")]
struct Args {
    /// UDP bind address (IP).
    #[arg(long, default_value = "0.0.0.0")]
    bind_host: String,

    /// First UDP media port.
    #[arg(long, default_value = "50000")]
    port: u16,

    /// Number of consecutive UDP ports to bind.
    #[arg(long, default_value = "1")]
    port_count: u16,

    /// Worker pool size.
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Control-plane base URL, e.g. http://control:8080
    #[arg(long)]
    control_url: String,

    /// Stable server name for idempotent registration.
    #[arg(long)]
    name: String,

    #[arg(long, default_value = "default")]
    region: String,

    /// Shared secret: authenticates registry RPCs and verifies voice tokens.
    #[arg(long)]
    voice_secret: String,

    /// Publicly reachable media host advertised to clients; defaults to the
    /// bind host.
    #[arg(long)]
    public_host: Option<String>,

    #[arg(long, default_value = "30")]
    heartbeat_secs: u64,

    #[arg(long, default_value = "100")]
    capacity_hint: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let public_host = args.public_host.clone().unwrap_or_else(|| args.bind_host.clone());

    info!("chorus-sfu-node starting...");
    info!("  media ports: {}..{}", args.port, args.port + args.port_count - 1);
    info!("  control:     {}", args.control_url);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("failed to build http client")?;

    let server_id = register(&http, &args, &public_host).await?;
    info!(server_id = %server_id, "registered with control plane");

    let mut config = SfuConfig::new(server_id, args.voice_secret.clone());
    config.bind_host = args.bind_host.clone();
    config.port_start = args.port;
    config.port_count = args.port_count;
    config.workers = args.workers;

    let server = UdpServer::start(config).await.context("failed to start udp server")?;

    let heartbeat_server = server.clone();
    let heartbeat_http = http.clone();
    let heartbeat_url = format!(
        "{}/api/voice/servers/{}/heartbeat",
        args.control_url.trim_end_matches('/'),
        server_id
    );
    let voice_secret = args.voice_secret.clone();
    let interval = Duration::from_secs(args.heartbeat_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_bytes_sent = 0u64;
        loop {
            ticker.tick().await;
            let snapshot = heartbeat_server.metrics_snapshot().await;
            let outbound_mbps = (snapshot.bytes_sent.saturating_sub(last_bytes_sent) * 8) as f64
                / 1_000_000.0
                / interval.as_secs_f64();
            last_bytes_sent = snapshot.bytes_sent;

            let report = HeartbeatReport {
                server_id,
                active_rooms: snapshot.active_rooms,
                active_sessions: snapshot.active_sessions,
                cpu: 0.0,
                outbound_mbps,
            };
            let result = heartbeat_http
                .post(&heartbeat_url)
                .bearer_auth(&voice_secret)
                .json(&report)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), "heartbeat rejected"),
                Err(e) => warn!(error = %e, "heartbeat failed"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}

/// Register with the control plane, retrying until it is reachable.
async fn register(
    http: &reqwest::Client,
    args: &Args,
    public_host: &str,
) -> anyhow::Result<Uuid> {
    let url = format!("{}/api/voice/servers", args.control_url.trim_end_matches('/'));
    let request = RegisterRequest {
        name: args.name.clone(),
        region: args.region.clone(),
        udp_host: public_host.to_string(),
        udp_port: args.port,
        ctrl_url: format!("udp://{}:{}", public_host, args.port),
        capacity_hint: args.capacity_hint,
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match http
            .post(&url)
            .bearer_auth(&args.voice_secret)
            .json(&request)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await?;
                let id = body
                    .get("id")
                    .and_then(|v| v.as_str())
                    .context("registration response missing id")?;
                return Uuid::parse_str(id).context("registration returned invalid server id");
            }
            Ok(resp) => {
                let status = resp.status();
                if status.is_client_error() {
                    anyhow::bail!("registration rejected with {status}");
                }
                warn!(attempt, status = %status, "registration failed, retrying");
            }
            Err(e) => warn!(attempt, error = %e, "control plane unreachable, retrying"),
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}
