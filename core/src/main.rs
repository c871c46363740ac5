/// chatsync - interactive console for the conversation sync engine
use chatsync_core::rest::{HttpRestClient, MemoryBackend, RestApi};
use chatsync_core::transport::{ChannelTransport, MemoryTransport, SseTransport};
use chatsync_core::{cli_app, Config, Credential, SessionWatch, SyncCoordinator};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_USER: &str = "demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interleave with the prompt
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let rest: Arc<dyn RestApi>;
    let transport: Arc<dyn ChannelTransport>;
    let credential: Option<Credential>;
    if config.demo {
        let user_id = config
            .user_id
            .clone()
            .unwrap_or_else(|| DEMO_USER.to_string());
        let hub = MemoryTransport::new();
        let backend = MemoryBackend::with_transport(hub.clone());
        cli_app::seed_demo(&backend, &user_id);
        info!("Running against the in-memory demo backend as {}", user_id);
        rest = Arc::new(backend);
        transport = Arc::new(hub);
        credential = Some(Credential::new(user_id, "demo-token"));
    } else {
        info!("REST: {}  realtime: {}", config.api_url, config.realtime_base());
        rest = Arc::new(HttpRestClient::new(config.api_url.clone()));
        transport = Arc::new(SseTransport::new(config.realtime_base().to_string()));
        credential = match (&config.user_id, &config.token) {
            (Some(user), Some(token)) => Some(Credential::new(user.clone(), token.clone())),
            _ => {
                warn!("No --user/--token given, starting signed out");
                None
            }
        };
    }

    let session = SessionWatch::new(credential);
    let coordinator = SyncCoordinator::new(config, rest, transport, session);
    coordinator.start().await;

    let result = cli_app::run(coordinator.clone()).await;
    coordinator.shutdown().await;
    result
}
