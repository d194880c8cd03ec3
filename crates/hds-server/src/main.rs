//! Haven domain server binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;
use uuid::Uuid;

use hds_auth::{AuthPolicy, OAuthClient, SessionStore, StateTokens};
use hds_core::{StartupError, value_at};
use hds_server::http::{self, AppState};
use hds_server::{
    DomainConfig, DomainServer, HttpMetaverseApi, InMemoryContentManager, MetaverseApi,
    NullMetaverse, RecordingTransport, Transport, acquire_temporary_identity_with_retry,
};

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "haven-domain-server", about = "Haven virtual-world domain server")]
struct Args {
    /// Path to the JSON settings document.
    #[arg(long, default_value = "domain-settings.json")]
    settings: PathBuf,

    /// Bind address for the admin HTTP surface.
    #[arg(long, default_value = "0.0.0.0:40100")]
    http_bind: SocketAddr,

    /// Publicly reachable socket advertised to peers.
    #[arg(long, default_value = "127.0.0.1:40102")]
    public_socket: SocketAddr,

    /// Local-network socket advertised to peers.
    #[arg(long, default_value = "127.0.0.1:40102")]
    local_socket: SocketAddr,

    /// Base URL of the metaverse API; omit to run disconnected.
    #[arg(long)]
    metaverse_url: Option<Url>,

    /// Rendezvous service hostname.
    #[arg(long, default_value = "ice.haven-vr.dev")]
    ice_server: String,

    /// Rendezvous service port.
    #[arg(long, default_value_t = 7337)]
    ice_port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        if let Some(startup) = error.downcast_ref::<StartupError>() {
            // configuration errors fail fast with a class-specific exit code
            error!(%startup, "fatal startup configuration error");
            std::process::exit(startup.exit_code());
        }
        error!(%error, "domain server exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings_root = load_settings(&args.settings)?;
    check_startup_configuration(&settings_root)?;

    let metaverse: Arc<dyn MetaverseApi> = match &args.metaverse_url {
        Some(url) => Arc::new(HttpMetaverseApi::new(url.clone())),
        None => Arc::new(NullMetaverse),
    };

    let session_id = resolve_domain_id(&settings_root, metaverse.as_ref()).await;
    info!(domain = %session_id, "starting haven domain server");

    // real packet transport attaches here; until then sends are recorded
    let transport: Arc<dyn Transport> = RecordingTransport::new();

    let domain = DomainServer::new(
        DomainConfig {
            session_id,
            public_socket: args.public_socket,
            local_socket: args.local_socket,
            ice_server_hostname: args.ice_server.clone(),
            ice_server_port: args.ice_port,
        },
        settings_root.clone(),
        transport,
        metaverse,
    );

    let sessions = Arc::new(SessionStore::new());
    let state = AppState {
        domain: Arc::clone(&domain),
        policy: Arc::new(AuthPolicy::from_settings(&settings_root)),
        sessions: Arc::clone(&sessions),
        states: Arc::new(StateTokens::new()),
        oauth: oauth_client_from_settings(&settings_root, &args),
        content: Arc::new(InMemoryContentManager::new()),
    };

    tokio::spawn(async move {
        let mut timer = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            timer.tick().await;
            sessions.purge_expired();
        }
    });

    let (message_tx, message_rx) = mpsc::channel(1024);
    // the transport collaborator feeds this sender; keep it alive for the
    // life of the process
    let _message_tx = message_tx;
    tokio::spawn(Arc::clone(&domain).run(message_rx));

    let listener = tokio::net::TcpListener::bind(args.http_bind).await?;
    info!(address = %args.http_bind, "admin http surface listening");
    axum::serve(listener, http::router(state)).await?;

    Ok(())
}

fn load_settings(path: &PathBuf) -> Result<Value, StartupError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(error) => {
            info!(path = %path.display(), %error, "no settings document, using defaults");
            Ok(json!({}))
        }
    }
}

/// Fail fast on configuration the server cannot run partially without.
fn check_startup_configuration(root: &Value) -> Result<(), StartupError> {
    let cert = value_at(root, "security.tls_cert").and_then(Value::as_str);
    let key = value_at(root, "security.tls_key").and_then(Value::as_str);
    match (cert, key) {
        (Some(_), None) => {
            return Err(StartupError::MissingTlsCredentials {
                detail: "tls_cert configured without tls_key".into(),
            });
        }
        (None, Some(_)) => {
            return Err(StartupError::MissingTlsCredentials {
                detail: "tls_key configured without tls_cert".into(),
            });
        }
        _ => {}
    }

    let oauth_provider = value_at(root, "oauth.provider_url").and_then(Value::as_str);
    let oauth_secret = value_at(root, "oauth.client_secret").and_then(Value::as_str);
    if oauth_provider.is_some() && oauth_secret.is_none() {
        return Err(StartupError::MissingOAuthSecret);
    }

    Ok(())
}

/// The domain id from settings, or a temporary identity from the metaverse.
async fn resolve_domain_id(root: &Value, metaverse: &dyn MetaverseApi) -> Uuid {
    if let Some(configured) = value_at(root, "metaverse.id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
    {
        return configured;
    }

    match acquire_temporary_identity_with_retry(metaverse).await {
        Ok(identity) => {
            info!(name = %identity.name, "acquired temporary domain identity");
            identity.id
        }
        Err(error) => {
            error!(%error, "could not acquire a temporary identity, generating a local id");
            Uuid::new_v4()
        }
    }
}

fn oauth_client_from_settings(root: &Value, args: &Args) -> Option<Arc<OAuthClient>> {
    let provider: Url = value_at(root, "oauth.provider_url")
        .and_then(Value::as_str)?
        .parse()
        .ok()?;
    let client_id = value_at(root, "oauth.client_id").and_then(Value::as_str)?;
    let client_secret = value_at(root, "oauth.client_secret").and_then(Value::as_str)?;

    let hostname = value_at(root, "metaverse.local_hostname")
        .and_then(Value::as_str)
        .unwrap_or("localhost");
    let redirect: Url = format!("https://{hostname}:{}/oauth", args.http_bind.port())
        .parse()
        .ok()?;

    Some(Arc::new(OAuthClient::new(
        provider,
        client_id,
        client_secret,
        redirect,
    )))
}
