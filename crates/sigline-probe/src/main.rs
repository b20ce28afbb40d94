//! Connects to a signaling endpoint and logs call activity until Ctrl-C.
//!
//! Environment:
//! - `SIGLINE_ENDPOINT`: websocket URL of the device (required)
//! - `SIGLINE_TOKEN`: bearer token
//! - `SIGLINE_DATA_DIR`: directory holding `transport.json` (default `.`)

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use sigline_core::services::NoReachability;
use sigline_core::{
    Call, CallManager, CallObserver, ConfigStore, DisconnectionType, MediaChangeType,
    ObserverRegistry, Registrar, SignalError, SignalingTransport, StaticCredentials,
    TransportServices, WsSocketFactory,
};
use url::Url;

struct CallLogger;

impl CallObserver for CallLogger {
    fn call_did_begin_ringing(&self, call: &Call) {
        tracing::info!(call = %call.id(), "ringing");
    }

    fn call_did_connect(&self, call: &Call) {
        tracing::info!(call = %call.id(), remotes = call.info().remotes.len(), "connected");
    }

    fn call_did_disconnect(&self, call: &Call, reason: DisconnectionType) {
        tracing::info!(call = %call.id(), ?reason, "disconnected");
    }

    fn remote_media_did_change(&self, call: &Call, change: MediaChangeType) {
        tracing::info!(call = %call.id(), ?change, "remote media changed");
    }

    fn dtmf_availability_did_change(&self, call: &Call, enabled: bool) {
        tracing::info!(call = %call.id(), enabled, "dtmf availability changed");
    }
}

/// Without a registration service the best we can do is dial the same
/// endpoint again.
struct ReconnectRegistrar {
    endpoint: Url,
}

impl Registrar for ReconnectRegistrar {
    fn reregister(&self, transport: SignalingTransport) {
        tracing::info!(url = %self.endpoint, "reconnecting to configured endpoint");
        transport.connect(self.endpoint.clone());
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sigline_core=debug,sigline_probe=info")),
        )
        .init();
}

fn endpoint_from_env() -> Result<Url, SignalError> {
    let raw = env::var("SIGLINE_ENDPOINT")
        .map_err(|_| SignalError::Config("SIGLINE_ENDPOINT is not set".into()))?;
    Url::parse(&raw).map_err(|e| SignalError::Config(format!("SIGLINE_ENDPOINT: {e}")))
}

#[tokio::main]
async fn main() -> Result<(), SignalError> {
    init_logging();

    let endpoint = endpoint_from_env()?;
    let credentials = match env::var("SIGLINE_TOKEN") {
        Ok(token) => StaticCredentials::bearer(token),
        Err(_) => {
            tracing::warn!("SIGLINE_TOKEN is not set, the connection will be refused");
            StaticCredentials::none()
        }
    };
    let data_dir = env::var("SIGLINE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let config = ConfigStore::new(&data_dir).get();

    let observers = ObserverRegistry::new();
    let logger = Arc::new(CallLogger);
    observers.add_observer(&logger);
    let manager = Arc::new(Mutex::new(CallManager::new(observers)));

    let transport = SignalingTransport::spawn(
        &config,
        TransportServices {
            credentials: Arc::new(credentials),
            sockets: Arc::new(WsSocketFactory),
            router: Box::new(manager.clone()),
            registrar: Arc::new(ReconnectRegistrar {
                endpoint: endpoint.clone(),
            }),
            reachability: Arc::new(NoReachability),
        },
    )?;
    transport.connect(endpoint);

    let mut states = transport.watch_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!(?state, "transport state changed");
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::error!("cannot listen for Ctrl-C: {e}");
                }
                break;
            }
        }
    }

    transport.disconnect();
    if let Some(snapshot) = transport.snapshot().await {
        tracing::info!(?snapshot, "transport at shutdown");
    }
    tracing::info!(active_calls = manager.lock().active_calls().len(), "probe stopped");
    Ok(())
}
