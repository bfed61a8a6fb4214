use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edtriage::api::RestApi;
use edtriage::config::{load_config, Config};
use edtriage::notify::BroadcastNotifier;
use edtriage::refresher::Refresher;
use edtriage::storage::{JournalStore, MemoryStore, Store};
use edtriage::triage::{Classifier, LinearSoftmaxModel, RuleBasedClassifier, TriageClassifier};
use edtriage::TriageService;

const CONFIG_ENV: &str = "EDTRIAGE_CONFIG";
const EVENT_BUFFER: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.yaml"));
    let config = if config_path.exists() {
        load_config(&config_path)?
    } else {
        warn!(path = %config_path.display(), "config file not found, using defaults");
        let config = Config::default();
        config.validate()?;
        config
    };

    let rules = RuleBasedClassifier::new(config.thresholds.clone());
    let triage = match &config.model.path {
        Some(path) => match LinearSoftmaxModel::from_file(path) {
            Ok(model) => {
                info!(path = %path, version = %model.version, "statistical model loaded");
                TriageClassifier::with_model(rules, Arc::new(model))
            }
            Err(e) => {
                warn!(path = %path, error = %e, "model unavailable, using rule-based triage only");
                TriageClassifier::new(rules)
            }
        },
        None => TriageClassifier::new(rules),
    };
    info!(statistical_model = triage.has_model(), "classifier ready");
    let classifier: Arc<dyn Classifier> = Arc::new(triage);

    let store: Arc<dyn Store> = if config.storage.journal_enabled {
        let journal = JournalStore::open(&config.storage.path).await?;
        let kept = journal.compact().await?;
        info!(path = %journal.path().display(), records = kept, "journal ready");
        Arc::new(journal)
    } else {
        Arc::new(MemoryStore::new())
    };

    let notifier = Arc::new(BroadcastNotifier::new(EVENT_BUFFER));
    let service = Arc::new(TriageService::new(&config, classifier, Arc::clone(&store), notifier.clone()));
    service.restore(store.replay().await?);

    let refresher = Refresher::start(Arc::clone(&service), config.queue.refresh_interval());
    let api = RestApi::new(Arc::clone(&service), notifier);

    let addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    info!(%addr, "starting server");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (_, server) = warp::serve(api.routes()).try_bind_with_graceful_shutdown(addr, async move {
        shutdown_rx.await.ok();
        info!("shutting down server");
    })?;
    let server_handle = tokio::spawn(server);

    signal::ctrl_c().await?;
    info!("Ctrl+C received, starting graceful shutdown");
    shutdown_tx.send(()).ok();
    server_handle.await?;

    refresher.stop().await;
    info!("shutdown complete");
    Ok(())
}
