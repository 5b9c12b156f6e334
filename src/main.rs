//! scanbridge daemon
//!
//! Main entry point: wiring, background tasks, listener startup, shutdown.

use scanbridge::{
    backend::{AlphaBackend, BravoBackend, EsclBackend},
    cert_manager::CertManager,
    driver::emulated::{EmulatedPort, EmulatedProfile},
    driver::DriverPort,
    gateway::Gateway,
    prefs::PreferencesStore,
    recompress::Recompressor,
    router::ScannerRouter,
    session_store::{SessionStore, SWEEP_INTERVAL_SECS},
    state::{AppConfig, AppState, UiEvent},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Probe cadence for network scanner discovery
const DISCOVERY_INTERVAL_SECS: u64 = 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanbridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting scanbridge v{}", env!("CARGO_PKG_VERSION"));

    // Last-resort sink for anything that slips past error handling
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        tracing::error!(location = %location, panic = %info, "Unhandled panic");
    }));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        ws_port = config.ws_port,
        wss_port = config.wss_port,
        data_dir = %config.data_dir.display(),
        "Configuration loaded"
    );
    tokio::fs::create_dir_all(&config.data_dir).await.ok();

    // Initialize components
    let prefs = Arc::new(PreferencesStore::load(&config.data_dir).await);
    tracing::info!("PreferencesStore initialized");

    let sessions = Arc::new(SessionStore::new(
        chrono::Duration::minutes(config.token_ttl_minutes),
        config.max_sessions,
    ));
    tracing::info!(
        ttl_minutes = config.token_ttl_minutes,
        max_sessions = config.max_sessions,
        "SessionStore initialized"
    );

    let router = Arc::new(ScannerRouter::new());

    // Backend a: full-negotiation driver family
    let alpha_port: Option<Arc<dyn DriverPort>> = if config.emulated_devices > 0 {
        Some(Arc::new(EmulatedPort::fleet(config.emulated_devices)))
    } else {
        None
    };
    let (alpha_tx, alpha_rx) = mpsc::channel(64);
    router
        .register(Arc::new(AlphaBackend::new(alpha_port, alpha_tx)), alpha_rx)
        .await;

    // Backend b: property-list driver family
    let bravo_port: Option<Arc<dyn DriverPort>> = if config.emulated_devices > 0 {
        Some(Arc::new(EmulatedPort::new(vec![EmulatedProfile::new(
            "Emulated Flatbed",
        )
        .no_ui()])))
    } else {
        None
    };
    let (bravo_tx, bravo_rx) = mpsc::channel(64);
    router
        .register(Arc::new(BravoBackend::new(bravo_port, bravo_tx)), bravo_rx)
        .await;

    // Backend e: network scanners
    let (escl_tx, escl_rx) = mpsc::channel(64);
    let escl = Arc::new(EsclBackend::new(config.escl_hosts.clone(), escl_tx));
    router.register(escl.clone(), escl_rx).await;

    router.initialize().await;
    tracing::info!("ScannerRouter initialized");

    let recompressor = Arc::new(Recompressor::new(
        config.recompress_threshold,
        config.jpeg_quality,
    ));

    // Upward UI notifications; the tray shell consumes these when present
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            match event {
                UiEvent::WakeUp => tracing::info!("UI wake-up requested"),
                UiEvent::ClientConnected => tracing::debug!("Client connection notified"),
            }
        }
    });

    // Certificate lifecycle; a missing identity only disables WSS
    let cert_manager = CertManager::new(
        config.cert_path.clone(),
        config.cert_password.clone(),
        config.cert_validity_days,
        config.auto_install_cert,
        "localhost".to_string(),
    );
    let tls_identity = cert_manager.obtain().await;

    // Create application state
    let state = AppState {
        config,
        sessions: sessions.clone(),
        router: router.clone(),
        prefs,
        recompressor,
        ui_events: ui_tx,
    };

    // Session sweep
    let sweep_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sweep_sessions.sweep().await;
        }
    });

    // Periodic network scanner discovery
    let discovery = escl.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(DISCOVERY_INTERVAL_SECS));
        loop {
            interval.tick().await;
            discovery.discover().await;
        }
    });

    // Start listeners
    let gateway = Gateway::new(state);
    if let Err(err) = gateway.start(tls_identity).await {
        tracing::error!(error = %err, "Startup failed");
        anyhow::bail!("no listener could bind");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    // Release in reverse dependency order; sockets die with the process
    router.shutdown().await;

    Ok(())
}
