//! Application state
//!
//! Holds configuration and the shared service handles

use crate::prefs::PreferencesStore;
use crate::recompress::Recompressor;
use crate::router::ScannerRouter;
use crate::session_store::SessionStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Loopback bind address for both listeners
    pub bind_host: String,
    /// Plaintext WebSocket port
    pub ws_port: u16,
    /// TLS WebSocket port
    pub wss_port: u16,
    /// Certificate bundle path (PEM); key and metadata live next to it
    pub cert_path: PathBuf,
    /// Secret protecting the private key; empty = unencrypted
    pub cert_password: String,
    /// Validity window of a freshly generated certificate
    pub cert_validity_days: u32,
    /// Install the certificate into the user trust store on startup
    pub auto_install_cert: bool,
    /// Session token time-to-live
    pub token_ttl_minutes: i64,
    /// Live session cap
    pub max_sessions: usize,
    /// Product data directory (certificate, preferences)
    pub data_dir: PathBuf,
    /// Candidate `host[:port]` entries for network scanner discovery
    pub escl_hosts: Vec<String>,
    /// Number of emulated local devices to expose (0 = none)
    pub emulated_devices: usize,
    /// Pages at or above this size are recompressed
    pub recompress_threshold: u64,
    /// JPEG quality used by the recompressor
    pub jpeg_quality: u8,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = std::env::var("SCANBRIDGE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("scanbridge")
            });

        Self {
            bind_host: std::env::var("SCANBRIDGE_BIND_HOST")
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            ws_port: std::env::var("SCANBRIDGE_WS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8180),
            wss_port: std::env::var("SCANBRIDGE_WSS_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8181),
            cert_path: std::env::var("SCANBRIDGE_CERT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("certificate.pem")),
            cert_password: std::env::var("SCANBRIDGE_CERT_PASSWORD").unwrap_or_default(),
            cert_validity_days: std::env::var("SCANBRIDGE_CERT_VALIDITY_DAYS")
                .ok()
                .and_then(|d| d.parse().ok())
                .unwrap_or(365),
            auto_install_cert: std::env::var("SCANBRIDGE_AUTO_INSTALL_CERT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            token_ttl_minutes: std::env::var("SCANBRIDGE_TOKEN_TTL_MINUTES")
                .ok()
                .and_then(|m| m.parse().ok())
                .unwrap_or(30),
            max_sessions: std::env::var("SCANBRIDGE_MAX_SESSIONS")
                .ok()
                .and_then(|m| m.parse().ok())
                .unwrap_or(10),
            escl_hosts: std::env::var("SCANBRIDGE_ESCL_HOSTS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            emulated_devices: std::env::var("SCANBRIDGE_EMULATED_DEVICES")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            recompress_threshold: std::env::var("SCANBRIDGE_RECOMPRESS_THRESHOLD_BYTES")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(5 * 1024 * 1024),
            jpeg_quality: std::env::var("SCANBRIDGE_JPEG_QUALITY")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(85),
            data_dir,
        }
    }
}

/// Events surfaced to the desktop shell (tray UI); consumed outside the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiEvent {
    /// Legacy wake-up frame received from a browser page
    WakeUp,
    /// A client connected to one of the listeners
    ClientConnected,
}

/// Application state shared across connection handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Session store (tokens, connection index)
    pub sessions: Arc<SessionStore>,
    /// Scanner router (backend façade)
    pub router: Arc<ScannerRouter>,
    /// User preferences (default device)
    pub prefs: Arc<PreferencesStore>,
    /// Page recompressor
    pub recompressor: Arc<Recompressor>,
    /// Upward UI notifications
    pub ui_events: mpsc::UnboundedSender<UiEvent>,
}
