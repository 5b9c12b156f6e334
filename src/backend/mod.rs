//! Scanner Backends - device-family adapters
//!
//! ## Responsibilities
//!
//! - One adapter per supported device family (`a`, `b`, `e`)
//! - Enumerate, select, configure, acquire, abort
//! - Reconcile noisy driver signals into exactly one terminal event per job
//!
//! Backends never block the caller across pages; acquisitions stream
//! [`BackendEvent`]s into the channel handed over at construction.

pub mod alpha;
pub mod bravo;
pub mod escl;

use crate::driver::{DriverEvent, DriverSource};
use crate::error::Result;
use crate::models::{
    Capability, CapabilitySnapshot, CapabilityType, Device, PageMeta, ScanSettings,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

pub use alpha::AlphaBackend;
pub use bravo::BravoBackend;
pub use escl::EsclBackend;

/// Events every backend emits; the router re-tags them upward
#[derive(Debug)]
pub enum BackendEvent {
    Page {
        request_id: String,
        data: Vec<u8>,
        meta: PageMeta,
        /// 1-based, strictly increasing
        number: u32,
    },
    Completed {
        request_id: String,
        total_pages: u32,
    },
    Error {
        request_id: String,
        message: String,
    },
}

/// Backend-local state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Ready,
    DeviceOpen,
    Scanning,
    Error(String),
}

/// Per-job acquisition state with the monotonic terminated flag
#[derive(Debug)]
pub struct ActiveJob {
    pub request_id: String,
    pub pages: u32,
    pub terminated: bool,
}

impl ActiveJob {
    pub fn new(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            pages: 0,
            terminated: false,
        }
    }
}

/// Polymorphic capability set implemented once per device family
#[async_trait]
pub trait ScannerBackend: Send + Sync {
    /// Backend tag used as the device id prefix
    fn name(&self) -> &'static str;

    /// Prepare the device library; init errors are captured and reported on
    /// first use rather than failing daemon startup
    async fn initialize(&self) -> Result<()>;

    /// Release all device handles
    async fn shutdown(&self);

    /// List local devices; ids are backend-local (the router prefixes them)
    async fn enumerate(&self) -> Vec<Device>;

    /// Open a specific device; invalidates any prior selection
    async fn select(&self, local_id: &str) -> Result<()>;

    /// Capability snapshot for a device
    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot>;

    /// Push canonical settings onto the selected device; unsupported fields
    /// are silently ignored
    async fn apply(&self, settings: &ScanSettings) -> Result<()>;

    /// Apply a backend-specific experimental setting
    async fn apply_advanced(&self, key: &str, value: &serde_json::Value)
        -> Result<serde_json::Value>;

    /// Begin an acquisition; must not block across pages
    async fn start(&self, request_id: &str) -> Result<()>;

    /// Request abort; safe to call at any time
    async fn stop(&self);
}

/// Bridge a driver's event stream into backend events, applying the
/// terminal-event rules:
///
/// - first terminal signal wins; the job is then `terminated`
/// - feeder-empty style faults after at least one page are a completion
/// - events on a terminated job are suppressed
/// - the device state is forced back down to device-open after the terminal
pub(crate) async fn relay_driver_events(
    backend: &'static str,
    mut driver_rx: mpsc::Receiver<DriverEvent>,
    events: mpsc::Sender<BackendEvent>,
    job_slot: Arc<Mutex<Option<ActiveJob>>>,
    state: Arc<Mutex<BackendState>>,
) {
    while let Some(event) = driver_rx.recv().await {
        let outbound = {
            let mut slot = job_slot.lock().await;
            let Some(job) = slot.as_mut() else {
                continue;
            };
            if job.terminated {
                tracing::debug!(backend, "Suppressing driver event on terminated job");
                continue;
            }
            match event {
                DriverEvent::Page {
                    data,
                    width,
                    height,
                    format,
                    dpi,
                } => {
                    job.pages += 1;
                    Some(BackendEvent::Page {
                        request_id: job.request_id.clone(),
                        meta: PageMeta {
                            width,
                            height,
                            format,
                            size: data.len() as u64,
                            dpi,
                        },
                        data,
                        number: job.pages,
                    })
                }
                DriverEvent::Done { pages } => {
                    job.terminated = true;
                    Some(BackendEvent::Completed {
                        request_id: job.request_id.clone(),
                        total_pages: pages.max(job.pages),
                    })
                }
                DriverEvent::FeederEmpty => {
                    job.terminated = true;
                    if job.pages > 0 {
                        Some(BackendEvent::Completed {
                            request_id: job.request_id.clone(),
                            total_pages: job.pages,
                        })
                    } else {
                        Some(BackendEvent::Error {
                            request_id: job.request_id.clone(),
                            message: "no media in feeder".to_string(),
                        })
                    }
                }
                DriverEvent::Fault(message) => {
                    job.terminated = true;
                    if job.pages > 0 && is_end_of_media(&message) {
                        // End-of-batch noise after real pages is a completion
                        Some(BackendEvent::Completed {
                            request_id: job.request_id.clone(),
                            total_pages: job.pages,
                        })
                    } else {
                        Some(BackendEvent::Error {
                            request_id: job.request_id.clone(),
                            message,
                        })
                    }
                }
            }
        };

        if let Some(event) = outbound {
            let terminal = matches!(
                event,
                BackendEvent::Completed { .. } | BackendEvent::Error { .. }
            );
            if terminal {
                // No active transfer anymore; same device is reusable
                let mut state = state.lock().await;
                if *state == BackendState::Scanning {
                    *state = BackendState::DeviceOpen;
                }
            }
            if events.send(event).await.is_err() {
                tracing::warn!(backend, "Backend event channel closed");
                return;
            }
        }
    }
}

/// Driver fault texts that mean "out of paper" rather than a real failure
fn is_end_of_media(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("feeder empty") || lower.contains("no media") || lower.contains("out of paper")
}

/// Baseline capability snapshot assembled from a driver source descriptor
pub(crate) fn snapshot_from_source(
    source: &DriverSource,
    current: &ScanSettings,
) -> CapabilitySnapshot {
    let mut snapshot = CapabilitySnapshot::new();

    snapshot.insert(
        "dpi".to_string(),
        Capability::new("dpi", "Resolution", CapabilityType::Int)
            .with_values(
                source
                    .dpi_values
                    .iter()
                    .map(|d| serde_json::json!(d))
                    .collect(),
            )
            .with_current(serde_json::json!(current.dpi)),
    );
    snapshot.insert(
        "pixelType".to_string(),
        Capability::new("pixelType", "Color mode", CapabilityType::Enum)
            .with_values(
                source
                    .pixel_types
                    .iter()
                    .map(|p| serde_json::json!(p))
                    .collect(),
            )
            .with_current(serde_json::json!(current.pixel_type.as_wire())),
    );
    snapshot.insert(
        "paperSize".to_string(),
        Capability::new("paperSize", "Paper size", CapabilityType::Enum)
            .with_values(
                source
                    .paper_sizes
                    .iter()
                    .map(|p| serde_json::json!(p))
                    .collect(),
            )
            .with_current(serde_json::json!(current.paper_size)),
    );
    snapshot.insert(
        "useAdf".to_string(),
        Capability::new("useAdf", "Use document feeder", CapabilityType::Bool)
            .with_values(if source.adf {
                vec![serde_json::json!(true), serde_json::json!(false)]
            } else {
                vec![serde_json::json!(false)]
            })
            .with_current(serde_json::json!(current.use_adf)),
    );
    snapshot.insert(
        "duplex".to_string(),
        Capability::new("duplex", "Two-sided", CapabilityType::Bool)
            .with_values(if source.duplex_one_pass || source.duplex_two_pass {
                vec![serde_json::json!(true), serde_json::json!(false)]
            } else {
                vec![serde_json::json!(false)]
            })
            .with_current(serde_json::json!(current.duplex)),
    );
    snapshot.insert(
        "maxPages".to_string(),
        Capability::new("maxPages", "Page limit", CapabilityType::Int)
            .with_current(serde_json::json!(current.max_pages)),
    );
    snapshot.insert(
        "showUI".to_string(),
        Capability::new("showUI", "Show driver window", CapabilityType::Bool)
            .with_values(if source.ui_supported {
                vec![serde_json::json!(true), serde_json::json!(false)]
            } else {
                vec![serde_json::json!(false)]
            })
            .with_current(serde_json::json!(current.show_ui)),
    );

    snapshot
}
