//! Backend `b` - property-list local driver family
//!
//! The simpler of the two local families: devices are enumerated once at
//! initialization, settings go down as a flat property sheet, and there is
//! no capability negotiation beyond "the device took it or it didn't".
//! Acquisition windows are rare in this family; UI requests are attempted
//! and the driver's refusal surfaced as-is.

use super::{
    relay_driver_events, snapshot_from_source, ActiveJob, BackendEvent, BackendState,
    ScannerBackend,
};
use crate::driver::{option_keys, DriverPort, DriverSession, OptionValue, UiMode};
use crate::error::{Error, Result};
use crate::models::{CapabilitySnapshot, Device, ScanSettings};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct BravoBackend {
    port: Option<Arc<dyn DriverPort>>,
    events: mpsc::Sender<BackendEvent>,
    state: Arc<Mutex<BackendState>>,
    job: Arc<Mutex<Option<ActiveJob>>>,
    session: Mutex<Option<Box<dyn DriverSession>>>,
    /// Device list captured at initialization; this family enumerates once
    known: Mutex<Vec<Device>>,
    init_error: Mutex<Option<String>>,
    applied: Mutex<ScanSettings>,
}

impl BravoBackend {
    pub fn new(port: Option<Arc<dyn DriverPort>>, events: mpsc::Sender<BackendEvent>) -> Self {
        Self {
            port,
            events,
            state: Arc::new(Mutex::new(BackendState::Uninitialized)),
            job: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            known: Mutex::new(Vec::new()),
            init_error: Mutex::new(None),
            applied: Mutex::new(ScanSettings::default()),
        }
    }

    fn property_sheet(settings: &ScanSettings) -> Vec<(&'static str, OptionValue)> {
        let mut sheet = vec![
            (option_keys::DPI, OptionValue::Int(settings.dpi as i64)),
            (
                option_keys::PIXEL_TYPE,
                OptionValue::Text(settings.pixel_type.as_wire().to_string()),
            ),
            (
                option_keys::PAPER_SIZE,
                OptionValue::Text(settings.paper_size.clone()),
            ),
            (option_keys::USE_ADF, OptionValue::Bool(settings.use_adf)),
            (option_keys::DUPLEX, OptionValue::Bool(settings.duplex)),
        ];
        if settings.duplex {
            // Interleaved transfer keeps page order for the client
            sheet.push((option_keys::DUPLEX_TWO_PASS, OptionValue::Bool(false)));
        }
        if !settings.show_ui && settings.max_pages > 0 {
            sheet.push((
                option_keys::TRANSFER_COUNT,
                OptionValue::Int(settings.max_pages as i64),
            ));
        }
        sheet
    }
}

#[async_trait]
impl ScannerBackend for BravoBackend {
    fn name(&self) -> &'static str {
        "b"
    }

    async fn initialize(&self) -> Result<()> {
        let Some(port) = &self.port else {
            let message = "driver runtime not present".to_string();
            *self.init_error.lock().await = Some(message.clone());
            return Err(Error::ScannerNotFound(message));
        };

        match port.sources().await {
            Ok(sources) => {
                let devices = sources
                    .into_iter()
                    .map(|source| {
                        let id = if source.local_id.is_empty() {
                            source.display_name.clone()
                        } else {
                            source.local_id.clone()
                        };
                        Device {
                            id,
                            name: source.display_name,
                            is_default: false,
                            protocol: "b".to_string(),
                            capabilities: None,
                        }
                    })
                    .collect::<Vec<_>>();
                tracing::info!(backend = "b", devices = devices.len(), "Backend initialized");
                *self.known.lock().await = devices;
                *self.state.lock().await = BackendState::Ready;
                Ok(())
            }
            Err(err) => {
                *self.init_error.lock().await = Some(err.to_string());
                *self.state.lock().await = BackendState::Error(err.to_string());
                Err(err)
            }
        }
    }

    async fn shutdown(&self) {
        self.stop().await;
        if let Some(mut session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.known.lock().await.clear();
        *self.state.lock().await = BackendState::Uninitialized;
        tracing::info!(backend = "b", "Backend shut down");
    }

    async fn enumerate(&self) -> Vec<Device> {
        self.known.lock().await.clone()
    }

    async fn select(&self, local_id: &str) -> Result<()> {
        let Some(port) = &self.port else {
            return Err(Error::ScannerNotFound(
                self.init_error
                    .lock()
                    .await
                    .clone()
                    .unwrap_or_else(|| "driver runtime not present".to_string()),
            ));
        };

        if !self.known.lock().await.iter().any(|d| d.id == local_id) {
            return Err(Error::ScannerNotFound(format!("unknown device '{local_id}'")));
        }

        let session = port
            .open(local_id)
            .await
            .map_err(|err| Error::ScannerNotFound(format!("open '{local_id}': {err}")))?;

        if let Some(mut previous) = self.session.lock().await.replace(session) {
            previous.close().await;
        }
        *self.state.lock().await = BackendState::DeviceOpen;
        tracing::info!(backend = "b", device = %local_id, "Device selected");
        Ok(())
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let applied = self.applied.lock().await.clone();

        {
            let session = self.session.lock().await;
            if let Some(session) = session.as_ref() {
                let descriptor = session.descriptor();
                if descriptor.local_id == local_id || descriptor.display_name == local_id {
                    return Some(snapshot_from_source(&descriptor, &applied));
                }
            }
        }

        let port = self.port.as_ref()?;
        let mut session = port.open(local_id).await.ok()?;
        let descriptor = session.descriptor();
        session.close().await;
        Some(snapshot_from_source(&descriptor, &applied))
    }

    async fn apply(&self, settings: &ScanSettings) -> Result<()> {
        if settings.max_pages == 0 {
            return Err(Error::InvalidRequest("maxPages must be -1 or positive".into()));
        }

        let mut session = self.session.lock().await;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::ScannerNotFound("no device selected".into()))?;

        let mut ignored = Vec::new();
        for (key, value) in Self::property_sheet(settings) {
            if !session.set_option(key, value).await? {
                ignored.push(key);
            }
        }
        if !ignored.is_empty() {
            tracing::debug!(backend = "b", ?ignored, "Device ignored properties");
        }

        *self.applied.lock().await = settings.clone();
        let mut state = self.state.lock().await;
        if matches!(*state, BackendState::Error(_)) {
            *state = BackendState::DeviceOpen;
        }
        Ok(())
    }

    async fn apply_advanced(
        &self,
        key: &str,
        _value: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(Error::InvalidRequest(format!(
            "unsupported advanced key: {key}"
        )))
    }

    async fn start(&self, request_id: &str) -> Result<()> {
        {
            let state = self.state.lock().await;
            if *state == BackendState::Scanning {
                return Err(Error::ScannerBusy("acquisition already running".into()));
            }
        }

        let mut session_guard = self.session.lock().await;
        let session = session_guard
            .as_mut()
            .ok_or_else(|| Error::ScannerNotFound("no device selected".into()))?;

        let show_ui = self.applied.lock().await.show_ui;
        *self.job.lock().await = Some(ActiveJob::new(request_id));

        let (driver_tx, driver_rx) = mpsc::channel(32);
        let begin = if show_ui {
            match session.begin(UiMode::NonModal, driver_tx.clone()).await {
                Ok(()) => Ok(()),
                Err(first) => {
                    tracing::debug!(backend = "b", error = %first, "Non-modal UI failed, trying modal");
                    session.begin(UiMode::Modal, driver_tx).await
                }
            }
        } else {
            session.begin(UiMode::Headless, driver_tx).await
        };

        if let Err(err) = begin {
            *self.job.lock().await = None;
            return Err(err);
        }

        let events = self.events.clone();
        let job = self.job.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            relay_driver_events("b", driver_rx, events, job, state).await;
        });

        *self.state.lock().await = BackendState::Scanning;
        tracing::info!(backend = "b", request_id, "Acquisition started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(job) = self.job.lock().await.as_mut() {
            job.terminated = true;
        }
        if let Some(session) = self.session.lock().await.as_mut() {
            session.abort().await;
        }
        let mut state = self.state.lock().await;
        if *state == BackendState::Scanning {
            *state = BackendState::DeviceOpen;
        }
    }
}
