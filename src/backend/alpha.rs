//! Backend `a` - full-negotiation local driver family
//!
//! Adapts the callback-style vendor API: capability negotiation per option,
//! vendor acquisition window with non-modal and modal variants, and a feeder
//! that keeps signalling after the batch. The heavy lifting of terminal
//! reconciliation lives in [`super::relay_driver_events`].

use super::{
    relay_driver_events, snapshot_from_source, ActiveJob, BackendEvent, BackendState,
    ScannerBackend,
};
use crate::driver::{option_keys, DriverPort, DriverSession, OptionValue, UiMode};
use crate::error::{Error, Result};
use crate::models::{CapabilitySnapshot, Device, ScanSettings};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

pub struct AlphaBackend {
    /// Vendor runtime entry point; absent when the library is not installed
    port: Option<Arc<dyn DriverPort>>,
    events: mpsc::Sender<BackendEvent>,
    state: Arc<Mutex<BackendState>>,
    job: Arc<Mutex<Option<ActiveJob>>>,
    session: Mutex<Option<Box<dyn DriverSession>>>,
    /// Local id -> driver source name; driver ids may be unpopulated until
    /// a device has been opened once
    names: Mutex<HashMap<String, String>>,
    init_error: Mutex<Option<String>>,
    applied: Mutex<ScanSettings>,
    /// Experimental override: force two-pass duplex
    duplex_two_pass: Mutex<Option<bool>>,
}

impl AlphaBackend {
    pub fn new(port: Option<Arc<dyn DriverPort>>, events: mpsc::Sender<BackendEvent>) -> Self {
        Self {
            port,
            events,
            state: Arc::new(Mutex::new(BackendState::Uninitialized)),
            job: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            names: Mutex::new(HashMap::new()),
            init_error: Mutex::new(None),
            applied: Mutex::new(ScanSettings::default()),
            duplex_two_pass: Mutex::new(None),
        }
    }

    async fn port(&self) -> Result<Arc<dyn DriverPort>> {
        match &self.port {
            Some(port) => Ok(port.clone()),
            None => {
                let detail = self
                    .init_error
                    .lock()
                    .await
                    .clone()
                    .unwrap_or_else(|| "driver runtime not present".to_string());
                Err(Error::ScannerNotFound(detail))
            }
        }
    }

    /// Resolve a local id to the name the driver opens by
    async fn source_name(&self, local_id: &str) -> String {
        self.names
            .lock()
            .await
            .get(local_id)
            .cloned()
            .unwrap_or_else(|| local_id.to_string())
    }

    async fn push_settings(
        &self,
        session: &mut Box<dyn DriverSession>,
        settings: &ScanSettings,
    ) -> Result<()> {
        if settings.max_pages == 0 {
            return Err(Error::InvalidRequest("maxPages must be -1 or positive".into()));
        }

        let mut pushes: Vec<(&str, OptionValue)> = vec![
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
            // One-pass keeps page order; two-pass only on explicit override
            // or when the device knows nothing else
            let descriptor = session.descriptor();
            let two_pass = match *self.duplex_two_pass.lock().await {
                Some(forced) => forced,
                None => !descriptor.duplex_one_pass && descriptor.duplex_two_pass,
            };
            pushes.push((option_keys::DUPLEX_TWO_PASS, OptionValue::Bool(two_pass)));
        }

        // The vendor window owns the transfer count; overriding it locks the
        // window into single-page mode
        if !settings.show_ui && settings.max_pages > 0 {
            pushes.push((
                option_keys::TRANSFER_COUNT,
                OptionValue::Int(settings.max_pages as i64),
            ));
        }

        for (key, value) in pushes {
            match session.set_option(key, value).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(backend = "a", key, "Device ignored unsupported option")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ScannerBackend for AlphaBackend {
    fn name(&self) -> &'static str {
        "a"
    }

    async fn initialize(&self) -> Result<()> {
        let Some(port) = &self.port else {
            let message = "driver runtime not present".to_string();
            *self.init_error.lock().await = Some(message.clone());
            return Err(Error::ScannerNotFound(message));
        };

        match port.sources().await {
            Ok(sources) => {
                let mut names = self.names.lock().await;
                for source in &sources {
                    let id = if source.local_id.is_empty() {
                        source.display_name.clone()
                    } else {
                        source.local_id.clone()
                    };
                    names.insert(id, source.display_name.clone());
                }
                *self.state.lock().await = BackendState::Ready;
                tracing::info!(backend = "a", sources = sources.len(), "Backend initialized");
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
        *self.state.lock().await = BackendState::Uninitialized;
        tracing::info!(backend = "a", "Backend shut down");
    }

    async fn enumerate(&self) -> Vec<Device> {
        let Ok(port) = self.port().await else {
            return Vec::new();
        };
        if *self.state.lock().await == BackendState::Uninitialized {
            return Vec::new();
        }

        let sources = match port.sources().await {
            Ok(sources) => sources,
            Err(err) => {
                tracing::warn!(backend = "a", error = %err, "Enumeration failed");
                return Vec::new();
            }
        };

        let mut names = self.names.lock().await;
        sources
            .into_iter()
            .map(|source| {
                let id = if source.local_id.is_empty() {
                    source.display_name.clone()
                } else {
                    source.local_id.clone()
                };
                names.insert(id.clone(), source.display_name.clone());
                Device {
                    id,
                    name: source.display_name,
                    is_default: false,
                    protocol: "a".to_string(),
                    capabilities: None,
                }
            })
            .collect()
    }

    async fn select(&self, local_id: &str) -> Result<()> {
        let port = self.port().await?;
        let name = self.source_name(local_id).await;

        let session = port
            .open(&name)
            .await
            .map_err(|err| Error::ScannerNotFound(format!("open '{local_id}': {err}")))?;

        // Descriptor ids are authoritative once opened
        let descriptor = session.descriptor();
        if !descriptor.local_id.is_empty() {
            self.names
                .lock()
                .await
                .insert(descriptor.local_id.clone(), descriptor.display_name.clone());
        }

        if let Some(mut previous) = self.session.lock().await.replace(session) {
            previous.close().await;
        }
        *self.state.lock().await = BackendState::DeviceOpen;
        tracing::info!(backend = "a", device = %local_id, "Device selected");
        Ok(())
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let applied = self.applied.lock().await.clone();

        // Use the open handle when it matches; otherwise peek transiently
        {
            let session = self.session.lock().await;
            if let Some(session) = session.as_ref() {
                let descriptor = session.descriptor();
                if descriptor.local_id == local_id || descriptor.display_name == local_id {
                    let mut snapshot = snapshot_from_source(&descriptor, &applied);
                    snapshot.insert(
                        "a.duplexTwoPass".to_string(),
                        crate::models::Capability::new(
                            "a.duplexTwoPass",
                            "Force two-pass duplex",
                            crate::models::CapabilityType::Bool,
                        )
                        .experimental()
                        .with_current(serde_json::json!(
                            self.duplex_two_pass.lock().await.unwrap_or(false)
                        )),
                    );
                    return Some(snapshot);
                }
            }
        }

        let port = self.port().await.ok()?;
        let name = self.source_name(local_id).await;
        let mut session = port.open(&name).await.ok()?;
        let descriptor = session.descriptor();
        session.close().await;
        Some(snapshot_from_source(&descriptor, &applied))
    }

    async fn apply(&self, settings: &ScanSettings) -> Result<()> {
        let mut session = self.session.lock().await;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::ScannerNotFound("no device selected".into()))?;

        self.push_settings(session, settings).await?;
        *self.applied.lock().await = settings.clone();

        // A successful apply recovers the device from a fault
        let mut state = self.state.lock().await;
        if matches!(*state, BackendState::Error(_)) {
            *state = BackendState::DeviceOpen;
        }
        Ok(())
    }

    async fn apply_advanced(
        &self,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match key {
            "a.duplexTwoPass" | "duplexTwoPass" => {
                let forced = value
                    .as_bool()
                    .ok_or_else(|| Error::InvalidRequest("duplexTwoPass expects a bool".into()))?;
                *self.duplex_two_pass.lock().await = Some(forced);
                Ok(serde_json::json!(forced))
            }
            other => Err(Error::InvalidRequest(format!(
                "unsupported advanced key: {other}"
            ))),
        }
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
            // Prefer the non-blocking window, fall back to modal
            match session.begin(UiMode::NonModal, driver_tx.clone()).await {
                Ok(()) => Ok(()),
                Err(first) => {
                    tracing::debug!(backend = "a", error = %first, "Non-modal UI failed, trying modal");
                    session.begin(UiMode::Modal, driver_tx).await
                }
            }
        } else {
            session.begin(UiMode::Headless, driver_tx).await
        };

        if let Err(err) = begin {
            *self.job.lock().await = None;
            // Never pop a window the client did not ask for
            return Err(err);
        }

        let events = self.events.clone();
        let job = self.job.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            relay_driver_events("a", driver_rx, events, job, state).await;
        });

        *self.state.lock().await = BackendState::Scanning;
        tracing::info!(backend = "a", request_id, "Acquisition started");
        Ok(())
    }

    async fn stop(&self) {
        // Mark terminated first so late driver events are suppressed
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::emulated::{EmulatedPort, EmulatedProfile};
    use std::time::Duration;

    fn backend_with(
        profiles: Vec<EmulatedProfile>,
    ) -> (AlphaBackend, mpsc::Receiver<BackendEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let port: Arc<dyn DriverPort> = Arc::new(EmulatedPort::new(profiles));
        (AlphaBackend::new(Some(port), tx), rx)
    }

    fn quick_profile(name: &str) -> EmulatedProfile {
        EmulatedProfile::new(name).page_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn uninitialized_backend_enumerates_empty() {
        let (tx, _rx) = mpsc::channel(4);
        let backend = AlphaBackend::new(None, tx);
        assert!(backend.initialize().await.is_err());
        assert!(backend.enumerate().await.is_empty());
        assert!(matches!(
            backend.select("x").await.unwrap_err(),
            Error::ScannerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn enumerate_falls_back_to_display_name_ids() {
        let (backend, _rx) = backend_with(vec![quick_profile("Front Desk")]);
        backend.initialize().await.unwrap();
        let devices = backend.enumerate().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "Front Desk");
        assert_eq!(devices[0].protocol, "a");
    }

    #[tokio::test]
    async fn scan_with_cap_emits_pages_and_single_completion() {
        let (backend, mut rx) = backend_with(vec![quick_profile("dev").sheets(5)]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();
        backend
            .apply(&ScanSettings {
                max_pages: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        backend.start("r1").await.unwrap();

        let mut pages = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                BackendEvent::Page { number, .. } => pages.push(number),
                BackendEvent::Completed {
                    request_id,
                    total_pages,
                } => {
                    assert_eq!(request_id, "r1");
                    assert_eq!(total_pages, 2);
                    break;
                }
                BackendEvent::Error { message, .. } => panic!("unexpected error: {message}"),
            }
        }
        assert_eq!(pages, vec![1, 2]);
    }

    #[tokio::test]
    async fn noisy_feeder_resolves_to_completion() {
        let (backend, mut rx) =
            backend_with(vec![quick_profile("dev").sheets(2).noisy_feeder()]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();
        backend.apply(&ScanSettings::default()).await.unwrap();
        backend.start("r2").await.unwrap();

        let mut terminals = 0;
        let mut pages = 0;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
        {
            match event {
                BackendEvent::Page { .. } => pages += 1,
                BackendEvent::Completed { .. } | BackendEvent::Error { .. } => terminals += 1,
            }
            if terminals > 0 && pages == 2 {
                // Give trailing noise a moment to (not) arrive
                match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                    Ok(Some(_)) => terminals += 1,
                    _ => break,
                }
            }
        }
        assert_eq!(pages, 2);
        assert_eq!(terminals, 1);
    }

    #[tokio::test]
    async fn headless_refusal_surfaces_typed_hint() {
        let (backend, _rx) = backend_with(vec![quick_profile("dev").refuse_headless()]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();
        backend.apply(&ScanSettings::default()).await.unwrap();

        let err = backend.start("r3").await.unwrap_err();
        assert!(matches!(err, Error::UiRequired(_)));
        // The failed start left no job behind
        assert!(backend.job.lock().await.is_none());
    }

    #[tokio::test]
    async fn show_ui_takes_window_path() {
        let (backend, mut rx) = backend_with(vec![quick_profile("dev").sheets(1)]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();
        backend
            .apply(&ScanSettings {
                show_ui: true,
                max_pages: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        backend.start("r4").await.unwrap();

        // Cap is not pushed in UI mode; the emulated window scans the feeder
        let mut last_terminal_pages = None;
        while let Some(event) = rx.recv().await {
            if let BackendEvent::Completed { total_pages, .. } = event {
                last_terminal_pages = Some(total_pages);
                break;
            }
        }
        assert_eq!(last_terminal_pages, Some(1));
    }

    #[tokio::test]
    async fn capabilities_include_experimental_override() {
        let (backend, _rx) = backend_with(vec![quick_profile("dev")]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();

        let snapshot = backend.capabilities("dev").await.unwrap();
        assert!(snapshot.contains_key("dpi"));
        assert!(snapshot.contains_key("pixelType"));
        assert!(snapshot["a.duplexTwoPass"].experimental);

        let applied = backend
            .apply_advanced("a.duplexTwoPass", &serde_json::json!(true))
            .await
            .unwrap();
        assert_eq!(applied, serde_json::json!(true));
    }

    #[tokio::test]
    async fn zero_max_pages_is_rejected() {
        let (backend, _rx) = backend_with(vec![quick_profile("dev")]);
        backend.initialize().await.unwrap();
        backend.select("dev").await.unwrap();
        let err = backend
            .apply(&ScanSettings {
                max_pages: 0,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
