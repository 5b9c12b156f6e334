//! Scanner Router - unified façade over the backends
//!
//! ## Responsibilities
//!
//! - Namespace device ids as `<backend>:<local-id>` and route calls
//! - Own the single active (backend, device) seat
//! - Fan backend events into one upward channel, re-tagged with the backend
//! - Assemble dynamic capability lists and apply settings patches
//!
//! The active seat is process-global: one device, one scan at a time.

use crate::backend::{BackendEvent, ScannerBackend};
use crate::error::{Error, Result};
use crate::models::{
    Capability, CapabilitySnapshot, Device, DeviceSettingsPatch, PageMeta, PixelType,
    ScanSettings, SettingResult, BASELINE_CAPABILITY_KEYS,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Backend events re-tagged with their protocol, fanned into the gateway
#[derive(Debug)]
pub enum ScannerEvent {
    Page {
        request_id: String,
        protocol: String,
        data: Vec<u8>,
        meta: PageMeta,
        number: u32,
    },
    Completed {
        request_id: String,
        protocol: String,
        total_pages: u32,
    },
    Error {
        request_id: String,
        protocol: String,
        message: String,
    },
}

/// The single-seat selection state
#[derive(Default)]
struct ActiveSeat {
    /// Backend tag of the selected device
    protocol: Option<String>,
    /// Backend-local id of the selected device
    local_id: Option<String>,
    /// Request id of the running scan, if any
    scanning: Option<String>,
}

/// Router instance
pub struct ScannerRouter {
    backends: RwLock<Vec<Arc<dyn ScannerBackend>>>,
    active: Arc<Mutex<ActiveSeat>>,
    /// Last-applied settings; capability listings carry these as current
    applied: Mutex<ScanSettings>,
    fan_in: mpsc::Sender<ScannerEvent>,
    events: Mutex<Option<mpsc::Receiver<ScannerEvent>>>,
}

impl ScannerRouter {
    pub fn new() -> Self {
        let (fan_in, events) = mpsc::channel(64);
        Self {
            backends: RwLock::new(Vec::new()),
            active: Arc::new(Mutex::new(ActiveSeat::default())),
            applied: Mutex::new(ScanSettings::default()),
            fan_in,
            events: Mutex::new(Some(events)),
        }
    }

    /// Take the upward event stream; the gateway consumes it exactly once
    pub async fn take_events(&self) -> Option<mpsc::Receiver<ScannerEvent>> {
        self.events.lock().await.take()
    }

    /// Register a backend and start forwarding its events
    pub async fn register(
        &self,
        backend: Arc<dyn ScannerBackend>,
        mut backend_rx: mpsc::Receiver<BackendEvent>,
    ) {
        let tag = backend.name();
        self.backends.write().await.push(backend);

        let fan_in = self.fan_in.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            while let Some(event) = backend_rx.recv().await {
                let upward = match event {
                    BackendEvent::Page {
                        request_id,
                        data,
                        meta,
                        number,
                    } => ScannerEvent::Page {
                        request_id,
                        protocol: tag.to_string(),
                        data,
                        meta,
                        number,
                    },
                    BackendEvent::Completed {
                        request_id,
                        total_pages,
                    } => {
                        release_seat(&active, &request_id).await;
                        ScannerEvent::Completed {
                            request_id,
                            protocol: tag.to_string(),
                            total_pages,
                        }
                    }
                    BackendEvent::Error {
                        request_id,
                        message,
                    } => {
                        release_seat(&active, &request_id).await;
                        ScannerEvent::Error {
                            request_id,
                            protocol: tag.to_string(),
                            message,
                        }
                    }
                };
                if fan_in.send(upward).await.is_err() {
                    tracing::warn!(backend = tag, "Event fan-in closed, stopping forwarder");
                    return;
                }
            }
        });
    }

    /// Initialize every backend; failures are captured per backend
    pub async fn initialize(&self) {
        for backend in self.backends.read().await.iter() {
            if let Err(err) = backend.initialize().await {
                tracing::warn!(backend = backend.name(), error = %err, "Backend initialization failed");
            }
        }
    }

    /// Shut backends down in reverse registration order
    pub async fn shutdown(&self) {
        for backend in self.backends.read().await.iter().rev() {
            backend.shutdown().await;
        }
    }

    async fn backend_by_tag(&self, tag: &str) -> Option<Arc<dyn ScannerBackend>> {
        self.backends
            .read()
            .await
            .iter()
            .find(|b| b.name() == tag)
            .cloned()
    }

    /// Split `<backend>:<local-id>`; a bare id belongs to backend `a`
    pub fn parse_id(id: &str) -> (&str, &str) {
        match id.split_once(':') {
            Some((tag, local)) if matches!(tag, "a" | "b" | "e") => (tag, local),
            _ => ("a", id),
        }
    }

    /// Enumerate all backends, optionally filtered, with prefixed ids
    pub async fn enumerate(&self, protocols: Option<&[String]>) -> Vec<Device> {
        let backends = self.backends.read().await.clone();
        let mut devices = Vec::new();
        for backend in backends {
            let tag = backend.name();
            if let Some(filter) = protocols {
                if !filter.iter().any(|p| p == tag) {
                    continue;
                }
            }
            for mut device in backend.enumerate().await {
                device.id = format!("{tag}:{}", device.id);
                devices.push(device);
            }
        }
        devices
    }

    /// Select a device; the seat updates atomically
    pub async fn select(&self, id: &str) -> Result<()> {
        let (tag, local_id) = Self::parse_id(id);
        let backend = self
            .backend_by_tag(tag)
            .await
            .ok_or_else(|| Error::ScannerNotFound(format!("unknown backend '{tag}'")))?;

        backend.select(local_id).await?;

        let mut active = self.active.lock().await;
        active.protocol = Some(tag.to_string());
        active.local_id = Some(local_id.to_string());
        Ok(())
    }

    /// Namespaced id of the current device
    pub async fn current_id(&self) -> Option<String> {
        let active = self.active.lock().await;
        match (&active.protocol, &active.local_id) {
            (Some(tag), Some(local)) => Some(format!("{tag}:{local}")),
            _ => None,
        }
    }

    /// Request id of the scan currently holding the seat
    pub async fn scanning(&self) -> Option<String> {
        self.active.lock().await.scanning.clone()
    }

    /// Baseline capability snapshot of the current device
    pub async fn current_capabilities(&self) -> Result<(Device, CapabilitySnapshot)> {
        let (tag, local_id) = {
            let active = self.active.lock().await;
            match (&active.protocol, &active.local_id) {
                (Some(tag), Some(local)) => (tag.clone(), local.clone()),
                _ => return Err(Error::ScannerNotFound("no device selected".into())),
            }
        };

        let backend = self
            .backend_by_tag(&tag)
            .await
            .ok_or_else(|| Error::ScannerNotFound(format!("unknown backend '{tag}'")))?;
        let snapshot = backend
            .capabilities(&local_id)
            .await
            .ok_or_else(|| Error::ScannerNotFound(format!("no capabilities for '{local_id}'")))?;

        let device = backend
            .enumerate()
            .await
            .into_iter()
            .find(|d| d.id == local_id)
            .map(|mut d| {
                d.id = format!("{tag}:{}", d.id);
                d
            })
            .unwrap_or_else(|| Device {
                id: format!("{tag}:{local_id}"),
                name: local_id.clone(),
                is_default: false,
                protocol: tag.clone(),
                capabilities: None,
            });

        Ok((device, snapshot))
    }

    /// Dynamic capability list: baseline keys in stable order, then extras,
    /// with current values taken from the last-applied settings
    pub async fn device_capabilities(&self) -> Result<(String, String, Vec<Capability>)> {
        let (device, mut snapshot) = self.current_capabilities().await?;
        let applied = self.applied.lock().await.clone();

        for key in BASELINE_CAPABILITY_KEYS {
            if let Some(capability) = snapshot.get_mut(key) {
                capability.current_value = Some(current_value_of(&applied, key));
            }
        }

        let mut capabilities = Vec::with_capacity(snapshot.len());
        for key in BASELINE_CAPABILITY_KEYS {
            if let Some(capability) = snapshot.remove(key) {
                capabilities.push(capability);
            }
        }
        // Backend extras follow, already in stable map order
        capabilities.extend(snapshot.into_values());

        Ok((device.id, device.protocol, capabilities))
    }

    /// Push canonical settings to the active backend and remember them
    pub async fn apply_settings(&self, settings: &ScanSettings) -> Result<()> {
        let backend = self.active_backend().await?;
        backend.apply(settings).await?;
        *self.applied.lock().await = settings.clone();
        Ok(())
    }

    /// Patch semantics: validate each present field against the capability
    /// snapshot, apply independently, push the merge once if anything stuck
    pub async fn apply_patch(
        &self,
        patch: &DeviceSettingsPatch,
        advanced: Option<&HashMap<String, serde_json::Value>>,
    ) -> Result<(String, String, Vec<SettingResult>)> {
        let (device, snapshot) = self.current_capabilities().await?;

        if self.scanning().await.is_some() {
            // The device cannot take settings mid-transfer
            return Ok((
                device.id,
                device.protocol,
                vec![SettingResult::rejected("scan", "scan in progress")],
            ));
        }

        let mut merged = self.applied.lock().await.clone();
        let mut results = Vec::new();
        let mut any_applied = false;

        if let Some(dpi) = patch.dpi {
            match validate_against(&snapshot, "dpi", &serde_json::json!(dpi)) {
                Ok(()) => {
                    merged.dpi = dpi;
                    any_applied = true;
                    results.push(SettingResult::applied("dpi", serde_json::json!(dpi)));
                }
                Err(message) => results.push(SettingResult::rejected("dpi", &message)),
            }
        }
        if let Some(pixel_type) = &patch.pixel_type {
            match PixelType::parse(pixel_type) {
                Some(parsed) => {
                    match validate_against(
                        &snapshot,
                        "pixelType",
                        &serde_json::json!(parsed.as_wire()),
                    ) {
                        Ok(()) => {
                            merged.pixel_type = parsed;
                            any_applied = true;
                            results.push(SettingResult::applied(
                                "pixelType",
                                serde_json::json!(parsed.as_wire()),
                            ));
                        }
                        Err(message) => {
                            results.push(SettingResult::rejected("pixelType", &message))
                        }
                    }
                }
                None => results.push(SettingResult::rejected(
                    "pixelType",
                    &format!("unsupported pixelType: {pixel_type}"),
                )),
            }
        }
        if let Some(paper_size) = &patch.paper_size {
            match validate_against(&snapshot, "paperSize", &serde_json::json!(paper_size)) {
                Ok(()) => {
                    merged.paper_size = paper_size.clone();
                    any_applied = true;
                    results.push(SettingResult::applied(
                        "paperSize",
                        serde_json::json!(paper_size),
                    ));
                }
                Err(message) => results.push(SettingResult::rejected("paperSize", &message)),
            }
        }
        if let Some(duplex) = patch.duplex {
            match validate_against(&snapshot, "duplex", &serde_json::json!(duplex)) {
                Ok(()) => {
                    merged.duplex = duplex;
                    any_applied = true;
                    results.push(SettingResult::applied("duplex", serde_json::json!(duplex)));
                }
                Err(message) => results.push(SettingResult::rejected("duplex", &message)),
            }
        }
        if let Some(use_adf) = patch.use_adf {
            match validate_against(&snapshot, "useAdf", &serde_json::json!(use_adf)) {
                Ok(()) => {
                    merged.use_adf = use_adf;
                    any_applied = true;
                    results.push(SettingResult::applied("useAdf", serde_json::json!(use_adf)));
                }
                Err(message) => results.push(SettingResult::rejected("useAdf", &message)),
            }
        }
        if let Some(max_pages) = patch.max_pages {
            if max_pages == 0 {
                results.push(SettingResult::rejected(
                    "maxPages",
                    "maxPages must be -1 or positive",
                ));
            } else {
                merged.max_pages = max_pages;
                any_applied = true;
                results.push(SettingResult::applied(
                    "maxPages",
                    serde_json::json!(max_pages),
                ));
            }
        }
        if let Some(show_ui) = patch.show_ui {
            match validate_against(&snapshot, "showUI", &serde_json::json!(show_ui)) {
                Ok(()) => {
                    merged.show_ui = show_ui;
                    any_applied = true;
                    results.push(SettingResult::applied("showUI", serde_json::json!(show_ui)));
                }
                Err(message) => results.push(SettingResult::rejected("showUI", &message)),
            }
        }

        if any_applied {
            let backend = self.active_backend().await?;
            backend.apply(&merged).await?;
            *self.applied.lock().await = merged;
        }

        if let Some(advanced) = advanced {
            let backend = self.active_backend().await?;
            for (key, value) in advanced {
                match backend.apply_advanced(key, value).await {
                    Ok(applied_value) => {
                        results.push(SettingResult::applied(key, applied_value))
                    }
                    Err(err) => results.push(SettingResult::rejected(key, &err.to_string())),
                }
            }
        }

        Ok((device.id, device.protocol, results))
    }

    /// Begin a scan on the active device; the seat admits one job
    pub async fn start(&self, request_id: &str) -> Result<()> {
        {
            let active = self.active.lock().await;
            if let Some(running) = &active.scanning {
                return Err(Error::ScannerBusy(format!(
                    "scan '{running}' is already running"
                )));
            }
        }

        let backend = self.active_backend().await?;
        backend.start(request_id).await?;

        self.active.lock().await.scanning = Some(request_id.to_string());
        Ok(())
    }

    /// Abort the running scan, if any; safe to call at any time
    pub async fn stop(&self) {
        let tag = {
            let mut active = self.active.lock().await;
            active.scanning = None;
            active.protocol.clone()
        };
        if let Some(tag) = tag {
            if let Some(backend) = self.backend_by_tag(&tag).await {
                backend.stop().await;
            }
        }
    }

    async fn active_backend(&self) -> Result<Arc<dyn ScannerBackend>> {
        let tag = {
            let active = self.active.lock().await;
            active
                .protocol
                .clone()
                .ok_or_else(|| Error::ScannerNotFound("no device selected".into()))?
        };
        self.backend_by_tag(&tag)
            .await
            .ok_or_else(|| Error::ScannerNotFound(format!("unknown backend '{tag}'")))
    }
}

impl Default for ScannerRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Clear the scanning seat when its job reaches a terminal event
async fn release_seat(active: &Arc<Mutex<ActiveSeat>>, request_id: &str) {
    let mut active = active.lock().await;
    if active.scanning.as_deref() == Some(request_id) {
        active.scanning = None;
    }
}

/// Check a value against a capability's writability and supported list
fn validate_against(
    snapshot: &CapabilitySnapshot,
    key: &str,
    value: &serde_json::Value,
) -> std::result::Result<(), String> {
    let Some(capability) = snapshot.get(key) else {
        return Err(format!("device has no '{key}' capability"));
    };
    if !capability.is_writable {
        return Err(format!("'{key}' is read-only"));
    }
    if let Some(supported) = &capability.supported_values {
        let matches = supported.iter().any(|candidate| {
            match (candidate.as_str(), value.as_str()) {
                // Enum values compare case-insensitively
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => candidate == value,
            }
        });
        if !matches {
            return Err(format!("'{value}' is not supported for '{key}'"));
        }
    }
    Ok(())
}

fn current_value_of(applied: &ScanSettings, key: &str) -> serde_json::Value {
    match key {
        "dpi" => serde_json::json!(applied.dpi),
        "pixelType" => serde_json::json!(applied.pixel_type.as_wire()),
        "paperSize" => serde_json::json!(applied.paper_size),
        "useAdf" => serde_json::json!(applied.use_adf),
        "duplex" => serde_json::json!(applied.duplex),
        "maxPages" => serde_json::json!(applied.max_pages),
        "showUI" => serde_json::json!(applied.show_ui),
        _ => serde_json::Value::Null,
    }
}
