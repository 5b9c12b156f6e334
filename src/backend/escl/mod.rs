//! Backend `e` - network scanners over HTTP+XML
//!
//! ## Responsibilities
//!
//! - Discover devices by probing candidate hosts and taking manual
//!   registrations
//! - Create scan jobs and drain their documents page by page
//! - Feed the drained pages through the same terminal reconciliation the
//!   local families use
//!
//! Devices ship self-signed certificates; the HTTP client accepts them.

mod xml;

use super::{relay_driver_events, ActiveJob, BackendEvent, BackendState, ScannerBackend};
use crate::driver::DriverEvent;
use crate::error::{Error, Result};
use crate::models::{
    Capability, CapabilitySnapshot, CapabilityType, Device, PixelType, ScanSettings,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Request timeout for device HTTP calls
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Probe timeout during discovery
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Fixed backoff while the device answers 503 between pages
const BUSY_BACKOFF: Duration = Duration::from_millis(500);
/// Bounded 503 retries per document
const BUSY_RETRIES: u32 = 60;

/// A discovered network scanner
#[derive(Debug, Clone)]
struct EsclDevice {
    /// `host[:port]` as registered; doubles as the local device id
    host: String,
    /// Resolved service root, e.g. `http://10.0.0.9:8080/eSCL`
    base_url: String,
    name: String,
    dpi_values: Vec<u32>,
    pixel_types: Vec<String>,
    adf: bool,
    duplex: bool,
}

pub struct EsclBackend {
    client: reqwest::Client,
    probe_client: reqwest::Client,
    events: mpsc::Sender<BackendEvent>,
    state: Arc<Mutex<BackendState>>,
    job: Arc<Mutex<Option<ActiveJob>>>,
    devices: Mutex<HashMap<String, EsclDevice>>,
    candidates: Mutex<Vec<String>>,
    selected: Mutex<Option<String>>,
    applied: Mutex<ScanSettings>,
    stop_flag: Arc<AtomicBool>,
}

impl EsclBackend {
    pub fn new(candidates: Vec<String>, events: mpsc::Sender<BackendEvent>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            // Scanners ship self-signed certificates
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to build HTTP client");
        let probe_client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("Failed to build probe client");

        Self {
            client,
            probe_client,
            events,
            state: Arc::new(Mutex::new(BackendState::Uninitialized)),
            job: Arc::new(Mutex::new(None)),
            devices: Mutex::new(HashMap::new()),
            candidates: Mutex::new(candidates),
            selected: Mutex::new(None),
            applied: Mutex::new(ScanSettings::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Register a `host[:port]` by hand and probe it right away
    pub async fn register_host(&self, host: &str) -> Result<()> {
        {
            let mut candidates = self.candidates.lock().await;
            if !candidates.iter().any(|c| c == host) {
                candidates.push(host.to_string());
            }
        }
        match self.probe_host(host).await {
            Some(device) => {
                tracing::info!(backend = "e", host, name = %device.name, "Scanner registered");
                self.devices.lock().await.insert(device.host.clone(), device);
                Ok(())
            }
            None => Err(Error::ScannerNotFound(format!(
                "no scan service answered at {host}"
            ))),
        }
    }

    /// Probe every candidate host; called periodically and on enumeration
    pub async fn discover(&self) {
        let candidates = self.candidates.lock().await.clone();
        if candidates.is_empty() {
            return;
        }

        let probes = candidates.iter().map(|host| self.probe_host(host));
        let results = futures_util::future::join_all(probes).await;

        let mut devices = self.devices.lock().await;
        for device in results.into_iter().flatten() {
            tracing::debug!(backend = "e", host = %device.host, name = %device.name, "Scanner discovered");
            devices.insert(device.host.clone(), device);
        }
    }

    /// Try the usual service roots on one host
    async fn probe_host(&self, host: &str) -> Option<EsclDevice> {
        let bases = if host.contains(':') {
            vec![format!("http://{host}/eSCL"), format!("https://{host}/eSCL")]
        } else {
            vec![
                format!("http://{host}/eSCL"),
                format!("http://{host}:8080/eSCL"),
                format!("https://{host}/eSCL"),
            ]
        };

        for base in bases {
            let url = format!("{base}/ScannerCapabilities");
            match self.probe_client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if let Ok(body) = resp.text().await {
                        if let Some(device) = parse_capabilities(host, &base, &body) {
                            return Some(device);
                        }
                    }
                }
                Ok(resp) => {
                    tracing::debug!(backend = "e", url = %url, status = %resp.status(), "Probe rejected");
                }
                Err(err) => {
                    tracing::debug!(backend = "e", url = %url, error = %err, "Probe failed");
                }
            }
        }
        None
    }

    async fn selected_device(&self) -> Result<EsclDevice> {
        let selected = self.selected.lock().await.clone();
        let host = selected.ok_or_else(|| Error::ScannerNotFound("no device selected".into()))?;
        self.devices
            .lock()
            .await
            .get(&host)
            .cloned()
            .ok_or_else(|| Error::ScannerNotFound(format!("scanner '{host}' is gone")))
    }
}

#[async_trait]
impl ScannerBackend for EsclBackend {
    fn name(&self) -> &'static str {
        "e"
    }

    async fn initialize(&self) -> Result<()> {
        *self.state.lock().await = BackendState::Ready;
        self.discover().await;
        let found = self.devices.lock().await.len();
        tracing::info!(backend = "e", devices = found, "Backend initialized");
        Ok(())
    }

    async fn shutdown(&self) {
        self.stop().await;
        self.devices.lock().await.clear();
        *self.selected.lock().await = None;
        *self.state.lock().await = BackendState::Uninitialized;
        tracing::info!(backend = "e", "Backend shut down");
    }

    async fn enumerate(&self) -> Vec<Device> {
        if self.devices.lock().await.is_empty() {
            self.discover().await;
        }
        self.devices
            .lock()
            .await
            .values()
            .map(|device| Device {
                id: device.host.clone(),
                name: device.name.clone(),
                is_default: false,
                protocol: "e".to_string(),
                capabilities: None,
            })
            .collect()
    }

    async fn select(&self, local_id: &str) -> Result<()> {
        if !self.devices.lock().await.contains_key(local_id) {
            // The device may have been registered since the last sweep
            self.discover().await;
        }
        if !self.devices.lock().await.contains_key(local_id) {
            return Err(Error::ScannerNotFound(format!("unknown scanner '{local_id}'")));
        }
        *self.selected.lock().await = Some(local_id.to_string());
        *self.state.lock().await = BackendState::DeviceOpen;
        tracing::info!(backend = "e", device = %local_id, "Device selected");
        Ok(())
    }

    async fn capabilities(&self, local_id: &str) -> Option<CapabilitySnapshot> {
        let device = self.devices.lock().await.get(local_id).cloned()?;
        let applied = self.applied.lock().await.clone();

        let mut snapshot = CapabilitySnapshot::new();
        snapshot.insert(
            "dpi".to_string(),
            Capability::new("dpi", "Resolution", CapabilityType::Int)
                .with_values(device.dpi_values.iter().map(|d| serde_json::json!(d)).collect())
                .with_current(serde_json::json!(applied.dpi)),
        );
        snapshot.insert(
            "pixelType".to_string(),
            Capability::new("pixelType", "Color mode", CapabilityType::Enum)
                .with_values(
                    device
                        .pixel_types
                        .iter()
                        .map(|p| serde_json::json!(p))
                        .collect(),
                )
                .with_current(serde_json::json!(applied.pixel_type.as_wire())),
        );
        snapshot.insert(
            "paperSize".to_string(),
            Capability::new("paperSize", "Paper size", CapabilityType::Enum)
                .with_values(vec![
                    serde_json::json!("A4"),
                    serde_json::json!("Letter"),
                    serde_json::json!("Legal"),
                ])
                .with_current(serde_json::json!(applied.paper_size)),
        );
        snapshot.insert(
            "useAdf".to_string(),
            Capability::new("useAdf", "Use document feeder", CapabilityType::Bool)
                .with_values(if device.adf {
                    vec![serde_json::json!(true), serde_json::json!(false)]
                } else {
                    vec![serde_json::json!(false)]
                })
                .with_current(serde_json::json!(applied.use_adf)),
        );
        snapshot.insert(
            "duplex".to_string(),
            Capability::new("duplex", "Two-sided", CapabilityType::Bool)
                .with_values(if device.duplex {
                    vec![serde_json::json!(true), serde_json::json!(false)]
                } else {
                    vec![serde_json::json!(false)]
                })
                .with_current(serde_json::json!(applied.duplex)),
        );
        snapshot.insert(
            "maxPages".to_string(),
            Capability::new("maxPages", "Page limit", CapabilityType::Int)
                .with_current(serde_json::json!(applied.max_pages)),
        );
        snapshot.insert(
            "showUI".to_string(),
            Capability::new("showUI", "Show driver window", CapabilityType::Bool)
                .with_values(vec![serde_json::json!(false)])
                .with_current(serde_json::json!(false)),
        );
        snapshot.insert(
            "e.address".to_string(),
            Capability::new("e.address", "Network address", CapabilityType::String)
                .read_only()
                .experimental()
                .with_current(serde_json::json!(device.host)),
        );
        Some(snapshot)
    }

    async fn apply(&self, settings: &ScanSettings) -> Result<()> {
        if settings.max_pages == 0 {
            return Err(Error::InvalidRequest("maxPages must be -1 or positive".into()));
        }
        // Settings travel with the job creation request; nothing to push yet
        let device = self.selected_device().await?;
        if !device
            .pixel_types
            .iter()
            .any(|p| p.eq_ignore_ascii_case(settings.pixel_type.as_wire()))
        {
            tracing::debug!(backend = "e", pixel_type = settings.pixel_type.as_wire(),
                "Device does not list the requested color mode, sending anyway");
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
        value: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        match key {
            // Manual registration of a scanner the probe sweep cannot see
            "e.registerHost" | "registerHost" => {
                let host = value
                    .as_str()
                    .ok_or_else(|| Error::InvalidRequest("registerHost expects a string".into()))?;
                self.register_host(host).await?;
                Ok(serde_json::json!(host))
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

        let device = self.selected_device().await?;
        let settings = self.applied.lock().await.clone();

        // Create the job up front so a refused request fails the start
        let body = build_job_request(&settings);
        let response = self
            .client
            .post(format!("{}/ScanJobs", device.base_url))
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|err| Error::ScanFailed(format!("job creation failed: {err}")))?;

        if !response.status().is_success() {
            return Err(Error::ScanFailed(format!(
                "device refused the job: HTTP {}",
                response.status()
            )));
        }

        let job_url = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|loc| resolve_job_url(&device.base_url, loc))
            .ok_or_else(|| Error::ScanFailed("device returned no job location".into()))?;

        *self.job.lock().await = Some(ActiveJob::new(request_id));
        self.stop_flag.store(false, Ordering::SeqCst);

        let (driver_tx, driver_rx) = mpsc::channel(32);
        let events = self.events.clone();
        let job = self.job.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            relay_driver_events("e", driver_rx, events, job, state).await;
        });

        let client = self.client.clone();
        let stop_flag = self.stop_flag.clone();
        let max_pages = settings.max_pages;
        let dpi = settings.dpi;
        tokio::spawn(async move {
            drain_job(client, job_url, driver_tx, stop_flag, max_pages, dpi).await;
        });

        *self.state.lock().await = BackendState::Scanning;
        tracing::info!(backend = "e", request_id, "Acquisition started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(job) = self.job.lock().await.as_mut() {
            job.terminated = true;
        }
        self.stop_flag.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if *state == BackendState::Scanning {
            *state = BackendState::DeviceOpen;
        }
    }
}

/// Pull documents off the device until the batch ends
///
/// Retries 503 with fixed backoff, treats 404 as end of batch, stops on the
/// first other 4xx, and always deletes the job on the way out.
async fn drain_job(
    client: reqwest::Client,
    job_url: String,
    driver_tx: mpsc::Sender<DriverEvent>,
    stop_flag: Arc<AtomicBool>,
    max_pages: i32,
    dpi: u32,
) {
    let mut pages = 0u32;
    let mut busy_retries = 0u32;

    loop {
        if stop_flag.load(Ordering::SeqCst) {
            break;
        }

        let response = match client.get(format!("{job_url}/NextDocument")).send().await {
            Ok(response) => response,
            Err(err) => {
                let _ = driver_tx
                    .send(DriverEvent::Fault(format!("transfer failed: {err}")))
                    .await;
                break;
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            busy_retries += 1;
            if busy_retries > BUSY_RETRIES {
                let _ = driver_tx
                    .send(DriverEvent::Fault("device stayed busy".into()))
                    .await;
                break;
            }
            tokio::time::sleep(BUSY_BACKOFF).await;
            continue;
        }
        busy_retries = 0;

        if status == reqwest::StatusCode::NOT_FOUND {
            // End of batch
            let _ = driver_tx.send(DriverEvent::Done { pages }).await;
            break;
        }
        if !status.is_success() {
            let _ = driver_tx
                .send(DriverEvent::Fault(format!("transfer failed: HTTP {status}")))
                .await;
            break;
        }

        let format = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(format_from_content_type)
            .unwrap_or("jpg")
            .to_string();

        let data = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(err) => {
                let _ = driver_tx
                    .send(DriverEvent::Fault(format!("document read failed: {err}")))
                    .await;
                break;
            }
        };

        let (width, height) = image_dimensions(&data);
        pages += 1;
        if driver_tx
            .send(DriverEvent::Page {
                data,
                width,
                height,
                format,
                dpi,
            })
            .await
            .is_err()
        {
            break;
        }

        if max_pages > 0 && pages >= max_pages as u32 {
            let _ = driver_tx.send(DriverEvent::Done { pages }).await;
            break;
        }
    }

    if let Err(err) = client.delete(&job_url).send().await {
        tracing::debug!(backend = "e", error = %err, "Job deletion failed");
    }
}

/// Header-only dimension read; zero when the format is unknown
fn image_dimensions(data: &[u8]) -> (u32, u32) {
    image::ImageReader::new(std::io::Cursor::new(data))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .unwrap_or((0, 0))
}

fn format_from_content_type(content_type: &str) -> &'static str {
    let lower = content_type.to_ascii_lowercase();
    if lower.contains("png") {
        "png"
    } else if lower.contains("pdf") {
        "pdf"
    } else {
        "jpg"
    }
}

/// Job locations come back absolute or service-relative depending on firmware
fn resolve_job_url(base_url: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.trim_end_matches('/').to_string();
    }
    // Root-relative: keep scheme and authority of the base
    if let Some(scheme_end) = base_url.find("://") {
        if let Some(path_start) = base_url[scheme_end + 3..].find('/') {
            let authority = &base_url[..scheme_end + 3 + path_start];
            return format!("{authority}{}", location.trim_end_matches('/'));
        }
    }
    format!("{}{}", base_url.trim_end_matches('/'), location.trim_end_matches('/'))
}

/// Map wire color modes to the protocol's names
fn pixel_type_to_color_mode(pixel_type: PixelType) -> &'static str {
    match pixel_type {
        PixelType::Rgb => "RGB24",
        PixelType::Gray8 => "Grayscale8",
        PixelType::Bw1 => "BlackAndWhite1",
    }
}

fn color_mode_to_pixel_type(mode: &str) -> Option<&'static str> {
    match mode.to_ascii_uppercase().as_str() {
        "RGB24" | "RGB48" => Some("RGB"),
        "GRAYSCALE8" | "GRAYSCALE16" => Some("GRAY8"),
        "BLACKANDWHITE1" => Some("BW1"),
        _ => None,
    }
}

/// Build the job creation document from canonical settings
fn build_job_request(settings: &ScanSettings) -> String {
    let input_source = if settings.use_adf { "Feeder" } else { "Platen" };
    let duplex = if settings.duplex && settings.use_adf {
        "\n  <scan:Duplex>true</scan:Duplex>"
    } else {
        ""
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScanSettings xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.63</pwg:Version>
  <pwg:InputSource>{}</pwg:InputSource>
  <scan:ColorMode>{}</scan:ColorMode>
  <scan:XResolution>{}</scan:XResolution>
  <scan:YResolution>{}</scan:YResolution>{}
  <pwg:DocumentFormat>image/jpeg</pwg:DocumentFormat>
</scan:ScanSettings>"#,
        input_source,
        pixel_type_to_color_mode(settings.pixel_type),
        settings.dpi,
        settings.dpi,
        duplex,
    )
}

/// Parse a capabilities document into a device entry
fn parse_capabilities(host: &str, base_url: &str, body: &str) -> Option<EsclDevice> {
    // A capabilities document without a version is not a scan service
    xml::extract_value(body, "Version")?;

    let name = xml::extract_value(body, "MakeAndModel")
        .unwrap_or_else(|| format!("Network scanner at {host}"));

    let mut dpi_values: Vec<u32> = xml::collect_values(body, "XResolution")
        .into_iter()
        .filter_map(|v| v.parse().ok())
        .collect();
    dpi_values.sort_unstable();
    dpi_values.dedup();
    if dpi_values.is_empty() {
        dpi_values = vec![200, 300];
    }

    let mut pixel_types: Vec<String> = xml::collect_values(body, "ColorMode")
        .iter()
        .filter_map(|m| color_mode_to_pixel_type(m))
        .map(String::from)
        .collect();
    pixel_types.dedup();
    if pixel_types.is_empty() {
        pixel_types = vec!["RGB".to_string()];
    }

    Some(EsclDevice {
        host: host.to_string(),
        base_url: base_url.to_string(),
        name,
        dpi_values,
        pixel_types,
        adf: xml::has_section(body, "Adf"),
        duplex: xml::has_section(body, "AdfDuplexInputCaps"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: &str = r#"<?xml version="1.0"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.63</pwg:Version>
  <pwg:MakeAndModel>ACME ScanJet 9000</pwg:MakeAndModel>
  <scan:ColorMode>RGB24</scan:ColorMode>
  <scan:ColorMode>Grayscale8</scan:ColorMode>
  <scan:XResolution>300</scan:XResolution>
  <scan:XResolution>200</scan:XResolution>
  <scan:Adf><scan:AdfDuplexInputCaps/></scan:Adf>
</scan:ScannerCapabilities>"#;

    #[test]
    fn parses_capabilities_document() {
        let device = parse_capabilities("10.0.0.9", "http://10.0.0.9/eSCL", CAPS).unwrap();
        assert_eq!(device.name, "ACME ScanJet 9000");
        assert_eq!(device.dpi_values, vec![200, 300]);
        assert_eq!(device.pixel_types, vec!["RGB", "GRAY8"]);
        assert!(device.adf);
        assert!(device.duplex);
    }

    #[test]
    fn rejects_non_scan_services() {
        assert!(parse_capabilities("h", "http://h/eSCL", "<html>login</html>").is_none());
    }

    #[test]
    fn job_request_carries_settings() {
        let body = build_job_request(&ScanSettings {
            dpi: 300,
            duplex: true,
            ..Default::default()
        });
        assert!(body.contains("<pwg:InputSource>Feeder</pwg:InputSource>"));
        assert!(body.contains("<scan:ColorMode>RGB24</scan:ColorMode>"));
        assert!(body.contains("<scan:XResolution>300</scan:XResolution>"));
        assert!(body.contains("<scan:Duplex>true</scan:Duplex>"));

        let platen = build_job_request(&ScanSettings {
            use_adf: false,
            duplex: true,
            ..Default::default()
        });
        assert!(platen.contains("<pwg:InputSource>Platen</pwg:InputSource>"));
        // Duplex only makes sense on the feeder
        assert!(!platen.contains("Duplex"));
    }

    #[test]
    fn job_urls_resolve_relative_and_absolute() {
        assert_eq!(
            resolve_job_url("http://10.0.0.9:8080/eSCL", "/eSCL/ScanJobs/123"),
            "http://10.0.0.9:8080/eSCL/ScanJobs/123"
        );
        assert_eq!(
            resolve_job_url("http://10.0.0.9/eSCL", "http://10.0.0.9/eSCL/ScanJobs/9/"),
            "http://10.0.0.9/eSCL/ScanJobs/9"
        );
    }

    #[test]
    fn color_mode_mapping_is_case_insensitive() {
        assert_eq!(color_mode_to_pixel_type("rgb24"), Some("RGB"));
        assert_eq!(color_mode_to_pixel_type("Grayscale8"), Some("GRAY8"));
        assert_eq!(color_mode_to_pixel_type("BlackAndWhite1"), Some("BW1"));
        assert_eq!(color_mode_to_pixel_type("CMYK32"), None);
    }

    #[test]
    fn content_type_maps_to_format_tag() {
        assert_eq!(format_from_content_type("image/jpeg"), "jpg");
        assert_eq!(format_from_content_type("image/png"), "png");
        assert_eq!(format_from_content_type("application/pdf"), "pdf");
        assert_eq!(format_from_content_type("application/octet-stream"), "jpg");
    }
}
