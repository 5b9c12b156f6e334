//! Emulated driver port
//!
//! An in-memory ADF device standing where a vendor runtime would plug in.
//! Profiles control sheet count, feeder noise after the batch, headless
//! refusal and vendor-window availability, so the backends' reconciliation
//! paths can all be exercised without hardware.

use super::{DriverEvent, DriverPort, DriverSession, DriverSource, OptionValue, UiMode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One emulated device
#[derive(Debug, Clone)]
pub struct EmulatedProfile {
    pub name: String,
    /// Sheets sitting in the feeder
    pub sheets: u32,
    /// Emit feeder-empty plus trailing faults after the batch
    pub noisy_feeder: bool,
    /// Refuse headless acquisition
    pub refuse_headless: bool,
    /// Vendor window available
    pub ui_supported: bool,
    /// Delay between pages
    pub page_delay: Duration,
}

impl EmulatedProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sheets: 10,
            noisy_feeder: false,
            refuse_headless: false,
            ui_supported: true,
            page_delay: Duration::from_millis(20),
        }
    }

    pub fn sheets(mut self, sheets: u32) -> Self {
        self.sheets = sheets;
        self
    }

    pub fn noisy_feeder(mut self) -> Self {
        self.noisy_feeder = true;
        self
    }

    pub fn refuse_headless(mut self) -> Self {
        self.refuse_headless = true;
        self
    }

    pub fn no_ui(mut self) -> Self {
        self.ui_supported = false;
        self
    }

    pub fn page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    fn source(&self, opened: bool) -> DriverSource {
        DriverSource {
            // Unpopulated until the device is opened, as real drivers do
            local_id: if opened { self.name.clone() } else { String::new() },
            display_name: self.name.clone(),
            adf: true,
            duplex_one_pass: true,
            duplex_two_pass: true,
            ui_required: self.refuse_headless,
            ui_supported: self.ui_supported,
            dpi_values: vec![75, 100, 150, 200, 300, 600],
            paper_sizes: vec![
                "A4".to_string(),
                "A5".to_string(),
                "Letter".to_string(),
                "Legal".to_string(),
            ],
            pixel_types: vec!["RGB".to_string(), "GRAY8".to_string(), "BW1".to_string()],
        }
    }
}

/// Emulated port holding a fleet of profiles
pub struct EmulatedPort {
    profiles: Vec<EmulatedProfile>,
}

impl EmulatedPort {
    pub fn new(profiles: Vec<EmulatedProfile>) -> Self {
        Self { profiles }
    }

    /// Uniform fleet of `count` plain ADF devices
    pub fn fleet(count: usize) -> Self {
        let profiles = (1..=count)
            .map(|i| EmulatedProfile::new(&format!("Emulated ADF {i}")))
            .collect();
        Self { profiles }
    }
}

#[async_trait]
impl DriverPort for EmulatedPort {
    fn runtime_name(&self) -> &str {
        "emulated"
    }

    async fn sources(&self) -> Result<Vec<DriverSource>> {
        Ok(self.profiles.iter().map(|p| p.source(false)).collect())
    }

    async fn open(&self, local_id: &str) -> Result<Box<dyn DriverSession>> {
        let profile = self
            .profiles
            .iter()
            .find(|p| p.name == local_id)
            .ok_or_else(|| Error::ScannerNotFound(format!("no emulated device '{local_id}'")))?;
        Ok(Box::new(EmulatedSession {
            profile: profile.clone(),
            options: HashMap::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct EmulatedSession {
    profile: EmulatedProfile,
    options: HashMap<String, OptionValue>,
    stop: Arc<AtomicBool>,
}

#[async_trait]
impl DriverSession for EmulatedSession {
    fn descriptor(&self) -> DriverSource {
        self.profile.source(true)
    }

    async fn set_option(&mut self, key: &str, value: OptionValue) -> Result<bool> {
        let descriptor = self.profile.source(true);
        let supported = match key {
            super::option_keys::DPI => match &value {
                OptionValue::Int(dpi) => descriptor.dpi_values.contains(&(*dpi as u32)),
                _ => false,
            },
            super::option_keys::PAPER_SIZE => match &value {
                OptionValue::Text(size) => descriptor.paper_sizes.iter().any(|s| s == size),
                _ => false,
            },
            super::option_keys::PIXEL_TYPE => match &value {
                OptionValue::Text(pt) => descriptor
                    .pixel_types
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(pt)),
                _ => false,
            },
            super::option_keys::USE_ADF
            | super::option_keys::DUPLEX
            | super::option_keys::DUPLEX_TWO_PASS => matches!(value, OptionValue::Bool(_)),
            super::option_keys::TRANSFER_COUNT => matches!(value, OptionValue::Int(_)),
            _ => false,
        };
        if supported {
            self.options.insert(key.to_string(), value);
        }
        Ok(supported)
    }

    async fn begin(&mut self, ui: UiMode, events: mpsc::Sender<DriverEvent>) -> Result<()> {
        match ui {
            UiMode::Headless if self.profile.refuse_headless => {
                return Err(Error::UiRequired(
                    "driver reports its window is mandatory".into(),
                ));
            }
            UiMode::NonModal | UiMode::Modal if !self.profile.ui_supported => {
                return Err(Error::ScanFailed("driver has no acquisition window".into()));
            }
            _ => {}
        }

        self.stop.store(false, Ordering::SeqCst);

        let dpi = match self.options.get(super::option_keys::DPI) {
            Some(OptionValue::Int(dpi)) => *dpi as u32,
            _ => 200,
        };
        // In UI mode the vendor window owns the transfer count
        let cap = match (ui, self.options.get(super::option_keys::TRANSFER_COUNT)) {
            (UiMode::Headless, Some(OptionValue::Int(cap))) if *cap > 0 => *cap as u32,
            _ => u32::MAX,
        };

        let profile = self.profile.clone();
        let stop = self.stop.clone();
        let total = profile.sheets.min(cap);

        tokio::spawn(async move {
            let mut transferred = 0u32;
            for page in 1..=total {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(profile.page_delay).await;
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let data = synthetic_page(page, dpi);
                let event = DriverEvent::Page {
                    data,
                    width: 64,
                    height: 64,
                    format: "png".to_string(),
                    dpi,
                };
                if events.send(event).await.is_err() {
                    return;
                }
                transferred = page;
            }

            if profile.noisy_feeder {
                // Real feeders keep signalling after the batch; the backend
                // must collapse this into one completion
                let _ = events.send(DriverEvent::FeederEmpty).await;
                let _ = events.send(DriverEvent::Fault("feeder empty".into())).await;
                let _ = events.send(DriverEvent::Fault("no media".into())).await;
            } else {
                let _ = events
                    .send(DriverEvent::Done {
                        pages: transferred,
                    })
                    .await;
            }
        });

        Ok(())
    }

    async fn abort(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.options.clear();
    }
}

/// Tiny deterministic PNG so transfers carry real image bytes
fn synthetic_page(page: u32, dpi: u32) -> Vec<u8> {
    let shade = (page * 37 % 255) as u8;
    let img = RgbImage::from_fn(64, 64, |x, y| {
        image::Rgb([shade, (x % 255) as u8, (y.wrapping_add(dpi) % 255) as u8])
    });
    let mut buf = Vec::new();
    let encoder = PngEncoder::new(&mut buf);
    if encoder
        .write_image(img.as_raw(), 64, 64, ExtendedColorType::Rgb8)
        .is_err()
    {
        // Unreachable for a well-formed buffer; keep the transfer alive
        return vec![0u8; 32];
    }
    buf
}
