//! Shared domain models
//!
//! Device descriptors, capability snapshots, scan settings and page metadata
//! used across the backends, the router and the gateway.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Baseline capability keys every backend answers for
pub const BASELINE_CAPABILITY_KEYS: [&str; 7] = [
    "dpi",
    "pixelType",
    "paperSize",
    "useAdf",
    "duplex",
    "maxPages",
    "showUI",
];

/// A scanner reachable through one of the backends
///
/// `id` is namespaced `<backend>:<local-id>`; the bare local id only exists
/// inside the owning backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub is_default: bool,
    /// Backend tag (`a`, `b`, `e`)
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySnapshot>,
}

/// Value type of a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityType {
    Bool,
    Int,
    Enum,
    String,
}

/// One capability of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub key: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub value_type: CapabilityType,
    pub is_readable: bool,
    pub is_writable: bool,
    pub experimental: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_values: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<serde_json::Value>,
}

impl Capability {
    pub fn new(key: &str, label: &str, value_type: CapabilityType) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            description: None,
            value_type,
            is_readable: true,
            is_writable: true,
            experimental: false,
            supported_values: None,
            current_value: None,
        }
    }

    pub fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.is_writable = false;
        self
    }

    pub fn with_values(mut self, values: Vec<serde_json::Value>) -> Self {
        self.supported_values = Some(values);
        self
    }

    pub fn with_current(mut self, value: serde_json::Value) -> Self {
        self.current_value = Some(value);
        self
    }
}

/// Capability snapshot of a device, key -> descriptor
///
/// A `BTreeMap` keeps wire output stable across enumerations.
pub type CapabilitySnapshot = BTreeMap<String, Capability>;

/// Pixel representation of transferred pages
///
/// Canonical form is uppercase on the wire; parsing is case-insensitive and
/// accepts the common aliases clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PixelType {
    /// 24-bit color
    Rgb,
    /// 8-bit grayscale
    Gray8,
    /// 1-bit bitonal
    Bw1,
}

impl PixelType {
    pub fn as_wire(&self) -> &'static str {
        match self {
            PixelType::Rgb => "RGB",
            PixelType::Gray8 => "GRAY8",
            PixelType::Bw1 => "BW1",
        }
    }

    /// Case-insensitive parse
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RGB" | "COLOR" | "COLOUR" => Some(PixelType::Rgb),
            "GRAY8" | "GREY8" | "GRAY" | "GRAYSCALE" => Some(PixelType::Gray8),
            "BW1" | "BW" | "BITONAL" | "MONO" | "BLACKANDWHITE" => Some(PixelType::Bw1),
            _ => None,
        }
    }
}

impl TryFrom<String> for PixelType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        PixelType::parse(&value).ok_or_else(|| format!("unsupported pixelType: {value}"))
    }
}

impl From<PixelType> for String {
    fn from(value: PixelType) -> Self {
        value.as_wire().to_string()
    }
}

/// Request-scoped scan settings
///
/// Defaults match the wire contract; clients send only the fields they care
/// about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSettings {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_pixel_type")]
    pub pixel_type: PixelType,
    #[serde(default = "default_paper_size")]
    pub paper_size: String,
    #[serde(default)]
    pub duplex: bool,
    #[serde(default)]
    pub show_ui: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default = "default_use_adf")]
    pub use_adf: bool,
    /// -1 = unlimited, positive = hard cap, 0 = invalid
    #[serde(default = "default_max_pages")]
    pub max_pages: i32,
    #[serde(default)]
    pub continuous_scan: bool,
    /// Backend filter for enumeration; absent = all backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols: Option<Vec<String>>,
}

fn default_dpi() -> u32 {
    200
}

fn default_pixel_type() -> PixelType {
    PixelType::Rgb
}

fn default_paper_size() -> String {
    "A4".to_string()
}

fn default_use_adf() -> bool {
    true
}

fn default_max_pages() -> i32 {
    -1
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            pixel_type: default_pixel_type(),
            paper_size: default_paper_size(),
            duplex: false,
            show_ui: false,
            source: None,
            use_adf: default_use_adf(),
            max_pages: default_max_pages(),
            continuous_scan: false,
            protocols: None,
        }
    }
}

/// Partial device-settings update; each present field is validated and
/// applied independently
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paper_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplex: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_adf: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_ui: Option<bool>,
}

impl DeviceSettingsPatch {
    pub fn is_empty(&self) -> bool {
        self.dpi.is_none()
            && self.pixel_type.is_none()
            && self.paper_size.is_none()
            && self.duplex.is_none()
            && self.use_adf.is_none()
            && self.max_pages.is_none()
            && self.show_ui.is_none()
    }
}

/// Outcome of applying one patch field
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingResult {
    pub key: String,
    pub status: SettingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingStatus {
    Applied,
    Rejected,
}

impl SettingResult {
    pub fn applied(key: &str, value: serde_json::Value) -> Self {
        Self {
            key: key.to_string(),
            status: SettingStatus::Applied,
            message: None,
            applied_value: Some(value),
        }
    }

    pub fn rejected(key: &str, message: &str) -> Self {
        Self {
            key: key.to_string(),
            status: SettingStatus::Rejected,
            message: Some(message.to_string()),
            applied_value: None,
        }
    }
}

/// Metadata travelling with every page frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    pub width: u32,
    pub height: u32,
    /// Encoded format tag ("png", "jpg", "raw", ...)
    pub format: String,
    /// Encoded byte size
    pub size: u64,
    pub dpi: u32,
}

/// One transferred page; immutable after creation
#[derive(Debug, Clone)]
pub struct Page {
    pub data: Vec<u8>,
    pub meta: PageMeta,
    /// 1-based ordinal within the job
    pub number: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_type_parses_case_insensitively() {
        assert_eq!(PixelType::parse("rgb"), Some(PixelType::Rgb));
        assert_eq!(PixelType::parse("Gray8"), Some(PixelType::Gray8));
        assert_eq!(PixelType::parse("BW1"), Some(PixelType::Bw1));
        assert_eq!(PixelType::parse("color"), Some(PixelType::Rgb));
        assert_eq!(PixelType::parse("cmyk"), None);
    }

    #[test]
    fn pixel_type_serializes_canonical_uppercase() {
        let json = serde_json::to_string(&PixelType::Gray8).unwrap();
        assert_eq!(json, "\"GRAY8\"");
        let back: PixelType = serde_json::from_str("\"gray8\"").unwrap();
        assert_eq!(back, PixelType::Gray8);
    }

    #[test]
    fn scan_settings_defaults_match_wire_contract() {
        let settings: ScanSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.dpi, 200);
        assert_eq!(settings.pixel_type, PixelType::Rgb);
        assert_eq!(settings.paper_size, "A4");
        assert!(!settings.duplex);
        assert!(!settings.show_ui);
        assert!(settings.use_adf);
        assert_eq!(settings.max_pages, -1);
        assert!(!settings.continuous_scan);
        assert!(settings.protocols.is_none());
    }

    #[test]
    fn scan_settings_roundtrip_preserves_fields() {
        let json = r#"{"dpi":300,"pixelType":"Gray8","useAdf":true,"maxPages":2}"#;
        let settings: ScanSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.dpi, 300);
        assert_eq!(settings.pixel_type, PixelType::Gray8);
        assert_eq!(settings.max_pages, 2);

        let encoded = serde_json::to_string(&settings).unwrap();
        let again: ScanSettings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(again.dpi, settings.dpi);
        assert_eq!(again.pixel_type, settings.pixel_type);
        assert_eq!(again.paper_size, settings.paper_size);
        assert_eq!(again.max_pages, settings.max_pages);
    }

    #[test]
    fn patch_emptiness() {
        assert!(DeviceSettingsPatch::default().is_empty());
        let patch = DeviceSettingsPatch {
            dpi: Some(300),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn device_serializes_camel_case() {
        let device = Device {
            id: "a:Front Desk".to_string(),
            name: "Front Desk".to_string(),
            is_default: true,
            protocol: "a".to_string(),
            capabilities: None,
        };
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["isDefault"], true);
        assert_eq!(json["protocol"], "a");
        assert!(json.get("capabilities").is_none());
    }
}
