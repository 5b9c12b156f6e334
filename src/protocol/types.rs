//! Wire protocol message types
//!
//! One logical JSON request per text frame; responses echo the client's
//! `requestId`. Keys are lower camel case, null-valued optionals are
//! omitted, timestamps are ISO-8601 UTC.

use crate::models::{
    Capability, Device, DeviceSettingsPatch, PageMeta, ScanSettings, SettingResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Client-to-server request, tagged by `action`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Authenticate {
        request_id: String,
        #[serde(default)]
        client_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Ping {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ListScanners {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    #[serde(rename_all = "camelCase")]
    SelectScanner {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    #[serde(rename_all = "camelCase")]
    GetCapabilities {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetDeviceCapabilities {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApplyDeviceSettings {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        patch: Option<DeviceSettingsPatch>,
        #[serde(default)]
        advanced: Option<HashMap<String, serde_json::Value>>,
    },
    #[serde(rename_all = "camelCase")]
    Scan {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        settings: Option<ScanSettings>,
    },
    #[serde(rename_all = "camelCase")]
    StopScan {
        request_id: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl Request {
    pub fn request_id(&self) -> &str {
        match self {
            Request::Authenticate { request_id, .. }
            | Request::Ping { request_id, .. }
            | Request::ListScanners { request_id, .. }
            | Request::SelectScanner { request_id, .. }
            | Request::GetCapabilities { request_id, .. }
            | Request::GetDeviceCapabilities { request_id, .. }
            | Request::ApplyDeviceSettings { request_id, .. }
            | Request::Scan { request_id, .. }
            | Request::StopScan { request_id, .. } => request_id,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Request::Authenticate { .. } => None,
            Request::Ping { token, .. }
            | Request::ListScanners { token, .. }
            | Request::SelectScanner { token, .. }
            | Request::GetCapabilities { token, .. }
            | Request::GetDeviceCapabilities { token, .. }
            | Request::ApplyDeviceSettings { token, .. }
            | Request::Scan { token, .. }
            | Request::StopScan { token, .. } => token.as_deref(),
        }
    }

    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            Request::Authenticate { .. } => "authenticate",
            Request::Ping { .. } => "ping",
            Request::ListScanners { .. } => "list_scanners",
            Request::SelectScanner { .. } => "select_scanner",
            Request::GetCapabilities { .. } => "get_capabilities",
            Request::GetDeviceCapabilities { .. } => "get_device_capabilities",
            Request::ApplyDeviceSettings { .. } => "apply_device_settings",
            Request::Scan { .. } => "scan",
            Request::StopScan { .. } => "stop_scan",
        }
    }

    /// Only `authenticate` and `ping` bypass the token check
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Request::Authenticate { .. } | Request::Ping { .. })
    }
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
    Scanning,
    Completed,
    Cancelled,
}

/// Server-to-client frame: common envelope plus an action-specific body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame<T: Serialize> {
    pub status: Status,
    pub action: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub body: T,
}

impl<T: Serialize> Frame<T> {
    pub fn new(status: Status, action: &str, request_id: &str, body: T) -> Self {
        Self {
            status,
            action: action.to_string(),
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            message: None,
            body,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }
}

/// Body with no action-specific fields
#[derive(Debug, Clone, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthBody {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannersBody {
    pub scanners: Vec<Device>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilitiesBody {
    pub scanner_id: String,
    pub protocol: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySettingsBody {
    pub scanner_id: String,
    pub protocol: String,
    pub results: Vec<SettingResult>,
}

/// One streamed page; `data` is the base64-encoded payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBody {
    pub metadata: PageMeta,
    pub data: String,
    pub page_number: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedBody {
    pub total_pages: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
}
