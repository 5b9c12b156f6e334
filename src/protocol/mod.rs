//! Protocol Codec - JSON frame parsing and serialization
//!
//! ## Responsibilities
//!
//! - Decode inbound text frames into the tagged [`Request`] variant
//! - Preserve the client's `requestId` even for frames that fail to decode
//! - Encode outbound frames with the common response envelope

mod types;

pub use types::{
    ApplySettingsBody, AuthBody, CompletedBody, DeviceCapabilitiesBody, Empty, ErrorBody, Frame,
    PageBody, Request, ScannersBody, Status,
};

use crate::error::Error;

/// Legacy wake-up frame; accepted verbatim, never answered
pub const LEGACY_WAKEUP: &str = "1100";

/// A frame that could not be decoded into a [`Request`]
///
/// Carries the `requestId` when the payload was at least parseable JSON, so
/// the resulting `INVALID_REQUEST` response can echo it.
#[derive(Debug)]
pub struct DecodeError {
    pub request_id: Option<String>,
    pub reason: String,
}

/// Decode a text frame into a request
pub fn decode(text: &str) -> Result<Request, DecodeError> {
    match serde_json::from_str::<Request>(text) {
        Ok(request) => Ok(request),
        Err(err) => {
            // Salvage the request id for the error echo
            let request_id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("requestId").and_then(|id| id.as_str().map(String::from)));
            Err(DecodeError {
                request_id,
                reason: err.to_string(),
            })
        }
    }
}

/// Encode a frame for the wire
pub fn encode<T: serde::Serialize>(frame: &Frame<T>) -> String {
    serde_json::to_string(frame).unwrap_or_else(|err| {
        tracing::error!(error = %err, "Failed to serialize response frame");
        format!(
            r#"{{"status":"error","action":"{}","requestId":"{}","errorCode":"INTERNAL_ERROR","message":"response serialization failed"}}"#,
            frame.action, frame.request_id
        )
    })
}

/// Build the error frame for a failed request
pub fn error_frame(action: &str, request_id: &str, err: &Error) -> Frame<ErrorBody> {
    Frame::new(
        Status::Error,
        action,
        request_id,
        ErrorBody {
            error_code: err.code().to_string(),
            error_details: None,
        },
    )
    .with_message(&err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PixelType;

    #[test]
    fn decodes_authenticate() {
        let request = decode(r#"{"action":"authenticate","requestId":"r1"}"#).unwrap();
        assert_eq!(request.action(), "authenticate");
        assert_eq!(request.request_id(), "r1");
        assert!(!request.requires_auth());
    }

    #[test]
    fn decodes_scan_with_settings() {
        let request = decode(
            r#"{"action":"scan","requestId":"r9","token":"t","settings":{"dpi":300,"pixelType":"Gray8","useAdf":true,"maxPages":2}}"#,
        )
        .unwrap();
        assert_eq!(request.action(), "scan");
        assert_eq!(request.token(), Some("t"));
        match request {
            Request::Scan { settings, .. } => {
                let settings = settings.unwrap();
                assert_eq!(settings.dpi, 300);
                assert_eq!(settings.pixel_type, PixelType::Gray8);
                assert_eq!(settings.max_pages, 2);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_action_keeps_request_id() {
        let err = decode(r#"{"action":"explode","requestId":"r2"}"#).unwrap_err();
        assert_eq!(err.request_id.as_deref(), Some("r2"));
    }

    #[test]
    fn malformed_json_has_no_request_id() {
        let err = decode("{nope").unwrap_err();
        assert!(err.request_id.is_none());
    }

    #[test]
    fn request_reserializes_equivalently() {
        let text = r#"{"action":"scan","requestId":"r3","settings":{"dpi":150,"paperSize":"Letter"}}"#;
        let first = decode(text).unwrap();
        let (settings_a, id_a) = match &first {
            Request::Scan {
                settings,
                request_id,
                ..
            } => (settings.clone().unwrap(), request_id.clone()),
            other => panic!("unexpected variant: {other:?}"),
        };
        let reencoded = serde_json::to_string(&settings_a).unwrap();
        let settings_b: crate::models::ScanSettings = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(id_a, "r3");
        assert_eq!(settings_a.dpi, settings_b.dpi);
        assert_eq!(settings_a.paper_size, settings_b.paper_size);
        assert_eq!(settings_a.pixel_type, settings_b.pixel_type);
        assert_eq!(settings_a.max_pages, settings_b.max_pages);
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let frame = error_frame("scan", "r4", &Error::ScannerBusy("job running".into()));
        let json: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["errorCode"], "SCANNER_BUSY");
        assert_eq!(json["requestId"], "r4");
        assert!(json["message"].as_str().unwrap().contains("job running"));
        assert!(json.get("errorDetails").is_none());
    }

    #[test]
    fn frames_omit_null_optionals_and_use_camel_case() {
        let frame = Frame::new(Status::Success, "pong", "r5", Empty {}).with_message("pong");
        let json: serde_json::Value = serde_json::from_str(&encode(&frame)).unwrap();
        assert_eq!(json["action"], "pong");
        assert_eq!(json["message"], "pong");
        assert!(json.get("requestId").is_some());
        // Timestamp is RFC3339 UTC
        let ts = json["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z') || ts.contains("+00:00"));
    }
}
