//! Action handlers
//!
//! One handler per wire action. Handlers return typed errors; `dispatch`
//! turns them into error envelopes with the request id echoed.

use super::{send_frame, Gateway, JobBinding, Outbound};
use crate::error::{Error, Result};
use crate::models::{Device, DeviceSettingsPatch, ScanSettings};
use crate::protocol::{
    error_frame, ApplySettingsBody, AuthBody, DeviceCapabilitiesBody, Empty, Frame, Request,
    ScannersBody, Status,
};
use crate::session_store::Session;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) async fn dispatch(
    gateway: &Arc<Gateway>,
    connection_id: Uuid,
    outbound: &Outbound,
    request: Request,
) {
    let action = request.action();
    let request_id = request.request_id().to_string();

    let session = if request.requires_auth() {
        match authorize(gateway, &request).await {
            Ok(session) => Some(session),
            Err(err) => {
                send_frame(outbound, &error_frame(action, &request_id, &err));
                return;
            }
        }
    } else {
        None
    };

    let result = match request {
        Request::Authenticate { client_id, .. } => {
            authenticate(gateway, connection_id, outbound, &request_id, client_id).await
        }
        Request::Ping { .. } => {
            let frame =
                Frame::new(Status::Success, "pong", &request_id, Empty {}).with_message("pong");
            send_frame(outbound, &frame);
            Ok(())
        }
        Request::ListScanners { settings, .. } => {
            list_scanners(gateway, outbound, &request_id, settings).await
        }
        Request::SelectScanner { settings, .. } => {
            select_scanner(
                gateway,
                outbound,
                &request_id,
                session.as_ref().expect("authorized"),
                settings,
            )
            .await
        }
        Request::GetCapabilities { .. } => {
            get_capabilities(gateway, outbound, &request_id).await
        }
        Request::GetDeviceCapabilities { .. } => {
            get_device_capabilities(gateway, outbound, &request_id).await
        }
        Request::ApplyDeviceSettings {
            patch, advanced, ..
        } => apply_device_settings(gateway, outbound, &request_id, patch, advanced).await,
        Request::Scan { settings, .. } => {
            scan(
                gateway,
                connection_id,
                outbound,
                &request_id,
                session.as_ref().expect("authorized"),
                settings,
            )
            .await
        }
        Request::StopScan { .. } => {
            stop_scan(
                gateway,
                outbound,
                &request_id,
                session.as_ref().expect("authorized"),
            )
            .await
        }
    };

    if let Err(err) = result {
        tracing::debug!(action, request_id = %request_id, error = %err, "Request failed");
        send_frame(outbound, &error_frame(action, &request_id, &err));
    }
}

async fn authorize(gateway: &Arc<Gateway>, request: &Request) -> Result<Session> {
    let token = request
        .token()
        .ok_or_else(|| Error::Unauthorized("token is required".into()))?;
    gateway
        .state
        .sessions
        .validate(token)
        .await
        .ok_or_else(|| Error::InvalidToken("unknown or expired token".into()))
}

async fn authenticate(
    gateway: &Arc<Gateway>,
    connection_id: Uuid,
    outbound: &Outbound,
    request_id: &str,
    client_id: Option<String>,
) -> Result<()> {
    let session = gateway
        .state
        .sessions
        .create(connection_id, client_id)
        .await
        .ok_or_else(|| Error::Internal("session capacity reached".into()))?;

    let frame = Frame::new(
        Status::Success,
        "authenticate",
        request_id,
        AuthBody {
            token: session.token,
            expires_at: session.expires_at,
        },
    );
    send_frame(outbound, &frame);
    Ok(())
}

async fn list_scanners(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
    settings: Option<ScanSettings>,
) -> Result<()> {
    let protocols = settings.and_then(|s| s.protocols);
    let mut devices = gateway
        .state
        .router
        .enumerate(protocols.as_deref())
        .await;
    mark_default(gateway, &mut devices).await;

    let frame = Frame::new(
        Status::Success,
        "list_scanners",
        request_id,
        ScannersBody { scanners: devices },
    );
    send_frame(outbound, &frame);
    Ok(())
}

async fn select_scanner(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
    session: &Session,
    settings: Option<ScanSettings>,
) -> Result<()> {
    let source = settings
        .and_then(|s| s.source)
        .ok_or_else(|| Error::InvalidRequest("settings.source is required".into()))?;

    if let Err(err) = gateway.state.router.select(&source).await {
        // Distinguish "that device is gone" from "there is nothing at all"
        if matches!(err, Error::ScannerNotFound(_))
            && gateway.state.router.enumerate(None).await.is_empty()
        {
            return Err(Error::NoScanners("no backend exposes any device".into()));
        }
        return Err(err);
    }

    let (tag, local) = crate::router::ScannerRouter::parse_id(&source);
    let normalized = format!("{tag}:{local}");

    gateway
        .state
        .sessions
        .update(&session.token, |s| {
            s.selected_scanner = Some(normalized.clone());
        })
        .await;
    gateway
        .state
        .prefs
        .set_default_device(&normalized, tag)
        .await;

    let frame = Frame::new(Status::Success, "select_scanner", request_id, Empty {})
        .with_message("scanner selected");
    send_frame(outbound, &frame);
    Ok(())
}

async fn get_capabilities(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
) -> Result<()> {
    let (mut device, snapshot) = gateway.state.router.current_capabilities().await?;
    device.capabilities = Some(snapshot);
    let mut devices = vec![device];
    mark_default(gateway, &mut devices).await;

    let frame = Frame::new(
        Status::Success,
        "get_capabilities",
        request_id,
        ScannersBody { scanners: devices },
    );
    send_frame(outbound, &frame);
    Ok(())
}

async fn get_device_capabilities(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
) -> Result<()> {
    let (scanner_id, protocol, capabilities) =
        gateway.state.router.device_capabilities().await?;

    let frame = Frame::new(
        Status::Success,
        "get_device_capabilities",
        request_id,
        DeviceCapabilitiesBody {
            scanner_id,
            protocol,
            capabilities,
        },
    );
    send_frame(outbound, &frame);
    Ok(())
}

async fn apply_device_settings(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
    patch: Option<DeviceSettingsPatch>,
    advanced: Option<HashMap<String, serde_json::Value>>,
) -> Result<()> {
    let patch = patch.unwrap_or_default();
    if patch.is_empty() && advanced.as_ref().map_or(true, |a| a.is_empty()) {
        return Err(Error::InvalidRequest(
            "patch or advanced settings are required".into(),
        ));
    }

    let (scanner_id, protocol, results) = gateway
        .state
        .router
        .apply_patch(&patch, advanced.as_ref())
        .await?;

    let frame = Frame::new(
        Status::Success,
        "apply_device_settings",
        request_id,
        ApplySettingsBody {
            scanner_id,
            protocol,
            results,
        },
    );
    send_frame(outbound, &frame);
    Ok(())
}

/// Begin a job: serialize per session, apply settings, bind the event
/// handlers, then start. Pages and the terminal frame arrive async.
async fn scan(
    gateway: &Arc<Gateway>,
    connection_id: Uuid,
    outbound: &Outbound,
    request_id: &str,
    session: &Session,
    settings: Option<ScanSettings>,
) -> Result<()> {
    if session.scanning || session.active_request.is_some() {
        return Err(Error::ScannerBusy("session already has an active scan".into()));
    }

    let settings = settings.unwrap_or_default();
    if settings.max_pages == 0 {
        return Err(Error::InvalidRequest("maxPages must be -1 or positive".into()));
    }

    // Make sure a device holds the seat
    if gateway.state.router.current_id().await.is_none() {
        let fallback = settings
            .source
            .clone()
            .or_else(|| session.selected_scanner.clone());
        match fallback {
            Some(id) => gateway.state.router.select(&id).await?,
            None => {
                if gateway.state.router.enumerate(None).await.is_empty() {
                    return Err(Error::NoScanners("no backend exposes any device".into()));
                }
                return Err(Error::ScannerNotFound("no device selected".into()));
            }
        }
    }

    gateway.state.router.apply_settings(&settings).await?;

    gateway
        .state
        .sessions
        .update(&session.token, |s| {
            s.scanning = true;
            s.active_request = Some(request_id.to_string());
        })
        .await;
    gateway
        .register_job(
            request_id,
            JobBinding {
                token: session.token.clone(),
                connection_id,
                outbound: outbound.clone(),
                max_pages: settings.max_pages,
            },
        )
        .await;

    if let Err(err) = gateway.state.router.start(request_id).await {
        gateway.unregister_job(request_id).await;
        gateway
            .state
            .sessions
            .update(&session.token, |s| {
                s.scanning = false;
                s.active_request = None;
            })
            .await;
        return Err(err);
    }

    tracing::info!(request_id = %request_id, "Scan started");
    Ok(())
}

/// Cancel the session's job; idempotent when nothing runs
async fn stop_scan(
    gateway: &Arc<Gateway>,
    outbound: &Outbound,
    request_id: &str,
    session: &Session,
) -> Result<()> {
    if let Some(active) = &session.active_request {
        // Unbind first so a late terminal event cannot race the ack
        gateway.unregister_job(active).await;
        gateway.state.router.stop().await;
        gateway
            .state
            .sessions
            .update(&session.token, |s| {
                s.scanning = false;
                s.active_request = None;
            })
            .await;
        tracing::info!(request_id = %active, "Scan cancelled");
    }

    let frame = Frame::new(Status::Cancelled, "stop_scan", request_id, Empty {})
        .with_message("scan cancelled");
    send_frame(outbound, &frame);
    Ok(())
}

/// Flag the preferred device, falling back to the first entry
async fn mark_default(gateway: &Arc<Gateway>, devices: &mut [Device]) {
    let prefs = gateway.state.prefs.get().await;
    let mut matched = false;
    if let Some(default_id) = &prefs.default_scanner_id {
        for device in devices.iter_mut() {
            if &device.id == default_id {
                device.is_default = true;
                matched = true;
            }
        }
    }
    if !matched {
        if let Some(first) = devices.first_mut() {
            first.is_default = true;
        }
    }
}
