//! Gateway - dual-port WebSocket front end
//!
//! ## Responsibilities
//!
//! - Accept WS/WSS connections on the two loopback listeners
//! - Own per-socket lifecycle and the outbound write queue
//! - Dispatch decoded requests to the action handlers
//! - Bind per-job event handlers that forward pages and the terminal
//!   message to the originating session only; never broadcast
//!
//! The TLS listener runs only when the certificate manager yields an
//! identity; losing it keeps the plaintext listener up.

mod connection;
mod handlers;

use crate::cert_manager::TlsIdentity;
use crate::protocol::{self, CompletedBody, ErrorBody, Frame, PageBody, Status};
use crate::router::ScannerEvent;
use crate::state::AppState;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Outbound queue of one connection
pub(crate) type Outbound = mpsc::UnboundedSender<Message>;

/// Per-job binding from scanner events back to the requesting session
pub(crate) struct JobBinding {
    pub token: String,
    pub connection_id: Uuid,
    pub outbound: Outbound,
    /// Client-requested cap; enforced here so UI-mode jobs stay bounded
    pub max_pages: i32,
}

pub struct Gateway {
    state: AppState,
    /// request id -> binding; registration and removal are idempotent
    jobs: Mutex<HashMap<String, JobBinding>>,
}

impl Gateway {
    pub fn new(state: AppState) -> Arc<Self> {
        Arc::new(Self {
            state,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Bind both listeners and start the scanner event pump
    ///
    /// Returns the bound addresses (plain, tls). Failing one listener is
    /// tolerated; failing both is fatal.
    pub async fn start(
        self: &Arc<Self>,
        tls_identity: Option<TlsIdentity>,
    ) -> crate::error::Result<(Option<SocketAddr>, Option<SocketAddr>)> {
        let pump_events = self
            .state
            .router
            .take_events()
            .await
            .ok_or_else(|| crate::error::Error::Internal("router events already taken".into()))?;
        let pump = self.clone();
        tokio::spawn(async move {
            pump.run_event_pump(pump_events).await;
        });

        let host = self.state.config.bind_host.clone();

        let plain_addr = match TcpListener::bind((host.as_str(), self.state.config.ws_port)).await
        {
            Ok(listener) => {
                let addr = listener.local_addr().ok();
                let gateway = self.clone();
                tokio::spawn(async move {
                    gateway.accept_plain(listener).await;
                });
                addr
            }
            Err(err) => {
                tracing::error!(port = self.state.config.ws_port, error = %err, "WS listener failed to bind");
                None
            }
        };

        let tls_addr = match tls_identity {
            Some(identity) => match identity.server_config() {
                Ok(config) => {
                    match TcpListener::bind((host.as_str(), self.state.config.wss_port)).await {
                        Ok(listener) => {
                            let addr = listener.local_addr().ok();
                            let acceptor = TlsAcceptor::from(config);
                            let gateway = self.clone();
                            tokio::spawn(async move {
                                gateway.accept_tls(listener, acceptor).await;
                            });
                            addr
                        }
                        Err(err) => {
                            tracing::error!(port = self.state.config.wss_port, error = %err, "WSS listener failed to bind");
                            None
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "TLS acceptor configuration failed");
                    None
                }
            },
            None => {
                tracing::warn!("No certificate available, WSS listener disabled");
                None
            }
        };

        if plain_addr.is_none() && tls_addr.is_none() {
            return Err(crate::error::Error::Internal(
                "no listener could bind".into(),
            ));
        }

        if let Some(addr) = plain_addr {
            tracing::info!(%addr, "WS listener up");
        }
        if let Some(addr) = tls_addr {
            tracing::info!(%addr, "WSS listener up");
        }
        Ok((plain_addr, tls_addr))
    }

    async fn accept_plain(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    tokio::spawn(async move {
                        connection::handle_socket(gateway, stream, peer).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "WS accept failed");
                }
            }
        }
    }

    async fn accept_tls(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let gateway = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                connection::handle_socket(gateway, tls_stream, peer).await;
                            }
                            Err(err) => {
                                tracing::warn!(peer = %peer, error = %err, "TLS handshake failed");
                            }
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "WSS accept failed");
                }
            }
        }
    }

    /// Connection teardown: drop the session and any job still bound to
    /// this socket
    pub(crate) async fn on_disconnect(&self, id: Uuid) {
        let orphaned: Vec<String> = {
            let jobs = self.jobs.lock().await;
            jobs.iter()
                .filter(|(_, binding)| binding.connection_id == id)
                .map(|(request_id, _)| request_id.clone())
                .collect()
        };
        for request_id in orphaned {
            self.unregister_job(&request_id).await;
            self.state.router.stop().await;
            tracing::info!(request_id = %request_id, "Scan abandoned by disconnect");
        }

        self.state.sessions.remove_by_connection(id).await;
    }

    pub(crate) async fn register_job(&self, request_id: &str, binding: JobBinding) {
        self.jobs.lock().await.insert(request_id.to_string(), binding);
    }

    pub(crate) async fn unregister_job(&self, request_id: &str) -> Option<JobBinding> {
        self.jobs.lock().await.remove(request_id)
    }

    /// Forward scanner events to the exact requesting session
    async fn run_event_pump(self: Arc<Self>, mut events: mpsc::Receiver<ScannerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ScannerEvent::Page {
                    request_id,
                    data,
                    meta,
                    number,
                    ..
                } => {
                    self.deliver_page(&request_id, data, meta, number).await;
                }
                ScannerEvent::Completed {
                    request_id,
                    total_pages,
                    ..
                } => {
                    if let Some(binding) = self.unregister_job(&request_id).await {
                        self.clear_session_scan(&binding).await;
                        let frame = Frame::new(
                            Status::Completed,
                            "scan",
                            &request_id,
                            CompletedBody { total_pages },
                        );
                        send_frame(&binding.outbound, &frame);
                        tracing::info!(request_id = %request_id, total_pages, "Scan completed");
                    }
                }
                ScannerEvent::Error {
                    request_id,
                    message,
                    ..
                } => {
                    if let Some(binding) = self.unregister_job(&request_id).await {
                        self.clear_session_scan(&binding).await;
                        let frame = Frame::new(
                            Status::Error,
                            "scan",
                            &request_id,
                            ErrorBody {
                                error_code: "SCAN_FAILED".to_string(),
                                error_details: Some(message.clone()),
                            },
                        )
                        .with_message(&message);
                        send_frame(&binding.outbound, &frame);
                        tracing::warn!(request_id = %request_id, error = %message, "Scan failed");
                    }
                }
            }
        }
    }

    async fn deliver_page(
        &self,
        request_id: &str,
        data: Vec<u8>,
        mut meta: crate::models::PageMeta,
        number: u32,
    ) {
        // Peek the binding without holding the lock across the send
        let (outbound, cap_reached) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(request_id) {
                Some(binding) => (
                    binding.outbound.clone(),
                    binding.max_pages > 0 && number as i32 >= binding.max_pages,
                ),
                None => return,
            }
        };

        let (data, format) = self.state.recompressor.process(data, &meta.format);
        meta.format = format;
        meta.size = data.len() as u64;

        use base64::Engine as _;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        let frame = Frame::new(
            Status::Scanning,
            "scan",
            request_id,
            PageBody {
                metadata: meta,
                data: encoded,
                page_number: number,
            },
        );
        send_frame(&outbound, &frame);
        tracing::debug!(request_id = %request_id, page = number, "Page delivered");

        // The session owns the page cap even when the driver does not: in
        // UI mode the vendor window keeps the transfer count, so the job is
        // completed here once the client got what it asked for
        if cap_reached {
            if let Some(binding) = self.unregister_job(request_id).await {
                self.clear_session_scan(&binding).await;
                self.state.router.stop().await;
                let frame = Frame::new(
                    Status::Completed,
                    "scan",
                    request_id,
                    CompletedBody {
                        total_pages: number,
                    },
                );
                send_frame(&binding.outbound, &frame);
                tracing::info!(request_id = %request_id, total_pages = number, "Scan completed at page cap");
            }
        }
    }

    async fn clear_session_scan(&self, binding: &JobBinding) {
        self.state
            .sessions
            .update(&binding.token, |session| {
                session.scanning = false;
                session.active_request = None;
            })
            .await;
    }
}

/// Enqueue one frame; a closed connection just drops it
pub(crate) fn send_frame<T: serde::Serialize>(outbound: &Outbound, frame: &Frame<T>) {
    let text = protocol::encode(frame);
    if outbound.send(Message::Text(text)).is_err() {
        tracing::debug!(request_id = %frame.request_id, "Connection gone, frame dropped");
    }
}
