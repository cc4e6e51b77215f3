//! Control protocol server
//!
//! Clients talk NDJSON over loopback TCP. The first frame of a connection must
//! be a `Hello` carrying the per-launch secret; anything else closes it. After
//! that every request runs in its own task and answers with the request's
//! `Idx`, while daemon events are broadcast to all clients with `Idx = 0`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use warden_proto::codec::{decode_header, decode_request, encode_response};
use warden_proto::request::{Hello, Request};
use warden_proto::response::{
    DisconnectedResp, ErrorResp, PingResultType, PingServersResp, SplitTunnelStatus, WiFiCurrentNetworkResp,
};
use warden_proto::{ClientType, Response};

use crate::autoconnect::Trigger;
use crate::error::{Error, Result};
use crate::event::DaemonEvent;
use crate::service::{connected_resp, Service};

/// Time a new connection has to authenticate
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(7);

/// Longest a single request may run
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3 * 60);

type ClientId = u64;

struct Client {
    tx: mpsc::UnboundedSender<String>,
    client_type: ClientType,
    keep_daemon_alone: bool,
}

pub struct ProtocolServer {
    service: Arc<Service>,
    secret: u64,
    clients: Mutex<HashMap<ClientId, Client>>,
    next_id: AtomicU64,
    delayed_error: Mutex<Option<ErrorResp>>,
    stop: broadcast::Sender<()>,
}

impl ProtocolServer {
    pub fn new(service: Arc<Service>, secret: u64) -> Arc<Self> {
        let (stop, _) = broadcast::channel(1);
        let server = Arc::new(Self {
            service,
            secret,
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            delayed_error: Mutex::new(None),
            stop,
        });
        let weak = Arc::downgrade(&server);
        server
            .service
            .set_client_probe(Arc::new(move || weak.upgrade().is_some_and(|s| s.has_ui_clients())));
        server
    }

    /// Listen on an ephemeral loopback port
    pub async fn bind() -> Result<TcpListener> {
        let listener = TcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))
            .await
            .map_err(|e| Error::Connection(format!("failed to bind control port: {}", e)))?;
        Ok(listener)
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn has_ui_clients(&self) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|c| c.client_type == ClientType::Ui)
    }

    /// Accept clients and forward events until `shutdown` fires
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        match listener.local_addr() {
            Ok(addr) => log::info!("Control protocol listening on {}", addr),
            Err(e) => log::warn!("Control protocol address unknown: {}", e),
        }

        let broadcaster = tokio::spawn(self.clone().forward_events());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve(stream).await {
                                log::debug!("Client {} closed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => log::warn!("Control protocol accept error: {}", e),
                },
                _ = shutdown.recv() => break,
            }
        }

        log::info!("Control protocol stopping");
        self.send_to_all(&Response::ServiceExitingResp);
        // cleared clients are not handled as leaving
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let _ = self.stop.send(());
        broadcaster.abort();
    }

    // ========================================================================
    // Connections
    // ========================================================================

    async fn serve(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let first = match tokio::time::timeout(HELLO_TIMEOUT, lines.next_line()).await {
            Ok(line) => line?.ok_or_else(|| Error::Connection("closed before Hello".into()))?,
            Err(_) => return Err(Error::Timeout("no Hello received".into())),
        };
        let (header, hello) = match decode_request(&first) {
            Ok((header, Request::Hello(hello))) => (header, hello),
            Ok((header, _)) => {
                return Err(Error::Connection(format!("'{}' received before Hello", header.command)))
            }
            Err(e) => return Err(e.into()),
        };
        if hello.secret != self.secret {
            log::warn!("Client rejected: wrong secret");
            return Err(Error::AuthenticationFailure);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::info!("Client {} connected ({:?}, version '{}')", id, hello.client_type, hello.version);
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Client {
                tx: tx.clone(),
                client_type: hello.client_type,
                keep_daemon_alone: hello.keep_daemon_alone,
            },
        );

        let mut stop = self.stop.subscribe();

        self.greet(&tx, &hello, header.idx).await;
        let delayed = self.delayed_error.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(err) = delayed {
            send(&tx, &Response::ErrorRespDelayed(err), 0);
        }
        if hello.client_type == ClientType::Ui {
            let service = self.service.clone();
            tokio::spawn(async move { service.run_autoconnect(Trigger::UiClientConnected).await });
        }

        let result = loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = stop.recv() => break Ok(()),
            };
            match line {
                Ok(Some(line)) => self.dispatch(&tx, &line),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        self.disconnected(id).await;
        drop(tx);
        let _ = writer_task.await;
        result
    }

    /// `HelloResp` followed by the snapshots the client asked for
    async fn greet(&self, tx: &mpsc::UnboundedSender<String>, hello: &Hello, idx: i64) {
        send(tx, &Response::HelloResp(self.service.hello_resp().await), idx);

        if hello.get_servers_list {
            match self.service.servers_resp().await {
                Ok(resp) => send(tx, &resp, 0),
                Err(e) => log::warn!("Server list not sent: {}", e),
            }
        }
        if hello.get_status {
            send(tx, &self.service.vpn_state_resp(), 0);
        }
        if hello.get_split_tunnel_status {
            let status: SplitTunnelStatus = self.service.split_tunnel.status().await;
            send(tx, &Response::SplitTunnelStatus(status), 0);
        }
        if hello.get_wifi_current_state {
            match self.service.wifi_resp().await {
                Ok(resp) => send(tx, &resp, 0),
                Err(e) => log::debug!("Wi-Fi state not sent: {}", e),
            }
        }
    }

    fn dispatch(self: &Arc<Self>, tx: &mpsc::UnboundedSender<String>, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let (header, request) = match decode_request(line) {
            Ok(decoded) => decoded,
            Err(e) => {
                let idx = decode_header(line).map(|h| h.idx).unwrap_or(0);
                log::warn!("Bad request: {}", e);
                send(tx, &Response::error(e.to_string()), idx);
                return;
            }
        };

        let server = self.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let command = header.command.clone();
            let follow_up = matches!(request, Request::Connect(_) | Request::Disconnect);
            if !Request::is_eaa_whitelisted(&command) {
                if let Err(e) = server.service.eaa.check(&header.protocol_secret).await {
                    log::warn!("'{}' rejected: {}", command, e);
                    send(&tx, &error_response(&e), header.idx);
                    if follow_up {
                        send(&tx, &server.service.vpn_state_resp(), 0);
                    }
                    return;
                }
            }

            if let Request::Hello(hello) = &request {
                server.greet(&tx, hello, header.idx).await;
                return;
            }

            log::debug!("--> {} [{}]", command, header.idx);
            let handled = tokio::time::timeout(
                REQUEST_TIMEOUT,
                server.service.handle(request, &header.protocol_secret),
            )
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(format!("'{}' took too long", command))));

            match handled {
                Ok(resp) => {
                    log::debug!("<-- {} [{}]", resp.command(), header.idx);
                    send(&tx, &resp, header.idx);
                }
                Err(e) => {
                    log::error!("'{}' failed: {}", command, e);
                    send(&tx, &error_response(&e), header.idx);
                    if follow_up {
                        send(&tx, &server.service.vpn_state_resp(), 0);
                    }
                }
            }
        });
    }

    async fn disconnected(&self, id: ClientId) {
        let (client, remaining) = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            (clients.remove(&id), clients.len())
        };
        let Some(client) = client else {
            return;
        };
        log::info!("Client {} disconnected", id);

        let service = &self.service;
        if !client.keep_daemon_alone {
            if !service.firewall.is_persistent() {
                if let Err(e) = service.firewall.set_enabled(false).await {
                    log::warn!("Firewall not disabled after client left: {}", e);
                }
            }
            if let Err(e) = service.engine.disconnect().await {
                log::warn!("Disconnect after client left failed: {}", e);
            }
            if service.prefs.get().is_stop_on_client_disconnect {
                log::info!("Last client left; stopping the daemon");
                service.request_shutdown();
            }
        } else if remaining == 0 && service.engine.status().is_paused() {
            log::info!("Paused connection left without clients; disconnecting");
            if let Err(e) = service.engine.disconnect().await {
                log::warn!("Disconnect failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Broadcasts
    // ========================================================================

    async fn forward_events(self: Arc<Self>) {
        let mut events = self.service.events.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Control protocol skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            // failures nobody saw go to the next client that attaches
            if self.client_count() == 0 {
                let unseen = match &event {
                    DaemonEvent::Error { message, .. } => Some(message.clone()),
                    DaemonEvent::Disconnected {
                        failure: true,
                        description,
                        ..
                    } => Some(description.clone()),
                    _ => None,
                };
                if let Some(message) = unseen {
                    *self.delayed_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(ErrorResp {
                        error_message: message,
                        ..Default::default()
                    });
                    continue;
                }
            }

            if let Some(resp) = self.broadcast_for(event).await {
                self.send_to_all(&resp);
            }
        }
    }

    async fn broadcast_for(&self, event: DaemonEvent) -> Option<Response> {
        let service = &self.service;
        let resp = match event {
            DaemonEvent::VpnStateChanged { state, info } => Response::vpn_state(state, info),
            DaemonEvent::Connected(info) => Response::ConnectedResp(connected_resp(&info)),
            DaemonEvent::Disconnected {
                failure,
                reason,
                description,
            } => Response::DisconnectedResp(DisconnectedResp {
                failure,
                reason,
                reason_description: description,
            }),
            DaemonEvent::FirewallChanged => match service.firewall.status().await {
                Ok(status) => Response::KillSwitchStatusResp(status),
                Err(e) => {
                    log::warn!("Firewall status unavailable: {}", e);
                    return None;
                }
            },
            DaemonEvent::SplitTunnelChanged => Response::SplitTunnelStatus(service.split_tunnel.status().await),
            DaemonEvent::SessionChanged => Response::HelloResp(service.hello_resp().await),
            DaemonEvent::SettingsChanged => Response::SettingsResp(service.prefs.get().settings_resp()),
            DaemonEvent::ServersUpdated => service.servers_resp().await.ok()?,
            DaemonEvent::PingResults(results) => {
                Response::PingServersResp(PingServersResp {
                    ping_results: results
                        .into_iter()
                        .map(|(host, ping)| PingResultType { host, ping })
                        .collect(),
                })
            }
            DaemonEvent::WifiChanged { ssid, is_insecure } => {
                Response::WiFiCurrentNetworkResp(WiFiCurrentNetworkResp {
                    ssid,
                    is_insecure_network: is_insecure,
                })
            }
            DaemonEvent::Error { message, .. } => Response::error(message),
            DaemonEvent::AttemptFinished | DaemonEvent::DnsChanged(_) => return None,
        };
        Some(resp)
    }

    fn send_to_all(&self, resp: &Response) {
        let line = match encode_response(resp, 0) {
            Ok(line) => line,
            Err(e) => {
                log::error!("Broadcast not encoded: {}", e);
                return;
            }
        };
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        for client in clients.values() {
            let _ = client.tx.send(line.clone());
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<String>, resp: &Response, idx: i64) {
    match encode_response(resp, idx) {
        Ok(line) => {
            let _ = tx.send(line);
        }
        Err(e) => log::error!("Response not encoded: {}", e),
    }
}

fn error_response(e: &Error) -> Response {
    Response::typed_error(e.error_type(), "", e.to_string())
}
