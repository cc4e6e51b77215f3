//! Control protocol over a real loopback socket
//!
//! A [`ProtocolServer`] is bound to an ephemeral port in front of a
//! [`Service`] built on the mocks; the tests talk to it the way a UI does,
//! one JSON object per line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use warden_engine::api::SESSION_NEW_PATH;
use warden_engine::connection::tunnel::TunnelExit;
use warden_engine::mock::{MockKem, TestBed};
use warden_engine::{DaemonEvent, EventHandler, ProtocolServer, Service};
use warden_proto::codec::{decode_response, encode_request};
use warden_proto::request::{Connect, Hello, SessionNew};
use warden_proto::types::{DisconnectReason, ErrorType};
use warden_proto::{ClientType, Request, Response, VpnType};

const SECRET: u64 = 0x5eed_cafe_f00d;
const WAIT: Duration = Duration::from_secs(10);

struct Daemon {
    bed: TestBed,
    service: Arc<Service>,
    server: Arc<ProtocolServer>,
    addr: SocketAddr,
    _dir: tempfile::TempDir,
}

async fn daemon(logged_in: bool) -> Daemon {
    let dir = tempfile::tempdir().unwrap();
    let mut bed = TestBed::new(dir.path());
    if logged_in {
        bed = bed.logged_in();
    }
    let service = Service::new(bed.components(dir.path()));
    service.init().await.unwrap();
    service.start().await;

    let server = ProtocolServer::new(service.clone(), SECRET);
    let listener = ProtocolServer::bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.clone().run(listener, service.shutdown_signal()));

    Daemon {
        bed,
        service,
        server,
        addr,
        _dir: dir,
    }
}

struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    secret: String,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            secret: String::new(),
        }
    }

    /// Connect and complete the handshake
    async fn attach(addr: SocketAddr, keep_daemon_alone: bool) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(&hello(SECRET, keep_daemon_alone), 1).await;
        match client.recv().await {
            Some((1, Response::HelloResp(_))) => {}
            other => panic!("expected HelloResp, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, request: &Request, idx: i64) {
        let line = encode_request(request, idx, &self.secret).unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    /// Next frame; `None` once the daemon closed the connection
    async fn recv(&mut self) -> Option<(i64, Response)> {
        let line = timeout(WAIT, self.lines.next_line())
            .await
            .expect("no frame from daemon")
            .ok()??;
        Some(decode_response(&line).unwrap())
    }

    /// Skip frames until `pick` accepts one
    async fn recv_until<T>(&mut self, mut pick: impl FnMut(i64, Response) -> Option<T>) -> T {
        loop {
            let (idx, resp) = self.recv().await.expect("connection closed");
            if let Some(found) = pick(idx, resp) {
                return found;
            }
        }
    }
}

fn hello(secret: u64, keep_daemon_alone: bool) -> Request {
    Request::Hello(Hello {
        version: "test".into(),
        secret,
        client_type: ClientType::Ui,
        keep_daemon_alone,
        ..Default::default()
    })
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_wrong_secret_closes_connection() {
    let d = daemon(false).await;
    let mut client = Client::connect(d.addr).await;
    client.send(&hello(SECRET + 1, false), 1).await;
    assert!(client.recv().await.is_none());
    assert_eq!(d.server.client_count(), 0);
}

#[tokio::test]
async fn test_request_before_hello_closes_connection() {
    let d = daemon(false).await;
    let mut client = Client::connect(d.addr).await;
    client.send(&Request::GetVPNState, 3).await;
    assert!(client.recv().await.is_none());
    assert_eq!(d.server.client_count(), 0);
}

#[tokio::test]
async fn test_garbage_before_hello_closes_connection() {
    let d = daemon(false).await;
    let mut client = Client::connect(d.addr).await;
    client.send_raw("not json").await;
    assert!(client.recv().await.is_none());
}

#[tokio::test]
async fn test_hello_snapshots() {
    let d = daemon(false).await;
    let mut client = Client::connect(d.addr).await;
    let request = Request::Hello(Hello {
        version: "test".into(),
        secret: SECRET,
        client_type: ClientType::Cli,
        get_status: true,
        ..Default::default()
    });
    client.send(&request, 5).await;

    let (idx, resp) = client.recv().await.unwrap();
    assert_eq!(idx, 5);
    let Response::HelloResp(hello) = resp else {
        panic!("expected HelloResp, got {:?}", resp);
    };
    assert!(hello.session.session.is_empty());

    let (idx, resp) = client.recv().await.unwrap();
    assert_eq!(idx, 0);
    assert!(matches!(resp, Response::DisconnectedResp(_)));
    assert_eq!(d.server.client_count(), 1);
}

#[tokio::test]
async fn test_bad_request_answered_with_error() {
    let d = daemon(false).await;
    let mut client = Client::attach(d.addr, true).await;
    client
        .send_raw(r#"{"Command":"NoSuchCommand","Idx":9,"ProtocolSecret":""}"#)
        .await;
    let (idx, resp) = client.recv_until(|idx, r| matches!(r, Response::ErrorResp(_)).then_some((idx, r))).await;
    assert_eq!(idx, 9);
    assert!(matches!(resp, Response::ErrorResp(_)));
    // the connection stays usable
    client.send(&Request::GetVPNState, 10).await;
    let idx = client.recv_until(|idx, r| matches!(r, Response::DisconnectedResp(_)).then_some(idx)).await;
    assert_eq!(idx, 10);
}

// ============================================================================
// Requests
// ============================================================================

#[tokio::test]
async fn test_disconnect_while_disconnected() {
    let d = daemon(true).await;
    let mut client = Client::attach(d.addr, true).await;
    client.send(&Request::Disconnect, 4).await;
    let resp = client
        .recv_until(|idx, r| match r {
            Response::DisconnectedResp(resp) if idx == 4 => Some(resp),
            _ => None,
        })
        .await;
    assert!(!resp.failure);
    assert_eq!(resp.reason, DisconnectReason::DisconnectRequested);
}

#[tokio::test]
async fn test_login_then_connect() {
    let d = daemon(false).await;
    let ciphers = MockKem::ciphers();
    d.bed.transport.respond(
        SESSION_NEW_PATH,
        json!({
            "status": 200,
            "token": "tok",
            "vpn_username": "u",
            "vpn_password": "p",
            "service_status": {"is_active": true, "current_plan": "Pro", "capabilities": ["multihop"]},
            "wireguard": {"status": 200, "ip_address": "10.0.0.2",
                          "kem_cipher1": ciphers.kyber1024, "kem_cipher2": ciphers.mceliece348864}
        }),
    );
    let mut client = Client::attach(d.addr, true).await;

    client
        .send(
            &Request::SessionNew(SessionNew {
                account_id: "i-AAAA-BBBB-CCCC".into(),
                force_login: false,
                ..Default::default()
            }),
            2,
        )
        .await;
    let mut login = None;
    let mut greeted = false;
    while login.is_none() || !greeted {
        match client.recv().await.expect("connection closed") {
            (2, Response::SessionNewResp(resp)) => login = Some(resp),
            (0, Response::HelloResp(hello)) if hello.session.session == "tok" => greeted = true,
            _ => {}
        }
    }
    let login = login.unwrap();
    assert_eq!(login.api_status, 200);
    assert_eq!(login.session.wg_local_ip, "10.0.0.2");
    assert!(login.session.wg_use_preshared_key);

    client
        .send(
            &Request::Connect(Connect {
                params: d.bed.connect_params(),
            }),
            3,
        )
        .await;
    let mut accepted = false;
    let mut states = Vec::new();
    let connected = loop {
        match client.recv().await.expect("connection closed") {
            (3, Response::EmptyResp) => accepted = true,
            (0, Response::VpnStateResp(state)) => states.push(state.state),
            (0, Response::ConnectedResp(resp)) => break resp,
            (_, Response::DisconnectedResp(resp)) => panic!("disconnected: {:?}", resp),
            _ => {}
        }
    };
    assert!(accepted);
    assert_eq!(states.first().map(String::as_str), Some("CONNECTING"));
    assert!(states.iter().any(|s| s == "INITIALISED"));
    assert_eq!(connected.client_ip, "10.0.0.2");
    assert_eq!(connected.vpn_type, VpnType::WTunnel);
    assert!(!connected.is_paused);

    d.service.engine.disconnect().await.unwrap();
}

// ============================================================================
// Enhanced App Authentication
// ============================================================================

#[tokio::test]
async fn test_eaa_guards_commands() {
    let d = daemon(true).await;
    d.service.eaa.set_secret("", "letmein").await.unwrap();
    let mut client = Client::attach(d.addr, true).await;

    client.secret = "wrong".into();
    client
        .send(
            &Request::Connect(Connect {
                params: d.bed.connect_params(),
            }),
            7,
        )
        .await;
    let err = client
        .recv_until(|idx, r| match r {
            Response::ErrorResp(err) if idx == 7 => Some(err),
            _ => None,
        })
        .await;
    assert_eq!(err.error_type, ErrorType::ParanoidModePasswordError);
    // the current state follows a rejected Connect
    client
        .recv_until(|idx, r| (idx == 0 && matches!(r, Response::DisconnectedResp(_))).then_some(()))
        .await;
    assert_eq!(d.bed.tunnels.created(), 0);

    // whitelisted without a secret
    client.secret.clear();
    client.send(&Request::GetVPNState, 8).await;
    client
        .recv_until(|idx, r| (idx == 8 && matches!(r, Response::DisconnectedResp(_))).then_some(()))
        .await;

    client.secret = "letmein".into();
    client.send(&Request::KillSwitchGetStatus, 9).await;
    client
        .recv_until(|idx, r| (idx == 9 && matches!(r, Response::KillSwitchStatusResp(_))).then_some(()))
        .await;
}

// ============================================================================
// Client lifetime
// ============================================================================

#[tokio::test]
async fn test_delayed_error_goes_to_next_client() {
    let d = daemon(false).await;
    d.bed
        .events
        .on_event(DaemonEvent::Error {
            message: "tunnel binary missing".into(),
            recoverable: false,
        })
        .await;
    // the broadcaster runs on its own task
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = Client::attach(d.addr, true).await;
    let err = client
        .recv_until(|_, r| match r {
            Response::ErrorRespDelayed(err) => Some(err),
            _ => None,
        })
        .await;
    assert_eq!(err.error_message, "tunnel binary missing");
}

#[tokio::test]
async fn test_connection_failure_without_clients_delayed() {
    let d = daemon(true).await;
    d.bed.tunnels.exit_at_start(Some(TunnelExit::Error("handshake".into())));
    let mut rx = d.bed.events.subscribe();

    d.service.engine.connect(d.bed.connect_params(), false).unwrap();
    timeout(WAIT, async {
        while !matches!(rx.recv().await.unwrap(), DaemonEvent::Disconnected { failure: true, .. }) {}
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = Client::attach(d.addr, true).await;
    let err = client
        .recv_until(|_, r| match r {
            Response::ErrorRespDelayed(err) => Some(err),
            _ => None,
        })
        .await;
    assert!(err.error_message.contains("handshake"), "{}", err.error_message);

    // reported once only
    let mut second = Client::attach(d.addr, true).await;
    second.send(&Request::GetVPNState, 2).await;
    let delayed = second
        .recv_until(|idx, r| match r {
            Response::ErrorRespDelayed(_) => Some(true),
            Response::DisconnectedResp(_) if idx == 2 => Some(false),
            _ => None,
        })
        .await;
    assert!(!delayed);
}

#[tokio::test]
async fn test_leaving_client_disconnects_vpn() {
    let d = daemon(true).await;
    let mut client = Client::attach(d.addr, false).await;
    let mut rx = d.bed.events.subscribe();

    d.service.engine.connect(d.bed.connect_params(), false).unwrap();
    timeout(WAIT, async {
        while !matches!(rx.recv().await.unwrap(), DaemonEvent::Connected(_)) {}
    })
    .await
    .unwrap();
    d.service.firewall.set_enabled(true).await.unwrap();

    client.send(&Request::GetVPNState, 2).await;
    drop(client);

    let engine = d.service.engine.clone();
    eventually("disconnect", || !engine.is_active()).await;
    eventually("firewall off", || !d.bed.firewall_backend.is_on()).await;
    assert_eq!(d.server.client_count(), 0);
}

#[tokio::test]
async fn test_keep_alone_client_leaves_vpn_up() {
    let d = daemon(true).await;
    let client = Client::attach(d.addr, true).await;
    let mut rx = d.bed.events.subscribe();

    d.service.engine.connect(d.bed.connect_params(), false).unwrap();
    timeout(WAIT, async {
        while !matches!(rx.recv().await.unwrap(), DaemonEvent::Connected(_)) {}
    })
    .await
    .unwrap();

    drop(client);
    let server = d.server.clone();
    eventually("client removal", || server.client_count() == 0).await;
    assert!(d.service.engine.is_active());
    assert!(d.service.engine.status().is_connected());

    d.service.engine.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_notifies_clients() {
    let d = daemon(false).await;
    let mut client = Client::attach(d.addr, true).await;

    d.service.request_shutdown();
    client
        .recv_until(|_, r| matches!(r, Response::ServiceExitingResp).then_some(()))
        .await;
    loop {
        if client.recv().await.is_none() {
            break;
        }
    }
}
