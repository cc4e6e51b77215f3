//! Local network information and port reachability probes

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use warden_proto::servers::PortInfo;
use warden_proto::ServersInfo;

use crate::error::{Error, Result};

/// Public addresses used only to pick the outbound interface; nothing is sent
const PROBE_TARGET_V4: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
const PROBE_TARGET_V6: IpAddr = IpAddr::V6(Ipv6Addr::new(0x2a00, 0x1450, 0x400d, 0x80a, 0, 0, 0, 0x200e));

pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const MAX_PARALLEL_PROBES: usize = 30;

/// Local address of the interface that routes to the internet
pub async fn outbound_ip(ipv6: bool) -> Result<IpAddr> {
    outbound_ip_to(if ipv6 { PROBE_TARGET_V6 } else { PROBE_TARGET_V4 }).await
}

/// Local address the system would use to reach `dest`
pub async fn outbound_ip_to(dest: IpAddr) -> Result<IpAddr> {
    let bind = match dest {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(SocketAddr::new(dest, 80)).await?;
    let local = socket.local_addr()?.ip();
    if local.is_unspecified() {
        return Err(Error::Connection(format!("no route to {}", dest)));
    }
    Ok(local)
}

/// A free local TCP port
pub async fn free_tcp_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// Ports to probe for a request; an empty request means every catalog port
pub fn ports_to_test(servers: &ServersInfo, requested: &[PortInfo]) -> Vec<PortInfo> {
    let mut candidates: Vec<PortInfo> = if requested.is_empty() {
        let ports = &servers.config.ports;
        let mut all: Vec<PortInfo> = ports
            .wireguard
            .iter()
            .chain(ports.openvpn.iter())
            .cloned()
            .collect();
        all.push(PortInfo::tcp(ports.obfs3.port));
        all.push(PortInfo::tcp(ports.obfs4.port));
        all
    } else {
        requested.to_vec()
    };

    candidates.retain(|p| p.port > 0 && (p.is_tcp() || p.is_udp()));
    let mut out: Vec<PortInfo> = Vec::with_capacity(candidates.len());
    for port in candidates {
        if !out.iter().any(|p| p.same_as(&port)) {
            out.push(port);
        }
    }
    out
}

async fn probe_port(echo_server: IpAddr, port: &PortInfo) -> bool {
    let addr = SocketAddr::new(echo_server, port.port);
    if port.is_udp() {
        let probe = async {
            let bind = match echo_server {
                IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(addr).await?;
            socket.send(b"Hi!").await?;
            let mut buf = [0u8; 64];
            socket.recv(&mut buf).await?;
            Ok::<_, std::io::Error>(())
        };
        matches!(tokio::time::timeout(PORT_PROBE_TIMEOUT, probe).await, Ok(Ok(())))
    } else {
        matches!(
            tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Ports of `ports` reachable on the echo server
pub async fn accessible_ports(echo_server: IpAddr, ports: Vec<PortInfo>) -> Vec<PortInfo> {
    let total = ports.len();
    log::info!("Testing accessible ports...");
    let accessible: Vec<PortInfo> = stream::iter(ports)
        .map(|port| async move {
            let ok = probe_port(echo_server, &port).await;
            (port, ok)
        })
        .buffer_unordered(MAX_PARALLEL_PROBES)
        .filter_map(|(port, ok)| async move { ok.then_some(port) })
        .collect()
        .await;
    log::info!("Testing accessible ports done: {} of {} reachable", accessible.len(), total);
    accessible
}

type SharedProbe = Shared<BoxFuture<'static, Vec<PortInfo>>>;

/// Port reachability test; identical concurrent requests share one run
#[derive(Default)]
pub struct PortChecker {
    running: Mutex<Option<(Vec<PortInfo>, SharedProbe)>>,
}

impl PortChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, servers: &ServersInfo, requested: &[PortInfo]) -> Result<Vec<PortInfo>> {
        let Some(echo_server) = servers
            .config
            .ports
            .test
            .first()
            .and_then(|t| t.echo_server.trim().parse::<IpAddr>().ok())
        else {
            return Ok(Vec::new());
        };

        let ports = ports_to_test(servers, requested);
        if ports.is_empty() {
            return Ok(Vec::new());
        }

        let probe = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            match running.as_ref() {
                Some((tested, probe)) if same_port_set(tested, &ports) => probe.clone(),
                _ => {
                    let probe = accessible_ports(echo_server, ports.clone()).boxed().shared();
                    *running = Some((ports.clone(), probe.clone()));
                    probe
                }
            }
        };

        let result = probe.await;

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if matches!(running.as_ref(), Some((tested, _)) if same_port_set(tested, &ports)) {
            *running = None;
        }
        Ok(result)
    }
}

fn same_port_set(a: &[PortInfo], b: &[PortInfo]) -> bool {
    a.len() == b.len() && a.iter().all(|p| b.iter().any(|q| q.same_as(p)))
}
