//! Server ping sweep and fastest-host selection

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;

use warden_proto::servers::{gateway_prefix, HostInfo};
use warden_proto::{ServersInfo, VpnType};

use crate::error::Result;
use crate::event::{DaemonEvent, EventHandler};
use crate::firewall::FirewallController;

/// Per-host timeout of the first phase
pub const FIRST_PHASE_TIMEOUT: Duration = Duration::from_millis(400);
/// Per-host timeout of the second phase
pub const SECOND_PHASE_TIMEOUT: Duration = Duration::from_millis(800);
/// Pings in flight at the same time
pub const MAX_PARALLEL_PINGS: usize = 10;

/// Port of the UDP probe used when ICMP sockets are not permitted
const UDP_PROBE_PORT: u16 = 33434;

#[async_trait]
pub trait Pinger: Send + Sync {
    /// Round-trip time of one echo, `None` on timeout or failure
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<Duration>;
}

/// Pinger using unprivileged ICMP datagram sockets
///
/// When the system refuses ICMP sockets, a UDP datagram is sent to a closed
/// port and the ICMP "port unreachable" answer (seen as a refused receive on
/// the connected socket) is timed instead.
#[derive(Debug, Default)]
pub struct SystemPinger;

impl SystemPinger {
    pub fn new() -> Self {
        Self
    }

    async fn icmp_echo(ip: IpAddr, timeout: Duration) -> io::Result<Duration> {
        let (domain, protocol, request_type, reply_type) = match ip {
            IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
            IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(protocol))?;
        socket.set_nonblocking(true)?;
        socket.connect(&SockAddr::from(SocketAddr::new(ip, 0)))?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;

        let packet = echo_request(request_type, rand::random::<u16>());
        let started = Instant::now();
        socket.send(&packet).await?;

        let mut buf = [0u8; 512];
        tokio::time::timeout(timeout, async {
            loop {
                let len = socket.recv(&mut buf).await?;
                if len >= 8 && buf[0] == reply_type {
                    return Ok(started.elapsed());
                }
            }
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "ping timed out"))?
    }

    async fn udp_probe(ip: IpAddr, timeout: Duration) -> io::Result<Duration> {
        let bind: SocketAddr = match ip {
            IpAddr::V4(_) => "0.0.0.0:0".parse().map_err(io::Error::other)?,
            IpAddr::V6(_) => "[::]:0".parse().map_err(io::Error::other)?,
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(SocketAddr::new(ip, UDP_PROBE_PORT)).await?;

        let started = Instant::now();
        socket.send(b"ping").await?;

        let mut buf = [0u8; 64];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(_)) => Ok(started.elapsed()),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(started.elapsed()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "probe timed out")),
        }
    }
}

#[async_trait]
impl Pinger for SystemPinger {
    async fn ping(&self, ip: IpAddr, timeout: Duration) -> Option<Duration> {
        match Self::icmp_echo(ip, timeout).await {
            Ok(rtt) => Some(rtt),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => None,
            Err(e) => {
                log::debug!("ICMP socket unavailable ({}); using UDP probe for {}", e, ip);
                Self::udp_probe(ip, timeout).await.ok()
            }
        }
    }
}

fn echo_request(icmp_type: u8, sequence: u16) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = icmp_type;
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..].copy_from_slice(b"warden!!");
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    /// Budget of the first phase
    pub timeout: Duration,
    /// Tunnel kind whose hosts are pinged first
    pub prioritized: Option<VpnType>,
    pub skip_second_phase: bool,
}

/// Runs ping sweeps over the catalog hosts, one sweep at a time
pub struct PingSweeper {
    pinger: Arc<dyn Pinger>,
    firewall: Arc<FirewallController>,
    events: Arc<dyn EventHandler>,
    busy: Arc<Semaphore>,
    last: Mutex<HashMap<IpAddr, u32>>,
}

impl PingSweeper {
    pub fn new(pinger: Arc<dyn Pinger>, firewall: Arc<FirewallController>, events: Arc<dyn EventHandler>) -> Self {
        Self {
            pinger,
            firewall,
            events,
            busy: Arc::new(Semaphore::new(1)),
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Results of the latest sweep, in milliseconds
    pub fn last_results(&self) -> HashMap<IpAddr, u32> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_running(&self) -> bool {
        self.busy.available_permits() == 0
    }

    /// Ping every host of the catalog
    ///
    /// Returns the first-phase results. Hosts that did not answer in time are
    /// retried in the background with a longer timeout unless the second
    /// phase is skipped; the merged results are then emitted as an event.
    /// A sweep requested while another one runs returns nothing.
    pub async fn sweep(self: &Arc<Self>, servers: &ServersInfo, opts: SweepOptions) -> Result<HashMap<IpAddr, u32>> {
        let Ok(permit) = self.busy.clone().try_acquire_owned() else {
            log::info!("Servers pinging skipped; a sweep is already in progress");
            return Ok(HashMap::new());
        };
        if opts.timeout.is_zero() {
            return Ok(HashMap::new());
        }

        let hosts = hosts_to_ping(servers, opts.prioritized);
        if hosts.is_empty() {
            return Ok(HashMap::new());
        }
        self.firewall.add_hosts_exception(&hosts, true, false).await?;

        let deadline = tokio::time::Instant::now() + opts.timeout;
        let first = self.ping_hosts(&hosts, FIRST_PHASE_TIMEOUT, Some(deadline)).await;
        log::info!("Pinged {} servers ({} answered)", hosts.len(), first.len());

        let remaining: Vec<IpAddr> = hosts
            .iter()
            .copied()
            .filter(|ip| !first.contains_key(ip))
            .collect();

        if opts.skip_second_phase || remaining.is_empty() {
            self.finish(&hosts, first.clone()).await;
            drop(permit);
            return Ok(first);
        }

        let sweeper = self.clone();
        let mut merged = first.clone();
        tokio::spawn(async move {
            let second = sweeper.ping_hosts(&remaining, SECOND_PHASE_TIMEOUT, None).await;
            for (ip, ms) in second {
                merged
                    .entry(ip)
                    .and_modify(|v| *v = (*v).min(ms))
                    .or_insert(ms);
            }
            sweeper.finish(&hosts, merged).await;
            drop(permit);
        });

        Ok(first)
    }

    async fn finish(&self, hosts: &[IpAddr], results: HashMap<IpAddr, u32>) {
        if let Err(e) = self.firewall.remove_hosts_exception(hosts, true, false).await {
            log::warn!("Failed to remove ping exceptions: {}", e);
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = results.clone();
        let mut list: Vec<(String, u32)> = results
            .into_iter()
            .map(|(ip, ms)| (ip.to_string(), ms))
            .collect();
        list.sort();
        self.events.on_event(DaemonEvent::PingResults(list)).await;
    }

    async fn ping_hosts(
        &self,
        hosts: &[IpAddr],
        per_host: Duration,
        deadline: Option<tokio::time::Instant>,
    ) -> HashMap<IpAddr, u32> {
        let pinger = self.pinger.clone();
        let mut pings = stream::iter(hosts.to_vec())
            .map(|ip| {
                let pinger = pinger.clone();
                async move { (ip, pinger.ping(ip, per_host).await) }
            })
            .buffer_unordered(MAX_PARALLEL_PINGS);

        let mut results = HashMap::new();
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, pings.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        log::info!("Servers pinging stopped: time budget exhausted");
                        break;
                    }
                },
                None => pings.next().await,
            };
            match next {
                Some((ip, Some(rtt))) => {
                    results.insert(ip, rtt.as_millis().max(1) as u32);
                }
                Some((_, None)) => {}
                None => break,
            }
        }
        results
    }
}

/// Host addresses of the catalog, the prioritised tunnel kind first
pub fn hosts_to_ping(servers: &ServersInfo, prioritized: Option<VpnType>) -> Vec<IpAddr> {
    let order = match prioritized {
        Some(VpnType::CTunnel) => [VpnType::CTunnel, VpnType::WTunnel],
        _ => [VpnType::WTunnel, VpnType::CTunnel],
    };

    let mut out: Vec<IpAddr> = Vec::new();
    for vpn_type in order {
        for server in servers.servers(vpn_type) {
            for ip in server.hosts.iter().filter_map(HostInfo::ip) {
                if !out.contains(&ip) {
                    out.push(ip);
                }
            }
        }
    }
    out
}

/// Host with the lowest round-trip time among the servers of one tunnel kind
///
/// Gateways in `exclude` are skipped; ids are compared by their part before
/// the first `.`.
pub fn fastest_host(
    servers: &ServersInfo,
    vpn_type: VpnType,
    results: &HashMap<IpAddr, u32>,
    exclude: &[String],
) -> Option<HostInfo> {
    let excluded: Vec<&str> = exclude.iter().map(|g| gateway_prefix(g.trim())).collect();

    servers
        .servers(vpn_type)
        .iter()
        .filter(|s| !excluded.contains(&gateway_prefix(&s.gateway)))
        .flat_map(|s| s.hosts.iter())
        .filter(|h| !excluded.contains(&h.gateway_prefix()))
        .filter_map(|h| {
            let ms = h.ip().and_then(|ip| results.get(&ip))?;
            Some((*ms, h))
        })
        .min_by_key(|(ms, _)| *ms)
        .map(|(_, h)| h.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelEventHandler;
    use crate::mock::{MockFirewall, MockPinger};
    use crate::preferences::PreferencesStore;

    fn catalog() -> ServersInfo {
        serde_json::from_value(serde_json::json!({
            "wireguard": [
                {"gateway": "nl1.wg.example.net", "country_code": "NL",
                 "hosts": [{"hostname": "nl1.wg.example.net", "host": "10.1.0.1"}]},
                {"gateway": "de1.wg.example.net", "country_code": "DE",
                 "hosts": [{"hostname": "de1.wg.example.net", "host": "10.1.0.2"}]},
                {"gateway": "us1.wg.example.net", "country_code": "US",
                 "hosts": [{"hostname": "us1.wg.example.net", "host": "10.1.0.3"}]}
            ],
            "openvpn": [
                {"gateway": "nl1.gw.example.net", "country_code": "NL",
                 "hosts": [{"hostname": "nl1.gw.example.net", "host": "10.2.0.1"}]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_icmp_checksum() {
        let packet = echo_request(8, 1);
        // a packet including its checksum sums to zero
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_hosts_prioritized() {
        let servers = catalog();
        let hosts = hosts_to_ping(&servers, Some(VpnType::CTunnel));
        assert_eq!(hosts[0], "10.2.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(hosts.len(), 4);
        let hosts = hosts_to_ping(&servers, None);
        assert_eq!(hosts[0], "10.1.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_fastest_honours_exclude_list() {
        let servers = catalog();
        let mut results = HashMap::new();
        results.insert("10.1.0.1".parse().unwrap(), 20);
        results.insert("10.1.0.2".parse().unwrap(), 30);
        results.insert("10.1.0.3".parse().unwrap(), 90);

        let best = fastest_host(&servers, VpnType::WTunnel, &results, &[]).unwrap();
        assert_eq!(best.host, "10.1.0.1");

        let best = fastest_host(&servers, VpnType::WTunnel, &results, &["nl1".into()]).unwrap();
        assert_eq!(best.host, "10.1.0.2");

        // full gateway ids are normalised too
        let exclude = vec!["nl1.wg.example.net".to_string(), "de1".to_string()];
        let best = fastest_host(&servers, VpnType::WTunnel, &results, &exclude).unwrap();
        assert_eq!(best.host, "10.1.0.3");

        assert!(fastest_host(&servers, VpnType::WTunnel, &HashMap::new(), &[]).is_none());
    }

    #[tokio::test]
    async fn test_sweep_two_phases() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = Arc::new(PreferencesStore::load(dir.path().join("settings.json")));
        let fw_backend = Arc::new(MockFirewall::new());
        let events = Arc::new(ChannelEventHandler::new(16));
        let mut rx = events.subscribe();
        let firewall = Arc::new(FirewallController::new(fw_backend.clone(), prefs, events.clone()));

        let pinger = Arc::new(MockPinger::new());
        pinger.set_rtt("10.1.0.1".parse().unwrap(), Duration::from_millis(15));
        // only answers within the longer second-phase timeout
        pinger.set_rtt("10.1.0.2".parse().unwrap(), Duration::from_millis(600));

        let sweeper = Arc::new(PingSweeper::new(pinger.clone(), firewall, events.clone()));
        let opts = SweepOptions {
            timeout: Duration::from_secs(6),
            prioritized: None,
            skip_second_phase: false,
        };
        let first = sweeper.sweep(&catalog(), opts).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[&"10.1.0.1".parse::<IpAddr>().unwrap()], 15);
        assert!(fw_backend.has_exception("10.1.0.3".parse().unwrap()));

        // a concurrent sweep is refused while the second phase runs
        assert!(sweeper.sweep(&catalog(), opts).await.unwrap().is_empty());

        let merged = loop {
            if let DaemonEvent::PingResults(list) = rx.recv().await.unwrap() {
                break list;
            }
        };
        assert_eq!(
            merged,
            vec![("10.1.0.1".to_string(), 15), ("10.1.0.2".to_string(), 600)]
        );
        assert!(!fw_backend.has_exception("10.1.0.3".parse().unwrap()));
        assert_eq!(sweeper.last_results().len(), 2);
    }
}
