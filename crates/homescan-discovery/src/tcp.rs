//! Subnet sweep finding hosts that accept connections on a TCP port

use async_trait::async_trait;
use homescan_core::CandidateDevice;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::probe::{CandidateSender, Probe, ProbeError};
use crate::scope::ScanScope;

/// Smallest prefix swept; larger subnets are rejected
const MIN_PREFIX_LEN: u8 = 16;

/// Default per-host connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;

/// Default number of connects in flight at once
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

/// TCP sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpProbeConfig {
    /// Subnet to sweep (e.g., "192.168.1.0")
    pub subnet: Ipv4Addr,
    /// Subnet prefix length (e.g., 24 for /24)
    pub prefix_len: u8,
    /// Port a device must accept connections on
    pub port: u16,
    /// Type tag given to every host found
    pub type_tag: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on concurrent connects; keeps the sweep within the fd limit
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Probe reporting every host in a subnet that answers on a TCP port
///
/// The host address is the raw id. Candidates are produced in the order
/// hosts answer. A connect that fails for a local reason (fd exhaustion,
/// no buffer space, unreachable network) fails the whole sweep, so a
/// partial host list is never reported as complete.
#[derive(Debug, Clone)]
pub struct TcpPortProbe {
    config: TcpProbeConfig,
}

impl TcpPortProbe {
    pub fn new(config: TcpProbeConfig) -> Self {
        Self { config }
    }

    /// Run `connect` over every host with at most `max_concurrent` in flight
    async fn sweep<F, Fut>(
        &self,
        scope: &ScanScope,
        hosts: &[Ipv4Addr],
        candidates: &CandidateSender,
        connect: F,
    ) -> Result<usize, ProbeError>
    where
        F: Fn(Ipv4Addr) -> Fut,
        Fut: Future<Output = Result<bool, ProbeError>> + Send + 'static,
    {
        let limit = self.config.max_concurrent.max(1);
        let mut pending = hosts.iter().copied();
        let mut tasks = JoinSet::new();
        for host in pending.by_ref().take(limit) {
            let attempt = connect(host);
            tasks.spawn(async move { (host, attempt.await) });
        }

        let mut found = 0usize;
        while let Some(joined) = tasks.join_next().await {
            if let Some(host) = pending.next() {
                let attempt = connect(host);
                tasks.spawn(async move { (host, attempt.await) });
            }

            let (host, status) = joined.map_err(|e| ProbeError::Other(e.into()))?;
            // An error returns early; dropping the set aborts remaining connects
            if !status? {
                continue;
            }

            trace!(scope = %scope.id, ip = %host, port = self.config.port, "Host accepted connection");
            let label = format!("{} ({})", self.config.type_tag, host);
            let candidate = CandidateDevice::new(host.to_string(), label, &self.config.type_tag)
                .with_property("ip", host.to_string())
                .with_property("port", i64::from(self.config.port));
            if !candidates.send(candidate).await {
                // Pass stopped
                break;
            }
            found += 1;
        }
        Ok(found)
    }
}

/// Classify one connect attempt; `None` means it timed out
///
/// `Ok(true)` is an open port and `Ok(false)` a host that is absent or not
/// listening. Everything else is a failure of the sweep itself.
fn classify(attempt: Option<std::io::Result<()>>, ip: Ipv4Addr) -> Result<bool, ProbeError> {
    match attempt {
        Some(Ok(())) => Ok(true),
        None => Ok(false),
        Some(Err(e)) => match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::HostUnreachable => Ok(false),
            ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown => {
                Err(ProbeError::Network(format!("{}: {}", ip, e)))
            }
            _ => Err(ProbeError::Io(e)),
        },
    }
}

async fn connect(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> Result<bool, ProbeError> {
    let attempt = timeout(connect_timeout, TcpStream::connect(SocketAddr::from((ip, port))))
        .await
        .ok()
        .map(|r| r.map(|_| ()));
    classify(attempt, ip)
}

#[async_trait]
impl Probe for TcpPortProbe {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn enumerate(&self, scope: &ScanScope, candidates: CandidateSender) -> Result<(), ProbeError> {
        let hosts = subnet_hosts(self.config.subnet, self.config.prefix_len)?;
        let port = self.config.port;
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);

        debug!(
            scope = %scope.id,
            subnet = %self.config.subnet,
            prefix = self.config.prefix_len,
            port = port,
            hosts = hosts.len(),
            max_concurrent = self.config.max_concurrent,
            "Sweeping subnet"
        );

        let found = self
            .sweep(scope, &hosts, &candidates, |ip| connect(ip, port, connect_timeout))
            .await?;

        debug!(scope = %scope.id, probed = hosts.len(), found = found, "Subnet sweep complete");
        Ok(())
    }
}

/// Host addresses of a subnet, excluding network and broadcast addresses
/// for prefixes shorter than /31
fn subnet_hosts(subnet: Ipv4Addr, prefix_len: u8) -> Result<Vec<Ipv4Addr>, ProbeError> {
    if prefix_len > 32 || prefix_len < MIN_PREFIX_LEN {
        return Err(ProbeError::InvalidScope(format!(
            "prefix length {} outside /{}../32",
            prefix_len, MIN_PREFIX_LEN
        )));
    }

    let mask = if prefix_len == 32 {
        u32::MAX
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    };
    let network = u32::from(subnet) & mask;
    let broadcast = network | !mask;

    let range = if prefix_len >= 31 {
        network..=broadcast
    } else {
        (network + 1)..=(broadcast - 1)
    };
    Ok(range.map(Ipv4Addr::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use homescan_core::PropertyValue;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_subnet_hosts() {
        let hosts = subnet_hosts(Ipv4Addr::new(192, 168, 1, 77), 30).unwrap();
        assert_eq!(
            hosts,
            vec![Ipv4Addr::new(192, 168, 1, 77), Ipv4Addr::new(192, 168, 1, 78)]
        );

        assert_eq!(subnet_hosts(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap().len(), 254);
        assert_eq!(
            subnet_hosts(Ipv4Addr::new(10, 0, 0, 5), 32).unwrap(),
            vec![Ipv4Addr::new(10, 0, 0, 5)]
        );
    }

    #[test]
    fn test_subnet_hosts_rejects_bad_prefix() {
        assert!(matches!(
            subnet_hosts(Ipv4Addr::new(10, 0, 0, 0), 33),
            Err(ProbeError::InvalidScope(_))
        ));
        assert!(matches!(
            subnet_hosts(Ipv4Addr::new(10, 0, 0, 0), 8),
            Err(ProbeError::InvalidScope(_))
        ));
    }

    fn probe(port: u16) -> TcpPortProbe {
        TcpPortProbe::new(TcpProbeConfig {
            subnet: Ipv4Addr::LOCALHOST,
            prefix_len: 32,
            port,
            type_tag: "controller".to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        })
    }

    fn subnet_probe(max_concurrent: usize) -> TcpPortProbe {
        TcpPortProbe::new(TcpProbeConfig {
            subnet: Ipv4Addr::new(10, 0, 0, 0),
            prefix_len: 24,
            port: 80,
            type_tag: "controller".to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_concurrent,
        })
    }

    #[test]
    fn test_classify_connect_attempts() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        assert!(classify(Some(Ok(())), ip).unwrap());
        assert!(!classify(None, ip).unwrap());
        assert!(!classify(Some(Err(ErrorKind::ConnectionRefused.into())), ip).unwrap());
        assert!(!classify(Some(Err(ErrorKind::HostUnreachable.into())), ip).unwrap());

        assert!(matches!(
            classify(Some(Err(ErrorKind::NetworkUnreachable.into())), ip),
            Err(ProbeError::Network(_))
        ));
        // EMFILE, too many open files
        assert!(matches!(
            classify(Some(Err(std::io::Error::from_raw_os_error(24))), ip),
            Err(ProbeError::Io(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_caps_connects_in_flight() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let hosts = subnet_hosts(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();

        let (tx, mut rx) = mpsc::channel(hosts.len());
        let found = subnet_probe(8)
            .sweep(&ScanScope::new("bridge1"), &hosts, &CandidateSender::new(tx), |_| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(true)
                }
            })
            .await
            .unwrap();

        assert_eq!(found, 254);
        assert_eq!(peak.load(Ordering::SeqCst), 8);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 254);
    }

    #[tokio::test]
    async fn test_local_connect_failure_fails_sweep() {
        let hosts = subnet_hosts(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();
        let exhausted = Ipv4Addr::new(10, 0, 0, 100);

        let (tx, mut rx) = mpsc::channel(hosts.len());
        let result = subnet_probe(4)
            .sweep(&ScanScope::new("bridge1"), &hosts, &CandidateSender::new(tx), move |ip| async move {
                if ip == exhausted {
                    classify(Some(Err(std::io::Error::from_raw_os_error(24))), ip)
                } else {
                    Ok(true)
                }
            })
            .await;

        assert!(matches!(result, Err(ProbeError::Io(_))));
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received < hosts.len());
    }

    #[tokio::test]
    async fn test_finds_listening_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::channel(8);
        probe(port)
            .enumerate(&ScanScope::new("bridge1"), CandidateSender::new(tx))
            .await
            .unwrap();

        let candidate = rx.recv().await.unwrap();
        assert_eq!(candidate.raw_id, "127.0.0.1");
        assert_eq!(candidate.type_tag, "controller");
        assert_eq!(candidate.properties["port"], PropertyValue::Integer(i64::from(port)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_port_is_not_an_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, mut rx) = mpsc::channel(8);
        probe(port)
            .enumerate(&ScanScope::new("bridge1"), CandidateSender::new(tx))
            .await
            .unwrap();
        assert!(rx.recv().await.is_none());
    }
}
