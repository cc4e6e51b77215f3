//! Startup handoff
//!
//! Local clients find the daemon through the port file: one line
//! `"<decimal port>:<hex secret>"`, readable by the owner only. The secret is
//! fresh for every launch.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tracing::{info, warn};

use warden_engine::preferences::write_private_file;

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-launch control secret
pub fn generate_secret() -> u64 {
    loop {
        let secret: u64 = rand::random();
        if secret != 0 {
            return secret;
        }
    }
}

/// Last four hex digits, the only part of the secret that is ever logged
pub fn secret_hint(secret: u64) -> String {
    format!("...{:04x}", secret & 0xffff)
}

/// Parse `"<port>:<hex secret>"`
pub fn parse_port_file(content: &str) -> Option<(u16, u64)> {
    let (port, secret) = content.trim().split_once(':')?;
    let port = port.parse().ok()?;
    let secret = u64::from_str_radix(secret, 16).ok()?;
    Some((port, secret))
}

/// Port file that is removed when dropped
pub struct PortFile {
    path: PathBuf,
}

impl PortFile {
    pub fn write(path: &Path, port: u16, secret: u64) -> Result<Self> {
        write_private_file(path, format!("{}:{:x}", port, secret).as_bytes())
            .with_context(|| format!("Failed to write port file {:?}", path))?;
        info!("Port file {:?} written (port {}, secret {})", path, port, secret_hint(secret));
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PortFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Port file {:?} removed", self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove port file {:?}: {}", self.path, e),
        }
    }
}

/// Refuse to start when the port file points at a daemon that still listens
pub async fn ensure_single_instance(path: &Path) -> Result<()> {
    let Ok(content) = fs::read_to_string(path) else {
        return Ok(());
    };
    let Some((port, _)) = parse_port_file(&content) else {
        warn!("Ignoring malformed port file {:?}", path);
        return Ok(());
    };

    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => bail!("Another daemon instance is listening on {}", addr),
        _ => {
            info!("Stale port file {:?} found; replacing it", path);
            Ok(())
        }
    }
}

/// Warn when the daemon lacks the privileges the platform helper needs
pub fn check_privileges() {
    #[cfg(unix)]
    {
        if !nix::unistd::Uid::effective().is_root() {
            warn!("Not running as root; firewall and DNS changes will likely fail");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_port_file() {
        assert_eq!(parse_port_file("4321:ff\n"), Some((4321, 0xff)));
        assert_eq!(parse_port_file("1:DEADBEEF"), Some((1, 0xdead_beef)));
        assert_eq!(parse_port_file("4321"), None);
        assert_eq!(parse_port_file("port:ff"), None);
        assert_eq!(parse_port_file("4321:xyz"), None);
    }

    #[test]
    fn test_secret_hint_shows_last_digits_only() {
        assert_eq!(secret_hint(0x1234_5678_9abc_def0), "...def0");
        assert_eq!(secret_hint(0x7), "...0007");
    }

    #[test]
    fn test_secret_is_never_zero() {
        for _ in 0..100 {
            assert_ne!(generate_secret(), 0);
        }
    }

    #[test]
    fn test_port_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("port.txt");

        let file = PortFile::write(&path, 5555, 0xabc).unwrap();
        let content = fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "5555:abc");
        assert_eq!(parse_port_file(&content), Some((5555, 0xabc)));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(file);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_instance_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port.txt");
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        fs::write(&path, format!("{}:1f", port)).unwrap();

        assert!(ensure_single_instance(&path).await.is_err());

        drop(listener);
        ensure_single_instance(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_or_malformed_port_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port.txt");
        ensure_single_instance(&path).await.unwrap();
        fs::write(&path, "garbage").unwrap();
        ensure_single_instance(&path).await.unwrap();
    }
}
