//! Enhanced App Authentication
//!
//! When enabled, every control request outside the whitelist must carry a
//! secret whose PBKDF2 hash matches the stored one. The file holds a 32-byte
//! salt followed by the 64-byte hash.

use std::collections::VecDeque;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rand::RngCore;
use ring::pbkdf2;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::preferences::write_private_file;

pub const SALT_LEN: usize = 32;
pub const HASH_LEN: usize = 64;
pub const ITERATIONS: u32 = 4096;

/// Failures counted by the lockout
const FAILURE_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAILURES: usize = 6;
const DELAY_AFTER_FAILURES: usize = 4;
const FAILURE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, PartialEq, Eq)]
struct Stored {
    salt: [u8; SALT_LEN],
    hash: [u8; HASH_LEN],
}

impl Stored {
    fn new(secret: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        Self {
            hash: derive(secret, &salt),
            salt,
        }
    }

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != SALT_LEN + HASH_LEN {
            return None;
        }
        let (salt, hash) = data.split_at(SALT_LEN);
        Some(Self {
            salt: salt.try_into().ok()?,
            hash: hash.try_into().ok()?,
        })
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SALT_LEN + HASH_LEN);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.hash);
        out
    }

    fn matches(&self, secret: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations(),
            &self.salt,
            secret.as_bytes(),
            &self.hash,
        )
        .is_ok()
    }
}

fn iterations() -> NonZeroU32 {
    NonZeroU32::new(ITERATIONS).unwrap_or(NonZeroU32::MIN)
}

fn derive(secret: &str, salt: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations(), salt, secret.as_bytes(), &mut out);
    out
}

pub struct Eaa {
    path: PathBuf,
    stored: Mutex<Option<Stored>>,
    failures: Mutex<VecDeque<Instant>>,
}

impl Eaa {
    /// Load the secret file at `path`; a missing or malformed file leaves EAA disabled
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stored = match fs::read(&path) {
            Ok(data) => {
                let stored = Stored::parse(&data);
                if stored.is_none() {
                    log::warn!("Ignoring malformed EAA file {}", path.display());
                }
                stored
            }
            Err(_) => None,
        };
        if stored.is_some() {
            log::info!("Enhanced App Authentication is enabled");
        }
        Self {
            path,
            stored: Mutex::new(stored),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_enabled(&self) -> bool {
        self.stored.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Verify `secret`, subject to the failure lockout
    ///
    /// Always succeeds while EAA is disabled.
    pub async fn check(&self, secret: &str) -> Result<()> {
        let Some(stored) = self.stored.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return Ok(());
        };

        let recent = self.recent_failures();
        if recent >= MAX_FAILURES {
            return Err(Error::ParanoidModePassword(
                "exceeded the allowed number of requests with an invalid EAA password".into(),
            ));
        }
        if recent >= DELAY_AFTER_FAILURES {
            tokio::time::sleep(FAILURE_DELAY).await;
        }

        if secret.is_empty() {
            self.record_failure();
            return Err(Error::ParanoidModePassword("EAA password is required".into()));
        }
        let secret = secret.to_owned();
        let ok = tokio::task::spawn_blocking(move || stored.matches(&secret))
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;
        if !ok {
            self.record_failure();
            return Err(Error::ParanoidModePassword("EAA password is not valid".into()));
        }
        Ok(())
    }

    /// Replace the secret; `current` must match while EAA is enabled
    ///
    /// An empty `new_secret` disables EAA.
    pub async fn set_secret(&self, current: &str, new_secret: &str) -> Result<()> {
        self.check(current).await?;

        if new_secret.trim() != new_secret {
            return Err(Error::InvalidArgument(
                "EAA password must not start or end with whitespace".into(),
            ));
        }

        if new_secret.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = None;
            log::info!("Enhanced App Authentication disabled");
            return Ok(());
        }

        let secret = new_secret.to_owned();
        let stored = tokio::task::spawn_blocking(move || Stored::new(&secret))
            .await
            .map_err(|e| Error::Unknown(e.to_string()))?;
        write_private_file(&self.path, &stored.to_bytes())?;
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(stored);
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clear();
        log::info!("Enhanced App Authentication enabled");
        Ok(())
    }

    fn recent_failures(&self) -> usize {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        while failures
            .front()
            .is_some_and(|t| now.duration_since(*t) >= FAILURE_WINDOW)
        {
            failures.pop_front();
        }
        failures.len()
    }

    fn record_failure(&self) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Instant::now());
    }
}
