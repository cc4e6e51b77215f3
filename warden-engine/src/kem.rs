//! Post-quantum pre-shared key exchange
//!
//! Key generation and decapsulation are done by the KEM helper executable:
//!
//! ```text
//! <kem> genkeys <alg>          -> {"priv": "...", "pub": "..."}
//! <kem> decpsk <alg> < {"cipher": "...", "priv": "..."} -> {"secret": "..."}
//! ```
//!
//! The tunnel pre-shared key is `base64(SHA256(secret1 || secret2))` over the
//! decoded secrets of both algorithms, in the order of [`KemAlgorithm::ALL`].

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use warden_proto::api::{KemCiphers, KemPublicKeys};

use crate::error::{Error, Result};
use crate::helper;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KemAlgorithm {
    Kyber1024,
    ClassicMcEliece348864,
}

impl KemAlgorithm {
    pub const ALL: [KemAlgorithm; 2] = [KemAlgorithm::Kyber1024, KemAlgorithm::ClassicMcEliece348864];

    pub fn name(&self) -> &'static str {
        match self {
            KemAlgorithm::Kyber1024 => "Kyber1024",
            KemAlgorithm::ClassicMcEliece348864 => "Classic-McEliece-348864",
        }
    }
}

impl std::fmt::Display for KemAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Base64 key pair of one algorithm
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct KemKeyPair {
    #[serde(rename = "priv")]
    pub private_key: String,
    #[serde(rename = "pub")]
    pub public_key: String,
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KemKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait KemHelper: Send + Sync {
    async fn generate_keys(&self, algorithm: KemAlgorithm) -> Result<KemKeyPair>;
    /// Base64 shared secret encapsulated in `cipher`
    async fn decode_cipher(&self, algorithm: KemAlgorithm, private_key: &str, cipher: &str) -> Result<String>;
}

/// [`KemHelper`] backed by the KEM helper executable
pub struct KemHelperProcess {
    program: String,
}

impl KemHelperProcess {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[derive(Deserialize)]
struct DecpskResp {
    #[serde(default)]
    secret: String,
}

#[async_trait]
impl KemHelper for KemHelperProcess {
    async fn generate_keys(&self, algorithm: KemAlgorithm) -> Result<KemKeyPair> {
        let keys: KemKeyPair =
            helper::run_json(&self.program, &["genkeys", algorithm.name()], None).await?;
        if keys.private_key.is_empty() || keys.public_key.is_empty() {
            return Err(Error::Helper(format!("KEM helper returned empty keys ({})", algorithm)));
        }
        Ok(keys)
    }

    async fn decode_cipher(&self, algorithm: KemAlgorithm, private_key: &str, cipher: &str) -> Result<String> {
        let input = json!({ "cipher": cipher, "priv": private_key });
        let resp: DecpskResp =
            helper::run_json(&self.program, &["decpsk", algorithm.name()], Some(&input)).await?;
        if resp.secret.is_empty() {
            return Err(Error::Helper(format!("KEM helper returned empty secret ({})", algorithm)));
        }
        Ok(resp.secret)
    }
}

/// What the ciphertexts of an answer allow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresharedKey {
    Derived(String),
    /// The server did not take part in the exchange
    NotOffered,
    /// Only some ciphertexts came back; the request has to be repeated without KEM
    Incomplete,
}

/// Key pairs of one exchange
pub struct KemExchange {
    keys: Vec<(KemAlgorithm, KemKeyPair)>,
}

impl KemExchange {
    pub async fn generate(helper: &dyn KemHelper) -> Result<Self> {
        let mut keys = Vec::with_capacity(KemAlgorithm::ALL.len());
        for algorithm in KemAlgorithm::ALL {
            keys.push((algorithm, helper.generate_keys(algorithm).await?));
        }
        Ok(Self { keys })
    }

    pub fn public_keys(&self) -> KemPublicKeys {
        let mut out = KemPublicKeys::default();
        for (algorithm, pair) in &self.keys {
            match algorithm {
                KemAlgorithm::Kyber1024 => out.kyber1024 = pair.public_key.clone(),
                KemAlgorithm::ClassicMcEliece348864 => {
                    out.mceliece348864 = pair.public_key.clone()
                }
            }
        }
        out
    }

    pub async fn preshared_key(&self, helper: &dyn KemHelper, ciphers: &KemCiphers) -> Result<PresharedKey> {
        match ciphers.count() {
            0 => return Ok(PresharedKey::NotOffered),
            n if n < KemAlgorithm::ALL.len() => return Ok(PresharedKey::Incomplete),
            _ => {}
        }

        let mut secrets = Vec::with_capacity(self.keys.len());
        for (algorithm, pair) in &self.keys {
            let cipher = match algorithm {
                KemAlgorithm::Kyber1024 => &ciphers.kyber1024,
                KemAlgorithm::ClassicMcEliece348864 => &ciphers.mceliece348864,
            };
            secrets.push(helper.decode_cipher(*algorithm, &pair.private_key, cipher).await?);
        }
        Ok(PresharedKey::Derived(combine_secrets(&secrets)?))
    }
}

/// `base64(SHA256(s1 || s2 || ...))` over base64-decoded secrets
pub fn combine_secrets(secrets: &[String]) -> Result<String> {
    if secrets.is_empty() {
        return Err(Error::InvalidArgument("no KEM secrets to combine".into()));
    }
    let mut hasher = Sha256::new();
    for secret in secrets {
        let decoded = BASE64
            .decode(secret.trim())
            .map_err(|e| Error::Helper(format!("bad KEM secret encoding: {}", e)))?;
        hasher.update(&decoded);
    }
    Ok(BASE64.encode(hasher.finalize()))
}
