use std::fmt;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};

use crate::state::CertInstallOutcome;

/// Categorized certificate install failure. The category is what the
/// manager sees in the last-install result; the message carries detail.
#[derive(Debug)]
pub enum CertInstallError {
    /// Key or cipher material could not be used.
    Crypto(String),
    /// The certificate chain did not validate.
    InvalidChain(String),
    /// The certificate was valid but could not be installed.
    InstallFailure(String),
    Other(String),
}

impl CertInstallError {
    pub fn outcome(&self) -> CertInstallOutcome {
        match self {
            Self::Crypto(_) => CertInstallOutcome::Crypto,
            Self::InvalidChain(_) => CertInstallOutcome::InvalidChain,
            Self::InstallFailure(_) => CertInstallOutcome::InstallFailure,
            Self::Other(_) => CertInstallOutcome::Other,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Crypto(m) | Self::InvalidChain(m) | Self::InstallFailure(m) | Self::Other(m) => m,
        }
    }
}

impl fmt::Display for CertInstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crypto(m) => write!(f, "crypto error: {m}"),
            Self::InvalidChain(m) => write!(f, "invalid certificate chain: {m}"),
            Self::InstallFailure(m) => write!(f, "certificate install failed: {m}"),
            Self::Other(m) => write!(f, "certificate error: {m}"),
        }
    }
}

impl std::error::Error for CertInstallError {}

/// Identity derived from a PEM certificate: the sha256 thumbprint of the
/// encoded body plus the expiry carried in an optional `Not-After:` header
/// line preceding the PEM block (textual bag attribute style).
///
/// Full X.509 parsing stays outside this crate; the thumbprint is the only
/// part of the identity other components key on.
#[derive(Debug, Clone)]
pub struct CertIdentity {
    thumbprint: String,
    not_after: DateTime<Utc>,
    pem: String,
}

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

impl CertIdentity {
    pub fn from_pem(text: &str) -> Result<Self, CertInstallError> {
        let begin = text
            .find(PEM_BEGIN)
            .ok_or_else(|| CertInstallError::Crypto("missing PEM begin marker".to_string()))?;
        let end = text
            .find(PEM_END)
            .ok_or_else(|| CertInstallError::Crypto("missing PEM end marker".to_string()))?;
        if end <= begin {
            return Err(CertInstallError::Crypto(
                "malformed PEM block".to_string(),
            ));
        }

        let body: String = text[begin + PEM_BEGIN.len()..end]
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if body.is_empty() {
            return Err(CertInstallError::Crypto("empty PEM body".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(body.as_bytes());
        let thumbprint = hex::encode_upper(hasher.finalize());

        let not_after = text[..begin]
            .lines()
            .find_map(|line| line.trim().strip_prefix("Not-After:"))
            .map(|v| {
                DateTime::parse_from_rfc3339(v.trim())
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| CertInstallError::Crypto(format!("bad Not-After header: {e}")))
            })
            .transpose()?
            .unwrap_or_else(|| Utc::now() + Duration::days(365));

        Ok(Self {
            thumbprint,
            not_after,
            pem: text.to_string(),
        })
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn days_remaining(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Chain validation hook. The full trust evaluation lives outside this
    /// crate; here an expired certificate is the only rejected chain.
    pub fn validate_chain(&self) -> Result<(), CertInstallError> {
        if self.not_after <= Utc::now() {
            return Err(CertInstallError::InvalidChain(format!(
                "certificate expired at {}",
                self.not_after
            )));
        }
        Ok(())
    }
}

/// Reversible credential protection keyed by a certificate.
pub trait Protector: Send + Sync {
    /// Thumbprint of the certificate this protector is keyed by.
    fn thumbprint(&self) -> &str;

    fn protect(&self, plaintext: &str) -> Result<Vec<u8>>;

    fn unprotect(&self, blob: &[u8]) -> Result<String>;
}

/// Development protector: a sha256-derived keystream XOR keyed by the
/// certificate thumbprint, with a key-id prefix so a blob protected under a
/// rotated-away certificate fails to unprotect instead of decoding garbage.
pub struct DevProtector {
    thumbprint: String,
    key_id: [u8; 8],
}

impl DevProtector {
    pub fn new(identity: &CertIdentity) -> Self {
        Self::from_thumbprint(identity.thumbprint())
    }

    pub fn from_thumbprint(thumbprint: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"tracerelay-key-id");
        hasher.update(thumbprint.as_bytes());
        let digest = hasher.finalize();

        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&digest[..8]);

        Self {
            thumbprint: thumbprint.to_string(),
            key_id,
        }
    }

    fn keystream_block(&self, counter: u64) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.thumbprint.as_bytes());
        hasher.update(counter.to_le_bytes());
        hasher.finalize().into()
    }

    fn apply_keystream(&self, data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(32).enumerate() {
            let block = self.keystream_block(i as u64);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }
}

impl Protector for DevProtector {
    fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    fn protect(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + plaintext.len());
        out.extend_from_slice(&self.key_id);

        let mut payload = plaintext.as_bytes().to_vec();
        self.apply_keystream(&mut payload);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn unprotect(&self, blob: &[u8]) -> Result<String> {
        if blob.len() < 8 {
            bail!("protected blob too short");
        }
        if blob[..8] != self.key_id {
            bail!("protected blob was encrypted under a different certificate");
        }

        let mut payload = blob[8..].to_vec();
        self.apply_keystream(&mut payload);
        String::from_utf8(payload).context("unprotected payload is not valid UTF-8")
    }
}
