use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::crypto::{CertIdentity, DevProtector, Protector};
use crate::sink::profile::EventSinkProfile;
use crate::state::EventSessionState;

const SESSION_FILE: &str = "session.json";
const SINKS_FILE: &str = "sinks.json";
const SETTINGS_FILE: &str = "settings.json";
const STOPPED_FILE: &str = "stopped";

/// First byte of an on-disk protected credential blob (hex-encoded in the
/// document). Anything without it is treated as legacy plaintext.
const PROTECTED_MARKER: u8 = 0x01;

/// Local settings document; carries the reference to the current
/// data-protection certificate.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LocalSettings {
    #[serde(default)]
    cert_thumbprint: Option<String>,
}

/// Durable agent configuration: the session-state document and the
/// sink-profile document, each behind its own lock.
///
/// Credentials are plaintext in memory and protected on disk. Lock order is
/// always session before profiles; certificate rotation is the one section
/// that holds both.
pub struct SessionStore {
    dir: PathBuf,
    session: Mutex<EventSessionState>,
    profiles: Mutex<HashMap<String, EventSinkProfile>>,
    protector: Mutex<Option<Arc<dyn Protector>>>,
}

impl SessionStore {
    /// Opens the store under `dir`, creating empty documents as needed and
    /// decrypting stored credentials with the persisted certificate
    /// reference. A profile whose credentials cannot be decrypted degrades
    /// to empty credentials rather than failing the whole load.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating data directory {}", dir.display()))?;

        let settings: LocalSettings = read_doc(&dir.join(SETTINGS_FILE)).await?.unwrap_or_default();
        let protector: Option<Arc<dyn Protector>> = settings
            .cert_thumbprint
            .as_deref()
            .map(|t| Arc::new(DevProtector::from_thumbprint(t)) as Arc<dyn Protector>);

        let session: EventSessionState =
            read_doc(&dir.join(SESSION_FILE)).await?.unwrap_or_default();

        let mut profiles: HashMap<String, EventSinkProfile> =
            read_doc(&dir.join(SINKS_FILE)).await?.unwrap_or_default();

        for profile in profiles.values_mut() {
            profile.credentials = decode_credentials(
                &profile.name,
                &profile.credentials,
                protector.as_deref(),
            );
        }

        Ok(Self {
            dir,
            session: Mutex::new(session),
            profiles: Mutex::new(profiles),
            protector: Mutex::new(protector),
        })
    }

    // Session-state document.

    pub async fn session_state(&self) -> EventSessionState {
        self.session.lock().await.clone()
    }

    /// Applies a mutation to the session state and persists the document.
    pub async fn update_session_state<F>(&self, mutate: F) -> Result<EventSessionState>
    where
        F: FnOnce(&mut EventSessionState),
    {
        let mut session = self.session.lock().await;
        mutate(&mut session);
        write_doc(&self.dir.join(SESSION_FILE), &*session).await?;
        Ok(session.clone())
    }

    // Sink-profile document. Keys are lowercase profile names.

    pub async fn profiles(&self) -> Vec<EventSinkProfile> {
        let mut out: Vec<EventSinkProfile> =
            self.profiles.lock().await.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub async fn get_profile(&self, name: &str) -> Option<EventSinkProfile> {
        self.profiles.lock().await.get(&name.to_lowercase()).cloned()
    }

    pub async fn upsert_profile(&self, profile: EventSinkProfile) -> Result<()> {
        let mut profiles = self.profiles.lock().await;
        profiles.insert(profile.key(), profile);
        self.save_profiles(&profiles).await
    }

    pub async fn remove_profile(&self, name: &str) -> Result<Option<EventSinkProfile>> {
        let mut profiles = self.profiles.lock().await;
        let removed = profiles.remove(&name.to_lowercase());
        if removed.is_some() {
            self.save_profiles(&profiles).await?;
        }
        Ok(removed)
    }

    /// Replaces the whole profile set (ApplyAgentOptions semantics).
    pub async fn replace_profiles(&self, new_profiles: Vec<EventSinkProfile>) -> Result<()> {
        let mut profiles = self.profiles.lock().await;
        profiles.clear();
        for profile in new_profiles {
            profiles.insert(profile.key(), profile);
        }
        self.save_profiles(&profiles).await
    }

    async fn save_profiles(&self, profiles: &HashMap<String, EventSinkProfile>) -> Result<()> {
        let protector = self.protector.lock().await;

        let mut on_disk = profiles.clone();
        for profile in on_disk.values_mut() {
            profile.credentials =
                encode_credentials(&profile.credentials, protector.as_deref())?;
        }

        write_doc(&self.dir.join(SINKS_FILE), &on_disk).await
    }

    // Stopped sentinel.

    /// Whether the operator explicitly stopped the session. Survives
    /// restarts and suppresses auto-start until cleared.
    pub fn is_stopped(&self) -> bool {
        self.dir.join(STOPPED_FILE).exists()
    }

    pub async fn set_stopped(&self, stopped: bool) -> Result<()> {
        let path = self.dir.join(STOPPED_FILE);
        if stopped {
            tokio::fs::write(&path, b"")
                .await
                .with_context(|| format!("creating {}", path.display()))?;
        } else if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
        }
        Ok(())
    }

    // Data-protection certificate.

    pub async fn cert_thumbprint(&self) -> Option<String> {
        self.protector
            .lock()
            .await
            .as_ref()
            .map(|p| p.thumbprint().to_string())
    }

    /// Switches data protection to `identity`, re-encrypting every stored
    /// credential under the new certificate. Takes both document locks for
    /// the duration so no save interleaves with the rotation.
    pub async fn rotate_certificate(&self, identity: &CertIdentity) -> Result<()> {
        let _session = self.session.lock().await;
        let profiles = self.profiles.lock().await;

        {
            let mut protector = self.protector.lock().await;
            *protector = Some(Arc::new(DevProtector::new(identity)));
        }

        let settings = LocalSettings {
            cert_thumbprint: Some(identity.thumbprint().to_string()),
        };
        write_doc(&self.dir.join(SETTINGS_FILE), &settings).await?;

        // In-memory credentials are plaintext, so re-encryption is a save
        // under the new protector.
        let protector = self.protector.lock().await;
        let mut on_disk = profiles.clone();
        for profile in on_disk.values_mut() {
            profile.credentials =
                encode_credentials(&profile.credentials, protector.as_deref())?;
        }
        write_doc(&self.dir.join(SINKS_FILE), &on_disk).await?;

        info!(thumbprint = %identity.thumbprint(), "data-protection certificate rotated");
        Ok(())
    }
}

fn encode_credentials(plaintext: &str, protector: Option<&dyn Protector>) -> Result<String> {
    if plaintext.is_empty() {
        return Ok(String::new());
    }

    let Some(protector) = protector else {
        return Ok(plaintext.to_string());
    };

    let blob = protector.protect(plaintext)?;
    let mut bytes = Vec::with_capacity(blob.len() + 1);
    bytes.push(PROTECTED_MARKER);
    bytes.extend_from_slice(&blob);
    Ok(hex::encode(bytes))
}

fn decode_credentials(name: &str, stored: &str, protector: Option<&dyn Protector>) -> String {
    if stored.is_empty() {
        return String::new();
    }

    let Ok(bytes) = hex::decode(stored) else {
        // Legacy plaintext credentials.
        return stored.to_string();
    };
    if bytes.first() != Some(&PROTECTED_MARKER) {
        return stored.to_string();
    }

    let Some(protector) = protector else {
        warn!(profile = %name, "protected credentials but no certificate, degrading to empty");
        return String::new();
    };

    match protector.unprotect(&bytes[1..]) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            warn!(profile = %name, error = %e, "credential decrypt failed, degrading to empty");
            String::new()
        }
    }
}

async fn read_doc<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read_to_string(path).await {
        Ok(data) => {
            let doc = serde_json::from_str(&data)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(doc))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

async fn write_doc<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(doc).context("serializing document")?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkType;
    use crate::trace::{ProviderSettings, TraceLevel};

    fn profile(name: &str, credentials: &str) -> EventSinkProfile {
        EventSinkProfile {
            name: name.to_string(),
            sink_type: SinkType::Memory,
            batch_size: 10,
            max_write_delay_m_secs: 1000,
            persistent_channel: false,
            credentials: credentials.to_string(),
            options: serde_json::json!({}),
        }
    }

    fn identity(tag: &str) -> CertIdentity {
        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{tag}Zm9vYmFyYmF6cXV4\n-----END CERTIFICATE-----\n"
        );
        CertIdentity::from_pem(&pem).expect("identity")
    }

    #[tokio::test]
    async fn test_session_state_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");

        let store = SessionStore::open(dir.path()).await.expect("open");
        store
            .update_session_state(|s| {
                s.provider_settings.push(ProviderSettings {
                    name: "Kernel-Process".to_string(),
                    level: TraceLevel::Info,
                    match_any_keyword: 0,
                });
            })
            .await
            .expect("update");
        drop(store);

        let store = SessionStore::open(dir.path()).await.expect("reopen");
        let state = store.session_state().await;
        assert_eq!(state.provider_settings.len(), 1);
        assert_eq!(state.provider_settings[0].name, "Kernel-Process");
    }

    #[tokio::test]
    async fn test_profiles_are_keyed_case_insensitively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open");

        store
            .upsert_profile(profile("Elastic", ""))
            .await
            .expect("upsert");
        assert!(store.get_profile("ELASTIC").await.is_some());

        store
            .remove_profile("elastic")
            .await
            .expect("remove")
            .expect("existed");
        assert!(store.get_profile("Elastic").await.is_none());
    }

    #[tokio::test]
    async fn test_credentials_protected_on_disk_after_rotation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open");

        store.rotate_certificate(&identity("A")).await.expect("rotate");
        store
            .upsert_profile(profile("db", "user:secret"))
            .await
            .expect("upsert");

        let raw = std::fs::read_to_string(dir.path().join(SINKS_FILE)).expect("read");
        assert!(!raw.contains("user:secret"));

        // In-memory view stays plaintext, and a reopen decrypts.
        assert_eq!(
            store.get_profile("db").await.expect("profile").credentials,
            "user:secret"
        );
        drop(store);

        let store = SessionStore::open(dir.path()).await.expect("reopen");
        assert_eq!(
            store.get_profile("db").await.expect("profile").credentials,
            "user:secret"
        );
    }

    #[tokio::test]
    async fn test_rotation_reencrypts_and_old_key_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SessionStore::open(dir.path()).await.expect("open");

        let old = identity("OLD");
        let new = identity("NEW");

        store.rotate_certificate(&old).await.expect("rotate old");
        store
            .upsert_profile(profile("db", "user:secret"))
            .await
            .expect("upsert");

        store.rotate_certificate(&new).await.expect("rotate new");
        assert_eq!(
            store.cert_thumbprint().await.as_deref(),
            Some(new.thumbprint())
        );

        // The document is now encrypted under the new certificate only.
        let raw: HashMap<String, EventSinkProfile> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(SINKS_FILE)).expect("read"),
        )
        .expect("parse");
        let stored = &raw.get("db").expect("db profile").credentials;
        let bytes = hex::decode(stored).expect("hex");
        assert_eq!(bytes[0], PROTECTED_MARKER);

        let old_protector = DevProtector::new(&old);
        assert!(old_protector.unprotect(&bytes[1..]).is_err());

        let new_protector = DevProtector::new(&new);
        assert_eq!(
            new_protector.unprotect(&bytes[1..]).expect("unprotect"),
            "user:secret"
        );
    }

    #[tokio::test]
    async fn test_undecryptable_credentials_degrade_to_empty() {
        let dir = tempfile::tempdir().expect("tempdir");

        let store = SessionStore::open(dir.path()).await.expect("open");
        store.rotate_certificate(&identity("A")).await.expect("rotate");
        store
            .upsert_profile(profile("db", "user:secret"))
            .await
            .expect("upsert");
        drop(store);

        // Simulate losing the certificate reference.
        std::fs::remove_file(dir.path().join(SETTINGS_FILE)).expect("remove settings");

        let store = SessionStore::open(dir.path()).await.expect("reopen");
        assert_eq!(store.get_profile("db").await.expect("profile").credentials, "");
    }

    #[tokio::test]
    async fn test_stopped_sentinel_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        let store = SessionStore::open(dir.path()).await.expect("open");
        assert!(!store.is_stopped());
        store.set_stopped(true).await.expect("set");
        drop(store);

        let store = SessionStore::open(dir.path()).await.expect("reopen");
        assert!(store.is_stopped());
        store.set_stopped(false).await.expect("clear");
        assert!(!store.is_stopped());
    }
}
