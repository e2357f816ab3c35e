//! Trust store: fingerprint to public key and lifecycle status

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::SignatureSuite;
use crate::canonical::canonicalize_record;
use crate::error::{KgenError, KgenResult};

/// Lifecycle status of a trusted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Rotated,
    Revoked,
}

/// Trust outcome for a signature, as reported by verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Active,
    Rotated,
    Revoked,
    Unknown,
}

/// One trusted public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustEntry {
    pub suite: SignatureSuite,
    /// Hex-encoded public key material (raw for Ed25519, SPKI DER for RSA).
    pub public_key: String,
    pub status: KeyStatus,
    pub added_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<DateTime<Utc>>,
    /// Fingerprint of the key that superseded this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Canonical mapping fingerprint → entry, persisted as a single JSON file.
///
/// Reads are shared; all writes go through the KeyStore's exclusive lock.
#[derive(Debug)]
pub struct TrustStore {
    path: PathBuf,
    entries: BTreeMap<String, TrustEntry>,
    /// Grace window, in seconds, for signatures made by rotated keys.
    pub rotation_grace_secs: u64,
}

impl TrustStore {
    /// Load the store from `path`, or start empty if the file is absent.
    pub fn open(path: &Path, rotation_grace_secs: u64) -> KgenResult<Self> {
        let entries = if path.exists() {
            let raw = std::fs::read(path)?;
            serde_json::from_slice(&raw)
                .map_err(|e| KgenError::Schema(format!("trust store unreadable: {}", e)))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path: path.to_path_buf(), entries, rotation_grace_secs })
    }

    /// Persist the store in canonical form via temp+rename.
    pub fn save(&self) -> KgenResult<()> {
        let bytes = canonicalize_record(&self.entries)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(
            self.path.parent().unwrap_or_else(|| Path::new(".")),
        )?;
        std::io::Write::write_all(&mut tmp, &bytes)?;
        tmp.persist(&self.path).map_err(|e| KgenError::Io(e.error))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644))?;
        }
        Ok(())
    }

    pub fn entry(&self, fingerprint: &str) -> Option<&TrustEntry> {
        self.entries.get(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert_active(
        &mut self,
        fingerprint: String,
        suite: SignatureSuite,
        public_key_hex: String,
        added_at: DateTime<Utc>,
    ) {
        debug!(%fingerprint, "registering active key");
        self.entries.insert(
            fingerprint,
            TrustEntry {
                suite,
                public_key: public_key_hex,
                status: KeyStatus::Active,
                added_at,
                rotated_at: None,
                successor: None,
                notes: None,
            },
        );
    }

    /// Mark a key rotated, pointing at its successor fingerprint.
    pub fn mark_rotated(
        &mut self,
        fingerprint: &str,
        successor: String,
        rotated_at: DateTime<Utc>,
    ) -> KgenResult<()> {
        let entry = self.entries.get_mut(fingerprint).ok_or_else(|| {
            KgenError::Config(format!("unknown key fingerprint: {}", fingerprint))
        })?;
        entry.status = KeyStatus::Rotated;
        entry.rotated_at = Some(rotated_at);
        entry.successor = Some(successor);
        Ok(())
    }

    pub fn mark_revoked(&mut self, fingerprint: &str) -> KgenResult<()> {
        let entry = self.entries.get_mut(fingerprint).ok_or_else(|| {
            KgenError::Config(format!("unknown key fingerprint: {}", fingerprint))
        })?;
        entry.status = KeyStatus::Revoked;
        Ok(())
    }

    /// Decode the stored public key for a fingerprint.
    pub fn public_key_bytes(&self, fingerprint: &str) -> KgenResult<Vec<u8>> {
        let entry = self.entry(fingerprint).ok_or_else(|| {
            KgenError::Crypto(format!("no trusted key for fingerprint {}", fingerprint))
        })?;
        hex::decode(&entry.public_key)
            .map_err(|e| KgenError::Crypto(format!("trust store public key is not hex: {}", e)))
    }

    /// Trust decision for a signature made at `signed_at`.
    ///
    /// `revoked` is always refused. `rotated` is accepted only when the
    /// signing time falls within the grace window ending at the rotation.
    pub fn evaluate(&self, fingerprint: &str, signed_at: DateTime<Utc>) -> TrustStatus {
        match self.entry(fingerprint) {
            None => TrustStatus::Unknown,
            Some(entry) => match entry.status {
                KeyStatus::Active => TrustStatus::Active,
                KeyStatus::Revoked => TrustStatus::Revoked,
                KeyStatus::Rotated => {
                    let within_grace = entry.rotated_at.is_some_and(|rotated_at| {
                        signed_at <= rotated_at
                            && (rotated_at - signed_at).num_seconds()
                                <= self.rotation_grace_secs as i64
                    });
                    if within_grace {
                        TrustStatus::Rotated
                    } else {
                        TrustStatus::Revoked
                    }
                }
            },
        }
    }
}
