//! Environment configuration and the deterministic clock

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{KgenError, KgenResult};

/// Passphrase used to unwrap the private key, if the key is wrapped.
pub const ENV_KEY_PASSPHRASE: &str = "KGEN_KEY_PASSPHRASE";
/// Override for the public key file location.
pub const ENV_PUBLIC_KEY_PATH: &str = "KGEN_PUBLIC_KEY_PATH";
/// Override for the trust store location.
pub const ENV_TRUST_STORE: &str = "KGEN_TRUST_STORE";
/// Override for the ledger file location.
pub const ENV_INTEGRITY_DB: &str = "KGEN_INTEGRITY_DB";
/// Engine version string inlined into provenance records.
pub const ENV_VERSION: &str = "KGEN_VERSION";
/// Deterministic clock source, seconds since the Unix epoch.
pub const ENV_SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Compiled-in engine version, used when `KGEN_VERSION` is unset.
pub const DEFAULT_ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Clock used for every timestamp that enters a canonical record.
///
/// Resolution order: an explicitly pinned instant (from an operation
/// context), then `SOURCE_DATE_EPOCH`, then the wall clock. Reproducible
/// paths must never fall through to the wall clock, so callers that
/// require determinism construct the clock with [`DeterministicClock::fixed`]
/// or check [`DeterministicClock::is_deterministic`].
#[derive(Debug, Clone, Copy)]
pub struct DeterministicClock {
    fixed: Option<DateTime<Utc>>,
}

impl DeterministicClock {
    /// Clock pinned to a single instant.
    pub fn fixed(at: DateTime<Utc>) -> Self {
        Self { fixed: Some(at) }
    }

    /// Clock pinned to `SOURCE_DATE_EPOCH` when set, wall clock otherwise.
    pub fn from_env() -> KgenResult<Self> {
        match std::env::var(ENV_SOURCE_DATE_EPOCH) {
            Ok(raw) => {
                let secs: i64 = raw.trim().parse().map_err(|_| {
                    KgenError::Config(format!(
                        "{} must be an integer epoch, got {:?}",
                        ENV_SOURCE_DATE_EPOCH, raw
                    ))
                })?;
                let at = Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| {
                        KgenError::Config(format!("{} out of range: {}", ENV_SOURCE_DATE_EPOCH, secs))
                    })?;
                Ok(Self::fixed(at))
            }
            Err(_) => Ok(Self { fixed: None }),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.fixed.unwrap_or_else(Utc::now)
    }
}

/// Resolved paths and knobs shared by the core components.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Directory holding key material and the trust store, mode 0700.
    pub keys_dir: PathBuf,
    /// Trust store file, `keys/trust-store.json` unless overridden.
    pub trust_store_path: PathBuf,
    /// Ledger file, `.kgen/ledger.ndjson` unless overridden.
    pub ledger_path: PathBuf,
    /// Engine version recorded into generated provenance.
    pub engine_version: String,
    /// Include the environment record in the context hash.
    pub strict_env: bool,
    /// Accept engine-supplied fields outside the sidecar whitelist.
    pub allow_passthrough: bool,
    /// Grace window, in seconds, for signatures made by rotated keys.
    pub rotation_grace_secs: u64,
    /// Number of rotated-key backups retained under `keys/backup/`.
    pub max_key_backups: usize,
    /// Load private keys with group/world read bits set.
    pub allow_insecure_key_perms: bool,
}

impl CoreConfig {
    /// Configuration for a project rooted at `project_root`, with the
    /// recognized `KGEN_*` overrides applied. Unknown variables are ignored.
    pub fn for_project(project_root: &std::path::Path) -> Self {
        let keys_dir = project_root.join("keys");
        let trust_store_path = std::env::var(ENV_TRUST_STORE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| keys_dir.join("trust-store.json"));
        let ledger_path = std::env::var(ENV_INTEGRITY_DB)
            .map(PathBuf::from)
            .unwrap_or_else(|_| project_root.join(".kgen").join("ledger.ndjson"));
        let engine_version = std::env::var(ENV_VERSION)
            .unwrap_or_else(|_| DEFAULT_ENGINE_VERSION.to_string());

        Self {
            keys_dir,
            trust_store_path,
            ledger_path,
            engine_version,
            strict_env: false,
            allow_passthrough: false,
            rotation_grace_secs: 86_400,
            max_key_backups: 5,
            allow_insecure_key_perms: false,
        }
    }

    pub fn key_passphrase() -> Option<String> {
        std::env::var(ENV_KEY_PASSPHRASE).ok()
    }

    pub fn public_key_path_override() -> Option<PathBuf> {
        std::env::var(ENV_PUBLIC_KEY_PATH).ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock_is_stable() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let clock = DeterministicClock::fixed(at);
        assert!(clock.is_deterministic());
        assert_eq!(clock.now(), at);
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn test_wall_clock_is_not_deterministic() {
        let clock = DeterministicClock { fixed: None };
        assert!(!clock.is_deterministic());
    }

    #[test]
    fn test_config_paths() {
        let config = CoreConfig::for_project(std::path::Path::new("/tmp/project"));
        assert!(config.keys_dir.ends_with("keys"));
        assert_eq!(config.rotation_grace_secs, 86_400);
    }
}
