//! Verification of artifacts against their attestations and the ledger

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::attest::{Attestation, SIDECAR_SUFFIX};
use crate::error::KgenResult;
use crate::hashing::{constant_time_hex_eq, hash_file};
use crate::keystore::trust::TrustStatus;
use crate::keystore::KeyStore;
use crate::ledger::Ledger;
use crate::merkle;

/// Outcome of verifying one artifact. The individual fields stay
/// independent so a report shows exactly which check failed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub path: String,
    pub valid: bool,
    pub hash_matches: bool,
    pub signature_valid: bool,
    pub chain_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_valid: Option<bool>,
    pub trust_status: TrustStatus,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl VerificationReport {
    fn failed(path: &Path, error: String) -> Self {
        Self {
            path: path.display().to_string(),
            valid: false,
            hash_matches: false,
            signature_valid: false,
            chain_valid: false,
            merkle_valid: None,
            trust_status: TrustStatus::Unknown,
            warnings: Vec::new(),
            errors: vec![error],
        }
    }
}

/// Verifies sidecars against artifact bytes, signatures, and the ledger.
pub struct Verifier<'a> {
    keystore: &'a KeyStore,
    ledger: Option<&'a Ledger>,
    strict_env: bool,
}

impl<'a> Verifier<'a> {
    pub fn new(keystore: &'a KeyStore, ledger: Option<&'a Ledger>) -> Self {
        Self { keystore, ledger, strict_env: false }
    }

    pub fn with_strict_env(mut self, strict_env: bool) -> Self {
        self.strict_env = strict_env;
        self
    }

    /// Verify one artifact. Never panics and never aborts a batch; every
    /// diagnostic lands in the report.
    pub fn verify_artifact(&self, artifact_path: &Path) -> VerificationReport {
        if !artifact_path.exists() {
            return VerificationReport::failed(artifact_path, "artifact missing".to_string());
        }

        let sidecar_path = Attestation::sidecar_path(artifact_path);
        let attestation = match Attestation::load(&sidecar_path) {
            Ok(a) => a,
            Err(e) => {
                return VerificationReport::failed(
                    artifact_path,
                    format!("sidecar unusable: {}", e),
                )
            }
        };

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        // Artifact bytes against both recorded digests.
        let hash_matches = match hash_file(attestation.integrity.hash_algorithm, artifact_path) {
            Ok(actual) => {
                let content_ok =
                    constant_time_hex_eq(&actual, &attestation.artifact.content_hash);
                let integrity_ok =
                    constant_time_hex_eq(&actual, &attestation.integrity.artifact_hash);
                if !content_ok || !integrity_ok {
                    errors.push("artifact hash mismatch".to_string());
                }
                content_ok && integrity_ok
            }
            Err(e) => {
                errors.push(format!("artifact unreadable: {}", e));
                false
            }
        };

        match attestation.compute_context_hash(self.strict_env) {
            Ok(recomputed) => {
                if !constant_time_hex_eq(&recomputed, &attestation.integrity.context_hash) {
                    errors.push("context hash mismatch".to_string());
                }
            }
            Err(e) => errors.push(format!("context hash not recomputable: {}", e)),
        }

        // Signature over the canonical projection, then the key's standing.
        let (signature_valid, trust_status) = match &attestation.signature {
            Some(signature) => {
                let valid = match attestation.canonical_signing_bytes() {
                    Ok(bytes) => self.keystore.verify_record(&bytes, signature),
                    Err(e) => {
                        errors.push(format!("record not canonicalizable: {}", e));
                        false
                    }
                };
                if !valid {
                    errors.push("signature invalid".to_string());
                }
                let status = self
                    .keystore
                    .trust_status(&signature.key_fingerprint, signature.signed_at);
                match status {
                    TrustStatus::Revoked => errors.push("signing key revoked".to_string()),
                    TrustStatus::Unknown => errors.push("signing key not trusted".to_string()),
                    TrustStatus::Rotated => {
                        warnings.push("signed by a rotated key within grace".to_string())
                    }
                    TrustStatus::Active => {}
                }
                (valid, status)
            }
            None => {
                errors.push("sidecar carries no signature".to_string());
                (false, TrustStatus::Unknown)
            }
        };

        let merkle_valid = match (
            &attestation.integrity.merkle_root,
            &attestation.integrity.merkle_proof,
        ) {
            (Some(root), Some(proof)) => {
                let ok = merkle::verify_proof(
                    attestation.integrity.hash_algorithm,
                    &attestation.integrity.artifact_hash,
                    proof,
                    root,
                );
                if !ok {
                    errors.push("merkle proof invalid".to_string());
                }
                Some(ok)
            }
            (Some(_), None) => {
                errors.push("merkle root present but proof missing".to_string());
                Some(false)
            }
            (None, Some(_)) => {
                errors.push("merkle proof present but root missing".to_string());
                Some(false)
            }
            (None, None) => None,
        };

        let chain_valid = match self.ledger {
            Some(ledger) => self.check_chain(ledger, &attestation, &mut errors),
            None => {
                warnings.push("no ledger available; chain continuity not checked".to_string());
                true
            }
        };

        if let Some(prov) = &attestation.prov_o {
            if prov.entity.is_empty() || prov.activity.is_empty() || prov.agent.is_empty() {
                warnings.push("prov-o projection incomplete".to_string());
            }
        }

        let trust_ok = matches!(trust_status, TrustStatus::Active | TrustStatus::Rotated);
        let valid = errors.is_empty()
            && hash_matches
            && signature_valid
            && chain_valid
            && merkle_valid.unwrap_or(true)
            && trust_ok;

        debug!(path = %artifact_path.display(), valid, "artifact verified");
        VerificationReport {
            path: artifact_path.display().to_string(),
            valid,
            hash_matches,
            signature_valid,
            chain_valid,
            merkle_valid,
            trust_status,
            warnings,
            errors,
        }
    }

    // The ledger must be intact, contain a link for the operation, and
    // that link must continue from the hash recorded in the sidecar.
    fn check_chain(
        &self,
        ledger: &Ledger,
        attestation: &Attestation,
        errors: &mut Vec<String>,
    ) -> bool {
        let report = match ledger.verify_chain(Some(self.keystore)) {
            Ok(r) => r,
            Err(e) => {
                errors.push(format!("ledger unreadable: {}", e));
                return false;
            }
        };
        if !report.is_intact() {
            errors.push(format!(
                "ledger chain broken at {} link(s)",
                report.broken_links.len()
            ));
            return false;
        }

        let links = match ledger.read_links(None) {
            Ok(l) => l,
            Err(e) => {
                errors.push(format!("ledger unreadable: {}", e));
                return false;
            }
        };
        let operation_link = links.iter().find(|l| {
            l.operation_id == attestation.generation.operation_id
                && l.artifact_digests.contains(&attestation.integrity.artifact_hash)
        });
        match operation_link {
            Some(link) => {
                if link.previous_hash != attestation.integrity.previous_link_hash {
                    errors.push("sidecar chains to a different ledger position".to_string());
                    false
                } else {
                    true
                }
            }
            None => {
                errors.push("operation not found in ledger".to_string());
                false
            }
        }
    }

    /// Verify many artifacts with per-artifact isolation: one bad artifact
    /// yields one invalid report and leaves the rest untouched.
    pub fn verify_batch(&self, paths: &[PathBuf]) -> Vec<VerificationReport> {
        paths.iter().map(|p| self.verify_artifact(p)).collect()
    }

    /// Verify every attested artifact below a root directory.
    pub fn verify_build(&self, root: &Path) -> KgenResult<Vec<VerificationReport>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                crate::error::KgenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if let Some(artifact_name) = name.strip_suffix(SIDECAR_SUFFIX) {
                let artifact = entry.path().with_file_name(artifact_name);
                paths.push(artifact);
            }
        }
        if paths.is_empty() {
            warn!(root = %root.display(), "no attested artifacts found");
        }
        Ok(self.verify_batch(&paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attest::tests::{fixture, record_for};
    use crate::attest::{AttestationBuilder, BuilderOptions};
    use std::io::Write;

    fn attest_one(f: &crate::attest::tests::Fixture, name: &str, content: &[u8]) -> PathBuf {
        let path = f.dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        let builder = AttestationBuilder::new(
            &f.keystore,
            &f.handle,
            &f.ledger,
            f.clock,
            "1.0.0",
            BuilderOptions::default(),
        );
        builder
            .attest_operation(f.dir.path(), &format!("op-{}", name), &[record_for(&path)])
            .unwrap();
        path
    }

    #[test]
    fn test_clean_artifact_verifies() {
        let f = fixture();
        let path = attest_one(&f, "out/hello.txt", b"Hello, World!\n");

        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let report = verifier.verify_artifact(&path);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.hash_matches);
        assert!(report.signature_valid);
        assert!(report.chain_valid);
        assert_eq!(report.trust_status, TrustStatus::Active);
    }

    #[test]
    fn test_tampered_artifact_fails_hash_only() {
        let f = fixture();
        let path = attest_one(&f, "out/hello.txt", b"Hello, World!\n");

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b" tampered").unwrap();
        drop(file);

        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let report = verifier.verify_artifact(&path);
        assert!(!report.valid);
        assert!(!report.hash_matches);
        // The sidecar itself is untouched, so its signature still holds.
        assert!(report.signature_valid);
    }

    #[test]
    fn test_missing_artifact_reported() {
        let f = fixture();
        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let report = verifier.verify_artifact(&f.dir.path().join("absent.txt"));
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("missing")));
    }

    #[test]
    fn test_batch_isolation() {
        let f = fixture();
        let good_a = attest_one(&f, "a.txt", b"alpha");
        let bad = attest_one(&f, "b.txt", b"beta");
        let good_c = attest_one(&f, "c.txt", b"gamma");

        std::fs::write(&bad, b"corrupted").unwrap();

        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let reports = verifier.verify_batch(&[good_a, bad, good_c]);
        let valid: Vec<bool> = reports.iter().map(|r| r.valid).collect();
        assert_eq!(valid, vec![true, false, true]);
    }

    #[test]
    fn test_verify_build_discovers_sidecars() {
        let f = fixture();
        attest_one(&f, "out/a.txt", b"one");
        attest_one(&f, "out/nested/b.txt", b"two");

        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let reports = verifier.verify_build(f.dir.path()).unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.valid));
    }

    #[test]
    fn test_revoked_key_fails_verification() {
        let f = fixture();
        let path = attest_one(&f, "a.txt", b"alpha");

        f.keystore.revoke(&f.handle.fingerprint).unwrap();
        let verifier = Verifier::new(&f.keystore, Some(&f.ledger));
        let report = verifier.verify_artifact(&path);
        assert!(!report.valid);
        assert_eq!(report.trust_status, TrustStatus::Revoked);
        // The cryptographic signature is still sound; only trust fails.
        assert!(report.signature_valid);
    }

    #[test]
    fn test_missing_ledger_is_warning_not_failure() {
        let f = fixture();
        let path = attest_one(&f, "a.txt", b"alpha");

        let verifier = Verifier::new(&f.keystore, None);
        let report = verifier.verify_artifact(&path);
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("ledger")));
    }
}
