//! Tamper-evident bundles: deterministic, manifest-indexed archives

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::attest::Attestation;
use crate::canonical::{canonicalize, canonicalize_record, signing_projection};
use crate::config::DeterministicClock;
use crate::error::{KgenError, KgenResult};
use crate::hashing::{constant_time_hex_eq, hash_bytes, hash_file, HashAlgorithm};
use crate::keystore::{KeyStore, KeypairHandle, SignatureRecord};
use crate::ledger::{verify_links, ChainReport, Ledger, LedgerLink, GENESIS_PREVIOUS_HASH};
use crate::verify::{VerificationReport, Verifier};

/// Bundle format version.
pub const BUNDLE_VERSION: &str = "1.0";
/// Archive entry holding the manifest.
pub const MANIFEST_ENTRY: &str = "manifest.json";
/// Archive entry holding the ledger slice.
pub const LEDGER_SLICE_ENTRY: &str = "ledger/slice.json";
/// Deflate level pinned for byte-identical archives.
const DEFLATE_LEVEL: i32 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFileEntry {
    /// Path inside the archive.
    pub path: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleIntegrity {
    pub hash_algorithm: HashAlgorithm,
    /// Archive path → content hash for every packaged file.
    pub files: BTreeMap<String, String>,
    pub manifest_digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub bundle_id: String,
    pub bundle_version: String,
    pub created_at: DateTime<Utc>,
    pub artifacts: Vec<BundleFileEntry>,
    pub attestations: Vec<BundleFileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ledger_slice: Vec<BundleFileEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compliance: Vec<BundleFileEntry>,
    pub integrity: BundleIntegrity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRecord>,
}

impl BundleManifest {
    /// Digest over the manifest minus its own digest and signature.
    pub fn compute_manifest_digest(&self) -> KgenResult<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
            if let Some(Value::Object(integrity)) = map.get_mut("integrity") {
                integrity.remove("manifestDigest");
            }
        }
        let bytes = canonicalize(&value)?;
        Ok(hash_bytes(self.integrity.hash_algorithm, &bytes))
    }

    fn canonical_signing_bytes(&self) -> KgenResult<Vec<u8>> {
        let value = serde_json::to_value(self)
            .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        canonicalize(&signing_projection(&value))
    }
}

/// Ledger excerpt packaged into a bundle. A slice may start mid-chain and
/// carries its own starting `previousHash` witness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSlice {
    pub start_index: u64,
    pub previous_hash_witness: String,
    pub links: Vec<LedgerLink>,
}

#[derive(Debug, Clone)]
pub struct CreateBundleRequest<'a> {
    pub bundle_id: Option<String>,
    pub project_root: PathBuf,
    /// Artifacts to package; each must have its sidecar next to it.
    pub artifacts: Vec<PathBuf>,
    pub ledger: Option<&'a Ledger>,
    /// Inclusive link range to slice; defaults to the whole chain.
    pub ledger_range: Option<(u64, u64)>,
    /// Opaque compliance payloads, stored under `compliance/` untouched.
    pub compliance: Vec<(String, Vec<u8>)>,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleResult {
    pub path: PathBuf,
    pub bundle_hash: String,
    pub manifest: BundleManifest,
    pub witness_path: PathBuf,
}

/// Detached record written next to the archive; the archive cannot contain
/// its own hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleWitness {
    pub bundle_hash: String,
    pub manifest_digest: String,
}

/// Package artifacts, sidecars, and a ledger slice into a deterministic
/// deflate ZIP. Identical input trees produce byte-identical archives:
/// entries are path-sorted, timestamps fixed, compression pinned.
pub fn create_bundle(
    request: &CreateBundleRequest<'_>,
    signer: Option<(&KeyStore, &KeypairHandle)>,
    clock: &DeterministicClock,
) -> KgenResult<BundleResult> {
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut artifacts = Vec::new();
    let mut attestations = Vec::new();

    for artifact_path in &request.artifacts {
        let rel = artifact_path
            .strip_prefix(&request.project_root)
            .unwrap_or(artifact_path)
            .to_string_lossy()
            .replace('\\', "/");

        let bytes = std::fs::read(artifact_path).map_err(|e| KgenError::ArtifactUnreadable {
            path: artifact_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let entry_path = format!("artifacts/{}", rel);
        artifacts.push(BundleFileEntry {
            path: entry_path.clone(),
            hash: hash_bytes(HashAlgorithm::Sha256, &bytes),
            size: bytes.len() as u64,
        });
        files.insert(entry_path, bytes);

        let sidecar_path = Attestation::sidecar_path(artifact_path);
        let sidecar_bytes = std::fs::read(&sidecar_path).map_err(|_| {
            KgenError::Config(format!(
                "artifact {} has no sidecar at {}",
                artifact_path.display(),
                sidecar_path.display()
            ))
        })?;
        let entry_path = format!("attestations/{}.attest.json", rel);
        attestations.push(BundleFileEntry {
            path: entry_path.clone(),
            hash: hash_bytes(HashAlgorithm::Sha256, &sidecar_bytes),
            size: sidecar_bytes.len() as u64,
        });
        files.insert(entry_path, sidecar_bytes);
    }

    let mut ledger_slice = Vec::new();
    if let Some(ledger) = request.ledger {
        let links = ledger.read_links(request.ledger_range)?;
        if let Some(first) = links.first() {
            let slice = LedgerSlice {
                start_index: first.index,
                previous_hash_witness: first.previous_hash.clone(),
                links,
            };
            let bytes = canonicalize_record(&slice)?;
            ledger_slice.push(BundleFileEntry {
                path: LEDGER_SLICE_ENTRY.to_string(),
                hash: hash_bytes(HashAlgorithm::Sha256, &bytes),
                size: bytes.len() as u64,
            });
            files.insert(LEDGER_SLICE_ENTRY.to_string(), bytes);
        }
    }

    let mut compliance = Vec::new();
    for (name, bytes) in &request.compliance {
        let entry_path = format!("compliance/{}", name);
        compliance.push(BundleFileEntry {
            path: entry_path.clone(),
            hash: hash_bytes(HashAlgorithm::Sha256, bytes),
            size: bytes.len() as u64,
        });
        files.insert(entry_path, bytes.clone());
    }
    compliance.sort_by(|a, b| a.path.cmp(&b.path));

    let mut manifest = BundleManifest {
        bundle_id: request
            .bundle_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        bundle_version: BUNDLE_VERSION.to_string(),
        created_at: clock.now(),
        artifacts,
        attestations,
        ledger_slice,
        compliance,
        integrity: BundleIntegrity {
            hash_algorithm: HashAlgorithm::Sha256,
            files: files
                .iter()
                .map(|(path, bytes)| (path.clone(), hash_bytes(HashAlgorithm::Sha256, bytes)))
                .collect(),
            manifest_digest: String::new(),
        },
        signature: None,
    };
    manifest.integrity.manifest_digest = manifest.compute_manifest_digest()?;
    if let Some((keystore, handle)) = signer {
        let bytes = manifest.canonical_signing_bytes()?;
        manifest.signature = Some(keystore.sign(handle, &bytes, clock)?);
    }
    files.insert(MANIFEST_ENTRY.to_string(), canonicalize_record(&manifest)?);

    write_archive(&request.output_path, &files)?;
    let bundle_hash = hash_file(HashAlgorithm::Sha256, &request.output_path)?;

    let witness = BundleWitness {
        bundle_hash: bundle_hash.clone(),
        manifest_digest: manifest.integrity.manifest_digest.clone(),
    };
    let witness_path = witness_path_for(&request.output_path);
    let parent = witness_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&canonicalize_record(&witness)?)?;
    tmp.persist(&witness_path).map_err(|e| KgenError::Io(e.error))?;

    info!(
        bundle = %request.output_path.display(),
        files = files.len(),
        %bundle_hash,
        "bundle created"
    );
    Ok(BundleResult { path: request.output_path.clone(), bundle_hash, manifest, witness_path })
}

/// `<bundle>.digest.json`
pub fn witness_path_for(bundle_path: &Path) -> PathBuf {
    let mut name = bundle_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());
    name.push_str(".digest.json");
    bundle_path.with_file_name(name)
}

fn write_archive(path: &Path, files: &BTreeMap<String, Vec<u8>>) -> KgenResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(DEFLATE_LEVEL))
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    // BTreeMap iteration gives the sorted entry order.
    for (name, bytes) in files {
        writer
            .start_file(name, options)
            .map_err(|e| KgenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        writer.write_all(bytes)?;
    }
    writer
        .finish()
        .map_err(|e| KgenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleFileCheck {
    pub path: String,
    pub hash_matches: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleVerificationReport {
    pub path: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_hash_matches: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_signature_valid: Option<bool>,
    pub file_results: Vec<BundleFileCheck>,
    pub attestation_reports: Vec<VerificationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_report: Option<ChainReport>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Verify a bundle: archive digest, per-file hashes, every attestation,
/// and the packaged ledger slice against its own witness.
pub fn verify_bundle(bundle_path: &Path, keystore: &KeyStore) -> KgenResult<BundleVerificationReport> {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();

    let file = std::fs::File::open(bundle_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| KgenError::Integrity(format!("not a readable archive: {}", e)))?;

    let manifest: BundleManifest = {
        let mut entry = archive
            .by_name(MANIFEST_ENTRY)
            .map_err(|_| KgenError::Integrity("bundle has no manifest.json".to_string()))?;
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        serde_json::from_slice(&raw)
            .map_err(|e| KgenError::Schema(format!("manifest malformed: {}", e)))?
    };

    // Archive digest against the detached witness, when present.
    let bundle_hash_matches = {
        let witness_path = witness_path_for(bundle_path);
        if witness_path.is_file() {
            let raw = std::fs::read(&witness_path)?;
            match serde_json::from_slice::<BundleWitness>(&raw) {
                Ok(witness) => {
                    let actual = hash_file(HashAlgorithm::Sha256, bundle_path)?;
                    let matches = constant_time_hex_eq(&actual, &witness.bundle_hash);
                    if !matches {
                        errors.push("archive bytes do not match recorded bundleHash".to_string());
                    }
                    Some(matches)
                }
                Err(e) => {
                    warnings.push(format!("bundle witness unreadable: {}", e));
                    None
                }
            }
        } else {
            warnings.push("no detached bundle digest found".to_string());
            None
        }
    };

    match manifest.compute_manifest_digest() {
        Ok(recomputed) => {
            if !constant_time_hex_eq(&recomputed, &manifest.integrity.manifest_digest) {
                errors.push("manifest digest mismatch".to_string());
            }
        }
        Err(e) => errors.push(format!("manifest not canonicalizable: {}", e)),
    }

    let manifest_signature_valid = match &manifest.signature {
        Some(signature) => {
            let valid = manifest
                .canonical_signing_bytes()
                .map(|bytes| keystore.verify_record(&bytes, signature))
                .unwrap_or(false);
            if !valid {
                errors.push("manifest signature invalid".to_string());
            }
            Some(valid)
        }
        None => {
            warnings.push("manifest is unsigned".to_string());
            None
        }
    };

    // Every listed file must be present with matching bytes, and the
    // archive must not smuggle extra entries.
    let entry_names: Vec<String> = archive.file_names().map(String::from).collect();
    for name in &entry_names {
        if name != MANIFEST_ENTRY && !manifest.integrity.files.contains_key(name) {
            errors.push(format!("archive entry {} not listed in manifest", name));
        }
    }

    let mut file_results = Vec::new();
    let mut extracted: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for (name, expected_hash) in &manifest.integrity.files {
        match archive.by_name(name) {
            Ok(mut entry) => {
                let mut raw = Vec::new();
                entry.read_to_end(&mut raw)?;
                let actual = hash_bytes(manifest.integrity.hash_algorithm, &raw);
                let matches = constant_time_hex_eq(&actual, expected_hash);
                if !matches {
                    errors.push(format!("content hash mismatch for {}", name));
                }
                file_results.push(BundleFileCheck { path: name.clone(), hash_matches: matches });
                extracted.insert(name.clone(), raw);
            }
            Err(_) => {
                errors.push(format!("listed file {} missing from archive", name));
                file_results.push(BundleFileCheck { path: name.clone(), hash_matches: false });
            }
        }
    }

    // Re-materialize artifact/sidecar pairs and run the artifact verifier.
    let scratch = tempfile::tempdir()?;
    for (name, bytes) in &extracted {
        if let Some(rel) = name.strip_prefix("artifacts/") {
            let dest = scratch.path().join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, bytes)?;
        } else if let Some(rel) = name.strip_prefix("attestations/") {
            let dest = scratch.path().join(rel);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, bytes)?;
        }
    }
    let verifier = Verifier::new(keystore, None);
    let mut attestation_reports = Vec::new();
    for entry in &manifest.artifacts {
        let rel = entry.path.strip_prefix("artifacts/").unwrap_or(&entry.path);
        let report = verifier.verify_artifact(&scratch.path().join(rel));
        if !report.valid {
            errors.push(format!("attestation invalid for {}", rel));
        }
        attestation_reports.push(report);
    }

    let ledger_report = match extracted.get(LEDGER_SLICE_ENTRY) {
        Some(bytes) => match serde_json::from_slice::<LedgerSlice>(bytes) {
            Ok(slice) => {
                let witness = if slice.start_index == 0 {
                    GENESIS_PREVIOUS_HASH.to_string()
                } else {
                    slice.previous_hash_witness.clone()
                };
                let report = verify_links(&slice.links, &witness, Some(keystore));
                if !report.is_intact() {
                    errors.push(format!(
                        "ledger slice broken at {} link(s)",
                        report.broken_links.len()
                    ));
                }
                Some(report)
            }
            Err(e) => {
                errors.push(format!("ledger slice malformed: {}", e));
                None
            }
        },
        None => {
            warnings.push("bundle carries no ledger slice".to_string());
            None
        }
    };

    let valid = errors.is_empty();
    debug!(path = %bundle_path.display(), valid, "bundle verified");
    Ok(BundleVerificationReport {
        path: bundle_path.display().to_string(),
        valid,
        bundle_hash_matches,
        manifest_signature_valid,
        file_results,
        attestation_reports,
        ledger_report,
        warnings,
        errors,
    })
}
