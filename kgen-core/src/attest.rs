//! Attestation sidecars: the per-artifact provenance record

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::canonical::{canonicalize, canonicalize_record, context_projection, signing_projection};
use crate::config::DeterministicClock;
use crate::error::{KgenError, KgenResult};
use crate::hashing::{hash_bytes, hash_file, HashAlgorithm};
use crate::keystore::{KeyStore, KeypairHandle, SignatureRecord};
use crate::ledger::Ledger;
use crate::merkle::{self, MerkleProof};

/// Fixed schema version of the sidecar format.
pub const SIDECAR_SCHEMA_VERSION: &str = "2.0";
/// Suffix appended to the artifact path to form the sidecar path.
pub const SIDECAR_SUFFIX: &str = ".attest.json";

/// Reference to an artifact, value-inlined into its sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// Path relative to the project root.
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_blob_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub id: String,
    pub version: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleRef {
    pub id: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRef {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRef {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub name: String,
}

/// The generation context: what produced the artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationInfo {
    pub template: TemplateRef,
    /// Rules in application order.
    pub rules: Vec<RuleRef>,
    pub input_graph_hash: String,
    pub engine: EngineRef,
    pub agent: AgentRef,
    pub operation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_chain: Option<Vec<String>>,
}

/// Recorded build environment. Excluded from the context hash unless the
/// builder runs with `strict_env`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    pub platform: String,
    pub runtime_version: String,
    pub architecture: String,
}

impl EnvironmentInfo {
    pub fn capture(runtime_version: &str) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            runtime_version: runtime_version.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityInfo {
    pub hash_algorithm: HashAlgorithm,
    pub artifact_hash: String,
    pub context_hash: String,
    pub previous_link_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_proof: Option<MerkleProof>,
}

/// Minimal W3C-PROV projection of the attestation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvProjection {
    pub entity: String,
    pub activity: String,
    pub agent: String,
    pub was_generated_by: String,
    pub was_associated_with: String,
}

/// The sidecar record written next to every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub schema_version: String,
    pub attestation_id: String,
    pub created_at: DateTime<Utc>,
    pub artifact: ArtifactRef,
    pub generation: GenerationInfo,
    pub environment: EnvironmentInfo,
    pub integrity: IntegrityInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prov_o: Option<ProvProjection>,
}

impl Attestation {
    /// `<artifact>.attest.json`
    pub fn sidecar_path(artifact_path: &Path) -> PathBuf {
        let mut name = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(SIDECAR_SUFFIX);
        artifact_path.with_file_name(name)
    }

    pub fn load(path: &Path) -> KgenResult<Self> {
        let raw = std::fs::read(path)?;
        let attestation: Attestation = serde_json::from_slice(&raw)
            .map_err(|e| KgenError::Schema(format!("sidecar malformed: {}", e)))?;
        if attestation.schema_version != SIDECAR_SCHEMA_VERSION {
            return Err(KgenError::Schema(format!(
                "unsupported sidecar schemaVersion {:?}",
                attestation.schema_version
            )));
        }
        Ok(attestation)
    }

    /// Canonical bytes covered by the signature.
    pub fn canonical_signing_bytes(&self) -> KgenResult<Vec<u8>> {
        let value =
            serde_json::to_value(self).map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        canonicalize(&signing_projection(&value))
    }

    /// Recompute the context hash binding artifact to generation.
    pub fn compute_context_hash(&self, strict_env: bool) -> KgenResult<String> {
        let value =
            serde_json::to_value(self).map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        let bytes = canonicalize(&context_projection(&value, strict_env))?;
        Ok(hash_bytes(self.integrity.hash_algorithm, &bytes))
    }
}

/// What the engine hands over when it finishes rendering one artifact.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    /// Where the rendered bytes were written.
    pub artifact_path: PathBuf,
    pub template: TemplateRef,
    pub rules: Vec<RuleRef>,
    pub input_graph_hash: String,
    pub engine: EngineRef,
    pub agent: AgentRef,
    pub mime_type: String,
    pub git_blob_sha: Option<String>,
    pub reasoning_chain: Option<Vec<String>>,
    /// Engine-supplied fields outside the whitelist. Refused unless the
    /// builder allows passthrough; never enter the canonical record.
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct BuilderOptions {
    pub hash_algorithm: HashAlgorithm,
    pub strict_env: bool,
    pub allow_passthrough: bool,
    /// Emit the PROV-O projection alongside the required fields.
    pub emit_prov: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha256,
            strict_env: false,
            allow_passthrough: false,
            emit_prov: true,
        }
    }
}

/// Builds, signs, and writes sidecars, then chains the operation into the
/// ledger. Reentrant; all state is per call.
pub struct AttestationBuilder<'a> {
    keystore: &'a KeyStore,
    handle: &'a KeypairHandle,
    ledger: &'a Ledger,
    clock: DeterministicClock,
    environment: EnvironmentInfo,
    options: BuilderOptions,
}

impl<'a> AttestationBuilder<'a> {
    pub fn new(
        keystore: &'a KeyStore,
        handle: &'a KeypairHandle,
        ledger: &'a Ledger,
        clock: DeterministicClock,
        engine_host_version: &str,
        options: BuilderOptions,
    ) -> Self {
        Self {
            keystore,
            handle,
            ledger,
            clock,
            environment: EnvironmentInfo::capture(engine_host_version),
            options,
        }
    }

    /// Attest every artifact of one engine operation and append the
    /// operation's link to the ledger.
    ///
    /// Two records naming the same artifact path are a hard error, not an
    /// overwrite. Batches of more than one artifact carry a Merkle
    /// commitment with per-artifact inclusion proofs.
    pub fn attest_operation(
        &self,
        project_root: &Path,
        operation_id: &str,
        records: &[CompletionRecord],
    ) -> KgenResult<Vec<Attestation>> {
        if records.is_empty() {
            return Err(KgenError::Config("operation has no artifacts".to_string()));
        }

        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.artifact_path.clone()) {
                return Err(KgenError::Integrity(format!(
                    "duplicate artifact path in operation: {}",
                    record.artifact_path.display()
                )));
            }
            if !self.options.allow_passthrough && !record.extra.is_empty() {
                let keys: Vec<&str> = record.extra.keys().map(String::as_str).collect();
                return Err(KgenError::Schema(format!(
                    "unknown engine-supplied fields: {}",
                    keys.join(", ")
                )));
            }
        }

        // Hash every artifact before writing anything; a missing artifact
        // fails the whole operation up front.
        let mut artifact_refs = Vec::with_capacity(records.len());
        for record in records {
            let content_hash = hash_file(self.options.hash_algorithm, &record.artifact_path)?;
            let size = std::fs::metadata(&record.artifact_path)
                .map_err(|e| KgenError::ArtifactUnreadable {
                    path: record.artifact_path.display().to_string(),
                    reason: e.to_string(),
                })?
                .len();
            let rel = record
                .artifact_path
                .strip_prefix(project_root)
                .unwrap_or(&record.artifact_path);
            artifact_refs.push(ArtifactRef {
                path: rel.to_string_lossy().replace('\\', "/"),
                content_hash,
                size,
                mime_type: record.mime_type.clone(),
                git_blob_sha: record.git_blob_sha.clone(),
            });
        }

        let digests: Vec<String> =
            artifact_refs.iter().map(|a| a.content_hash.clone()).collect();
        let batch = if records.len() > 1 {
            Some(merkle::build_batch(self.options.hash_algorithm, &digests)?)
        } else {
            None
        };
        let previous_link_hash = self.ledger.next_previous_hash();

        let mut attestations = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            let attestation = self.build_one(
                operation_id,
                record,
                artifact_refs[i].clone(),
                &previous_link_hash,
                batch.as_ref().map(|b| (b.root.clone(), b.proofs[i].clone())),
            )?;
            write_sidecar(&record.artifact_path, &attestation)?;
            attestations.push(attestation);
        }

        self.ledger.append(self.keystore, self.handle, &self.clock, operation_id, digests)?;
        info!(operation_id, artifacts = records.len(), "operation attested");
        Ok(attestations)
    }

    fn build_one(
        &self,
        operation_id: &str,
        record: &CompletionRecord,
        artifact: ArtifactRef,
        previous_link_hash: &str,
        batch: Option<(String, MerkleProof)>,
    ) -> KgenResult<Attestation> {
        let generation = GenerationInfo {
            template: record.template.clone(),
            rules: record.rules.clone(),
            input_graph_hash: record.input_graph_hash.clone(),
            engine: record.engine.clone(),
            agent: record.agent.clone(),
            operation_id: operation_id.to_string(),
            reasoning_chain: record.reasoning_chain.clone(),
        };
        let (merkle_root, merkle_proof) = match batch {
            Some((root, proof)) => (Some(root), Some(proof)),
            None => (None, None),
        };

        let prov_o = self.options.emit_prov.then(|| ProvProjection {
            entity: format!("kgen:artifact:{}", artifact.path),
            activity: format!("kgen:operation:{}", operation_id),
            agent: format!("kgen:agent:{}", generation.agent.id),
            was_generated_by: format!("kgen:operation:{}", operation_id),
            was_associated_with: format!("kgen:agent:{}", generation.agent.id),
        });

        let mut attestation = Attestation {
            schema_version: SIDECAR_SCHEMA_VERSION.to_string(),
            attestation_id: Uuid::new_v4().to_string(),
            created_at: self.clock.now(),
            integrity: IntegrityInfo {
                hash_algorithm: self.options.hash_algorithm,
                artifact_hash: artifact.content_hash.clone(),
                context_hash: String::new(),
                previous_link_hash: previous_link_hash.to_string(),
                merkle_root,
                merkle_proof,
            },
            artifact,
            generation,
            environment: self.environment.clone(),
            signature: None,
            prov_o,
        };

        attestation.integrity.context_hash =
            attestation.compute_context_hash(self.options.strict_env)?;
        let signing_bytes = attestation.canonical_signing_bytes()?;
        attestation.signature = Some(self.keystore.sign(self.handle, &signing_bytes, &self.clock)?);
        debug!(artifact = %attestation.artifact.path, "sidecar built");
        Ok(attestation)
    }
}

/// Write the sidecar atomically next to its artifact.
pub fn write_sidecar(artifact_path: &Path, attestation: &Attestation) -> KgenResult<()> {
    let sidecar_path = Attestation::sidecar_path(artifact_path);
    let bytes = canonicalize_record(attestation)?;
    let parent = sidecar_path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&bytes)?;
    tmp.persist(&sidecar_path).map_err(|e| KgenError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::keystore::SignatureSuite;
    use chrono::TimeZone;

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub keystore: KeyStore,
        pub handle: KeypairHandle,
        pub ledger: Ledger,
        pub clock: DeterministicClock,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::for_project(dir.path());
        let keystore = KeyStore::open(&config).unwrap();
        let clock =
            DeterministicClock::fixed(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap());
        let handle = keystore.generate_keypair(SignatureSuite::Ed25519, &clock).unwrap();
        keystore.save_keypair(&handle, None).unwrap();
        let ledger =
            Ledger::open_or_create(&config.ledger_path, &keystore, &handle, &clock).unwrap();
        Fixture { dir, keystore, handle, ledger, clock }
    }

    pub(crate) fn record_for(path: &Path) -> CompletionRecord {
        CompletionRecord {
            artifact_path: path.to_path_buf(),
            template: TemplateRef {
                id: "greet".to_string(),
                version: "1.0.0".to_string(),
                hash: "ab".repeat(32),
            },
            rules: vec![],
            input_graph_hash: "00".repeat(32),
            engine: EngineRef { name: "kgen".to_string(), version: "1.0.0".to_string() },
            agent: AgentRef {
                id: "agent-1".to_string(),
                agent_type: "system".to_string(),
                name: "generator".to_string(),
            },
            mime_type: "text/plain".to_string(),
            git_blob_sha: None,
            reasoning_chain: None,
            extra: BTreeMap::new(),
        }
    }

    fn builder<'a>(f: &'a Fixture) -> AttestationBuilder<'a> {
        AttestationBuilder::new(
            &f.keystore,
            &f.handle,
            &f.ledger,
            f.clock,
            "1.0.0",
            BuilderOptions::default(),
        )
    }

    #[test]
    fn test_sidecar_written_and_hashes_agree() {
        let f = fixture();
        let out = f.dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let artifact = out.join("hello.txt");
        std::fs::write(&artifact, b"Hello, World!\n").unwrap();

        let attestations = builder(&f)
            .attest_operation(f.dir.path(), "op-1", &[record_for(&artifact)])
            .unwrap();
        let a = &attestations[0];

        assert_eq!(a.schema_version, SIDECAR_SCHEMA_VERSION);
        assert_eq!(a.artifact.content_hash, a.integrity.artifact_hash);
        assert_eq!(a.artifact.path, "out/hello.txt");
        assert!(Attestation::sidecar_path(&artifact).exists());

        let loaded = Attestation::load(&Attestation::sidecar_path(&artifact)).unwrap();
        assert_eq!(loaded, attestations[0]);
    }

    #[test]
    fn test_signature_covers_projection() {
        let f = fixture();
        let artifact = f.dir.path().join("a.txt");
        std::fs::write(&artifact, b"data").unwrap();
        let attestations =
            builder(&f).attest_operation(f.dir.path(), "op-1", &[record_for(&artifact)]).unwrap();
        let a = &attestations[0];

        let bytes = a.canonical_signing_bytes().unwrap();
        assert!(f.keystore.verify_record(&bytes, a.signature.as_ref().unwrap()));
        // Context hash is stable under recomputation.
        assert_eq!(a.integrity.context_hash, a.compute_context_hash(false).unwrap());
    }

    #[test]
    fn test_duplicate_path_is_hard_error() {
        let f = fixture();
        let artifact = f.dir.path().join("a.txt");
        std::fs::write(&artifact, b"data").unwrap();
        let records = vec![record_for(&artifact), record_for(&artifact)];
        let err =
            builder(&f).attest_operation(f.dir.path(), "op-1", &records).unwrap_err();
        assert!(matches!(err, KgenError::Integrity(_)));
    }

    #[test]
    fn test_missing_artifact_never_fabricates() {
        let f = fixture();
        let err = builder(&f)
            .attest_operation(
                f.dir.path(),
                "op-1",
                &[record_for(&f.dir.path().join("missing.txt"))],
            )
            .unwrap_err();
        assert!(matches!(err, KgenError::ArtifactUnreadable { .. }));
        // Nothing was appended past genesis.
        assert_eq!(f.ledger.len(), 1);
    }

    #[test]
    fn test_passthrough_fields_rejected_by_default() {
        let f = fixture();
        let artifact = f.dir.path().join("a.txt");
        std::fs::write(&artifact, b"data").unwrap();
        let mut record = record_for(&artifact);
        record.extra.insert("vendorField".to_string(), serde_json::json!("x"));
        let err = builder(&f).attest_operation(f.dir.path(), "op-1", &[record]).unwrap_err();
        assert!(matches!(err, KgenError::Schema(_)));
    }

    #[test]
    fn test_batch_carries_merkle_commitment() {
        let f = fixture();
        let a = f.dir.path().join("x.txt");
        let b = f.dir.path().join("y.txt");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let attestations = builder(&f)
            .attest_operation(f.dir.path(), "op-1", &[record_for(&a), record_for(&b)])
            .unwrap();
        assert_eq!(attestations.len(), 2);
        let root = attestations[0].integrity.merkle_root.clone().unwrap();
        for at in &attestations {
            assert_eq!(at.integrity.merkle_root.as_deref(), Some(root.as_str()));
            let proof = at.integrity.merkle_proof.as_ref().unwrap();
            assert!(merkle::verify_proof(
                HashAlgorithm::Sha256,
                &at.integrity.artifact_hash,
                proof,
                &root
            ));
        }

        // The operation landed as one ledger link with both digests.
        let links = f.ledger.read_links(None).unwrap();
        let tail = links.last().unwrap();
        assert_eq!(tail.artifact_digests.len(), 2);
    }

    #[test]
    fn test_previous_link_hash_matches_ledger() {
        let f = fixture();
        let artifact = f.dir.path().join("a.txt");
        std::fs::write(&artifact, b"data").unwrap();
        let attestations =
            builder(&f).attest_operation(f.dir.path(), "op-1", &[record_for(&artifact)]).unwrap();

        let links = f.ledger.read_links(None).unwrap();
        let operation_link = links.last().unwrap();
        assert_eq!(attestations[0].integrity.previous_link_hash, operation_link.previous_hash);
    }
}
