//! Append-only hash-linked integrity ledger

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::canonical::{canonicalize, canonicalize_record, signing_projection};
use crate::config::DeterministicClock;
use crate::error::{KgenError, KgenResult};
use crate::hashing::{hash_bytes, HashAlgorithm};
use crate::keystore::{KeyStore, KeypairHandle, SignatureRecord};

/// `previousHash` of the genesis link.
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";
/// Operation id recorded on the genesis link.
pub const GENESIS_OPERATION_ID: &str = "genesis";

/// One entry in the ledger. Links form a chain:
/// `links[i].previousHash == H(links[i-1].linkPayloadHash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerLink {
    pub index: u64,
    pub operation_id: String,
    pub timestamp: DateTime<Utc>,
    pub artifact_digests: Vec<String>,
    pub previous_hash: String,
    pub link_payload_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<SignatureRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkPayload<'a> {
    index: u64,
    operation_id: &'a str,
    timestamp: DateTime<Utc>,
    artifact_digests: &'a [String],
    previous_hash: &'a str,
}

impl LedgerLink {
    /// Recompute the payload hash from the link's own fields.
    pub fn compute_payload_hash(&self) -> KgenResult<String> {
        let payload = LinkPayload {
            index: self.index,
            operation_id: &self.operation_id,
            timestamp: self.timestamp,
            artifact_digests: &self.artifact_digests,
            previous_hash: &self.previous_hash,
        };
        let bytes = canonicalize_record(&payload)?;
        Ok(hash_bytes(HashAlgorithm::Sha256, &bytes))
    }

    /// The hash a successor link must carry as its `previousHash`.
    pub fn successor_previous_hash(&self) -> String {
        hash_bytes(HashAlgorithm::Sha256, self.link_payload_hash.as_bytes())
    }

    fn canonical_signing_bytes(&self) -> KgenResult<Vec<u8>> {
        let value = serde_json::to_value(self)
            .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        canonicalize(&signing_projection(&value))
    }
}

/// One broken link, with the first reason observed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainIssue {
    pub index: u64,
    pub reason: String,
}

/// Result of chain verification. Breaks are reported, never repaired.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub total_links: u64,
    pub valid_links: u64,
    pub broken_links: Vec<ChainIssue>,
    pub signature_valid: Vec<bool>,
    pub integrity_score: f64,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        self.broken_links.is_empty()
    }
}

#[derive(Debug)]
struct LedgerState {
    links: u64,
    tail_payload_hash: String,
    last_timestamp: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TailWitness {
    links: u64,
    tail_payload_hash: String,
}

/// Per-project ledger over an NDJSON file, one canonical link per line.
///
/// In-process appends serialize through a mutex; the file itself is guarded
/// by an advisory lock for cross-process writers. A tail sidecar holding
/// the last payload hash is rewritten atomically on every append.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Open an existing ledger, or create one with a signed genesis link.
    pub fn open_or_create(
        path: &Path,
        keystore: &KeyStore,
        handle: &KeypairHandle,
        clock: &DeterministicClock,
    ) -> KgenResult<Self> {
        if path.exists() {
            return Self::open(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut genesis = LedgerLink {
            index: 0,
            operation_id: GENESIS_OPERATION_ID.to_string(),
            timestamp: clock.now(),
            artifact_digests: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            link_payload_hash: String::new(),
            signature: None,
        };
        genesis.link_payload_hash = genesis.compute_payload_hash()?;
        genesis.signature =
            Some(keystore.sign(handle, &genesis.canonical_signing_bytes()?, clock)?);

        let ledger = Self {
            path: path.to_path_buf(),
            state: Mutex::new(LedgerState {
                links: 0,
                tail_payload_hash: String::new(),
                last_timestamp: genesis.timestamp,
            }),
        };
        ledger.persist_link(&genesis)?;
        {
            let mut state = ledger.state.lock().expect("ledger lock poisoned");
            state.links = 1;
            state.tail_payload_hash = genesis.link_payload_hash.clone();
        }
        info!(path = %path.display(), "ledger created");
        Ok(ledger)
    }

    /// Open an existing ledger, reading the tail from the file.
    pub fn open(path: &Path) -> KgenResult<Self> {
        let links = read_links_file(path)?;
        let tail = links.last().ok_or_else(|| {
            KgenError::Integrity(format!("ledger {} has no genesis link", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LedgerState {
                links: links.len() as u64,
                tail_payload_hash: tail.link_payload_hash.clone(),
                last_timestamp: tail.timestamp,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tail_witness_path(&self) -> PathBuf {
        tail_witness_path(&self.path)
    }

    pub fn len(&self) -> u64 {
        self.state.lock().expect("ledger lock poisoned").links
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `previousHash` the next appended link will carry. Cheap; reads
    /// the in-memory tail.
    pub fn next_previous_hash(&self) -> String {
        let state = self.state.lock().expect("ledger lock poisoned");
        hash_bytes(HashAlgorithm::Sha256, state.tail_payload_hash.as_bytes())
    }

    /// Append a signed link for one operation.
    ///
    /// The lock is held for hash + sign + persist, so racing submissions
    /// observe each other's `previousHash`. Timestamps must not move
    /// backwards; an equal timestamp is permitted.
    pub fn append(
        &self,
        keystore: &KeyStore,
        handle: &KeypairHandle,
        clock: &DeterministicClock,
        operation_id: &str,
        artifact_digests: Vec<String>,
    ) -> KgenResult<LedgerLink> {
        let mut state = self.state.lock().expect("ledger lock poisoned");

        let timestamp = clock.now();
        if timestamp < state.last_timestamp {
            return Err(KgenError::Integrity(format!(
                "ledger timestamp regressed: {} < {}",
                timestamp, state.last_timestamp
            )));
        }

        let mut link = LedgerLink {
            index: state.links,
            operation_id: operation_id.to_string(),
            timestamp,
            artifact_digests,
            previous_hash: hash_bytes(
                HashAlgorithm::Sha256,
                state.tail_payload_hash.as_bytes(),
            ),
            link_payload_hash: String::new(),
            signature: None,
        };
        link.link_payload_hash = link.compute_payload_hash()?;
        link.signature = Some(keystore.sign(handle, &link.canonical_signing_bytes()?, clock)?);

        self.persist_link(&link)?;

        state.links += 1;
        state.tail_payload_hash = link.link_payload_hash.clone();
        state.last_timestamp = timestamp;
        debug!(index = link.index, operation_id, "ledger link appended");
        Ok(link)
    }

    // Append one canonical line under the advisory file lock, fsync, then
    // atomically rewrite the tail witness.
    fn persist_link(&self, link: &LedgerLink) -> KgenResult<()> {
        let line = canonicalize_record(link)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = (|| -> KgenResult<()> {
            file.write_all(&line)?;
            file.write_all(b"\n")?;
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        result?;

        let witness = TailWitness {
            links: link.index + 1,
            tail_payload_hash: link.link_payload_hash.clone(),
        };
        let bytes = canonicalize_record(&witness)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(tail_witness_path(&self.path)).map_err(|e| KgenError::Io(e.error))?;
        Ok(())
    }

    /// Read links, optionally restricted to an inclusive index range.
    pub fn read_links(&self, range: Option<(u64, u64)>) -> KgenResult<Vec<LedgerLink>> {
        let links = read_links_file(&self.path)?;
        Ok(match range {
            None => links,
            Some((start, end)) => links
                .into_iter()
                .filter(|l| l.index >= start && l.index <= end)
                .collect(),
        })
    }

    /// Verify the whole chain from genesis.
    pub fn verify_chain(&self, keystore: Option<&KeyStore>) -> KgenResult<ChainReport> {
        let links = self.read_links(None)?;
        Ok(verify_links(&links, GENESIS_PREVIOUS_HASH, keystore))
    }
}

fn tail_witness_path(ledger_path: &Path) -> PathBuf {
    let mut name = ledger_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    name.push_str(".tail.json");
    ledger_path.with_file_name(name)
}

fn read_links_file(path: &Path) -> KgenResult<Vec<LedgerLink>> {
    let raw = std::fs::read_to_string(path)?;
    let mut links = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let link: LedgerLink = serde_json::from_str(line).map_err(|e| {
            KgenError::Schema(format!("ledger line {} malformed: {}", lineno + 1, e))
        })?;
        links.push(link);
    }
    Ok(links)
}

/// Verify a run of links against a starting `previousHash` witness.
///
/// Used for the full chain (witness = genesis constant) and for bundle
/// slices that start mid-chain. A hash break taints every subsequent link;
/// a signature failure taints only its own link.
pub fn verify_links(
    links: &[LedgerLink],
    starting_previous: &str,
    keystore: Option<&KeyStore>,
) -> ChainReport {
    let total = links.len() as u64;
    let mut broken: Vec<ChainIssue> = Vec::new();
    let mut signature_valid = Vec::with_capacity(links.len());
    let mut expected_previous = starting_previous.to_string();
    let mut tainted_from: Option<u64> = None;
    let mut last_timestamp: Option<DateTime<Utc>> = None;

    for link in links {
        let mut reason: Option<String> = None;

        if let Some(origin) = tainted_from {
            reason = Some(format!("descends from broken link {}", origin));
        } else {
            match link.compute_payload_hash() {
                Ok(recomputed) => {
                    if !crate::hashing::constant_time_hex_eq(&recomputed, &link.link_payload_hash) {
                        reason = Some("link payload hash mismatch".to_string());
                    }
                }
                Err(e) => reason = Some(format!("payload not canonicalizable: {}", e)),
            }
            if reason.is_none() && link.previous_hash != expected_previous {
                reason = Some("previous hash does not match predecessor".to_string());
            }
            if reason.is_none() {
                if let Some(last) = last_timestamp {
                    if link.timestamp < last {
                        reason = Some("timestamp regressed".to_string());
                    }
                }
            }
        }

        let sig_ok = match (&link.signature, keystore) {
            (Some(sig), Some(ks)) => match link.canonical_signing_bytes() {
                Ok(bytes) => ks.verify_record(&bytes, sig),
                Err(_) => false,
            },
            (None, Some(_)) => false,
            _ => true,
        };
        signature_valid.push(sig_ok);
        if reason.is_none() && !sig_ok {
            reason = Some("signature invalid".to_string());
        }

        if let Some(reason) = reason {
            // Signature failures do not taint descendants; hash breaks do.
            if tainted_from.is_none() && reason != "signature invalid" {
                tainted_from = Some(link.index);
            }
            warn!(index = link.index, %reason, "broken ledger link");
            broken.push(ChainIssue { index: link.index, reason });
        }

        expected_previous = link.successor_previous_hash();
        last_timestamp = Some(link.timestamp);
    }

    let valid = total - broken.len() as u64;
    ChainReport {
        total_links: total,
        valid_links: valid,
        broken_links: broken,
        signature_valid,
        integrity_score: if total == 0 { 1.0 } else { valid as f64 / total as f64 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::keystore::SignatureSuite;
    use chrono::TimeZone;

    struct Fixture {
        _dir: tempfile::TempDir,
        keystore: KeyStore,
        handle: KeypairHandle,
        ledger_path: PathBuf,
        clock: DeterministicClock,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::for_project(dir.path());
        let keystore = KeyStore::open(&config).unwrap();
        let clock =
            DeterministicClock::fixed(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap());
        let handle = keystore.generate_keypair(SignatureSuite::Ed25519, &clock).unwrap();
        keystore.save_keypair(&handle, None).unwrap();
        let ledger_path = config.ledger_path.clone();
        Fixture { _dir: dir, keystore, handle, ledger_path, clock }
    }

    #[test]
    fn test_genesis_created_once() {
        let f = fixture();
        let ledger =
            Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
        assert_eq!(ledger.len(), 1);
        let links = ledger.read_links(None).unwrap();
        assert_eq!(links[0].index, 0);
        assert_eq!(links[0].previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(links[0].operation_id, GENESIS_OPERATION_ID);
    }

    #[test]
    fn test_append_links_previous_hash() {
        let f = fixture();
        let ledger =
            Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
        let expected = ledger.next_previous_hash();
        let link = ledger
            .append(&f.keystore, &f.handle, &f.clock, "op-1", vec!["aa".repeat(32)])
            .unwrap();
        assert_eq!(link.index, 1);
        assert_eq!(link.previous_hash, expected);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_chain_verifies_clean() {
        let f = fixture();
        let ledger =
            Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
        for i in 0..3 {
            ledger
                .append(&f.keystore, &f.handle, &f.clock, &format!("op-{}", i), vec![])
                .unwrap();
        }
        let report = ledger.verify_chain(Some(&f.keystore)).unwrap();
        assert_eq!(report.total_links, 4);
        assert_eq!(report.valid_links, 4);
        assert!(report.is_intact());
        assert!(report.signature_valid.iter().all(|v| *v));
        assert_eq!(report.integrity_score, 1.0);
    }

    #[test]
    fn test_tampered_link_cascades() {
        let f = fixture();
        {
            let ledger =
                Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
            for i in 0..3 {
                ledger
                    .append(&f.keystore, &f.handle, &f.clock, &format!("op-{}", i), vec![])
                    .unwrap();
            }
        }

        // Rewrite link #1's previousHash to zeros, leaving everything else.
        let raw = std::fs::read_to_string(&f.ledger_path).unwrap();
        let mut lines: Vec<String> = raw.lines().map(String::from).collect();
        let mut link: LedgerLink = serde_json::from_str(&lines[1]).unwrap();
        link.previous_hash = "00".repeat(32);
        lines[1] = String::from_utf8(canonicalize_record(&link).unwrap()).unwrap();
        std::fs::write(&f.ledger_path, lines.join("\n") + "\n").unwrap();

        let ledger = Ledger::open(&f.ledger_path).unwrap();
        let report = ledger.verify_chain(Some(&f.keystore)).unwrap();
        let broken: Vec<u64> = report.broken_links.iter().map(|b| b.index).collect();
        assert_eq!(broken, vec![1, 2, 3]);
        assert_eq!(report.valid_links, 1);
    }

    #[test]
    fn test_slice_verifies_against_witness() {
        let f = fixture();
        let ledger =
            Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
        for i in 0..4 {
            ledger
                .append(&f.keystore, &f.handle, &f.clock, &format!("op-{}", i), vec![])
                .unwrap();
        }
        let all = ledger.read_links(None).unwrap();
        let witness = all[1].successor_previous_hash();
        let slice = ledger.read_links(Some((2, 4))).unwrap();
        let report = verify_links(&slice, &witness, Some(&f.keystore));
        assert!(report.is_intact());
        assert_eq!(report.total_links, 3);
    }

    #[test]
    fn test_reopen_resumes_tail() {
        let f = fixture();
        let first_tail;
        {
            let ledger =
                Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
            ledger.append(&f.keystore, &f.handle, &f.clock, "op-0", vec![]).unwrap();
            first_tail = ledger.next_previous_hash();
        }
        let reopened = Ledger::open(&f.ledger_path).unwrap();
        assert_eq!(reopened.next_previous_hash(), first_tail);
        let link = reopened
            .append(&f.keystore, &f.handle, &f.clock, "op-1", vec![])
            .unwrap();
        assert_eq!(link.previous_hash, first_tail);
        assert!(reopened.verify_chain(Some(&f.keystore)).unwrap().is_intact());
    }

    #[test]
    fn test_tail_witness_written() {
        let f = fixture();
        let ledger =
            Ledger::open_or_create(&f.ledger_path, &f.keystore, &f.handle, &f.clock).unwrap();
        ledger.append(&f.keystore, &f.handle, &f.clock, "op-0", vec![]).unwrap();
        let witness_raw = std::fs::read_to_string(ledger.tail_witness_path()).unwrap();
        let witness: TailWitness = serde_json::from_str(&witness_raw).unwrap();
        assert_eq!(witness.links, 2);
        let tail = ledger.read_links(None).unwrap().pop().unwrap();
        assert_eq!(witness.tail_payload_hash, tail.link_payload_hash);
    }
}
