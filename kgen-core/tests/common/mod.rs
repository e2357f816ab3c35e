//! Shared rig for end-to-end provenance tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use chrono::TimeZone;
use chrono::Utc;

use kgen_core::attest::{
    AgentRef, AttestationBuilder, BuilderOptions, CompletionRecord, EngineRef, TemplateRef,
};
use kgen_core::config::{CoreConfig, DeterministicClock};
use kgen_core::keystore::{KeyStore, KeypairHandle, SignatureSuite};
use kgen_core::ledger::Ledger;

pub struct Rig {
    pub dir: tempfile::TempDir,
    pub config: CoreConfig,
    pub keystore: KeyStore,
    pub handle: KeypairHandle,
    pub ledger: Ledger,
    pub clock: DeterministicClock,
}

impl Rig {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig::for_project(dir.path());
        let keystore = KeyStore::open(&config).unwrap();
        let clock =
            DeterministicClock::fixed(Utc.timestamp_opt(1_700_000_000, 0).single().unwrap());
        let handle = keystore.generate_keypair(SignatureSuite::Ed25519, &clock).unwrap();
        keystore.save_keypair(&handle, None).unwrap();
        let ledger =
            Ledger::open_or_create(&config.ledger_path, &keystore, &handle, &clock).unwrap();
        Self { dir, config, keystore, handle, ledger, clock }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write artifact bytes and attest them as one operation.
    pub fn render_and_attest(&self, rel: &str, content: &[u8], operation_id: &str) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();

        let builder = AttestationBuilder::new(
            &self.keystore,
            &self.handle,
            &self.ledger,
            self.clock,
            "1.0.0",
            BuilderOptions::default(),
        );
        builder
            .attest_operation(self.root(), operation_id, &[completion_record(&path)])
            .unwrap();
        path
    }
}

pub fn completion_record(path: &Path) -> CompletionRecord {
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
        extra: Default::default(),
    }
}
