//! KGEN provenance core - attestation, integrity chain, and
//! reproducibility for template-driven artifact generation.
//!
//! Every rendered artifact gets a signed sidecar binding it byte-for-byte
//! to the template, rules, input graph, and engine that produced it, plus
//! a link in a per-project hash-linked ledger. The core then verifies
//! built trees against their attestations, pins component versions in a
//! deterministic lockfile, replays builds to check reproducibility, and
//! packages everything into tamper-evident bundles.
//!
//! ## Components
//! - Canonicalizer: byte-stable JSON for hashing and signing
//! - Hasher: sha-256 (default) and blake3 content digests
//! - KeyStore & Signer: Ed25519 / RSA-PSS keypairs with a trust store
//! - Attestation Builder: per-artifact `<artifact>.attest.json` sidecars
//! - Integrity Ledger: append-only hash-linked chain with Merkle batches
//! - Verifier: artifact, build, and batch verification
//! - Lockfile Generator: deterministic `kgen.lock.json`
//! - Reproducibility Differ: N isolated rebuilds, pairwise compared
//! - Bundle Packager: deterministic deflate ZIP with signed manifest
//!
//! No process-wide singletons: the `KeyStore`, `Ledger`, and clock are
//! explicit handles passed to every call.

pub mod attest;
pub mod bundle;
pub mod canonical;
pub mod config;
pub mod error;
pub mod hashing;
pub mod keystore;
pub mod ledger;
pub mod lockfile;
pub mod merkle;
pub mod reproduce;
pub mod verify;

pub use attest::{
    AgentRef, ArtifactRef, Attestation, AttestationBuilder, BuilderOptions, CompletionRecord,
    EngineRef, GenerationInfo, RuleRef, TemplateRef, SIDECAR_SCHEMA_VERSION, SIDECAR_SUFFIX,
};
pub use bundle::{
    create_bundle, verify_bundle, BundleManifest, BundleResult, BundleVerificationReport,
    CreateBundleRequest,
};
pub use canonical::{canonicalize, canonicalize_record, signing_projection};
pub use config::{CoreConfig, DeterministicClock};
pub use error::{KgenError, KgenResult};
pub use hashing::{hash_bytes, hash_file, HashAlgorithm};
pub use keystore::trust::{KeyStatus, TrustStatus, TrustStore};
pub use keystore::{KeyStore, KeypairHandle, SignatureRecord, SignatureSuite};
pub use ledger::{ChainReport, Ledger, LedgerLink, GENESIS_PREVIOUS_HASH};
pub use lockfile::{Lockfile, ProjectContext, Validation, LOCKFILE_NAME};
pub use merkle::{build_batch, merkle_root, verify_proof, MerkleProof};
pub use reproduce::{
    reproduce, verify_artifact_reproducibility, ReproduceRequest, ReproducibilityReport,
};
pub use verify::{VerificationReport, Verifier};
