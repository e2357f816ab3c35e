//! End-to-end attestation and verification flows.

mod common;

use std::io::Write;

use common::Rig;
use kgen_core::attest::Attestation;
use kgen_core::keystore::trust::TrustStatus;
use kgen_core::verify::Verifier;

#[test]
fn baseline_render_attest_verify() {
    let rig = Rig::new();
    let artifact = rig.render_and_attest("out/hello.txt", b"Hello, World!\n", "op-hello");

    let sidecar = Attestation::sidecar_path(&artifact);
    assert!(sidecar.exists());
    let attestation = Attestation::load(&sidecar).unwrap();
    assert_eq!(attestation.schema_version, "2.0");
    assert_eq!(attestation.generation.template.id, "greet");
    assert_eq!(attestation.artifact.content_hash, attestation.integrity.artifact_hash);

    let verifier = Verifier::new(&rig.keystore, Some(&rig.ledger));
    let report = verifier.verify_artifact(&artifact);
    assert!(report.valid, "errors: {:?}", report.errors);
    assert!(report.hash_matches);
    assert!(report.signature_valid);
    assert!(report.chain_valid);
    assert_eq!(report.trust_status, TrustStatus::Active);
}

#[test]
fn appended_bytes_break_hash_but_not_signature() {
    let rig = Rig::new();
    let artifact = rig.render_and_attest("out/hello.txt", b"Hello, World!\n", "op-hello");

    let mut file = std::fs::OpenOptions::new().append(true).open(&artifact).unwrap();
    file.write_all(b" tampered").unwrap();
    drop(file);

    let verifier = Verifier::new(&rig.keystore, Some(&rig.ledger));
    let report = verifier.verify_artifact(&artifact);
    assert!(!report.valid);
    assert!(!report.hash_matches);
    // The sidecar was untouched, so the signature over it still holds.
    assert!(report.signature_valid);

    let sidecar_bytes = std::fs::read(Attestation::sidecar_path(&artifact)).unwrap();
    assert!(!sidecar_bytes.is_empty());
}

#[test]
fn batch_verification_isolates_failures() {
    let rig = Rig::new();
    let mut paths = Vec::new();
    for i in 0..5 {
        paths.push(rig.render_and_attest(
            &format!("out/file-{}.txt", i),
            format!("content {}", i).as_bytes(),
            &format!("op-{}", i),
        ));
    }
    std::fs::write(&paths[2], b"corrupted").unwrap();

    let verifier = Verifier::new(&rig.keystore, Some(&rig.ledger));
    let reports = verifier.verify_batch(&paths);
    let invalid: Vec<usize> = reports
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.valid)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(invalid, vec![2]);
}

#[test]
fn rotation_keeps_grace_and_revocation_bites() {
    let rig = Rig::new();
    let artifact = rig.render_and_attest("out/a.txt", b"payload", "op-a");

    let outcome = rig.keystore.rotate(None, &rig.clock).unwrap();
    assert_eq!(outcome.old_fingerprint, rig.handle.fingerprint);

    // Signed at the rotation instant: inside the grace window.
    let verifier = Verifier::new(&rig.keystore, Some(&rig.ledger));
    let report = verifier.verify_artifact(&artifact);
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.trust_status, TrustStatus::Rotated);

    rig.keystore.revoke(&rig.handle.fingerprint).unwrap();
    let report = verifier.verify_artifact(&artifact);
    assert!(!report.valid);
    assert_eq!(report.trust_status, TrustStatus::Revoked);
}

#[test]
fn sidecar_chains_to_ledger_order() {
    let rig = Rig::new();
    rig.render_and_attest("out/first.txt", b"one", "op-1");
    rig.render_and_attest("out/second.txt", b"two", "op-2");

    let links = rig.ledger.read_links(None).unwrap();
    assert_eq!(links.len(), 3); // genesis + two operations
    for pair in links.windows(2) {
        assert_eq!(pair[1].previous_hash, pair[0].successor_previous_hash());
    }

    let report = rig.ledger.verify_chain(Some(&rig.keystore)).unwrap();
    assert!(report.is_intact());
    assert_eq!(report.total_links, 3);
}
