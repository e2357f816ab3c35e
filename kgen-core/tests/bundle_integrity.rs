//! Bundle tamper evidence.

mod common;

use std::collections::BTreeMap;
use std::io::Read;

use common::Rig;
use kgen_core::bundle::{create_bundle, verify_bundle, CreateBundleRequest};
use zip::ZipArchive;

fn read_entries(path: &std::path::Path) -> BTreeMap<String, Vec<u8>> {
    let mut archive = ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let mut entries = BTreeMap::new();
    for name in names {
        let mut raw = Vec::new();
        archive.by_name(&name).unwrap().read_to_end(&mut raw).unwrap();
        entries.insert(name, raw);
    }
    entries
}

fn rewrite_archive(path: &std::path::Path, entries: &BTreeMap<String, Vec<u8>>) {
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::{CompressionMethod, ZipWriter};

    let file = std::fs::File::create(path).unwrap();
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    for (name, bytes) in entries {
        writer.start_file(name, options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

fn bundled_rig() -> (Rig, std::path::PathBuf) {
    let rig = Rig::new();
    let x = rig.render_and_attest("out/x.txt", b"x body", "op-x");
    let y = rig.render_and_attest("out/y.txt", b"y body", "op-y");

    let output = rig.root().join("bundle.zip");
    let request = CreateBundleRequest {
        bundle_id: Some("itest".to_string()),
        project_root: rig.root().to_path_buf(),
        artifacts: vec![x, y],
        ledger: Some(&rig.ledger),
        ledger_range: None,
        compliance: vec![],
        output_path: output.clone(),
    };
    create_bundle(&request, Some((&rig.keystore, &rig.handle)), &rig.clock).unwrap();
    (rig, output)
}

#[test]
fn clean_bundle_verifies_end_to_end() {
    let (rig, bundle) = bundled_rig();
    let report = verify_bundle(&bundle, &rig.keystore).unwrap();
    assert!(report.valid, "errors: {:?}", report.errors);
    assert_eq!(report.bundle_hash_matches, Some(true));
    assert_eq!(report.manifest_signature_valid, Some(true));
    assert_eq!(report.attestation_reports.len(), 2);
    assert!(report.ledger_report.unwrap().is_intact());
}

#[test]
fn swapping_two_artifacts_flags_both_paths() {
    let (rig, bundle) = bundled_rig();

    let mut entries = read_entries(&bundle);
    let x = entries["artifacts/out/x.txt"].clone();
    let y = entries["artifacts/out/y.txt"].clone();
    entries.insert("artifacts/out/x.txt".to_string(), y);
    entries.insert("artifacts/out/y.txt".to_string(), x);
    rewrite_archive(&bundle, &entries);

    let report = verify_bundle(&bundle, &rig.keystore).unwrap();
    assert!(!report.valid);
    let flagged: Vec<&str> = report
        .file_results
        .iter()
        .filter(|f| !f.hash_matches)
        .map(|f| f.path.as_str())
        .collect();
    assert!(flagged.contains(&"artifacts/out/x.txt"));
    assert!(flagged.contains(&"artifacts/out/y.txt"));
}

#[test]
fn single_byte_artifact_edit_names_the_path() {
    let (rig, bundle) = bundled_rig();

    let mut entries = read_entries(&bundle);
    entries.get_mut("artifacts/out/x.txt").unwrap()[0] ^= 0x01;
    rewrite_archive(&bundle, &entries);

    let report = verify_bundle(&bundle, &rig.keystore).unwrap();
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.contains("artifacts/out/x.txt")));
    // The untouched artifact is still individually sound.
    let y_check = report
        .file_results
        .iter()
        .find(|f| f.path == "artifacts/out/y.txt")
        .unwrap();
    assert!(y_check.hash_matches);
}

#[test]
fn smuggled_archive_entry_is_rejected() {
    let (rig, bundle) = bundled_rig();

    let mut entries = read_entries(&bundle);
    entries.insert("artifacts/out/extra.txt".to_string(), b"sneaky".to_vec());
    rewrite_archive(&bundle, &entries);

    let report = verify_bundle(&bundle, &rig.keystore).unwrap();
    assert!(!report.valid);
    assert!(report.errors.iter().any(|e| e.contains("not listed in manifest")));
}

#[test]
fn ledger_slice_tamper_is_detected() {
    let (rig, bundle) = bundled_rig();

    let mut entries = read_entries(&bundle);
    let slice_bytes = entries.get_mut("ledger/slice.json").unwrap();
    let mut slice: serde_json::Value = serde_json::from_slice(slice_bytes).unwrap();
    slice["links"][1]["operationId"] = serde_json::json!("rewritten");
    *slice_bytes = serde_json::to_vec(&slice).unwrap();
    rewrite_archive(&bundle, &entries);

    let report = verify_bundle(&bundle, &rig.keystore).unwrap();
    assert!(!report.valid);
    // Both the per-file hash and the chain itself flag the rewrite.
    assert!(report.errors.iter().any(|e| e.contains("ledger/slice.json"))
        || report.errors.iter().any(|e| e.contains("ledger slice broken")));
}
