//! Reproducibility verification through repeated isolated builds

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::attest::Attestation;
use crate::canonical::canonicalize_record;
use crate::error::{KgenError, KgenResult};
use crate::hashing::{hash_bytes, hash_file, HashAlgorithm};
use crate::lockfile::LOCKFILE_NAME;

/// Minimum number of builds before reproducibility can be asserted.
pub const MIN_BUILDS: usize = 2;

/// Grace period between the termination request and the hard kill.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Captured output tails keep this many trailing lines.
const TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct ReproduceRequest {
    pub lockfile_path: PathBuf,
    pub project_path: PathBuf,
    /// Program and arguments invoked inside each scratch tree.
    pub build_argv: Vec<String>,
    /// Number of builds; clamped up to [`MIN_BUILDS`].
    pub builds: usize,
    pub timeout: Duration,
    /// Directories (relative to the work tree) purged before each build.
    pub purge_dirs: Vec<PathBuf>,
    /// Report line-level positions for differing text files.
    pub text_diffs: bool,
    /// Retain scratch trees for diagnostics.
    pub keep_scratch: bool,
}

impl ReproduceRequest {
    pub fn new(lockfile_path: PathBuf, project_path: PathBuf, build_argv: Vec<String>) -> Self {
        Self {
            lockfile_path,
            project_path,
            build_argv,
            builds: MIN_BUILDS,
            timeout: Duration::from_secs(600),
            purge_dirs: Vec::new(),
            text_diffs: true,
            keep_scratch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputFile {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub success: bool,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub environment_digest: String,
    pub outputs: Vec<OutputFile>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout_tail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    /// `changed`, `missing`, or `extra` relative to the baseline build.
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairComparison {
    pub base_index: usize,
    pub other_index: usize,
    pub identical: bool,
    pub differences: Vec<FileDiff>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReproducibilityReport {
    pub verification_id: String,
    pub builds: Vec<BuildOutcome>,
    pub comparison: Vec<PairComparison>,
    pub reproducible: bool,
    pub confidence: f64,
}

/// Outcome of re-running the recorded pipeline for one artifact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactReproReport {
    pub artifact: String,
    pub recorded_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuilt_hash: Option<String>,
    pub identical: bool,
}

// One finished build plus its still-live scratch tree, so the comparison
// pass can re-read differing files before anything is deleted.
struct BuildRun {
    outcome: BuildOutcome,
    work: PathBuf,
    _scratch: Option<tempfile::TempDir>,
}

/// Run N isolated builds from a pinned lockfile and compare their outputs.
///
/// A timed-out build is `failed`, never non-reproducible; reproducibility
/// is only asserted when at least two builds succeeded and every pair of
/// output sets is identical. Comparisons run after all builds return.
pub async fn reproduce(request: &ReproduceRequest) -> KgenResult<ReproducibilityReport> {
    if !request.lockfile_path.is_file() {
        return Err(KgenError::Config(format!(
            "lockfile not found: {}",
            request.lockfile_path.display()
        )));
    }
    if !request.project_path.is_dir() {
        return Err(KgenError::Config(format!(
            "project not found: {}",
            request.project_path.display()
        )));
    }
    if request.build_argv.is_empty() {
        return Err(KgenError::Config("empty build argv".to_string()));
    }

    let n = request.builds.max(MIN_BUILDS);
    let mut runs = Vec::with_capacity(n);
    for index in 0..n {
        runs.push(run_one_build(request, index).await?);
    }

    // Pairwise comparison against the first successful build, while every
    // scratch tree is still on disk.
    let successful: Vec<&BuildRun> = runs.iter().filter(|r| r.outcome.success).collect();
    let mut comparison = Vec::new();
    if let Some((base, rest)) = successful.split_first() {
        for other in rest {
            comparison.push(compare_outputs(base, other, request.text_diffs));
        }
    }
    let successful_count = successful.len();

    let total_pairs = comparison.len();
    let identical_pairs = comparison.iter().filter(|p| p.identical).count();
    let reproducible = successful_count >= MIN_BUILDS && identical_pairs == total_pairs;
    let confidence =
        if total_pairs == 0 { 0.0 } else { identical_pairs as f64 / total_pairs as f64 };

    info!(
        builds = n,
        successful = successful_count,
        reproducible,
        "reproducibility verification finished"
    );
    Ok(ReproducibilityReport {
        verification_id: Uuid::new_v4().to_string(),
        builds: runs.into_iter().map(|r| r.outcome).collect(),
        comparison,
        reproducible,
        confidence,
    })
}

async fn run_one_build(request: &ReproduceRequest, index: usize) -> KgenResult<BuildRun> {
    let scratch = tempfile::tempdir()?;
    let work = scratch.path().join("work");
    copy_tree(&request.project_path, &work)?;
    std::fs::copy(&request.lockfile_path, work.join(LOCKFILE_NAME))?;
    for dir in &request.purge_dirs {
        let target = work.join(dir);
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
    }

    let baseline = snapshot_tree(&work)?;
    let environment_digest = environment_digest(&request.build_argv)?;

    let started = Instant::now();
    let mut command = Command::new(&request.build_argv[0]);
    command
        .args(&request.build_argv[1..])
        .current_dir(&work)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        KgenError::BuildFailed(format!("cannot spawn {:?}: {}", request.build_argv[0], e))
    })?;
    // Drain the pipes concurrently so a chatty build cannot block on a
    // full pipe while we wait on its exit.
    let stdout_task = tokio::spawn(drain_pipe(child.stdout.take()));
    let stderr_task = tokio::spawn(drain_pipe(child.stderr.take()));

    let waited = tokio::time::timeout(request.timeout, child.wait()).await;
    let (exit_status, timed_out) = match waited {
        Ok(Ok(status)) => (status.code(), false),
        Ok(Err(e)) => return Err(KgenError::BuildFailed(format!("wait failed: {}", e))),
        Err(_) => {
            warn!(index, "build timed out after {} ms", request.timeout.as_millis());
            terminate(&mut child, TERM_GRACE).await;
            (None, true)
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let stdout_tail = tail(&stdout_task.await.unwrap_or_default());
    let stderr_tail = tail(&stderr_task.await.unwrap_or_default());
    let success = !timed_out && exit_status == Some(0);

    let outputs = if success {
        let after = snapshot_tree(&work)?;
        collect_outputs(&baseline, &after)
    } else {
        Vec::new()
    };

    let (scratch, scratch_path) = if request.keep_scratch {
        let retained = scratch.into_path();
        debug!(index, path = %retained.display(), "scratch tree retained");
        (None, Some(retained.display().to_string()))
    } else {
        (Some(scratch), None)
    };

    Ok(BuildRun {
        outcome: BuildOutcome {
            index,
            exit_status,
            success,
            timed_out,
            duration_ms,
            environment_digest,
            outputs,
            stdout_tail,
            stderr_tail,
            scratch_path,
        },
        work,
        _scratch: scratch,
    })
}

// Two-stage termination: ask politely with SIGTERM, give the child a
// bounded grace period, then hard-kill whatever is left.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "build ignored termination request; killing");
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.kill().await;
}

async fn drain_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let mut lines: Vec<&str> = text.lines().rev().take(TAIL_LINES).collect();
    lines.reverse();
    lines.join("\n")
}

/// Re-run the recorded single-artifact pipeline and compare byte-for-byte.
///
/// The command must regenerate the artifact at its recorded relative path
/// inside the scratch tree.
pub async fn verify_artifact_reproducibility(
    attestation: &Attestation,
    rebuild_argv: &[String],
    timeout: Duration,
) -> KgenResult<ArtifactReproReport> {
    if rebuild_argv.is_empty() {
        return Err(KgenError::Config("empty rebuild argv".to_string()));
    }
    let scratch = tempfile::tempdir()?;

    let mut command = Command::new(&rebuild_argv[0]);
    command
        .args(&rebuild_argv[1..])
        .current_dir(scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|e| {
        KgenError::BuildFailed(format!("cannot spawn {:?}: {}", rebuild_argv[0], e))
    })?;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(result) => result.map_err(|e| KgenError::BuildFailed(format!("wait failed: {}", e)))?,
        Err(_) => {
            terminate(&mut child, TERM_GRACE).await;
            return Err(KgenError::Timeout(timeout.as_millis() as u64));
        }
    };
    if !status.success() {
        return Err(KgenError::BuildFailed(format!(
            "rebuild exited with {:?}",
            status.code()
        )));
    }

    let rebuilt = scratch.path().join(&attestation.artifact.path);
    let report = if rebuilt.is_file() {
        let rebuilt_hash = hash_file(attestation.integrity.hash_algorithm, &rebuilt)?;
        let identical = crate::hashing::constant_time_hex_eq(
            &rebuilt_hash,
            &attestation.integrity.artifact_hash,
        );
        ArtifactReproReport {
            artifact: attestation.artifact.path.clone(),
            recorded_hash: attestation.integrity.artifact_hash.clone(),
            rebuilt_hash: Some(rebuilt_hash),
            identical,
        }
    } else {
        ArtifactReproReport {
            artifact: attestation.artifact.path.clone(),
            recorded_hash: attestation.integrity.artifact_hash.clone(),
            rebuilt_hash: None,
            identical: false,
        }
    };
    Ok(report)
}

fn compare_outputs(base: &BuildRun, other: &BuildRun, text_diffs: bool) -> PairComparison {
    let base_map: BTreeMap<&str, &OutputFile> =
        base.outcome.outputs.iter().map(|o| (o.path.as_str(), o)).collect();
    let other_map: BTreeMap<&str, &OutputFile> =
        other.outcome.outputs.iter().map(|o| (o.path.as_str(), o)).collect();

    let mut differences = Vec::new();
    for (path, base_file) in &base_map {
        match other_map.get(path) {
            None => differences.push(FileDiff {
                path: path.to_string(),
                status: "missing".to_string(),
                detail: None,
            }),
            Some(other_file) if other_file.hash != base_file.hash => {
                differences.push(FileDiff {
                    path: path.to_string(),
                    status: "changed".to_string(),
                    detail: changed_file_detail(
                        &base.work.join(path),
                        &other.work.join(path),
                        text_diffs,
                    ),
                });
            }
            Some(_) => {}
        }
    }
    for path in other_map.keys() {
        if !base_map.contains_key(path) {
            differences.push(FileDiff {
                path: path.to_string(),
                status: "extra".to_string(),
                detail: None,
            });
        }
    }

    PairComparison {
        base_index: base.outcome.index,
        other_index: other.outcome.index,
        identical: differences.is_empty(),
        differences,
    }
}

// Re-read the two copies from their scratch trees. Text files get a
// line-level position when configured; anything else diffs as binary,
// equal or unequal only.
fn changed_file_detail(
    base_path: &Path,
    other_path: &Path,
    text_diffs: bool,
) -> Option<String> {
    let (Ok(base_bytes), Ok(other_bytes)) =
        (std::fs::read(base_path), std::fs::read(other_path))
    else {
        return None;
    };
    match (std::str::from_utf8(&base_bytes), std::str::from_utf8(&other_bytes)) {
        (Ok(base_text), Ok(other_text)) => {
            text_diffs.then(|| first_line_difference(base_text, other_text))
        }
        _ => Some("binary contents differ".to_string()),
    }
}

fn first_line_difference(base: &str, other: &str) -> String {
    let mut line = 1usize;
    let mut base_lines = base.lines();
    let mut other_lines = other.lines();
    loop {
        match (base_lines.next(), other_lines.next()) {
            (Some(a), Some(b)) if a == b => line += 1,
            // Same lines, different bytes: only the line endings moved.
            (None, None) => return "line endings differ".to_string(),
            (Some(_), Some(_)) => return format!("first difference at line {}", line),
            (Some(_), None) | (None, Some(_)) => {
                return format!("files diverge in length at line {}", line)
            }
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> KgenResult<()> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry
            .map_err(|e| KgenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| KgenError::Config(e.to_string()))?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &dest)?;
        } else {
            warn!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

// Relative path → content hash for every regular file under root.
fn snapshot_tree(root: &Path) -> KgenResult<BTreeMap<String, (String, u64)>> {
    let mut snapshot = BTreeMap::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry
            .map_err(|e| KgenError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| KgenError::Config(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        let hash = hash_file(HashAlgorithm::Sha256, entry.path())?;
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        snapshot.insert(rel, (hash, size));
    }
    Ok(snapshot)
}

// Output set: files that appeared or changed relative to the baseline.
fn collect_outputs(
    baseline: &BTreeMap<String, (String, u64)>,
    after: &BTreeMap<String, (String, u64)>,
) -> Vec<OutputFile> {
    after
        .iter()
        .filter(|(path, (hash, _))| baseline.get(*path).map(|(h, _)| h) != Some(hash))
        .map(|(path, (hash, size))| OutputFile {
            path: path.clone(),
            hash: hash.clone(),
            size: *size,
        })
        .collect()
}

fn environment_digest(argv: &[String]) -> KgenResult<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct EnvRecord<'a> {
        os: &'a str,
        arch: &'a str,
        argv: &'a [String],
    }
    let record = EnvRecord {
        os: std::env::consts::OS,
        arch: std::env::consts::ARCH,
        argv,
    };
    Ok(hash_bytes(HashAlgorithm::Sha256, &canonicalize_record(&record)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile::tests::{clock, context};

    fn project_with_lockfile() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), b"seed\n").unwrap();
        let lockfile = crate::lockfile::generate(&context(), &clock()).unwrap();
        let path = dir.path().join(LOCKFILE_NAME);
        lockfile.write_to(&path).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_deterministic_build_is_reproducible() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "mkdir -p out && printf 'stable' > out/a.txt".to_string(),
            ],
        );
        let report = reproduce(&request).await.unwrap();
        assert!(report.reproducible);
        assert_eq!(report.confidence, 1.0);
        assert_eq!(report.builds.len(), 2);
        assert!(report.builds.iter().all(|b| b.success));
        assert!(report.builds[0].outputs.iter().any(|o| o.path == "out/a.txt"));
    }

    #[tokio::test]
    async fn test_nondeterministic_build_flips_result() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                // A fresh random value per build guarantees a diff.
                "mkdir -p out && head -c 16 /dev/urandom > out/a.txt".to_string(),
            ],
        );
        let report = reproduce(&request).await.unwrap();
        assert!(!report.reproducible);
        assert!(report.comparison.iter().any(|p| {
            p.differences.iter().any(|d| d.path == "out/a.txt" && d.status == "changed")
        }));
    }

    #[tokio::test]
    async fn test_text_difference_reports_line_position() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                // Line 1 is stable; line 2 differs per invocation via the
                // shell's own pid.
                "mkdir -p out && printf 'header\\n%s\\n' \"$$\" > out/t.txt".to_string(),
            ],
        );
        let report = reproduce(&request).await.unwrap();
        assert!(!report.reproducible);
        let diff = report
            .comparison
            .iter()
            .flat_map(|p| p.differences.iter())
            .find(|d| d.path == "out/t.txt")
            .unwrap();
        assert_eq!(diff.detail.as_deref(), Some("first difference at line 2"));
    }

    #[tokio::test]
    async fn test_binary_difference_stays_equal_unequal() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                // Invalid UTF-8 prefix plus a per-build suffix.
                "mkdir -p out && { printf '\\377\\376'; echo \"$$\"; } > out/b.bin".to_string(),
            ],
        );
        let report = reproduce(&request).await.unwrap();
        let diff = report
            .comparison
            .iter()
            .flat_map(|p| p.differences.iter())
            .find(|d| d.path == "out/b.bin")
            .unwrap();
        assert_eq!(diff.detail.as_deref(), Some("binary contents differ"));
    }

    #[tokio::test]
    async fn test_failed_build_is_failed_not_nonreproducible() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
        );
        let report = reproduce(&request).await.unwrap();
        assert!(!report.reproducible);
        assert!(report.builds.iter().all(|b| !b.success));
        assert_eq!(report.builds[0].exit_status, Some(3));
        // No successful pair exists, so no comparison was made.
        assert!(report.comparison.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_reports_failed() {
        let (dir, lockfile) = project_with_lockfile();
        let mut request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec!["sleep".to_string(), "30".to_string()],
        );
        request.timeout = Duration::from_millis(200);
        let started = Instant::now();
        let report = reproduce(&request).await.unwrap();
        assert!(report.builds.iter().all(|b| b.timed_out && !b.success));
        assert!(!report.reproducible);
        // sleep exits on the termination request, well inside the grace.
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_builds_are_isolated_from_project() {
        let (dir, lockfile) = project_with_lockfile();
        let request = ReproduceRequest::new(
            lockfile,
            dir.path().to_path_buf(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf 'clobbered' > input.txt".to_string(),
            ],
        );
        reproduce(&request).await.unwrap();
        // The original project tree is untouched.
        let original = std::fs::read(dir.path().join("input.txt")).unwrap();
        assert_eq!(original, b"seed\n");
    }
}
