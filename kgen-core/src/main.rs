use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kgen_core::bundle::{create_bundle, verify_bundle, CreateBundleRequest};
use kgen_core::config::{CoreConfig, DeterministicClock};
use kgen_core::error::{KgenError, KgenResult};
use kgen_core::keystore::{KeyStore, KeypairHandle, SignatureSuite};
use kgen_core::ledger::Ledger;
use kgen_core::lockfile::{self, Lockfile, ProjectContext, LOCKFILE_NAME};
use kgen_core::reproduce::{reproduce, ReproduceRequest};
use kgen_core::verify::Verifier;

/// Context file the engine writes for `lock` and `verify lockfile`.
const CONTEXT_FILE: &str = "kgen.context.json";

/// KGEN provenance core CLI
#[derive(Parser)]
#[command(name = "kgen")]
#[command(about = "Verifiable, reproducible build provenance for generated artifacts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project root
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a deterministic lockfile from the project context
    Lock {
        /// Output path; defaults to <project>/kgen.lock.json
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Package attested artifacts into a signed bundle
    Attest {
        /// Artifact paths; each must carry its sidecar
        #[arg(required = true)]
        artifacts: Vec<PathBuf>,

        #[arg(long)]
        bundle_id: Option<String>,

        /// Output archive path; defaults to <project>/kgen.bundle.zip
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Verify a build tree, artifacts, a bundle, or a lockfile
    #[command(subcommand)]
    Verify(VerifyTarget),

    /// Run N isolated builds from a pinned lockfile and diff the outputs
    Reproduce {
        /// Lockfile path; defaults to <project>/kgen.lock.json
        #[arg(long)]
        lockfile: Option<PathBuf>,

        /// Number of builds (minimum 2)
        #[arg(short = 'n', long, default_value_t = 2)]
        builds: usize,

        /// Per-build timeout in seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,

        /// Build command and arguments
        #[arg(required = true, trailing_var_arg = true)]
        build_argv: Vec<String>,
    },

    /// Rotate the signing keypair, retiring the old key into backup/
    RotateKeys,
}

#[derive(Subcommand)]
enum VerifyTarget {
    /// Verify every attested artifact under a directory
    Build {
        /// Root to scan; defaults to the project root
        path: Option<PathBuf>,
    },
    /// Verify individual artifacts against their sidecars
    Artifact {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Verify a bundle archive
    Bundle { path: PathBuf },
    /// Validate a lockfile against the project context
    Lockfile {
        /// Lockfile path; defaults to <project>/kgen.lock.json
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> KgenResult<i32> {
    let config = CoreConfig::for_project(&cli.project);
    let clock = DeterministicClock::from_env()?;

    match &cli.command {
        Commands::Lock { output } => cmd_lock(cli, &config, &clock, output.as_deref()),
        Commands::Attest { artifacts, bundle_id, output } => {
            cmd_attest(cli, &config, &clock, artifacts, bundle_id.clone(), output.as_deref())
        }
        Commands::Verify(target) => cmd_verify(cli, &config, &clock, target),
        Commands::Reproduce { lockfile, builds, timeout, build_argv } => {
            cmd_reproduce(cli, lockfile.as_deref(), *builds, *timeout, build_argv).await
        }
        Commands::RotateKeys => cmd_rotate(&config, &clock),
    }
}

fn cmd_lock(
    cli: &Cli,
    _config: &CoreConfig,
    clock: &DeterministicClock,
    output: Option<&Path>,
) -> KgenResult<i32> {
    let context_path = cli.project.join(CONTEXT_FILE);
    let raw = std::fs::read(&context_path)?;
    let context: ProjectContext = serde_json::from_slice(&raw)
        .map_err(|e| KgenError::Schema(format!("{}: {}", context_path.display(), e)))?;

    let lockfile = lockfile::generate(&context, clock)?;
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cli.project.join(LOCKFILE_NAME));
    lockfile.write_to(&output)?;

    info!("locked {} components", lockfile.resolution.len());
    print_json(&json!({
        "lockfilePath": output,
        "lockfileHash": lockfile.lockfile_hash,
    }))?;
    Ok(0)
}

fn cmd_attest(
    cli: &Cli,
    config: &CoreConfig,
    clock: &DeterministicClock,
    artifacts: &[PathBuf],
    bundle_id: Option<String>,
    output: Option<&Path>,
) -> KgenResult<i32> {
    let keystore = KeyStore::open(config)?;
    let handle = load_or_init_keypair(&keystore, clock)?;
    let ledger = if config.ledger_path.exists() {
        Some(Ledger::open(&config.ledger_path)?)
    } else {
        None
    };

    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cli.project.join("kgen.bundle.zip"));
    let request = CreateBundleRequest {
        bundle_id,
        project_root: cli.project.clone(),
        artifacts: artifacts.to_vec(),
        ledger: ledger.as_ref(),
        ledger_range: None,
        compliance: Vec::new(),
        output_path: output,
    };
    let result = create_bundle(&request, Some((&keystore, &handle)), clock)?;

    info!("bundle written to {}", result.path.display());
    print_json(&json!({
        "bundlePath": result.path,
        "bundleHash": result.bundle_hash,
        "signature": result.manifest.signature,
        "manifest": result.manifest,
    }))?;
    Ok(0)
}

fn cmd_verify(
    cli: &Cli,
    config: &CoreConfig,
    clock: &DeterministicClock,
    target: &VerifyTarget,
) -> KgenResult<i32> {
    let keystore = KeyStore::open(config)?;
    // An externally supplied public key becomes trusted for this run.
    if let Some(pub_path) = CoreConfig::public_key_path_override() {
        let raw = std::fs::read_to_string(&pub_path)?;
        let bytes = hex::decode(raw.trim())
            .map_err(|e| KgenError::Config(format!("{}: {}", pub_path.display(), e)))?;
        keystore.import_public_key(SignatureSuite::default(), &bytes, clock)?;
    }
    let ledger = if config.ledger_path.exists() {
        Some(Ledger::open(&config.ledger_path)?)
    } else {
        None
    };
    let verifier = Verifier::new(&keystore, ledger.as_ref());

    match target {
        VerifyTarget::Build { path } => {
            let root = path.clone().unwrap_or_else(|| cli.project.clone());
            let reports = verifier.verify_build(&root)?;
            let valid = !reports.is_empty() && reports.iter().all(|r| r.valid);
            info!(
                "verified {} artifact(s), {} invalid",
                reports.len(),
                reports.iter().filter(|r| !r.valid).count()
            );
            print_json(&json!({ "valid": valid, "artifacts": reports }))?;
            Ok(if valid { 0 } else { 1 })
        }
        VerifyTarget::Artifact { paths } => {
            let reports = verifier.verify_batch(paths);
            let valid = reports.iter().all(|r| r.valid);
            print_json(&json!({ "valid": valid, "artifacts": reports }))?;
            Ok(if valid { 0 } else { 1 })
        }
        VerifyTarget::Bundle { path } => {
            let report = verify_bundle(path, &keystore)?;
            let valid = report.valid;
            print_json(&report)?;
            Ok(if valid { 0 } else { 1 })
        }
        VerifyTarget::Lockfile { path } => {
            let lockfile_path = path
                .clone()
                .unwrap_or_else(|| cli.project.join(LOCKFILE_NAME));
            let lockfile = Lockfile::load(&lockfile_path)?;
            let context_path = cli.project.join(CONTEXT_FILE);
            let context: ProjectContext = if context_path.is_file() {
                serde_json::from_slice(&std::fs::read(&context_path)?)
                    .map_err(|e| KgenError::Schema(format!("{}: {}", context_path.display(), e)))?
            } else {
                ProjectContext::default()
            };
            let validation = lockfile::validate(&lockfile, &context)?;
            let valid = validation.valid;
            print_json(&validation)?;
            Ok(if valid { 0 } else { 1 })
        }
    }
}

async fn cmd_reproduce(
    cli: &Cli,
    lockfile: Option<&Path>,
    builds: usize,
    timeout: u64,
    build_argv: &[String],
) -> KgenResult<i32> {
    let lockfile_path = lockfile
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cli.project.join(LOCKFILE_NAME));
    let mut request =
        ReproduceRequest::new(lockfile_path, cli.project.clone(), build_argv.to_vec());
    request.builds = builds;
    request.timeout = Duration::from_secs(timeout);

    let report = reproduce(&request).await?;
    let successful = report.builds.iter().filter(|b| b.success).count();
    print_json(&report)?;
    if successful < 2 {
        return Ok(5);
    }
    Ok(if report.reproducible { 0 } else { 1 })
}

fn cmd_rotate(config: &CoreConfig, clock: &DeterministicClock) -> KgenResult<i32> {
    let keystore = KeyStore::open(config)?;
    let outcome = keystore.rotate(CoreConfig::key_passphrase().as_deref(), clock)?;
    info!("rotated to {}", outcome.new_fingerprint);
    print_json(&outcome)?;
    Ok(0)
}

// Load the project keypair, generating and registering one on first use.
fn load_or_init_keypair(
    keystore: &KeyStore,
    clock: &DeterministicClock,
) -> KgenResult<KeypairHandle> {
    let passphrase = CoreConfig::key_passphrase();
    if keystore.private_key_path().is_file() {
        return keystore.load_keypair(passphrase.as_deref());
    }
    let handle = keystore.generate_keypair(SignatureSuite::default(), clock)?;
    keystore.save_keypair(&handle, passphrase.as_deref())?;
    info!("generated signing key {}", handle.fingerprint);
    Ok(handle)
}

fn print_json<T: serde::Serialize>(value: &T) -> KgenResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| KgenError::Config(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}
