//! Deterministic lockfile generation, validation, and update

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::canonical::canonicalize_record;
use crate::config::DeterministicClock;
use crate::error::{KgenError, KgenResult};
use crate::hashing::{constant_time_hex_eq, hash_bytes, HashAlgorithm};

/// Schema version of the lockfile format.
pub const LOCKFILE_SCHEMA_VERSION: &str = "1.0";
/// Default lockfile name inside a project.
pub const LOCKFILE_NAME: &str = "kgen.lock.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateLock {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleLock {
    pub version: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaLock {
    pub version: String,
    pub format: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineLock {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeLock {
    pub os: String,
    pub arch: String,
    pub engine_host_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLock {
    pub uri: String,
    pub hash: String,
}

/// The deterministic pin of every component a project builds from.
///
/// Field order matters: the file is written in declaration order so
/// `lockfileHash` always appears last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
    pub schema_version: String,
    pub project_id: String,
    pub project_name: String,
    pub project_version: String,
    pub generated_at: DateTime<Utc>,
    pub templates: BTreeMap<String, TemplateLock>,
    pub rules: BTreeMap<String, RuleLock>,
    pub schemas: BTreeMap<String, SchemaLock>,
    pub engine: EngineLock,
    pub runtime: RuntimeLock,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceLock>,
    pub integrity_hashes: BTreeMap<String, String>,
    pub dependency_tree: BTreeMap<String, Vec<String>>,
    pub resolution: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub lockfile_hash: String,
}

impl Lockfile {
    /// Serialized file form: pretty-printed JSON in declaration order,
    /// trailing newline. Byte-identical for equal lockfiles.
    pub fn to_bytes(&self) -> KgenResult<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn write_to(&self, path: &Path) -> KgenResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&self.to_bytes()?)?;
        tmp.persist(path).map_err(|e| KgenError::Io(e.error))?;
        Ok(())
    }

    pub fn load(path: &Path) -> KgenResult<Self> {
        let raw = std::fs::read(path)?;
        let lockfile: Lockfile = serde_json::from_slice(&raw)
            .map_err(|e| KgenError::Schema(format!("lockfile malformed: {}", e)))?;
        if lockfile.schema_version != LOCKFILE_SCHEMA_VERSION {
            return Err(KgenError::Schema(format!(
                "unsupported lockfile schemaVersion {:?}",
                lockfile.schema_version
            )));
        }
        Ok(lockfile)
    }

    /// Digest over every field except `lockfileHash` itself.
    pub fn compute_hash(&self) -> KgenResult<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| KgenError::Canonicalization(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.remove("lockfileHash");
        }
        let bytes = crate::canonical::canonicalize(&value)?;
        Ok(hash_bytes(HashAlgorithm::Sha256, &bytes))
    }
}

/// The engine's current component tables, as handed to `generate`.
/// Also the on-disk shape of `kgen.context.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    pub project_id: String,
    pub project_name: String,
    pub project_version: String,
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateLock>,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleLock>,
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeLock>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceLock>,
    /// Clock value recorded in the context, used when no deterministic
    /// clock is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Validation outcome. Hash drift is an issue; version-only drift is a
/// warning.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub valid: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Component mutations applied by `update`.
#[derive(Debug, Clone)]
pub enum Change {
    AddTemplate { id: String, lock: TemplateLock },
    UpdateTemplate { id: String, lock: TemplateLock },
    RemoveTemplate { id: String },
    AddRule { id: String, lock: RuleLock },
    UpdateRule { id: String, lock: RuleLock },
    RemoveRule { id: String },
    AddSchema { id: String, lock: SchemaLock },
    UpdateSchema { id: String, lock: SchemaLock },
    RemoveSchema { id: String },
}

/// Generate a lockfile from a project context.
///
/// Pure function of its inputs: equal contexts with an equal clock produce
/// byte-identical lockfiles.
pub fn generate(ctx: &ProjectContext, clock: &DeterministicClock) -> KgenResult<Lockfile> {
    generate_inner(ctx, clock, None)
}

fn generate_inner(
    ctx: &ProjectContext,
    clock: &DeterministicClock,
    previous_hash: Option<String>,
) -> KgenResult<Lockfile> {
    let generated_at = if clock.is_deterministic() {
        clock.now()
    } else {
        ctx.recorded_at.unwrap_or_else(|| clock.now())
    };

    // Normalize: dependency lists sorted by id; maps are already ordered.
    let mut templates = ctx.templates.clone();
    for t in templates.values_mut() {
        t.dependencies.sort();
    }
    let mut rules = ctx.rules.clone();
    for r in rules.values_mut() {
        r.dependencies.sort();
    }
    let schemas = ctx.schemas.clone();

    let engine = ctx
        .engine
        .clone()
        .ok_or_else(|| KgenError::Config("context has no engine record".to_string()))?;
    let runtime = ctx
        .runtime
        .clone()
        .ok_or_else(|| KgenError::Config("context has no runtime record".to_string()))?;
    let mut resources = ctx.resources.clone();
    resources.sort_by(|a, b| a.uri.cmp(&b.uri));

    let dependency_tree = build_dependency_tree(&templates, &rules, &schemas)?;

    let mut resolution = BTreeMap::new();
    for (id, t) in &templates {
        resolution.insert(id.clone(), t.version.clone());
    }
    for (id, r) in &rules {
        resolution.insert(id.clone(), r.version.clone());
    }
    for (id, s) in &schemas {
        resolution.insert(id.clone(), s.version.clone());
    }

    let mut integrity_hashes = BTreeMap::new();
    integrity_hashes.insert("templates".to_string(), section_hash(&templates)?);
    integrity_hashes.insert("rules".to_string(), section_hash(&rules)?);
    integrity_hashes.insert("schemas".to_string(), section_hash(&schemas)?);
    integrity_hashes.insert("engine".to_string(), section_hash(&engine)?);
    integrity_hashes.insert("runtime".to_string(), section_hash(&runtime)?);
    integrity_hashes.insert("resources".to_string(), section_hash(&resources)?);

    let mut lockfile = Lockfile {
        schema_version: LOCKFILE_SCHEMA_VERSION.to_string(),
        project_id: ctx.project_id.clone(),
        project_name: ctx.project_name.clone(),
        project_version: ctx.project_version.clone(),
        generated_at,
        templates,
        rules,
        schemas,
        engine,
        runtime,
        resources,
        integrity_hashes,
        dependency_tree,
        resolution,
        previous_hash,
        lockfile_hash: String::new(),
    };
    lockfile.lockfile_hash = lockfile.compute_hash()?;
    debug!(hash = %lockfile.lockfile_hash, "lockfile generated");
    Ok(lockfile)
}

fn section_hash<T: Serialize>(section: &T) -> KgenResult<String> {
    Ok(hash_bytes(HashAlgorithm::Sha256, &canonicalize_record(section)?))
}

// Adjacency lists over the combined component namespace, refusing cycles.
fn build_dependency_tree(
    templates: &BTreeMap<String, TemplateLock>,
    rules: &BTreeMap<String, RuleLock>,
    schemas: &BTreeMap<String, SchemaLock>,
) -> KgenResult<BTreeMap<String, Vec<String>>> {
    let mut tree: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (id, t) in templates {
        tree.insert(id.clone(), t.dependencies.clone());
    }
    for (id, r) in rules {
        tree.insert(id.clone(), r.dependencies.clone());
    }
    for id in schemas.keys() {
        tree.entry(id.clone()).or_default();
    }

    // Depth-first walk with an explicit path for cycle reporting.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

    fn visit<'a>(
        node: &'a str,
        tree: &'a BTreeMap<String, Vec<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> KgenResult<()> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| *p == node).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(node);
                return Err(KgenError::DependencyCycle { path: cycle.join(" -> ") });
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        path.push(node);
        if let Some(deps) = tree.get(node) {
            for dep in deps {
                visit(dep, tree, marks, path)?;
            }
        }
        path.pop();
        marks.insert(node, Mark::Done);
        Ok(())
    }

    let mut path = Vec::new();
    for id in tree.keys() {
        visit(id, &tree, &mut marks, &mut path)?;
    }
    Ok(tree)
}

/// Validate an existing lockfile against the current context.
pub fn validate(existing: &Lockfile, ctx: &ProjectContext) -> KgenResult<Validation> {
    let mut issues = Vec::new();
    let mut warnings = Vec::new();
    let mut recommendations = Vec::new();

    if existing.schema_version != LOCKFILE_SCHEMA_VERSION {
        issues.push(format!(
            "incompatible schemaVersion {:?}",
            existing.schema_version
        ));
    }

    diff_section(
        "template",
        existing.templates.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        ctx.templates.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        &mut issues,
        &mut warnings,
        &mut recommendations,
    );
    diff_section(
        "rule",
        existing.rules.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        ctx.rules.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        &mut issues,
        &mut warnings,
        &mut recommendations,
    );
    diff_section(
        "schema",
        existing.schemas.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        ctx.schemas.iter().map(|(k, v)| (k, &v.hash, &v.version)),
        &mut issues,
        &mut warnings,
        &mut recommendations,
    );

    // Section digests must match what the locked content hashes to.
    for (section, recomputed) in [
        ("templates", section_hash(&existing.templates)?),
        ("rules", section_hash(&existing.rules)?),
        ("schemas", section_hash(&existing.schemas)?),
        ("engine", section_hash(&existing.engine)?),
        ("runtime", section_hash(&existing.runtime)?),
        ("resources", section_hash(&existing.resources)?),
    ] {
        match existing.integrity_hashes.get(section) {
            Some(stored) if constant_time_hex_eq(stored, &recomputed) => {}
            Some(_) => issues.push(format!("integrity hash mismatch for section {}", section)),
            None => issues.push(format!("integrity hash missing for section {}", section)),
        }
    }

    let recomputed = existing.compute_hash()?;
    if !constant_time_hex_eq(&recomputed, &existing.lockfile_hash) {
        issues.push("lockfileHash does not match content".to_string());
    }

    Ok(Validation { valid: issues.is_empty(), issues, warnings, recommendations })
}

fn diff_section<'a>(
    kind: &str,
    locked: impl Iterator<Item = (&'a String, &'a String, &'a String)>,
    current: impl Iterator<Item = (&'a String, &'a String, &'a String)>,
    issues: &mut Vec<String>,
    warnings: &mut Vec<String>,
    recommendations: &mut Vec<String>,
) {
    let locked: BTreeMap<_, _> = locked.map(|(id, hash, version)| (id, (hash, version))).collect();
    let current: BTreeMap<_, _> =
        current.map(|(id, hash, version)| (id, (hash, version))).collect();

    for (id, (hash, version)) in &current {
        match locked.get(id) {
            None => issues.push(format!("{} {} is not locked", kind, id)),
            Some((locked_hash, locked_version)) => {
                if !constant_time_hex_eq(locked_hash, hash) {
                    issues.push(format!("{} {} content hash drifted", kind, id));
                } else if locked_version != version {
                    warnings.push(format!(
                        "{} {} version drifted: {} -> {}",
                        kind, id, locked_version, version
                    ));
                }
            }
        }
    }
    for id in locked.keys() {
        if !current.contains_key(*id) {
            recommendations.push(format!("{} {} is locked but absent from the context", kind, id));
        }
    }
}

/// Apply component changes, then re-run the full generation pipeline so
/// every derived field is freshly canonical. The result carries
/// `previousHash = existing.lockfileHash`.
pub fn update(
    existing: &Lockfile,
    changes: &[Change],
    clock: &DeterministicClock,
) -> KgenResult<Lockfile> {
    let mut ctx = ProjectContext {
        project_id: existing.project_id.clone(),
        project_name: existing.project_name.clone(),
        project_version: existing.project_version.clone(),
        templates: existing.templates.clone(),
        rules: existing.rules.clone(),
        schemas: existing.schemas.clone(),
        engine: Some(existing.engine.clone()),
        runtime: Some(existing.runtime.clone()),
        resources: existing.resources.clone(),
        recorded_at: Some(existing.generated_at),
    };

    for change in changes {
        apply_change(&mut ctx, change)?;
    }

    let lockfile = generate_inner(&ctx, clock, Some(existing.lockfile_hash.clone()))?;
    info!(previous = %existing.lockfile_hash, new = %lockfile.lockfile_hash, "lockfile updated");
    Ok(lockfile)
}

fn apply_change(ctx: &mut ProjectContext, change: &Change) -> KgenResult<()> {
    fn add<T>(map: &mut BTreeMap<String, T>, id: &str, lock: T, kind: &str) -> KgenResult<()> {
        if map.contains_key(id) {
            return Err(KgenError::Config(format!("{} {} already locked", kind, id)));
        }
        map.insert(id.to_string(), lock);
        Ok(())
    }
    fn set<T>(map: &mut BTreeMap<String, T>, id: &str, lock: T, kind: &str) -> KgenResult<()> {
        if !map.contains_key(id) {
            return Err(KgenError::Config(format!("{} {} is not locked", kind, id)));
        }
        map.insert(id.to_string(), lock);
        Ok(())
    }
    fn remove<T>(map: &mut BTreeMap<String, T>, id: &str, kind: &str) -> KgenResult<()> {
        map.remove(id)
            .map(|_| ())
            .ok_or_else(|| KgenError::Config(format!("{} {} is not locked", kind, id)))
    }

    match change {
        Change::AddTemplate { id, lock } => add(&mut ctx.templates, id, lock.clone(), "template"),
        Change::UpdateTemplate { id, lock } => set(&mut ctx.templates, id, lock.clone(), "template"),
        Change::RemoveTemplate { id } => remove(&mut ctx.templates, id, "template"),
        Change::AddRule { id, lock } => add(&mut ctx.rules, id, lock.clone(), "rule"),
        Change::UpdateRule { id, lock } => set(&mut ctx.rules, id, lock.clone(), "rule"),
        Change::RemoveRule { id } => remove(&mut ctx.rules, id, "rule"),
        Change::AddSchema { id, lock } => add(&mut ctx.schemas, id, lock.clone(), "schema"),
        Change::UpdateSchema { id, lock } => set(&mut ctx.schemas, id, lock.clone(), "schema"),
        Change::RemoveSchema { id } => remove(&mut ctx.schemas, id, "schema"),
    }
}
