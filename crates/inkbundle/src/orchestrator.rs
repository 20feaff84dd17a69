//! Concurrent compilation of every entry and staged publishing of the artifact set

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;

use crate::{
    aliases::resolution_aliases,
    boundary::ErrorBoundary,
    compiler::{BuiltinCompiler, CompileOptions, CompileRequest, CompiledModule, Compiler, ModuleHost},
    config::Config,
    entry::{EntrySpec, synthesize},
    error::{BundleError, Result},
    js::Defines,
    patch::{PatchRule, apply_rules},
    resolver::ModuleResolver,
};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Resolves through the override table and patches files as they load
#[derive(Debug, Clone)]
pub struct RuntimeHost {
    resolver: ModuleResolver,
    rules: Vec<PatchRule>,
}

impl RuntimeHost {
    pub fn new(resolver: ModuleResolver, rules: Vec<PatchRule>) -> Self {
        Self { resolver, rules }
    }

    pub fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }
}

impl ModuleHost for RuntimeHost {
    fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<PathBuf> {
        self.resolver.resolve(specifier, importer)
    }

    fn load(&self, path: &Path) -> Result<String> {
        let source = fs::read_to_string(path).map_err(|e| BundleError::io(path, e))?;
        apply_rules(&self.rules, path, source)
    }
}

/// A published artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputArtifact {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    /// Files linked into the artifact, in emission order
    pub modules: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub out_dir: PathBuf,
    pub manifest: PathBuf,
    pub artifacts: Vec<OutputArtifact>,
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Development invocation; nothing was compiled or written
    Skipped,
    Built(BuildReport),
}

#[derive(Serialize)]
struct Manifest<'a> {
    mode: String,
    artifacts: Vec<ManifestArtifact<'a>>,
    /// Package -> artifact file, relative to the output directory
    aliases: IndexMap<&'a str, String>,
}

#[derive(Serialize)]
struct ManifestArtifact<'a> {
    name: &'a str,
    file: String,
    bytes: usize,
    sha256: &'a str,
    modules: Vec<String>,
}

#[derive(Debug)]
pub struct Orchestrator {
    config: Config,
    compiler: Arc<dyn Compiler>,
}

impl Orchestrator {
    /// Orchestrator using the built-in compiler configured from `config`
    pub fn new(config: Config) -> Result<Self> {
        let defines = Defines::new(&config.define).map_err(BundleError::Config)?;
        let compiler = BuiltinCompiler::new(CompileOptions {
            defines,
            minify: config.minify,
        });
        Ok(Self::with_compiler(config, Arc::new(compiler)))
    }

    pub fn with_compiler(config: Config, compiler: Arc<dyn Compiler>) -> Self {
        Self { config, compiler }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn host(&self) -> RuntimeHost {
        RuntimeHost::new(
            ModuleResolver::new(&self.config.root, &self.config.overrides),
            vec![self.config.guard.clone()],
        )
    }

    /// One compile request per entry, in entry order
    ///
    /// Non-standalone entries keep the core package external so the core
    /// runtime is loaded exactly once.
    pub fn requests(&self) -> Result<Vec<(EntrySpec, CompileRequest)>> {
        let core = self
            .config
            .standalone_entry()
            .map(|entry| entry.package.clone())
            .ok_or_else(|| BundleError::Config("no standalone entry configured".to_owned()))?;

        self.config
            .entries
            .iter()
            .map(|entry| {
                let externals = if entry.standalone {
                    IndexSet::new()
                } else {
                    IndexSet::from([core.clone()])
                };
                let request = CompileRequest {
                    entry: entry.name.clone(),
                    source: synthesize(entry)?,
                    externals,
                };
                Ok((entry.clone(), request))
            })
            .collect()
    }

    /// Run the pipeline for the configured mode
    pub fn run(&self) -> Result<BuildOutcome> {
        if !self.config.mode.is_production() {
            info!(
                "Skipping runtime bundling in {} mode",
                self.config.mode
            );
            return Ok(BuildOutcome::Skipped);
        }

        self.config.validate()?;
        check_replaceable(&self.config.out_dir_path())?;
        let host = self.host();
        self.check_overrides(host.resolver())?;

        let requests = self.requests()?;
        info!("Bundling {} runtime entries", requests.len());
        let compiled = self.compile_all(requests, host)?;
        self.publish(compiled).map(BuildOutcome::Built)
    }

    /// Fail before compiling anything if a development build is missing
    fn check_overrides(&self, resolver: &ModuleResolver) -> Result<()> {
        let errors: Vec<BundleError> = self
            .config
            .overrides
            .keys()
            .filter_map(|package| resolver.resolve_override(package).err())
            .collect();
        BundleError::from_batch(errors).map_or(Ok(()), Err)
    }

    fn compile_all(
        &self,
        requests: Vec<(EntrySpec, CompileRequest)>,
        host: RuntimeHost,
    ) -> Result<Vec<(EntrySpec, CompiledModule)>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("inkbundle-compile")
            .build()
            .map_err(BundleError::Runtime)?;

        let host = Arc::new(host);
        let mut results = runtime.block_on(async {
            let mut tasks = JoinSet::new();
            for (index, (entry, request)) in requests.into_iter().enumerate() {
                let compiler = Arc::clone(&self.compiler);
                let host = Arc::clone(&host);
                tasks.spawn_blocking(move || {
                    let result = compile_supervised(compiler.as_ref(), &entry, &request, host.as_ref());
                    (index, entry, result)
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => results.push(outcome),
                    Err(e) => warn!("Compile task did not finish: {e}"),
                }
            }
            results
        });
        results.sort_by_key(|(index, _, _)| *index);

        let expected = self.config.entries.len();
        let mut compiled = Vec::with_capacity(expected);
        let mut errors = Vec::new();
        for (_, entry, result) in results {
            match result {
                Ok(module) => {
                    debug!(
                        "Entry '{}' compiled to {} bytes from {} module(s)",
                        entry.name,
                        module.code.len(),
                        module.modules.len()
                    );
                    compiled.push((entry, module));
                }
                Err(e) => errors.push(e),
            }
        }

        if let Some(error) = BundleError::from_batch(errors) {
            return Err(error);
        }
        if compiled.len() != expected {
            return Err(BundleError::compilation(
                "<batch>",
                format!("{} of {expected} compile tasks did not finish", expected - compiled.len()),
            ));
        }
        Ok(compiled)
    }

    fn publish(&self, compiled: Vec<(EntrySpec, CompiledModule)>) -> Result<BuildReport> {
        let out_dir = self.config.out_dir_path();
        let (Some(parent), Some(dir_name)) = (out_dir.parent(), out_dir.file_name()) else {
            return Err(BundleError::Config(format!(
                "output directory {} has no parent",
                out_dir.display()
            )));
        };
        let dir_name = dir_name.to_string_lossy();
        let staging = parent.join(format!(".{dir_name}.staging"));
        let backup = parent.join(format!(".{dir_name}.previous"));

        remove_if_exists(&staging)?;
        fs::create_dir_all(&staging).map_err(|e| BundleError::io(&staging, e))?;

        let staged = self
            .stage(&staging, &out_dir, compiled)
            .and_then(|artifacts| swap_into_place(&staging, &out_dir, &backup).map(|()| artifacts));
        let artifacts = match staged {
            Ok(artifacts) => artifacts,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };
        info!(
            "Published {} artifact(s) to {}",
            artifacts.len(),
            out_dir.display()
        );

        Ok(BuildReport {
            manifest: out_dir.join(MANIFEST_FILE),
            out_dir,
            artifacts,
        })
    }

    /// Write every artifact and the manifest into `staging`
    fn stage(
        &self,
        staging: &Path,
        out_dir: &Path,
        compiled: Vec<(EntrySpec, CompiledModule)>,
    ) -> Result<Vec<OutputArtifact>> {
        let mut artifacts = Vec::with_capacity(compiled.len());
        for (entry, module) in compiled {
            let file_name = entry.artifact_file_name();
            let staged = staging.join(&file_name);
            fs::write(&staged, &module.code).map_err(|e| BundleError::io(&staged, e))?;

            artifacts.push(OutputArtifact {
                sha256: format!("{:x}", Sha256::digest(module.code.as_bytes())),
                bytes: module.code.len(),
                path: out_dir.join(file_name),
                name: entry.name,
                modules: module.modules,
            });
        }

        let manifest = self.manifest_json(&artifacts)?;
        let staged_manifest = staging.join(MANIFEST_FILE);
        fs::write(&staged_manifest, manifest).map_err(|e| BundleError::io(&staged_manifest, e))?;
        Ok(artifacts)
    }

    fn manifest_json(&self, artifacts: &[OutputArtifact]) -> Result<String> {
        let aliases = resolution_aliases(&self.config);
        let manifest = Manifest {
            mode: self.config.mode.to_string(),
            artifacts: artifacts
                .iter()
                .map(|artifact| ManifestArtifact {
                    name: &artifact.name,
                    file: file_name_of(&artifact.path),
                    bytes: artifact.bytes,
                    sha256: &artifact.sha256,
                    modules: artifact
                        .modules
                        .iter()
                        .map(|module| self.display_relative(module))
                        .collect(),
                })
                .collect(),
            aliases: aliases
                .iter()
                .map(|(package, path)| (package.as_str(), file_name_of(path)))
                .collect(),
        };
        let mut json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| BundleError::Config(format!("failed to encode manifest: {e}")))?;
        json.push('\n');
        Ok(json)
    }

    /// Project-relative path with `/` separators, so the manifest does not depend on the checkout location
    fn display_relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.config.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Only a missing or empty directory, or a previous output carrying the manifest, may be replaced
fn check_replaceable(out_dir: &Path) -> Result<()> {
    if !out_dir.exists() || out_dir.join(MANIFEST_FILE).is_file() {
        return Ok(());
    }
    let mut entries = fs::read_dir(out_dir).map_err(|e| BundleError::io(out_dir, e))?;
    if entries.next().is_none() {
        return Ok(());
    }
    Err(BundleError::Config(format!(
        "refusing to replace {}: it has no {MANIFEST_FILE} and was not written by inkbundle",
        out_dir.display()
    )))
}

/// Move `staging` to `out_dir`, keeping the previous output until the move succeeded
fn swap_into_place(staging: &Path, out_dir: &Path, backup: &Path) -> Result<()> {
    remove_if_exists(backup)?;
    let had_previous = out_dir.exists();
    if had_previous {
        debug!("Moving previous output aside to {}", backup.display());
        fs::rename(out_dir, backup).map_err(|e| BundleError::io(out_dir, e))?;
    }

    if let Err(e) = fs::rename(staging, out_dir) {
        if had_previous {
            if let Err(restore) = fs::rename(backup, out_dir) {
                warn!(
                    "Failed to restore previous output from {}: {restore}",
                    backup.display()
                );
            }
        }
        return Err(BundleError::io(out_dir, e));
    }

    if had_previous {
        if let Err(e) = fs::remove_dir_all(backup) {
            warn!("Failed to remove previous output at {}: {e}", backup.display());
        }
    }
    Ok(())
}

fn remove_if_exists(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|e| BundleError::io(dir, e))?;
    }
    Ok(())
}

fn discard(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("Failed to clean up {}: {e}", dir.display());
        }
    }
}

/// Compile one entry, turning a compiler panic into a compilation error
fn compile_supervised(
    compiler: &dyn Compiler,
    entry: &EntrySpec,
    request: &CompileRequest,
    host: &dyn ModuleHost,
) -> Result<CompiledModule> {
    let mut boundary = ErrorBoundary::new(format!("compile {}", entry.name));
    boundary.render(
        || compiler.compile(request, host),
        |message| {
            Err(BundleError::compilation(
                entry.name.as_str(),
                format!("compiler panicked: {message}"),
            ))
        },
    )
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
