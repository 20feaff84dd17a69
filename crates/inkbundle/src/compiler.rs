use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};

use indexmap::IndexSet;
use log::debug;

use crate::{error::Result, js::Defines, linker};

/// Resolution and loading hooks used during compilation
pub trait ModuleHost: Send + Sync {
    /// Resolve `specifier`; `importer` is `None` for imports of the entry module
    fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<PathBuf>;

    /// Load a resolved module's source, after any load-time rewriting
    fn load(&self, path: &Path) -> Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub defines: Defines,
    pub minify: bool,
}

/// One compilation unit: a synthesized entry plus the packages left external
#[derive(Debug, Clone)]
pub struct CompileRequest {
    /// Logical entry name, used in diagnostics
    pub entry: String,
    pub source: String,
    /// Specifiers kept as `import` statements instead of being bundled
    pub externals: IndexSet<String>,
}

/// Output of a compilation: one ES module plus the files linked into it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModule {
    pub code: String,
    pub modules: Vec<PathBuf>,
}

pub trait Compiler: Debug + Send + Sync {
    fn compile(&self, request: &CompileRequest, host: &dyn ModuleHost) -> Result<CompiledModule>;
}

/// Links CommonJS dependencies into a single ES module for the browser
#[derive(Debug, Clone, Default)]
pub struct BuiltinCompiler {
    options: CompileOptions,
}

impl BuiltinCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }
}

impl Compiler for BuiltinCompiler {
    fn compile(&self, request: &CompileRequest, host: &dyn ModuleHost) -> Result<CompiledModule> {
        debug!(
            "Compiling entry '{}' ({} external(s), minify: {})",
            request.entry,
            request.externals.len(),
            self.options.minify
        );
        linker::link(request, &self.options, host)
    }
}
