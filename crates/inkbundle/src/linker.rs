//! Module linking for the built-in compiler
//!
//! The entry is an ES module whose default imports are rewritten into calls of
//! CommonJS module accessors. Every dependency is wrapped in a lazily evaluated
//! factory, static `require("x")` calls become accessor calls and external
//! packages turn into hoisted `import` statements.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, trace, warn};
use petgraph::{
    algo::toposort,
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashSet;

use crate::{
    compiler::{CompileOptions, CompileRequest, CompiledModule, ModuleHost},
    error::{BundleError, Result},
    js::{self, Token, is_member_access, lexer::is_ident_part, next_significant},
};

/// Shared helper that evaluates a CommonJS factory once and caches its exports
const CJS_RUNTIME: &str = "var __inkbundle_cjs = (factory, module) => () => {
  if (!module) {
    module = { exports: {} };
    factory.call(module.exports, module.exports, module);
  }
  return module.exports;
};
";

/// Identifier of a module linked into the current bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ModuleId(u32);

impl ModuleId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Module(ModuleId),
    /// Index into the linker's external bindings
    External(usize),
}

/// A `require("x")` call spanning `start..end` in the module's tokens
#[derive(Debug)]
struct RequireSite {
    start: usize,
    end: usize,
    target: Target,
}

#[derive(Debug)]
struct LinkedModule {
    path: PathBuf,
    accessor: String,
    node: NodeIndex,
    tokens: Vec<Token<'static>>,
    requires: Vec<RequireSite>,
}

/// `import binding from "specifier";` in the entry, spanning `start..end`
#[derive(Debug)]
struct EntryImport {
    start: usize,
    end: usize,
    binding: String,
    /// `None` when the specifier is external and the statement is kept as written
    module: Option<ModuleId>,
}

/// Link `request` into one ES module
pub(crate) fn link(
    request: &CompileRequest,
    options: &CompileOptions,
    host: &dyn ModuleHost,
) -> Result<CompiledModule> {
    let mut linker = Linker::new(request, options, host);

    let entry_file = PathBuf::from(format!("<entry {}>", request.entry));
    let entry_tokens = js::prepare(&request.source, &entry_file, &options.defines)?;
    let imports = linker.scan_entry_imports(&entry_tokens)?;
    linker.load_pending()?;

    debug!(
        "Linked {} module(s) and {} external(s) for entry '{}'",
        linker.modules.len(),
        linker.externals_used.len(),
        request.entry
    );
    linker.emit(&entry_tokens, &imports)
}

struct Linker<'r> {
    request: &'r CompileRequest,
    options: &'r CompileOptions,
    host: &'r dyn ModuleHost,
    /// Modules in discovery order; position is the module id
    modules: IndexMap<PathBuf, LinkedModule>,
    graph: DiGraph<ModuleId, ()>,
    /// External specifier -> local binding, in first-use order
    externals_used: IndexMap<String, String>,
    taken_names: FxHashSet<String>,
    pending: VecDeque<ModuleId>,
}

impl<'r> Linker<'r> {
    fn new(request: &'r CompileRequest, options: &'r CompileOptions, host: &'r dyn ModuleHost) -> Self {
        Self {
            request,
            options,
            host,
            modules: IndexMap::new(),
            graph: DiGraph::new(),
            externals_used: IndexMap::new(),
            taken_names: FxHashSet::default(),
            pending: VecDeque::new(),
        }
    }

    fn is_external(&self, specifier: &str) -> bool {
        self.request.externals.contains(specifier)
    }

    fn unique_name(&mut self, base: String) -> String {
        let mut name = base.clone();
        let mut counter = 2;
        while !self.taken_names.insert(name.clone()) {
            name = format!("{base}_{counter}");
            counter += 1;
        }
        name
    }

    /// Register `path`, queueing it for loading if it is new
    fn intern(&mut self, path: PathBuf) -> ModuleId {
        if let Some(index) = self.modules.get_index_of(&path) {
            return ModuleId(index as u32);
        }
        let id = ModuleId(self.modules.len() as u32);
        let accessor = self.unique_name(format!("require_{}", module_stem(&path)));
        let node = self.graph.add_node(id);
        trace!("Registered module {} as {accessor}", path.display());
        self.modules.insert(
            path.clone(),
            LinkedModule {
                path,
                accessor,
                node,
                tokens: Vec::new(),
                requires: Vec::new(),
            },
        );
        self.pending.push_back(id);
        id
    }

    fn external_target(&mut self, specifier: &str) -> Target {
        if let Some(index) = self.externals_used.get_index_of(specifier) {
            return Target::External(index);
        }
        let binding = self.unique_name(format!("__inkbundle_external_{}", sanitize(specifier)));
        let (index, _) = self.externals_used.insert_full(specifier.to_owned(), binding);
        Target::External(index)
    }

    fn scan_entry_imports(&mut self, tokens: &[Token<'_>]) -> Result<Vec<EntryImport>> {
        let mut imports = Vec::new();
        let mut depth = 0usize;
        let mut previous: Option<usize> = None;
        let mut i = 0;

        while i < tokens.len() {
            let token = &tokens[i];
            if token.is_trivia() {
                i += 1;
                continue;
            }
            depth = track_depth(token, depth);

            let prev = previous.map(|p| &tokens[p]);
            if depth == 0 && token.is_ident("import") && !is_member_access(prev) {
                let next = next_significant(tokens, i + 1, tokens.len());
                let is_expression = next.is_some_and(|n| tokens[n].is_punct("(") || tokens[n].is_punct("."));
                if !is_expression {
                    let import = self.parse_default_import(tokens, i)?;
                    previous = Some(import.end - 1);
                    i = import.end;
                    imports.push(import);
                    continue;
                }
            }
            previous = Some(i);
            i += 1;
        }
        Ok(imports)
    }

    /// Parse `import binding from "specifier" [;]` starting at the `import` token
    fn parse_default_import(&mut self, tokens: &[Token<'_>], start: usize) -> Result<EntryImport> {
        let request = self.request;
        let unsupported = || {
            BundleError::compilation(
                &request.entry,
                "only `import name from \"specifier\"` is supported in entry modules",
            )
        };
        let limit = tokens.len();
        let binding = next_significant(tokens, start + 1, limit).ok_or_else(unsupported)?;
        let from = next_significant(tokens, binding + 1, limit).ok_or_else(unsupported)?;
        let source = next_significant(tokens, from + 1, limit).ok_or_else(unsupported)?;
        if tokens[binding].kind != js::TokenKind::Ident || !tokens[from].is_ident("from") {
            return Err(unsupported());
        }
        let specifier = js::string_value(&tokens[source]).ok_or_else(unsupported)?;

        let mut end = source + 1;
        if let Some(semi) = next_significant(tokens, end, limit) {
            if tokens[semi].is_punct(";") {
                end = semi + 1;
            }
        }

        let module = if self.is_external(specifier) {
            trace!("Entry import of '{specifier}' stays external");
            None
        } else {
            let path = self.host.resolve(specifier, None)?;
            Some(self.intern(path))
        };

        Ok(EntryImport {
            start,
            end,
            binding: tokens[binding].text.to_string(),
            module,
        })
    }

    fn load_pending(&mut self) -> Result<()> {
        while let Some(id) = self.pending.pop_front() {
            let path = self.modules[id.index()].path.clone();
            let source = self.host.load(&path)?;
            let tokens = js::prepare(&source, &path, &self.options.defines)?;
            reject_module_syntax(&tokens, &path, &self.request.entry)?;
            let requires = self.scan_requires(&tokens, &path)?;

            let from = self.modules[id.index()].node;
            for site in &requires {
                if let Target::Module(dep) = site.target {
                    let to = self.modules[dep.index()].node;
                    self.graph.update_edge(from, to, ());
                }
            }

            let module = &mut self.modules[id.index()];
            module.tokens = tokens;
            module.requires = requires;
        }
        Ok(())
    }

    fn scan_requires(&mut self, tokens: &[Token<'_>], importer: &Path) -> Result<Vec<RequireSite>> {
        let mut sites = Vec::new();
        let mut previous: Option<usize> = None;
        let limit = tokens.len();
        let mut i = 0;

        while i < limit {
            if tokens[i].is_trivia() {
                i += 1;
                continue;
            }
            let prev = previous.map(|p| &tokens[p]);
            if tokens[i].is_ident("require") && !is_member_access(prev) {
                if let Some((specifier, end)) = static_require(tokens, i) {
                    let target = if self.is_external(specifier) {
                        self.external_target(specifier)
                    } else {
                        let path = self.host.resolve(specifier, Some(importer))?;
                        Target::Module(self.intern(path))
                    };
                    sites.push(RequireSite {
                        start: i,
                        end,
                        target,
                    });
                    previous = Some(end - 1);
                    i = end;
                    continue;
                }
                let is_call = next_significant(tokens, i + 1, limit).is_some_and(|n| tokens[n].is_punct("("));
                if is_call {
                    warn!(
                        "Dynamic require in {} is left as written and will fail at runtime",
                        importer.display()
                    );
                }
            }
            previous = Some(i);
            i += 1;
        }
        Ok(sites)
    }

    /// Modules with their dependencies first; discovery order when the graph has cycles
    fn emission_order(&self) -> Vec<ModuleId> {
        match toposort(&self.graph, None) {
            Ok(nodes) => nodes.into_iter().rev().map(|n| self.graph[n]).collect(),
            Err(cycle) => {
                debug!(
                    "Dependency cycle through node {:?}; emitting in discovery order",
                    cycle.node_id()
                );
                (0..self.modules.len()).map(|i| ModuleId(i as u32)).collect()
            }
        }
    }

    fn snippet(&self, text: &str) -> Result<Vec<Token<'static>>> {
        js::tokenize(text)
            .map(|tokens| tokens.into_iter().map(Token::into_owned).collect())
            .map_err(|e| BundleError::compilation(&self.request.entry, format!("generated code: {e}")))
    }

    fn replacement_for(&self, target: Target) -> String {
        match target {
            Target::Module(id) => format!("{}()", self.modules[id.index()].accessor),
            Target::External(index) => self.externals_used[index].clone(),
        }
    }

    fn emit(&self, entry_tokens: &[Token<'static>], imports: &[EntryImport]) -> Result<CompiledModule> {
        let mut out: Vec<Token<'static>> = Vec::new();

        for (specifier, binding) in &self.externals_used {
            let quoted = serde_json::to_string(specifier)
                .map_err(|e| BundleError::compilation(&self.request.entry, e.to_string()))?;
            out.extend(self.snippet(&format!("import {binding} from {quoted};\n"))?);
        }

        let order = self.emission_order();
        if !order.is_empty() {
            out.extend(self.snippet(CJS_RUNTIME)?);
        }
        for id in &order {
            let module = &self.modules[id.index()];
            out.extend(self.snippet(&format!(
                "var {} = __inkbundle_cjs(function (exports, module) {{\n",
                module.accessor
            ))?);
            let mut cursor = 0;
            for site in &module.requires {
                out.extend(module.tokens[cursor..site.start].iter().cloned());
                out.extend(self.snippet(&self.replacement_for(site.target))?);
                cursor = site.end;
            }
            out.extend(module.tokens[cursor..].iter().cloned());
            out.extend(self.snippet("\n});\n")?);
        }

        let mut cursor = 0;
        for import in imports {
            out.extend(entry_tokens[cursor..import.start].iter().cloned());
            match import.module {
                Some(id) => out.extend(self.snippet(&format!(
                    "var {} = {}();",
                    import.binding, self.modules[id.index()].accessor
                ))?),
                None => out.extend(entry_tokens[import.start..import.end].iter().cloned()),
            }
            cursor = import.end;
        }
        out.extend(entry_tokens[cursor..].iter().cloned());

        let mut code = js::print(&out, self.options.minify);
        if !code.ends_with('\n') {
            code.push('\n');
        }

        Ok(CompiledModule {
            code,
            modules: order
                .iter()
                .map(|id| self.modules[id.index()].path.clone())
                .collect(),
        })
    }
}

fn track_depth(token: &Token<'_>, depth: usize) -> usize {
    if token.is_punct("{") || token.is_punct("(") || token.is_punct("[") {
        depth + 1
    } else if token.is_punct("}") || token.is_punct(")") || token.is_punct("]") {
        depth.saturating_sub(1)
    } else {
        depth
    }
}

/// Match `require("specifier")` at `start`; returns the specifier and the index after `)`
fn static_require<'t>(tokens: &'t [Token<'_>], start: usize) -> Option<(&'t str, usize)> {
    let limit = tokens.len();
    let open = next_significant(tokens, start + 1, limit)?;
    if !tokens[open].is_punct("(") {
        return None;
    }
    let argument = next_significant(tokens, open + 1, limit)?;
    let specifier = js::string_value(&tokens[argument])?;
    let close = next_significant(tokens, argument + 1, limit)?;
    tokens[close].is_punct(")").then_some((specifier, close + 1))
}

/// Dependencies are CommonJS; top-level `import`/`export` declarations are rejected
fn reject_module_syntax(tokens: &[Token<'_>], path: &Path, entry: &str) -> Result<()> {
    let mut depth = 0usize;
    let mut previous: Option<&Token<'_>> = None;
    for (i, token) in tokens.iter().enumerate() {
        if token.is_trivia() {
            continue;
        }
        if depth == 0 && !is_member_access(previous) {
            let declaration = if token.is_ident("export") {
                true
            } else if token.is_ident("import") {
                !next_significant(tokens, i + 1, tokens.len())
                    .is_some_and(|n| tokens[n].is_punct("(") || tokens[n].is_punct("."))
            } else {
                false
            };
            if declaration {
                return Err(BundleError::compilation(
                    entry,
                    format!(
                        "{} uses ES module syntax; only CommonJS dependencies can be linked",
                        path.display()
                    ),
                ));
            }
        }
        depth = track_depth(token, depth);
        previous = Some(token);
    }
    Ok(())
}

fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if is_ident_part(c) && c != '\\' { c } else { '_' })
        .collect()
}

/// Readable accessor stem: the file stem, or the directory name for `index` files
fn module_stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = if stem == "index" {
        path.parent()
            .and_then(Path::file_name)
            .map_or(stem, |dir| format!("{}_index", dir.to_string_lossy()))
    } else {
        stem
    };
    sanitize(&stem)
}
