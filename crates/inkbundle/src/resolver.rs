use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, trace};
use serde::Deserialize;

use crate::error::{BundleError, Result};

/// Extensions tried, in order, when a specifier names a file without one
const EXTENSION_CANDIDATES: &[&str] = &["js", "cjs"];

/// The subset of `package.json` the resolver reads
#[derive(Debug, Deserialize)]
struct PackageManifest {
    main: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleResolver {
    /// Project root, used for bare specifiers without an importer
    root: PathBuf,
    /// Exact package name -> absolute development build path
    overrides: IndexMap<String, PathBuf>,
}

impl ModuleResolver {
    /// Create a resolver; relative override paths are taken relative to `root`
    pub fn new(root: impl Into<PathBuf>, overrides: &IndexMap<String, PathBuf>) -> Self {
        let root = root.into();
        let overrides = overrides
            .iter()
            .map(|(package, path)| {
                let absolute = if path.is_absolute() {
                    path.clone()
                } else {
                    root.join(path)
                };
                (package.clone(), absolute)
            })
            .collect();
        Self { root, overrides }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn overrides(&self) -> &IndexMap<String, PathBuf> {
        &self.overrides
    }

    /// Look up the override for `package`
    ///
    /// Only an exact match redirects: `react` never matches `react/internal`
    /// unless that string is itself in the override set.
    pub fn override_for(&self, package: &str) -> Option<&Path> {
        self.overrides.get(package).map(PathBuf::as_path)
    }

    /// Resolve an overridden package, failing if its development build is missing
    ///
    /// Returns `Ok(None)` when `package` is not overridden so the caller can fall
    /// through to default resolution.
    pub fn resolve_override(&self, package: &str) -> Result<Option<PathBuf>> {
        let Some(path) = self.override_for(package) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Err(BundleError::Resolution {
                package: package.to_owned(),
                path: path.to_path_buf(),
            });
        }
        debug!("Redirecting '{package}' to {}", path.display());
        Ok(Some(path.to_path_buf()))
    }

    /// Resolve `specifier` as imported from `importer`
    pub fn resolve(&self, specifier: &str, importer: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = self.resolve_override(specifier)? {
            return Ok(path);
        }

        let resolved = if is_relative(specifier) {
            let base = importer
                .and_then(Path::parent)
                .unwrap_or(self.root.as_path());
            resolve_file(&base.join(specifier))
        } else {
            self.resolve_bare(specifier, importer)?
        };

        resolved.ok_or_else(|| BundleError::ModuleNotFound {
            specifier: specifier.to_owned(),
            importer: importer.map_or_else(|| "<entry>".to_owned(), |p| p.display().to_string()),
        })
    }

    fn resolve_bare(&self, specifier: &str, importer: Option<&Path>) -> Result<Option<PathBuf>> {
        let (package, subpath) = split_package_specifier(specifier);
        let start = importer
            .and_then(Path::parent)
            .unwrap_or(self.root.as_path());

        for dir in start.ancestors() {
            let package_dir = dir.join("node_modules").join(package);
            if !package_dir.is_dir() {
                continue;
            }
            trace!("Found package '{package}' at {}", package_dir.display());
            let target = match subpath {
                Some(subpath) => package_dir.join(subpath),
                None => package_dir.join(read_main(&package_dir)?),
            };
            return Ok(resolve_file(&target));
        }
        Ok(None)
    }
}

fn is_relative(specifier: &str) -> bool {
    specifier == "."
        || specifier == ".."
        || specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
}

/// Split `@scope/pkg/sub/path` into (`@scope/pkg`, `Some("sub/path")`)
fn split_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    let name_segments = if specifier.starts_with('@') { 2 } else { 1 };
    let mut boundary = None;
    for (count, (index, _)) in specifier.match_indices('/').enumerate() {
        if count + 1 == name_segments {
            boundary = Some(index);
            break;
        }
    }
    match boundary {
        Some(index) => (&specifier[..index], Some(&specifier[index + 1..])),
        None => (specifier, None),
    }
}

fn read_main(package_dir: &Path) -> Result<String> {
    let manifest_path = package_dir.join("package.json");
    if !manifest_path.is_file() {
        return Ok("index.js".to_owned());
    }
    let content =
        fs::read_to_string(&manifest_path).map_err(|e| BundleError::io(&manifest_path, e))?;
    let manifest: PackageManifest = serde_json::from_str(&content)
        .map_err(|e| BundleError::parse(&manifest_path, e.to_string()))?;
    Ok(manifest.main.unwrap_or_else(|| "index.js".to_owned()))
}

/// Try `path` as a file, with known extensions, then as a directory index
fn resolve_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    for extension in EXTENSION_CANDIDATES {
        let candidate = path.with_file_name(format!("{file_name}.{extension}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let index = path.join("index.js");
    index.is_file().then_some(index)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().expect("fixture path has a parent"))
            .expect("create fixture dir");
        fs::write(path, content).expect("write fixture");
    }

    fn resolver_with_react(root: &Path) -> ModuleResolver {
        let mut overrides = IndexMap::new();
        overrides.insert(
            "react".to_owned(),
            PathBuf::from("node_modules/react/cjs/react.development.js"),
        );
        ModuleResolver::new(root, &overrides)
    }

    #[test]
    fn test_override_exact_match_only() {
        let temp = TempDir::new().expect("tempdir");
        let resolver = resolver_with_react(temp.path());

        assert_eq!(
            resolver.override_for("react"),
            Some(
                temp.path()
                    .join("node_modules/react/cjs/react.development.js")
                    .as_path()
            )
        );
        assert_eq!(resolver.override_for("react/internal"), None);
        assert_eq!(resolver.override_for("react-is"), None);
        assert_eq!(resolver.override_for("reac"), None);
    }

    #[test]
    fn test_missing_override_is_hard_failure() {
        let temp = TempDir::new().expect("tempdir");
        let resolver = resolver_with_react(temp.path());
        // A production build exists but must never be used as a fallback
        write(
            &temp.path().join("node_modules/react/index.js"),
            "module.exports = {};",
        );

        let err = resolver
            .resolve("react", None)
            .expect_err("missing development build must fail");
        match err {
            BundleError::Resolution { package, path } => {
                assert_eq!(package, "react");
                assert_eq!(
                    path,
                    temp.path().join("node_modules/react/cjs/react.development.js")
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_override_resolves_when_present() {
        let temp = TempDir::new().expect("tempdir");
        let dev = temp.path().join("node_modules/react/cjs/react.development.js");
        write(&dev, "'use strict';");
        let resolver = resolver_with_react(temp.path());

        assert_eq!(resolver.resolve("react", None).expect("resolves"), dev);
    }

    #[test]
    fn test_default_resolution_for_unlisted_packages() {
        let temp = TempDir::new().expect("tempdir");
        write(
            &temp.path().join("node_modules/object-assign/package.json"),
            r#"{ "name": "object-assign", "main": "lib/main" }"#,
        );
        let main = temp.path().join("node_modules/object-assign/lib/main.js");
        write(&main, "module.exports = Object.assign;");
        let sub = temp.path().join("node_modules/@scope/pkg/util/index.js");
        write(&sub, "");

        let resolver = resolver_with_react(temp.path());
        assert_eq!(resolver.resolve("object-assign", None).expect("resolves"), main);
        assert_eq!(resolver.resolve("@scope/pkg/util", None).expect("resolves"), sub);
    }

    #[test]
    fn test_relative_resolution_against_importer() {
        let temp = TempDir::new().expect("tempdir");
        let importer = temp.path().join("node_modules/react/cjs/react.development.js");
        let sibling = temp.path().join("node_modules/react/cjs/shared.js");
        write(&importer, "");
        write(&sibling, "");

        let resolver = resolver_with_react(temp.path());
        assert_eq!(
            resolver
                .resolve("./shared", Some(&importer))
                .expect("resolves"),
            sibling
        );

        let err = resolver
            .resolve("./missing", Some(&importer))
            .expect_err("missing relative module");
        assert!(matches!(err, BundleError::ModuleNotFound { .. }));
    }

    #[test]
    fn test_extension_candidates() {
        let temp = TempDir::new().expect("tempdir");
        let importer = temp.path().join("lib/main.js");
        write(&importer, "");
        write(&temp.path().join("lib/common.cjs"), "");
        write(&temp.path().join("lib/esm.mjs"), "");
        write(&temp.path().join("lib/dir/index.js"), "");

        let resolver = resolver_with_react(temp.path());
        assert_eq!(
            resolver.resolve("./common", Some(&importer)).expect("resolves"),
            temp.path().join("lib/common.cjs")
        );
        assert_eq!(
            resolver.resolve("./dir", Some(&importer)).expect("resolves"),
            temp.path().join("lib/dir/index.js")
        );
        assert!(
            resolver.resolve("./esm", Some(&importer)).is_err(),
            "ES module files are never picked by extension"
        );
    }

    #[test]
    fn test_split_package_specifier() {
        assert_eq!(split_package_specifier("react"), ("react", None));
        assert_eq!(
            split_package_specifier("react/jsx-runtime"),
            ("react", Some("jsx-runtime"))
        );
        assert_eq!(split_package_specifier("@scope/pkg"), ("@scope/pkg", None));
        assert_eq!(
            split_package_specifier("@scope/pkg/a/b"),
            ("@scope/pkg", Some("a/b"))
        );
    }
}
