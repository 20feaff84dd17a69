use serde::{Deserialize, Serialize};

use crate::error::{BundleError, Result};

/// Local binding used for the imported default export
pub const DEFAULT_BINDING: &str = "__inkbundle_default";

/// A named bundle target plus the symbols it must re-export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    /// Logical artifact name, also the output file stem
    pub name: String,
    /// Package whose default export is re-exported
    pub package: String,
    /// Symbols destructured from the default export, in output order
    pub symbols: Vec<String>,
    /// Bundle every dependency, including the core runtime
    #[serde(default)]
    pub standalone: bool,
}

impl EntrySpec {
    pub fn new(name: &str, package: &str, symbols: &[&str], standalone: bool) -> Self {
        Self {
            name: name.to_owned(),
            package: package.to_owned(),
            symbols: symbols.iter().map(|s| (*s).to_owned()).collect(),
            standalone,
        }
    }

    /// File name of the artifact produced for this entry
    pub fn artifact_file_name(&self) -> String {
        format!("{}.js", self.name)
    }
}

/// Generate the entry module source for `spec`
///
/// Symbol names go verbatim into both the destructuring pattern and the export
/// list; they must already be valid identifiers.
pub fn synthesize(spec: &EntrySpec) -> Result<String> {
    if spec.symbols.is_empty() {
        return Err(BundleError::Config(format!(
            "entry '{}' does not export any symbols",
            spec.name
        )));
    }

    let package = serde_json::to_string(&spec.package)
        .map_err(|e| BundleError::Config(format!("unencodable package name: {e}")))?;
    let symbols = spec.symbols.join(", ");

    Ok(format!(
        "import {DEFAULT_BINDING} from {package};\n\
         const {{ {symbols} }} = {DEFAULT_BINDING};\n\
         export {{ {symbols}, {DEFAULT_BINDING} as default }};\n"
    ))
}

/// The fixed entry table for the React runtime
pub fn default_entries() -> Vec<EntrySpec> {
    vec![
        EntrySpec::new(
            "core",
            "react",
            &[
                "Children",
                "Component",
                "Fragment",
                "Profiler",
                "PureComponent",
                "StrictMode",
                "Suspense",
                "cloneElement",
                "createContext",
                "createElement",
                "createFactory",
                "createRef",
                "forwardRef",
                "isValidElement",
                "lazy",
                "memo",
                "startTransition",
                "useCallback",
                "useContext",
                "useDebugValue",
                "useDeferredValue",
                "useEffect",
                "useId",
                "useImperativeHandle",
                "useInsertionEffect",
                "useLayoutEffect",
                "useMemo",
                "useReducer",
                "useRef",
                "useState",
                "useSyncExternalStore",
                "useTransition",
                "version",
            ],
            true,
        ),
        EntrySpec::new(
            "dom",
            "react-dom",
            &[
                "createPortal",
                "createRoot",
                "findDOMNode",
                "flushSync",
                "hydrate",
                "hydrateRoot",
                "render",
                "unmountComponentAtNode",
                "unstable_batchedUpdates",
                "version",
            ],
            false,
        ),
        EntrySpec::new(
            "jsx-runtime",
            "react/jsx-runtime",
            &["Fragment", "jsx", "jsxs"],
            false,
        ),
        EntrySpec::new(
            "jsx-dev-runtime",
            "react/jsx-dev-runtime",
            &["Fragment", "jsxDEV"],
            false,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_synthesize_two_symbols() {
        let spec = EntrySpec::new("pkg", "pkg", &["a", "b"], false);
        let source = synthesize(&spec).expect("synthesis should succeed");

        assert_eq!(
            source,
            "import __inkbundle_default from \"pkg\";\n\
             const { a, b } = __inkbundle_default;\n\
             export { a, b, __inkbundle_default as default };\n"
        );
    }

    #[test]
    fn test_synthesize_preserves_symbol_order() {
        let spec = EntrySpec::new("jsx-runtime", "react/jsx-runtime", &["jsxs", "jsx"], false);
        let source = synthesize(&spec).expect("synthesis should succeed");

        insta::assert_snapshot!(source.lines().nth(1).unwrap_or_default(), @"const { jsxs, jsx } = __inkbundle_default;");
    }

    #[test]
    fn test_synthesize_rejects_empty_symbols() {
        let spec = EntrySpec::new("empty", "pkg", &[], false);
        let err = synthesize(&spec).expect_err("empty entry must be rejected");
        assert!(matches!(err, BundleError::Config(_)));
    }

    #[test]
    fn test_default_table_has_single_standalone_entry() {
        let entries = default_entries();
        let standalone: Vec<_> = entries.iter().filter(|e| e.standalone).collect();
        assert_eq!(standalone.len(), 1);
        assert_eq!(standalone[0].package, "react");

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["core", "dom", "jsx-runtime", "jsx-dev-runtime"]);
    }
}
