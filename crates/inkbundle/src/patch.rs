//! Load-time patch rules
//!
//! React's CommonJS development builds wrap their whole body in
//! `if (process.env.NODE_ENV !== "production") { ... }`. Once the environment is
//! defined as `"production"` that guard folds to `false` and the exports vanish.
//! The environment guard rule rewrites the first, outermost guard to
//! `if (true) {`; nested checks keep their original text and are folded away by
//! the compiler.

use std::{borrow::Cow, path::Path};

use cow_utils::CowUtils;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{BundleError, Result};

pub const ENVIRONMENT_GUARD: &str = "if (process.env.NODE_ENV !== \"production\") {";
pub const ALWAYS_TRUE_GUARD: &str = "if (true) {";

/// Runtime files the environment guard rule applies to
pub const RUNTIME_FILES: &[&str] = &[
    "react.development.js",
    "react-dom.development.js",
    "scheduler.development.js",
    "react-jsx-runtime.development.js",
    "react-jsx-dev-runtime.development.js",
];

/// A textual match/replace pair applied to files selected by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRule {
    pub name: String,
    pub find: String,
    pub replace: String,
    /// File names (not paths) this rule applies to
    pub files: Vec<String>,
}

impl PatchRule {
    pub fn environment_guard() -> Self {
        Self {
            name: "environment-guard".to_owned(),
            find: ENVIRONMENT_GUARD.to_owned(),
            replace: ALWAYS_TRUE_GUARD.to_owned(),
            files: RUNTIME_FILES.iter().map(|f| (*f).to_owned()).collect(),
        }
    }

    pub fn applies_to(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.files.iter().any(|f| f == name))
    }

    /// Rewrite the first occurrence of `find` in `source`
    ///
    /// Fails when `find` does not occur at all: a silent no-op would publish an
    /// artifact with its exports stripped.
    pub fn apply<'s>(&self, path: &Path, source: &'s str) -> Result<Cow<'s, str>> {
        let occurrences = source.matches(self.find.as_str()).count();
        if occurrences == 0 {
            return Err(BundleError::GuardPatternNotFound {
                rule: self.name.clone(),
                file: path.to_path_buf(),
            });
        }
        debug!(
            "Applying patch '{}' to {} ({occurrences} occurrence(s), rewriting the first)",
            self.name,
            path.display()
        );
        Ok(source.cow_replacen(self.find.as_str(), &self.replace, 1))
    }
}

/// Apply every rule targeting `path`, in order
pub fn apply_rules(rules: &[PatchRule], path: &Path, source: String) -> Result<String> {
    let mut current = source;
    for rule in rules.iter().filter(|r| r.applies_to(path)) {
        let patched = rule.apply(path, &current)?.into_owned();
        current = patched;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;
    use similar::{ChangeTag, TextDiff};

    use super::*;

    const RUNTIME_SOURCE: &str = r#"'use strict';

if (process.env.NODE_ENV !== "production") {
  (function() {
'use strict';
var ReactVersion = '18.2.0';
if (process.env.NODE_ENV !== "production") {
  console.warn('dev only');
}
exports.version = ReactVersion;
  })();
}
"#;

    fn runtime_path() -> PathBuf {
        PathBuf::from("/srv/site/node_modules/react/cjs/react.development.js")
    }

    #[test]
    fn test_rewrites_only_first_occurrence() {
        let rule = PatchRule::environment_guard();
        let patched = rule
            .apply(&runtime_path(), RUNTIME_SOURCE)
            .expect("guard is present");

        assert!(patched.starts_with("'use strict';\n\nif (true) {\n"));
        assert_eq!(patched.matches(ENVIRONMENT_GUARD).count(), 1);

        let diff = TextDiff::from_lines(RUNTIME_SOURCE, patched.as_ref());
        let changed: Vec<(ChangeTag, String)> = diff
            .iter_all_changes()
            .filter(|c| c.tag() != ChangeTag::Equal)
            .map(|c| (c.tag(), c.value().to_owned()))
            .collect();
        assert_eq!(
            changed,
            vec![
                (ChangeTag::Delete, format!("{ENVIRONMENT_GUARD}\n")),
                (ChangeTag::Insert, format!("{ALWAYS_TRUE_GUARD}\n")),
            ]
        );
    }

    #[test]
    fn test_zero_matches_is_an_error() {
        let rule = PatchRule::environment_guard();
        // Reformatted upstream source: single quotes instead of double quotes
        let source = "if (process.env.NODE_ENV !== 'production') {\n}\n";
        let err = rule
            .apply(&runtime_path(), source)
            .expect_err("missing guard must fail");
        match err {
            BundleError::GuardPatternNotFound { rule, file } => {
                assert_eq!(rule, "environment-guard");
                assert_eq!(file, runtime_path());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_applies_by_file_name() {
        let rule = PatchRule::environment_guard();
        assert!(rule.applies_to(&runtime_path()));
        assert!(rule.applies_to(Path::new("scheduler/cjs/scheduler.development.js")));
        assert!(!rule.applies_to(Path::new("react/cjs/react.production.min.js")));
        assert!(!rule.applies_to(Path::new("object-assign/index.js")));
    }

    #[test]
    fn test_apply_rules_skips_untargeted_files() {
        let rules = vec![PatchRule::environment_guard()];
        let source = "module.exports = 1;".to_owned();
        let out = apply_rules(&rules, Path::new("object-assign/index.js"), source.clone())
            .expect("untargeted file passes through");
        assert_eq!(out, source);
    }
}
