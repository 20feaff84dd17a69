use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BundleError>;

#[derive(Error, Debug)]
pub enum BundleError {
    /// An overridden package's development build is missing on disk
    #[error("development build of '{package}' not found at {}", path.display())]
    Resolution { package: String, path: PathBuf },

    #[error("cannot resolve '{specifier}' imported from {importer}")]
    ModuleNotFound { specifier: String, importer: String },

    /// A patch rule matched nothing in a file it targets
    #[error("patch rule '{rule}' found no match in {}", file.display())]
    GuardPatternNotFound { rule: String, file: PathBuf },

    #[error("failed to parse {}: {message}", file.display())]
    Parse { file: PathBuf, message: String },

    #[error("compilation of entry '{entry}' failed: {message}")]
    Compilation { entry: String, message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start the compilation runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{} entries failed:\n{}", .0.len(), .0.iter().map(|e| format!("  - {e}")).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<BundleError>),
}

impl BundleError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(file: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            message: message.into(),
        }
    }

    pub fn compilation(entry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compilation {
            entry: entry.into(),
            message: message.into(),
        }
    }

    /// Collapse a batch of failures into a single error
    ///
    /// Returns `None` for an empty batch so callers can use it on the fan-in path.
    pub fn from_batch(mut errors: Vec<Self>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Multiple(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_message_names_package_and_path() {
        let err = BundleError::Resolution {
            package: "scheduler".to_owned(),
            path: PathBuf::from("/srv/node_modules/scheduler/cjs/scheduler.development.js"),
        };
        let message = err.to_string();
        assert!(message.contains("'scheduler'"));
        assert!(message.contains("/srv/node_modules/scheduler/cjs/scheduler.development.js"));
    }

    #[test]
    fn test_from_batch() {
        assert!(BundleError::from_batch(Vec::new()).is_none());

        let single = BundleError::from_batch(vec![BundleError::Config("bad".to_owned())]);
        assert!(matches!(single, Some(BundleError::Config(_))));

        let multiple = BundleError::from_batch(vec![
            BundleError::compilation("dom", "boom"),
            BundleError::compilation("jsx-runtime", "bang"),
        ])
        .expect("batch should produce an error");
        let message = multiple.to_string();
        assert!(message.starts_with("2 entries failed"));
        assert!(message.contains("  - compilation of entry 'dom' failed: boom"));
        assert!(message.contains("  - compilation of entry 'jsx-runtime' failed: bang"));
    }
}
