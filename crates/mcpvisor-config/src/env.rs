//! Environment overlay and `${VAR}` placeholder substitution.
//!
//! The overlay is a dotenv-format file loaded before placeholders are
//! resolved. Lookups check the overlay first, then the process environment.
//! An unresolved placeholder is left literal and reported as a warning.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, warn};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
});

/// Variables loaded from the overlay file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    vars: BTreeMap<String, String>,
    inherit_process: bool,
}

impl EnvOverlay {
    /// Overlay that only sees the process environment.
    pub fn process_only() -> Self {
        Self {
            vars: BTreeMap::new(),
            inherit_process: true,
        }
    }

    /// Overlay with fixed variables and no process environment fallback.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            inherit_process: false,
        }
    }

    /// Load the overlay file. A missing file is not an error.
    ///
    /// Malformed lines are logged and skipped.
    pub fn load(path: &Path) -> Self {
        let mut overlay = Self::process_only();

        if !path.exists() {
            debug!(path = %path.display(), "No environment overlay file");
            return overlay;
        }

        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read environment overlay");
                return overlay;
            }
        };

        for item in iter {
            match item {
                Ok((key, value)) => {
                    overlay.vars.insert(key, value);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping malformed overlay entry");
                }
            }
        }

        debug!(path = %path.display(), count = overlay.vars.len(), "Loaded environment overlay");
        overlay
    }

    /// Resolve a variable: overlay first, then (optionally) the process environment.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned().or_else(|| {
            if self.inherit_process {
                std::env::var(key).ok()
            } else {
                None
            }
        })
    }

    /// Variables defined by the overlay file itself.
    pub const fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// A placeholder that could not be resolved. Non-fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSubstitutionWarning {
    /// Variable name without the `${}` wrapper.
    pub variable: String,
    /// Dotted location of the string in the document.
    pub location: String,
}

impl fmt::Display for EnvSubstitutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unresolved placeholder ${{{}}} at {}",
            self.variable, self.location
        )
    }
}

/// Substitute placeholders in a single string.
///
/// Returns the new string and the names of unresolved variables.
pub fn substitute_str(input: &str, overlay: &EnvOverlay) -> (String, Vec<String>) {
    let mut missing = Vec::new();
    let output = PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        overlay.get(name).unwrap_or_else(|| {
            missing.push(name.to_string());
            caps[0].to_string()
        })
    });
    (output.into_owned(), missing)
}

/// Recursively substitute placeholders in every string value of a document.
///
/// Object keys are left untouched.
pub fn substitute_placeholders(
    value: &mut Value,
    overlay: &EnvOverlay,
) -> Vec<EnvSubstitutionWarning> {
    let mut warnings = Vec::new();
    walk(value, overlay, "", &mut warnings);
    warnings
}

fn walk(
    value: &mut Value,
    overlay: &EnvOverlay,
    location: &str,
    warnings: &mut Vec<EnvSubstitutionWarning>,
) {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let (resolved, missing) = substitute_str(s, overlay);
            warnings.extend(missing.into_iter().map(|variable| EnvSubstitutionWarning {
                variable,
                location: location.to_string(),
            }));
            *s = resolved;
        }
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                walk(item, overlay, &join(location, &i.to_string()), warnings);
            }
        }
        Value::Object(map) => {
            for (key, item) in map.iter_mut() {
                walk(item, overlay, &join(location, key), warnings);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn join(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{prefix}.{segment}")
    }
}
