// src/core/target.rs

use std::fmt;
use std::path::{Component, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^var\(([^\s()]+)\)$").expect("valid regex"))
}

/// The atomic unit of dependency tracking.
///
/// A target is either a filesystem path, a phony name (`#name`, a symbolic
/// grouping target not backed by a file), or a variable (`var(name)`, an
/// environment value produced by substitution instead of file I/O). Targets
/// are the keys of the lazy database; each one is bound to at most one
/// producing node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Path(PathBuf),
    Phony(String),
    Var(String),
}

impl Target {
    /// Creates a path target with a lexically normalized path, so that
    /// `./out.txt` and `out.txt` index the same node.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        let normalized: PathBuf = path
            .into()
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect();
        Self::Path(normalized)
    }

    /// Parses the target string encoding: `#name` is phony, `var(name)` is a
    /// variable, anything else is a filesystem path.
    pub fn parse(s: &str) -> Self {
        if let Some(name) = s.strip_prefix('#') {
            Self::Phony(name.to_string())
        } else if let Some(captures) = var_pattern().captures(s) {
            Self::Var(captures[1].to_string())
        } else {
            Self::path(s)
        }
    }

    pub fn as_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Path(path) => Some(path),
            _ => None,
        }
    }

    pub fn is_phony(&self) -> bool {
        matches!(self, Self::Phony(_))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Phony(name) => write!(f, "#{name}"),
            Self::Var(name) => write!(f, "var({name})"),
        }
    }
}
