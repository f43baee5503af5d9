// src/core/template.rs

//! Structural template substitution.
//!
//! `${name}` (or `$name`) placeholders are replaced from an environment map;
//! unknown names are left untouched, so partially resolvable templates stay
//! valid text. The same traversal also gathers the set of referenced names,
//! which is how templated task descriptions declare their variable
//! dependencies before any substitution happens.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::{Captures, Regex};

/// Variable name to value.
pub type Env = HashMap<String, String>;

fn placeholder_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("valid regex")
    })
}

/// A value that supports placeholder substitution and referenced-name
/// gathering over its structure. Implemented per record type so the
/// traversal stays explicit instead of reflective.
pub trait Substitutable: Sized {
    fn substitute(&self, env: &Env) -> Self;
    fn gather(&self, out: &mut BTreeSet<String>);
}

impl Substitutable for String {
    fn substitute(&self, env: &Env) -> Self {
        placeholder_pattern()
            .replace_all(self, |captures: &Captures<'_>| {
                if captures.get(1).is_some() {
                    return "$".to_string();
                }
                let name = captures
                    .get(2)
                    .or_else(|| captures.get(3))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match env.get(name) {
                    Some(value) => value.clone(),
                    // Safe substitution: leave unknown placeholders as-is.
                    None => captures[0].to_string(),
                }
            })
            .into_owned()
    }

    fn gather(&self, out: &mut BTreeSet<String>) {
        for captures in placeholder_pattern().captures_iter(self) {
            if let Some(name) = captures.get(2).or_else(|| captures.get(3)) {
                out.insert(name.as_str().to_string());
            }
        }
    }
}

impl<T: Substitutable> Substitutable for Option<T> {
    fn substitute(&self, env: &Env) -> Self {
        self.as_ref().map(|value| value.substitute(env))
    }

    fn gather(&self, out: &mut BTreeSet<String>) {
        if let Some(value) = self {
            value.gather(out);
        }
    }
}

impl<T: Substitutable> Substitutable for Vec<T> {
    fn substitute(&self, env: &Env) -> Self {
        self.iter().map(|value| value.substitute(env)).collect()
    }

    fn gather(&self, out: &mut BTreeSet<String>) {
        for value in self {
            value.gather(out);
        }
    }
}

/// Replaces every known placeholder in `value`, rebuilding the same shape.
pub fn substitute<S: Substitutable>(value: &S, env: &Env) -> S {
    value.substitute(env)
}

/// The set of placeholder names referenced anywhere in `value`.
pub fn gather_args<S: Substitutable>(value: &S) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    value.gather(&mut out);
    out
}
