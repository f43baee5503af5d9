// src/core/result.rs

use std::fmt;

/// Outcome of evaluating a single node: a value, or a structured failure that
/// flows through the dependency graph. Failures are expected and reportable;
/// they are distinct from the fatal configuration errors in
/// [`crate::core::errors::Error`], which abort the whole run.
pub type Outcome<I, V> = Result<V, Failure<I>>;

/// A failure attached to one node of the dependency graph.
///
/// Failures aggregate: a node depending on failed nodes wraps their failures
/// in [`Failure::Dependencies`], so the outcome for a top-level target carries
/// the full chain of causes.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure<I> {
    /// The identifier has no producing node and no implicit resolution.
    Missing(I),
    /// The node's own action failed.
    Task(String),
    /// One or more direct dependencies failed, in requirement order.
    Dependencies(Vec<(I, Failure<I>)>),
}

impl<I: fmt::Display> fmt::Display for Failure<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(id) => write!(f, "missing dependency: {id}"),
            Self::Task(message) => write!(f, "{message}"),
            Self::Dependencies(deps) => {
                let chain: Vec<String> = deps
                    .iter()
                    .map(|(id, cause)| format!("{id} -> {cause}"))
                    .collect();
                write!(f, "{}", chain.join("\n"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_failure_names_the_identifier() {
        let failure: Failure<String> = Failure::Missing("out.txt".into());
        assert_eq!(failure.to_string(), "missing dependency: out.txt");
    }

    #[test]
    fn test_dependency_failure_renders_the_full_chain() {
        let inner: Failure<String> = Failure::Task("process exited early".into());
        let mid = Failure::Dependencies(vec![("b".to_string(), inner)]);
        let outer = Failure::Dependencies(vec![("a".to_string(), mid)]);
        assert_eq!(outer.to_string(), "a -> b -> process exited early");
    }

    #[test]
    fn test_sibling_failures_render_one_per_line() {
        let failure = Failure::Dependencies(vec![
            ("x".to_string(), Failure::<String>::Task("first".into())),
            ("y".to_string(), Failure::<String>::Task("second".into())),
        ]);
        assert_eq!(failure.to_string(), "x -> first\ny -> second");
    }
}
