// src/core/errors.rs

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors: configuration and programmer mistakes that abort the whole
/// run before or during evaluation. Per-target failures are *not* errors;
/// they travel through the graph as [`crate::core::result::Failure`] values
/// and are reported target by target.
///
/// The one crossover is [`Error::Task`]: a node action signals its own
/// failure with it, and the lazy engine converts it into a memoized
/// `Failure::Task` instead of letting it abort the run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependency detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("include `{0}` not found")]
    MissingInclude(PathBuf),

    #[error("template `{0}` not found")]
    MissingTemplate(String),

    #[error("{0}")]
    Unresolvable(String),

    #[error("invalid task specification: {0}")]
    Spec(String),

    #[error("{0}")]
    Task(String),

    #[error("could not decode program: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
