//! Weft is a declarative task runner. A program describes named build tasks
//! (targets, dependencies, scripts, variable substitution); weft resolves the
//! templated task definitions into a concrete dependency graph and evaluates
//! it lazily: memoized, concurrency-safe, skipping tasks whose outputs are
//! already up to date.
//!
//! The typical embedding reads a [`Program`], resolves it into a [`TaskDb`]
//! and runs one or more targets:
//!
//! ```no_run
//! use std::path::Path;
//! use weft::{Program, Target, resolve_tasks};
//!
//! # async fn example() -> Result<(), weft::core::errors::Error> {
//! let program = Program::read(Path::new("weft.toml"), None)?;
//! let db = resolve_tasks(program, None).await?;
//! db.run(Target::Phony("all".into())).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod constants;
pub mod core;
pub mod system;

pub use crate::core::lazy::{LazyDb, LazyNode, NodeType, Step};
pub use crate::core::program::{Program, TemplateCall, resolve_tasks};
pub use crate::core::result::{Failure, Outcome};
pub use crate::core::runner::Runner;
pub use crate::core::target::Target;
pub use crate::core::task::{Task, TaskDb, TaskProxy};
