// src/constants.rs

/// The default program file looked up in the working directory.
pub const PROGRAM_FILENAME: &str = "weft.toml";

/// Fallback manifest that may embed a program under `[tool.weft]`.
pub const PYPROJECT_FILENAME: &str = "pyproject.toml";

/// The section path inside `pyproject.toml` holding an embedded program.
pub const PYPROJECT_SECTION: &str = "tool.weft";

/// Where output digests are remembered between runs.
pub const HISTORY_FILENAME: &str = ".weft_history";
