// src/core/runner.rs

use std::collections::BTreeMap;

use serde::Deserialize;

/// A registered command for running task scripts: an executable plus argument
/// templates. A `${script}` placeholder in the arguments is substituted with
/// the path to the materialized script file at spawn time.
#[derive(Debug, Clone, Deserialize)]
pub struct Runner {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The runners available without any configuration.
pub fn default_runners() -> BTreeMap<String, Runner> {
    BTreeMap::from([
        (
            "python".to_string(),
            Runner {
                command: "python".to_string(),
                args: vec!["${script}".to_string()],
            },
        ),
        (
            "bash".to_string(),
            Runner {
                command: "bash".to_string(),
                args: vec!["${script}".to_string()],
            },
        ),
    ])
}
