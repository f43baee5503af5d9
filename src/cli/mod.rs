// src/cli/mod.rs

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Parser;
use colored::Colorize;
use futures::future::join_all;
use tokio::sync::Semaphore;

use crate::constants::{
    HISTORY_FILENAME, PROGRAM_FILENAME, PYPROJECT_FILENAME, PYPROJECT_SECTION,
};
use crate::core::program::{Program, resolve_tasks};
use crate::core::target::Target;

/// A declarative task runner with lazy dependency resolution.
#[derive(Parser, Debug)]
#[command(name = "weft", version, about)]
pub struct Cli {
    /// Names of the tasks to run (defaults to `all`)
    pub targets: Vec<String>,

    /// Program file to read, optionally with a `[section]` suffix
    #[arg(short, long)]
    pub input_file: Option<String>,

    /// Run every task, even when targets are up to date
    #[arg(short = 'B', long)]
    pub force_run: bool,

    /// Maximum number of tasks running at the same time
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Show the registered runners and exit
    #[arg(long)]
    pub list_runners: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

pub fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let program = load_program(cli.input_file.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("could not start the async runtime")?;
    runtime.block_on(run_targets(program, cli))
}

/// Finds and reads the program: an explicit `-i` argument first, then
/// `weft.toml`, then the `[tool.weft]` section of `pyproject.toml`.
fn load_program(input: Option<&str>) -> anyhow::Result<Program> {
    if let Some(spec) = input {
        let (path, section) = split_spec(spec);
        let path = Path::new(path);
        let section = section.or_else(|| default_section(path));
        return Program::read(path, section)
            .with_context(|| format!("could not read `{}`", path.display()));
    }
    let main = Path::new(PROGRAM_FILENAME);
    if main.exists() {
        return Program::read(main, None)
            .with_context(|| format!("could not read `{PROGRAM_FILENAME}`"));
    }
    let pyproject = Path::new(PYPROJECT_FILENAME);
    if pyproject.exists() {
        return Program::read(pyproject, Some(PYPROJECT_SECTION))
            .with_context(|| format!("could not read `{PYPROJECT_FILENAME}`"));
    }
    bail!("no `{PROGRAM_FILENAME}` or `{PYPROJECT_FILENAME}` found in the current directory");
}

/// Splits a `path[section]` argument. An empty `[]` suffix is ignored.
fn split_spec(spec: &str) -> (&str, Option<&str>) {
    if let Some(rest) = spec.strip_suffix(']')
        && let Some((path, section)) = rest.split_once('[')
        && !section.is_empty()
    {
        return (path, Some(section));
    }
    (spec, None)
}

fn default_section(path: &Path) -> Option<&'static str> {
    (path.file_name() == Some(std::ffi::OsStr::new(PYPROJECT_FILENAME)))
        .then_some(PYPROJECT_SECTION)
}

async fn run_targets(program: Program, cli: Cli) -> anyhow::Result<()> {
    let mut db = resolve_tasks(program, Some(PathBuf::from(HISTORY_FILENAME))).await?;
    db.force_run = cli.force_run;
    db.throttle = cli.jobs.map(Semaphore::new);

    if cli.list_runners {
        for (name, runner) in &db.runners {
            let invocation = std::iter::once(runner.command.clone())
                .chain(runner.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ");
            println!("{:<12} {invocation}", name.cyan());
        }
        return Ok(());
    }

    let mut names = cli.targets;
    if names.is_empty() {
        names.push("all".to_string());
    }
    let goals: Vec<Target> = names.iter().map(|name| Target::Phony(name.clone())).collect();

    // The guard writes the history back when this scope ends, whether the
    // run succeeded or not.
    let _guard = db.history.persist();
    let results = join_all(goals.iter().map(|goal| db.run(goal.clone()))).await;

    let mut failed = 0usize;
    for (goal, result) in goals.iter().zip(results) {
        match result? {
            Ok(_) => println!("{} {goal}", "✓".green()),
            Err(failure) => {
                failed += 1;
                println!("{} {goal}", "✗".red());
                for line in failure.to_string().lines() {
                    println!("  {}", line.yellow());
                }
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} targets failed", goals.len());
    }
    Ok(())
}
