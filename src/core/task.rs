// src/core/task.rs

//! The domain-specific node kinds layered on the lazy engine: concrete tasks
//! that spawn subprocesses, template variables that substitute into strings,
//! and template tasks that materialize into concrete tasks once the
//! variables they mention are known.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::SystemTime;

use futures::future::{BoxFuture, join_all};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::core::errors::Error;
use crate::core::history::History;
use crate::core::lazy::{LazyDb, LazyNode, NodeType, Step};
use crate::core::result::Outcome;
use crate::core::runner::{Runner, default_runners};
use crate::core::target::Target;
use crate::core::template::{Env, Substitutable, gather_args};
use crate::system::executor;

/// Content hash of a script body, for change detection independent of file
/// timestamps.
pub fn script_digest(script: &str) -> String {
    blake3::hash(script.as_bytes()).to_hex().to_string()
}

/// A task as written in the program file, before any variable resolution.
/// All fields are plain strings that may contain `${name}` placeholders.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskProxy {
    #[serde(default, alias = "targets")]
    pub creates: Vec<String>,
    #[serde(default, alias = "dependencies")]
    pub requires: Vec<String>,
    pub name: Option<String>,
    #[serde(alias = "language")]
    pub runner: Option<String>,
    pub path: Option<String>,
    pub script: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl TaskProxy {
    /// Every target string this task produces, including the implicit phony
    /// name and the stdout target.
    pub fn all_targets(&self) -> Vec<String> {
        let mut targets = self.creates.clone();
        if let Some(stdout) = &self.stdout {
            targets.push(stdout.clone());
        }
        if let Some(name) = &self.name {
            targets.push(format!("#{name}"));
        }
        targets
    }

    /// Every dependency string, including the implicit stdin and script path.
    pub fn all_dependencies(&self) -> Vec<String> {
        let mut deps = self.requires.clone();
        if let Some(stdin) = &self.stdin {
            deps.push(stdin.clone());
        }
        if let Some(path) = &self.path {
            deps.push(path.clone());
        }
        deps
    }

    /// Builds the concrete task node for a fully substituted proxy.
    pub fn task_node(&self) -> Result<LazyNode<NodeKind>, Error> {
        let creates = self.creates.iter().map(|s| Target::parse(s)).collect();
        let requires = self.requires.iter().map(|s| Target::parse(s)).collect();
        let task = Task {
            name: self.name.clone(),
            runner: self.runner.clone(),
            path: self.path.as_ref().map(PathBuf::from),
            script: self.script.clone(),
            stdin: self.stdin.as_deref().map(Target::parse),
            stdout: self.stdout.as_deref().map(Target::parse),
            description: self.description.clone(),
            force: self.force,
            digest: self.script.as_deref().map(script_digest),
        };
        task.into_node(creates, requires)
    }
}

impl Substitutable for TaskProxy {
    fn substitute(&self, env: &Env) -> Self {
        Self {
            creates: self.creates.substitute(env),
            requires: self.requires.substitute(env),
            name: self.name.substitute(env),
            runner: self.runner.substitute(env),
            path: self.path.substitute(env),
            script: self.script.substitute(env),
            stdin: self.stdin.substitute(env),
            stdout: self.stdout.substitute(env),
            description: self.description.substitute(env),
            force: self.force,
        }
    }

    fn gather(&self, out: &mut std::collections::BTreeSet<String>) {
        self.creates.gather(out);
        self.requires.gather(out);
        self.name.gather(out);
        self.runner.gather(out);
        self.path.gather(out);
        self.script.gather(out);
        self.stdin.gather(out);
        self.stdout.gather(out);
        self.description.gather(out);
    }
}

/// A concrete task: runs an external script or program, tracks file
/// modification times and content digests for staleness.
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub name: Option<String>,
    pub runner: Option<String>,
    pub path: Option<PathBuf>,
    pub script: Option<String>,
    pub stdin: Option<Target>,
    pub stdout: Option<Target>,
    pub description: Option<String>,
    pub force: bool,
    pub digest: Option<String>,
}

impl Task {
    /// Validates the task and wires the implicit identifiers: the phony name
    /// joins `creates`, stdin and the script path join `requires`, stdout
    /// joins `creates`.
    pub fn into_node(
        self,
        mut creates: Vec<Target>,
        mut requires: Vec<Target>,
    ) -> Result<LazyNode<NodeKind>, Error> {
        if self.path.is_some() && self.script.is_some() {
            return Err(Error::Spec(
                "a task may define `path` or `script`, not both".into(),
            ));
        }
        if matches!(self.stdin, Some(Target::Phony(_)))
            || matches!(self.stdout, Some(Target::Phony(_)))
        {
            return Err(Error::Spec(
                "`stdin` and `stdout` may not be phony targets".into(),
            ));
        }
        if let Some(name) = &self.name {
            let phony = Target::Phony(name.clone());
            if !creates.contains(&phony) {
                creates.push(phony);
            }
        }
        if let Some(stdin) = &self.stdin
            && !requires.contains(stdin)
        {
            requires.push(stdin.clone());
        }
        if let Some(path) = &self.path {
            let target = Target::path(path.clone());
            if !requires.contains(&target) {
                requires.push(target);
            }
        }
        if let Some(stdout) = &self.stdout
            && !creates.contains(stdout)
        {
            creates.push(stdout.clone());
        }
        Ok(LazyNode::new(creates, requires, NodeKind::Task(self)))
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.description.clone())
            .unwrap_or_else(|| "anonymous task".into())
    }

    /// A task with no real file outputs has nothing to check for staleness
    /// and runs on every request; `force` opts in explicitly.
    fn always_run(&self, node: &LazyNode<NodeKind>) -> bool {
        self.force || path_targets(node).is_empty()
    }

    /// True when any declared file target is missing, older than a file
    /// dependency, or recorded under a different script digest.
    fn needs_run(&self, node: &LazyNode<NodeKind>, db: &TaskDb) -> bool {
        let targets = path_targets(node);
        if targets.iter().any(|path| !path.exists()) {
            return true;
        }
        let target_times: Vec<SystemTime> =
            targets.iter().filter_map(|path| modified(path)).collect();
        let dep_times: Vec<SystemTime> = path_dependencies(node)
            .iter()
            .filter_map(|path| modified(path))
            .collect();
        if target_times
            .iter()
            .any(|target| dep_times.iter().any(|dep| target < dep))
        {
            return true;
        }
        targets
            .iter()
            .any(|path| !db.history.up_to_date(path, self.digest.as_deref()))
    }

    async fn run(
        &self,
        node: &LazyNode<NodeKind>,
        db: &TaskDb,
    ) -> Result<Step<NodeKind>, Error> {
        if !self.always_run(node) && !self.needs_run(node, db) && !db.force_run {
            log::info!(
                "targets {} already up to date",
                join_targets(node.creates())
            );
            return Ok(Step::Value(None));
        }
        log::debug!(
            "task `{}`: [{}] <- [{}]",
            self.label(),
            join_targets(node.creates()),
            join_targets(node.requires())
        );
        if self.path.is_none() && self.script.is_none() {
            return Ok(Step::Value(None));
        }

        let note = self
            .description
            .clone()
            .or_else(|| self.name.as_ref().map(|name| format!("#{name}")))
            .unwrap_or_else(|| format!("creating {}", join_targets(node.creates())));
        log::info!("{note}");

        // Resolve the input source once; it is shared by every spawn.
        let mut input_bytes: Option<Vec<u8>> = None;
        let mut input_file: Option<std::fs::File> = None;
        match &self.stdin {
            Some(Target::Var(name)) => {
                let value = db.environment().get(name).cloned().ok_or_else(|| {
                    Error::Task(format!("input variable `{name}` is not available"))
                })?;
                input_bytes = Some(value.into_bytes());
            }
            Some(Target::Path(path)) => {
                input_file = Some(std::fs::File::open(path).map_err(|e| {
                    Error::Task(format!("could not open input `{}`: {e}", path.display()))
                })?);
            }
            _ => {}
        }
        let stdin_spec = || match (&input_bytes, &input_file) {
            (Some(bytes), _) => executor::Stdin::Bytes(bytes),
            (None, Some(file)) => executor::Stdin::File(file),
            _ => executor::Stdin::Inherit,
        };

        let capture = matches!(self.stdout, Some(Target::Var(_)));
        let sink_file = match &self.stdout {
            Some(Target::Path(path)) => Some(std::fs::File::create(path).map_err(|e| {
                Error::Task(format!(
                    "could not create output `{}`: {e}",
                    path.display()
                ))
            })?),
            _ => None,
        };
        let stdout_spec = || {
            if capture {
                executor::Stdout::Capture
            } else if let Some(file) = &sink_file {
                executor::Stdout::File(file)
            } else {
                executor::Stdout::Inherit
            }
        };

        let mut captured: Vec<u8> = Vec::new();
        match (&self.runner, &self.script) {
            (None, Some(script)) => {
                // Each line is a separate subprocess with explicit argv; the
                // declared stdin/stdout are shared across the sequence.
                if script.lines().count() > 1 && self.stdin.is_some() {
                    return Err(Error::Spec(
                        "a multi-line script cannot take `stdin`".into(),
                    ));
                }
                for line in script.lines() {
                    let Some(line_argv) = shlex::split(line) else {
                        return Err(Error::Task(format!(
                            "could not parse command line: {line}"
                        )));
                    };
                    if line_argv.is_empty() {
                        continue;
                    }
                    let output = executor::execute(
                        &line_argv,
                        stdin_spec(),
                        stdout_spec(),
                        db.throttle.as_ref(),
                    )
                    .await
                    .map_err(|e| Error::Task(e.to_string()))?;
                    captured.extend_from_slice(&output.stdout);
                    log_stderr(&self.label(), &output.stderr);
                }
            }
            (Some(runner_name), _) => {
                let runner = db.runners.get(runner_name).ok_or_else(|| {
                    Error::Spec(format!("runner `{runner_name}` is not registered"))
                })?;
                // Keeps a script written for the runner alive for the spawn,
                // removed again when this call returns.
                let mut _scratch: Option<tempfile::NamedTempFile> = None;
                let script_path = if let Some(path) = &self.path {
                    path.clone()
                } else if let Some(script) = &self.script {
                    let mut file = tempfile::NamedTempFile::new()?;
                    file.write_all(script.as_bytes())?;
                    file.flush()?;
                    let path = file.path().to_path_buf();
                    _scratch = Some(file);
                    path
                } else {
                    return Err(Error::Spec(
                        "a runner task needs `path` or `script`".into(),
                    ));
                };
                let mut script_env = Env::new();
                script_env.insert("script".to_string(), script_path.display().to_string());
                let mut argv = vec![runner.command.clone()];
                argv.extend(runner.args.iter().map(|arg| arg.substitute(&script_env)));
                let output = executor::execute(
                    &argv,
                    stdin_spec(),
                    stdout_spec(),
                    db.throttle.as_ref(),
                )
                .await
                .map_err(|e| Error::Task(e.to_string()))?;
                captured.extend_from_slice(&output.stdout);
                log_stderr(&self.label(), &output.stderr);
            }
            (None, None) => return Ok(Step::Value(None)),
        }

        let value = if captured.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&captured).trim().to_string())
        };

        for path in path_targets(node) {
            db.history.record(path, self.digest.as_deref());
        }
        if self.needs_run(node, db) {
            return Err(Error::Task(format!(
                "task `{}` did not achieve its goals",
                self.label()
            )));
        }
        Ok(Step::Value(value))
    }
}

fn path_targets(node: &LazyNode<NodeKind>) -> Vec<&PathBuf> {
    node.creates().iter().filter_map(Target::as_path).collect()
}

fn path_dependencies(node: &LazyNode<NodeKind>) -> Vec<&PathBuf> {
    node.requires().iter().filter_map(Target::as_path).collect()
}

fn modified(path: &PathBuf) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

fn join_targets(targets: &[Target]) -> String {
    targets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn log_stderr(label: &str, stderr: &[u8]) {
    if !stderr.is_empty() {
        log::info!("{label}: {}", String::from_utf8_lossy(stderr).trim_end());
    }
}

/// A deferred string substitution producing an environment value.
#[derive(Debug, Clone)]
pub struct TemplateVariable {
    pub template: String,
}

impl TemplateVariable {
    pub fn node(name: &str, template: String) -> LazyNode<NodeKind> {
        let requires = gather_args(&template).into_iter().map(Target::Var).collect();
        LazyNode::new(
            vec![Target::Var(name.to_string())],
            requires,
            NodeKind::Variable(Self { template }),
        )
    }

    async fn run(&self, db: &TaskDb) -> Result<Step<NodeKind>, Error> {
        Ok(Step::Value(Some(self.template.substitute(&db.environment()))))
    }
}

/// A task description whose targets are concrete but whose body may mention
/// variables: once those resolve, it materializes into a concrete [`Task`]
/// the engine continues through.
#[derive(Debug, Clone)]
pub struct TemplateTask {
    pub proxy: TaskProxy,
}

impl TemplateTask {
    pub fn node(proxy: TaskProxy) -> Result<LazyNode<NodeKind>, Error> {
        let targets = proxy.all_targets();
        if !gather_args(&targets).is_empty() {
            return Err(Error::Unresolvable(format!(
                "task has templated targets: {targets:?}"
            )));
        }
        let creates = targets.iter().map(|s| Target::parse(s)).collect();
        let requires = gather_args(&proxy).into_iter().map(Target::Var).collect();
        Ok(LazyNode::new(
            creates,
            requires,
            NodeKind::Template(Self { proxy }),
        ))
    }

    async fn run(&self, db: &TaskDb) -> Result<Step<NodeKind>, Error> {
        let proxy = self.proxy.substitute(&db.environment());
        Ok(Step::Node(std::sync::Arc::new(proxy.task_node()?)))
    }
}

/// The closed set of node kinds evaluated by the task database.
pub enum NodeKind {
    Task(Task),
    Variable(TemplateVariable),
    Template(TemplateTask),
}

impl NodeType for NodeKind {
    type Id = Target;
    type Value = Option<String>;
    type Ctx = TaskDb;

    fn run<'a>(
        &'a self,
        node: &'a LazyNode<Self>,
        ctx: &'a TaskDb,
    ) -> BoxFuture<'a, Result<Step<Self>, Error>> {
        Box::pin(async move {
            match self {
                Self::Task(task) => task.run(node, ctx).await,
                Self::Variable(variable) => variable.run(ctx).await,
                Self::Template(template) => template.run(ctx).await,
            }
        })
    }

    /// A path that already exists on disk resolves to an implicit source
    /// node with no action of its own.
    fn on_missing(id: &Target, _ctx: &TaskDb) -> Option<LazyNode<Self>> {
        match id {
            Target::Path(path) if path.exists() => Task::default()
                .into_node(vec![id.clone()], vec![])
                .ok(),
            _ => None,
        }
    }
}

/// The lazy database specialized to tasks, plus the run-wide shared state:
/// the runner registry, the optional process throttle, the global force flag
/// and the digest history.
pub struct TaskDb {
    lazy: LazyDb<NodeKind>,
    pub runners: BTreeMap<String, Runner>,
    /// Counting semaphore bounding simultaneous subprocess spawns.
    pub throttle: Option<Semaphore>,
    /// When set, every task reruns regardless of staleness.
    pub force_run: bool,
    pub history: History,
}

impl TaskDb {
    pub fn new(history: History) -> Self {
        Self {
            lazy: LazyDb::new(),
            runners: default_runners(),
            throttle: None,
            force_run: false,
            history,
        }
    }

    pub fn add(&self, node: LazyNode<NodeKind>) -> std::sync::Arc<LazyNode<NodeKind>> {
        self.lazy.add(node)
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.lazy.contains(target)
    }

    /// Evaluates the node producing `target`; see [`LazyDb::run`].
    pub async fn run(&self, target: Target) -> Result<Outcome<Target, Option<String>>, Error> {
        self.lazy.run(target, self).await
    }

    pub fn reset(&self) {
        self.lazy.reset();
    }

    pub fn clean(&self) {
        self.lazy.clean();
    }

    /// A snapshot of every variable whose value is already memoized.
    pub fn environment(&self) -> Env {
        let mut env = Env::new();
        for (id, node) in self.lazy.entries() {
            if let Target::Var(name) = id
                && let Some(Ok(Some(value))) = node.value()
            {
                env.insert(name, value);
            }
        }
        env
    }

    /// True when every variable referenced by `value` has a producing node.
    pub fn is_resolvable<S: Substitutable>(&self, value: &S) -> bool {
        gather_args(value)
            .iter()
            .all(|name| self.contains(&Target::Var(name.clone())))
    }

    /// Runs every variable referenced by `value`, then substitutes them in.
    /// A variable that cannot be produced is fatal here: this is used for
    /// include paths and deferred task targets, which must become concrete.
    pub async fn resolve_object<S: Substitutable>(&self, value: &S) -> Result<S, Error> {
        let names: Vec<String> = gather_args(value).into_iter().collect();
        let results = join_all(
            names
                .iter()
                .map(|name| self.run(Target::Var(name.clone()))),
        )
        .await;
        for (name, result) in names.iter().zip(results) {
            if let Err(failure) = result? {
                return Err(Error::Unresolvable(format!(
                    "variable `{name}` could not be resolved: {failure}"
                )));
            }
        }
        Ok(value.substitute(&self.environment()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_accepts_legacy_field_names() {
        let proxy: TaskProxy = toml::from_str(
            r#"
            targets = ["out.txt"]
            dependencies = ["in.txt"]
            language = "bash"
            script = "echo hi"
            "#,
        )
        .unwrap();
        assert_eq!(proxy.creates, vec!["out.txt"]);
        assert_eq!(proxy.requires, vec!["in.txt"]);
        assert_eq!(proxy.runner.as_deref(), Some("bash"));
    }

    #[test]
    fn test_node_wiring_adds_implicit_targets() {
        let proxy = TaskProxy {
            creates: vec!["out.txt".into()],
            requires: vec!["in.txt".into()],
            name: Some("build".into()),
            stdin: Some("var(msg)".into()),
            stdout: Some("log.txt".into()),
            script: Some("cp in.txt out.txt".into()),
            ..TaskProxy::default()
        };
        let node = proxy.task_node().unwrap();
        assert!(node.creates().contains(&Target::Phony("build".into())));
        assert!(node.creates().contains(&Target::path("log.txt")));
        assert!(node.requires().contains(&Target::Var("msg".into())));
    }

    #[test]
    fn test_phony_stdout_is_rejected() {
        let task = Task {
            stdout: Some(Target::Phony("nope".into())),
            ..Task::default()
        };
        assert!(matches!(
            task.into_node(vec![], vec![]),
            Err(Error::Spec(_))
        ));
    }

    #[test]
    fn test_path_and_script_together_are_rejected() {
        let task = Task {
            path: Some(PathBuf::from("script.sh")),
            script: Some("echo hi".into()),
            ..Task::default()
        };
        assert!(matches!(
            task.into_node(vec![], vec![]),
            Err(Error::Spec(_))
        ));
    }

    #[test]
    fn test_needs_run_on_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        std::fs::write(&out, "content").unwrap();

        let db = TaskDb::new(History::default());
        let task = Task {
            script: Some("echo content".into()),
            digest: Some(script_digest("echo content")),
            ..Task::default()
        };
        let digest = task.digest.clone();
        let node = task
            .clone()
            .into_node(vec![Target::path(&out)], vec![])
            .unwrap();
        let NodeKind::Task(inner) = node.inner() else {
            panic!("expected a task node");
        };

        // Target exists and nothing is newer, but the digest was never
        // recorded: stale.
        assert!(inner.needs_run(&node, &db));

        db.history.record(&out, digest.as_deref());
        assert!(!inner.needs_run(&node, &db));

        db.history.record(&out, Some("0000"));
        assert!(inner.needs_run(&node, &db));
    }

    #[test]
    fn test_needs_run_on_outdated_target() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let dep = dir.path().join("dep.txt");
        std::fs::write(&out, "old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        std::fs::write(&dep, "new").unwrap();

        let db = TaskDb::new(History::default());
        db.history.record(&out, None);
        let node = Task::default()
            .into_node(vec![Target::path(&out)], vec![Target::path(&dep)])
            .unwrap();
        let NodeKind::Task(inner) = node.inner() else {
            panic!("expected a task node");
        };
        assert!(inner.needs_run(&node, &db));
    }

    #[tokio::test]
    async fn test_variable_substitution_chains() {
        let db = TaskDb::new(History::default());
        db.add(TemplateVariable::node("name", "world".into()));
        db.add(TemplateVariable::node("greeting", "hello ${name}".into()));

        let result = db.run(Target::Var("greeting".into())).await.unwrap();
        assert_eq!(result, Ok(Some("hello world".into())));
        assert_eq!(
            db.environment().get("greeting").map(String::as_str),
            Some("hello world")
        );
    }

    #[tokio::test]
    async fn test_existing_file_resolves_implicitly() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        std::fs::write(&source, "data").unwrap();

        let db = TaskDb::new(History::default());
        let result = db.run(Target::path(&source)).await.unwrap();
        assert_eq!(result, Ok(None));

        let missing = db
            .run(Target::path(dir.path().join("absent.txt")))
            .await
            .unwrap();
        assert!(matches!(
            missing,
            Err(crate::core::result::Failure::Missing(_))
        ));
    }
}
