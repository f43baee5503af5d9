// src/core/program.rs

//! The declarative program surface: the on-disk format, template call
//! expansion, and the resolver that turns a parsed program into a populated
//! task database.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use serde::Deserialize;

use crate::core::errors::Error;
use crate::core::history::History;
use crate::core::runner::Runner;
use crate::core::target::Target;
use crate::core::task::{TaskDb, TaskProxy, TemplateTask, TemplateVariable};
use crate::core::template::{Env, Substitutable, gather_args};

/// How list-valued call arguments combine into argument sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Join {
    /// Lock-step over the lists, truncated to the shortest.
    #[default]
    Zip,
    /// Cartesian product of the lists.
    Product,
}

/// A call argument: a single value applied to every set, or a list expanded
/// according to the call's join mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CallArg {
    One(String),
    Many(Vec<String>),
}

/// An instantiation of a named template with concrete arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateCall {
    pub template: String,
    #[serde(default)]
    pub args: BTreeMap<String, CallArg>,
    #[serde(default)]
    pub join: Join,
}

impl TemplateCall {
    /// The concrete argument environments this call expands into, one per
    /// instantiated task.
    pub fn argument_sets(&self) -> Vec<Env> {
        let mut scalars = Env::new();
        let mut lists: Vec<(&String, &Vec<String>)> = Vec::new();
        for (name, arg) in &self.args {
            match arg {
                CallArg::One(value) => {
                    scalars.insert(name.clone(), value.clone());
                }
                CallArg::Many(values) => lists.push((name, values)),
            }
        }
        if lists.is_empty() {
            return vec![scalars];
        }
        match self.join {
            Join::Zip => {
                let count = lists.iter().map(|(_, v)| v.len()).min().unwrap_or(0);
                (0..count)
                    .map(|i| {
                        let mut env = scalars.clone();
                        for (name, values) in &lists {
                            env.insert((*name).clone(), values[i].clone());
                        }
                        env
                    })
                    .collect()
            }
            Join::Product => {
                let mut sets = vec![scalars];
                for (name, values) in &lists {
                    sets = sets
                        .into_iter()
                        .flat_map(|env| {
                            values.iter().map(move |value| {
                                let mut env = env.clone();
                                env.insert((*name).clone(), value.clone());
                                env
                            })
                        })
                        .collect();
                }
                sets
            }
        }
    }
}

/// A parsed program file: tasks, variables, templates, calls, includes and
/// runner registrations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Program {
    pub task: Vec<TaskProxy>,
    pub environment: BTreeMap<String, String>,
    #[serde(alias = "pattern")]
    pub template: BTreeMap<String, TaskProxy>,
    pub call: Vec<TemplateCall>,
    pub include: Vec<String>,
    pub runner: BTreeMap<String, Runner>,
}

impl Program {
    /// Reads a program from a TOML or JSON file (chosen by extension),
    /// optionally descending into a dotted section such as `tool.weft`
    /// before decoding.
    pub fn read(path: &Path, section: Option<&str>) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let decode = |e: &dyn std::fmt::Display| {
            Error::Decode(format!("{}: {e}", path.display()))
        };
        let mut value: serde_json::Value =
            if path.extension().is_some_and(|ext| ext == "json") {
                serde_json::from_str(&text).map_err(|e| decode(&e))?
            } else {
                toml::from_str(&text).map_err(|e| decode(&e))?
            };
        if let Some(section) = section {
            for part in section.split('.') {
                value = value
                    .get(part)
                    .cloned()
                    .ok_or_else(|| decode(&format!("section `{section}` not found")))?;
            }
        }
        serde_json::from_value(value).map_err(|e| decode(&e))
    }
}

/// Builds the task database for `program`, recursing through includes.
///
/// Resolution runs in phases: variables, templates and runners register
/// first; calls whose template is not yet known and tasks whose targets are
/// still templated are deferred; includes load depth-first (generating an
/// include file by running its producing task when one is registered); then
/// the deferred work retries once, and anything still unresolved is fatal.
pub async fn resolve_tasks(
    program: Program,
    history_path: Option<PathBuf>,
) -> Result<TaskDb, Error> {
    let history = History::load(history_path)?;
    let mut resolver = Resolver {
        db: TaskDb::new(history),
        templates: BTreeMap::new(),
    };
    resolver.load(program).await?;
    Ok(resolver.db)
}

struct Resolver {
    db: TaskDb,
    templates: BTreeMap<String, TaskProxy>,
}

impl Resolver {
    fn load(&mut self, program: Program) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            let Program {
                task,
                environment,
                template,
                call,
                include,
                runner,
            } = program;

            for (name, value) in &environment {
                self.db.add(TemplateVariable::node(name, value.clone()));
            }
            self.templates.extend(template);
            self.db.runners.extend(runner);

            let mut delayed_calls: Vec<TemplateCall> = Vec::new();
            let mut delayed_proxies: Vec<TaskProxy> = Vec::new();

            for proxy in task {
                self.enqueue(proxy, &mut delayed_proxies)?;
            }

            // After direct tasks, so a colliding call-produced target wins
            // under the index's last-registration rule.
            for call in call {
                if self.templates.contains_key(&call.template) {
                    self.expand_call(&call, &mut delayed_proxies)?;
                } else {
                    delayed_calls.push(call);
                }
            }

            for include in &include {
                let resolved = self.db.resolve_object(include).await?;
                let path = PathBuf::from(&resolved);
                let target = Target::path(&path);
                if self.db.contains(&target)
                    && let Err(failure) = self.db.run(target).await?
                {
                    return Err(Error::Unresolvable(format!(
                        "include `{resolved}` could not be generated: {failure}"
                    )));
                }
                if !path.exists() {
                    return Err(Error::MissingInclude(path));
                }
                let included = Program::read(&path, None)?;
                self.load(included).await?;
            }

            for call in delayed_calls {
                if !self.templates.contains_key(&call.template) {
                    return Err(Error::MissingTemplate(call.template));
                }
                self.expand_call(&call, &mut delayed_proxies)?;
            }

            for proxy in delayed_proxies {
                if !self.db.is_resolvable(&proxy.all_targets()) {
                    return Err(Error::Unresolvable(format!(
                        "task targets mention unknown variables: {:?}",
                        proxy.all_targets()
                    )));
                }
                let resolved = self.db.resolve_object(&proxy).await?;
                self.db.add(TemplateTask::node(resolved)?);
            }

            Ok(())
        })
    }

    fn expand_call(
        &self,
        call: &TemplateCall,
        delayed: &mut Vec<TaskProxy>,
    ) -> Result<(), Error> {
        let template = self
            .templates
            .get(&call.template)
            .ok_or_else(|| Error::MissingTemplate(call.template.clone()))?;
        for env in call.argument_sets() {
            self.enqueue(template.substitute(&env), delayed)?;
        }
        Ok(())
    }

    /// Registers a task whose targets are concrete; a task whose targets
    /// still mention variables waits for the deferred phase.
    fn enqueue(&self, proxy: TaskProxy, delayed: &mut Vec<TaskProxy>) -> Result<(), Error> {
        if gather_args(&proxy.all_targets()).is_empty() {
            self.db.add(TemplateTask::node(proxy)?);
        } else {
            delayed.push(proxy);
        }
        Ok(())
    }
}
