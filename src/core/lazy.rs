// src/core/lazy.rs

//! The generic lazy evaluation engine.
//!
//! A [`LazyNode`] is a unit of deferred, memoized computation identified by
//! the identifiers it creates and the identifiers it requires. A [`LazyDb`]
//! indexes nodes by created identifier and drives recursive, cycle-checked,
//! concurrency-safe evaluation: dependencies of a node are launched
//! concurrently, concurrent requesters of the same node collapse into a
//! single execution, and an action may hand back another node to continue
//! through (the trampoline), which is how task templates materialize into
//! concrete tasks.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::future::{BoxFuture, join_all};
use tokio::sync::Mutex as ExecutionLock;

use crate::core::errors::Error;
use crate::core::result::{Failure, Outcome};

/// Behavior of a node kind within the lazy engine.
pub trait NodeType: Send + Sync + Sized + 'static {
    /// Identifier nodes are indexed by.
    type Id: Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static;
    /// Value a completed node evaluates to.
    type Value: Clone + Send + Sync + 'static;
    /// Shared context handed to every action, typically the owning database.
    type Ctx: Sync;

    /// Performs this node's action, after all requirements resolved. An
    /// `Err(Error::Task(_))` is memoized as a per-node failure; any other
    /// error is fatal and aborts the whole evaluation.
    fn run<'a>(
        &'a self,
        node: &'a LazyNode<Self>,
        ctx: &'a Self::Ctx,
    ) -> BoxFuture<'a, Result<Step<Self>, Error>>;

    /// Consulted when an identifier has no producing node. Returning `None`
    /// yields a [`Failure::Missing`].
    fn on_missing(_id: &Self::Id, _ctx: &Self::Ctx) -> Option<LazyNode<Self>> {
        None
    }
}

/// What one action evaluated to: a final value, or another node to continue
/// evaluating through in its place.
pub enum Step<T: NodeType> {
    Value(T::Value),
    Node(Arc<LazyNode<T>>),
}

impl<T: NodeType> Clone for Step<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Node(node) => Self::Node(node.clone()),
        }
    }
}

type Eval<T> = Result<Step<T>, Failure<<T as NodeType>::Id>>;

/// Identifiers on the current evaluation path, used for cycle detection.
type Trail<I> = Vec<I>;

/// A memoized unit of deferred computation.
///
/// Lifecycle: unrun, then running (execution lock held), then memoized with
/// either a value or a failure. [`LazyNode::reset`] returns it to unrun.
pub struct LazyNode<T: NodeType> {
    creates: Vec<T::Id>,
    requires: Vec<T::Id>,
    inner: T,
    lock: ExecutionLock<()>,
    memo: Mutex<Option<Eval<T>>>,
}

impl<T: NodeType> LazyNode<T> {
    pub fn new(creates: Vec<T::Id>, requires: Vec<T::Id>, inner: T) -> Self {
        Self {
            creates,
            requires,
            inner,
            lock: ExecutionLock::new(()),
            memo: Mutex::new(None),
        }
    }

    /// Identifiers this node produces.
    pub fn creates(&self) -> &[T::Id] {
        &self.creates
    }

    /// Identifiers this node depends on.
    pub fn requires(&self) -> &[T::Id] {
        &self.requires
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The memoized outcome, following continuation nodes through to their
    /// final value. `None` while the node has not completed.
    pub fn value(&self) -> Option<Outcome<T::Id, T::Value>> {
        let mut eval = self.memo()?;
        loop {
            match eval {
                Ok(Step::Value(value)) => return Some(Ok(value)),
                Ok(Step::Node(next)) => eval = next.memo()?,
                Err(failure) => return Some(Err(failure)),
            }
        }
    }

    /// Clears the memo slot so the node runs again on next request. Only
    /// meaningful between evaluations.
    pub fn reset(&self) {
        *self.memo.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn memo(&self) -> Option<Eval<T>> {
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn memoize(&self, eval: Eval<T>) {
        *self.memo.lock().unwrap_or_else(PoisonError::into_inner) = Some(eval);
    }

    async fn run_cached(
        &self,
        db: &LazyDb<T>,
        ctx: &T::Ctx,
        trail: &Trail<T::Id>,
    ) -> Result<Eval<T>, Error> {
        let _running = self.lock.lock().await;
        if let Some(eval) = self.memo() {
            return Ok(eval);
        }
        let eval = self.run_after_deps(db, ctx, trail).await?;
        self.memoize(eval.clone());
        Ok(eval)
    }

    async fn run_after_deps(
        &self,
        db: &LazyDb<T>,
        ctx: &T::Ctx,
        trail: &Trail<T::Id>,
    ) -> Result<Eval<T>, Error> {
        let results = join_all(
            self.requires
                .iter()
                .map(|dep| db.run_trailed(dep.clone(), ctx, trail.clone())),
        )
        .await;

        let mut failed = Vec::new();
        for (dep, result) in self.requires.iter().zip(results) {
            if let Err(failure) = result? {
                failed.push((dep.clone(), failure));
            }
        }
        if !failed.is_empty() {
            return Ok(Err(Failure::Dependencies(failed)));
        }

        match self.inner.run(self, ctx).await {
            Ok(step) => Ok(Ok(step)),
            Err(Error::Task(message)) => Ok(Err(Failure::Task(message))),
            Err(fatal) => Err(fatal),
        }
    }
}

/// Indexes nodes by the identifiers they create and coordinates running them.
pub struct LazyDb<T: NodeType> {
    nodes: RwLock<Vec<Arc<LazyNode<T>>>>,
    index: RwLock<HashMap<T::Id, Arc<LazyNode<T>>>>,
}

impl<T: NodeType> Default for LazyDb<T> {
    fn default() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: NodeType> LazyDb<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` under every identifier it creates. A later
    /// registration for the same identifier overwrites the earlier one.
    pub fn add(&self, node: LazyNode<T>) -> Arc<LazyNode<T>> {
        log::debug!("adding node creating {:?}", node.creates());
        let node = Arc::new(node);
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(node.clone());
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        for id in node.creates() {
            index.insert(id.clone(), node.clone());
        }
        node
    }

    pub fn get(&self, id: &T::Id) -> Option<Arc<LazyNode<T>>> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// A snapshot of the current index.
    pub fn entries(&self) -> Vec<(T::Id, Arc<LazyNode<T>>)> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect()
    }

    /// Evaluates the node producing `id`, memoized and cycle-checked.
    ///
    /// The outer `Result` carries fatal errors (cycles, configuration
    /// mistakes); the inner [`Outcome`] carries per-node failures.
    pub async fn run(&self, id: T::Id, ctx: &T::Ctx) -> Result<Outcome<T::Id, T::Value>, Error> {
        self.run_trailed(id, ctx, Trail::new()).await
    }

    fn run_trailed<'a>(
        &'a self,
        id: T::Id,
        ctx: &'a T::Ctx,
        mut trail: Trail<T::Id>,
    ) -> BoxFuture<'a, Result<Outcome<T::Id, T::Value>, Error>> {
        Box::pin(async move {
            if let Some(start) = trail.iter().position(|seen| *seen == id) {
                let cycle = trail[start..].iter().map(ToString::to_string).collect();
                return Err(Error::Cycle(cycle));
            }
            trail.push(id.clone());

            let mut node = match self.get(&id) {
                Some(node) => node,
                None => match T::on_missing(&id, ctx) {
                    Some(node) => Arc::new(node),
                    None => return Ok(Err(Failure::Missing(id))),
                },
            };

            loop {
                match node.run_cached(self, ctx, &trail).await? {
                    Ok(Step::Value(value)) => return Ok(Ok(value)),
                    Ok(Step::Node(next)) => node = next,
                    Err(failure) => return Ok(Err(failure)),
                }
            }
        })
    }

    /// Clears every node's memo slot, forcing re-evaluation on next request.
    pub fn reset(&self) {
        for node in self
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            node.reset();
        }
    }

    /// Drops all nodes and the index.
    pub fn clean(&self) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A toy node kind: literal numbers and counted sums over dependencies.
    enum Calc {
        Lit(i64),
        Sum(Arc<AtomicUsize>),
        Boom,
        Indirect(i64),
    }

    impl NodeType for Calc {
        type Id = String;
        type Value = i64;
        type Ctx = LazyDb<Calc>;

        fn run<'a>(
            &'a self,
            node: &'a LazyNode<Self>,
            ctx: &'a LazyDb<Calc>,
        ) -> BoxFuture<'a, Result<Step<Self>, Error>> {
            Box::pin(async move {
                match self {
                    Calc::Lit(value) => Ok(Step::Value(*value)),
                    Calc::Sum(count) => {
                        count.fetch_add(1, Ordering::SeqCst);
                        let mut total = 0;
                        for dep in node.requires() {
                            match ctx.get(dep).and_then(|n| n.value()) {
                                Some(Ok(value)) => total += value,
                                _ => {
                                    return Err(Error::Task(format!(
                                        "dependency `{dep}` unavailable"
                                    )));
                                }
                            }
                        }
                        Ok(Step::Value(total))
                    }
                    Calc::Boom => Err(Error::Task("boom".into())),
                    Calc::Indirect(value) => Ok(Step::Node(Arc::new(LazyNode::new(
                        vec![],
                        vec![],
                        Calc::Lit(*value),
                    )))),
                }
            })
        }
    }

    fn lit(db: &LazyDb<Calc>, id: &str, value: i64) {
        db.add(LazyNode::new(vec![id.into()], vec![], Calc::Lit(value)));
    }

    fn sum(db: &LazyDb<Calc>, id: &str, deps: &[&str]) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        db.add(LazyNode::new(
            vec![id.into()],
            deps.iter().map(|d| d.to_string()).collect(),
            Calc::Sum(count.clone()),
        ));
        count
    }

    #[tokio::test]
    async fn test_values_flow_through_dependencies() {
        let db = LazyDb::new();
        lit(&db, "x", 3);
        lit(&db, "y", 5);
        sum(&db, "z", &["x", "y"]);
        let result = db.run("z".into(), &db).await.unwrap();
        assert_eq!(result, Ok(8));
    }

    #[tokio::test]
    async fn test_memoized_node_runs_exactly_once() {
        let db = LazyDb::new();
        lit(&db, "x", 1);
        let count = sum(&db, "shared", &["x"]);
        sum(&db, "a", &["shared"]);
        sum(&db, "b", &["shared"]);

        // Diamond: both sides requested concurrently share one execution.
        let results = join_all([
            db.run("a".to_string(), &db),
            db.run("b".to_string(), &db),
        ])
        .await;
        for result in results {
            assert_eq!(result.unwrap(), Ok(1));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_forces_reevaluation() {
        let db = LazyDb::new();
        lit(&db, "x", 2);
        let count = sum(&db, "y", &["x"]);
        db.run("y".to_string(), &db).await.unwrap().unwrap();
        db.run("y".to_string(), &db).await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        db.reset();
        db.run("y".to_string(), &db).await.unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_dependency_fails() {
        let db: LazyDb<Calc> = LazyDb::new();
        let result = db.run("ghost".to_string(), &db).await.unwrap();
        assert_eq!(result, Err(Failure::Missing("ghost".into())));
    }

    #[tokio::test]
    async fn test_failures_aggregate_through_dependents() {
        let db = LazyDb::new();
        db.add(LazyNode::new(vec!["bad".into()], vec![], Calc::Boom));
        sum(&db, "top", &["bad"]);
        let result = db.run("top".to_string(), &db).await.unwrap();
        match result {
            Err(Failure::Dependencies(deps)) => {
                assert_eq!(deps.len(), 1);
                assert_eq!(deps[0].0, "bad");
                assert_eq!(deps[0].1, Failure::Task("boom".into()));
            }
            other => panic!("expected a dependency failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cycle_detection_reports_the_cycle() {
        let db = LazyDb::new();
        sum(&db, "a", &["b"]);
        sum(&db, "b", &["c"]);
        sum(&db, "c", &["a"]);
        match db.run("a".to_string(), &db).await {
            Err(Error::Cycle(cycle)) => assert_eq!(cycle, vec!["a", "b", "c"]),
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trampoline_continues_through_returned_nodes() {
        let db = LazyDb::new();
        db.add(LazyNode::new(
            vec!["indirect".into()],
            vec![],
            Calc::Indirect(42),
        ));
        let result = db.run("indirect".to_string(), &db).await.unwrap();
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_last_registration_wins_on_collision() {
        let db = LazyDb::new();
        lit(&db, "x", 1);
        lit(&db, "x", 2);
        let result = db.run("x".to_string(), &db).await.unwrap();
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_clean_drops_all_nodes() {
        let db = LazyDb::new();
        lit(&db, "x", 1);
        db.clean();
        let result = db.run("x".to_string(), &db).await.unwrap();
        assert_eq!(result, Err(Failure::Missing("x".into())));
    }
}
