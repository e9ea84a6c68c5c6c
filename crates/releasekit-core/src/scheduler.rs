use crate::errors::{ReleaseKitError, Result};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore, watch};

/// Backoff ceiling for transient retries.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Node lifecycle inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    Blocked,
    Cancelled,
}

/// Scheduler-level lifecycle reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Running,
    Paused,
    Cancelling,
    Finished,
}

/// Narrow observer interface; all callbacks have no-op defaults.
pub trait SchedulerObserver: Send + Sync {
    fn on_state_change(&self, _package: &str, _state: NodeState) {}
    fn on_retry(&self, _package: &str, _attempt: u32, _delay: Duration) {}
    fn on_scheduler_state(&self, _state: SchedulerState) {}
}

struct NoopObserver;
impl SchedulerObserver for NoopObserver {}

#[derive(Debug)]
struct Node {
    remaining_deps: usize,
    dependents: Vec<String>,
    dependencies: Vec<String>,
    state: NodeState,
    attempts: u32,
    blocked_by: Option<String>,
    error: Option<String>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    ready: VecDeque<String>,
    done: BTreeSet<String>,
    /// Dynamically removed packages, consulted on dequeue.
    removed: BTreeSet<String>,
    skipped: BTreeSet<String>,
}

/// Final outcome of a scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerResult {
    pub done: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub blocked: Vec<(String, String)>,
    pub cancelled: Vec<String>,
    /// Seeded as already published; never dispatched.
    pub skipped: Vec<String>,
}

impl SchedulerResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.blocked.is_empty() && self.cancelled.is_empty()
    }
}

/// Dependency-triggered async queue.
///
/// Workers are cooperative tasks on one event loop, bounded by a
/// semaphore. Dependents dispatch the instant their last dependency
/// completes; siblings run concurrently up to the pool size.
pub struct Scheduler {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    observer: Arc<dyn SchedulerObserver>,
}

impl Scheduler {
    /// Build a scheduler over `deps` (package -> internal deps within the
    /// release set). Packages in `already_published` are seeded as done:
    /// they are never dispatched and their dependents start pre-decremented.
    pub fn new(
        deps: &BTreeMap<String, BTreeSet<String>>,
        already_published: &BTreeSet<String>,
        concurrency: usize,
        max_retries: u32,
    ) -> Self {
        Self::with_observer(
            deps,
            already_published,
            concurrency,
            max_retries,
            Arc::new(NoopObserver),
        )
    }

    pub fn with_observer(
        deps: &BTreeMap<String, BTreeSet<String>>,
        already_published: &BTreeSet<String>,
        concurrency: usize,
        max_retries: u32,
        observer: Arc<dyn SchedulerObserver>,
    ) -> Self {
        let mut inner = Inner::default();

        for (name, dep_set) in deps {
            let in_set: Vec<String> = dep_set
                .iter()
                .filter(|d| deps.contains_key(*d))
                .cloned()
                .collect();
            let remaining = in_set
                .iter()
                .filter(|d| !already_published.contains(*d))
                .count();
            inner.nodes.insert(
                name.clone(),
                Node {
                    remaining_deps: remaining,
                    dependents: Vec::new(),
                    dependencies: in_set,
                    state: NodeState::Pending,
                    attempts: 0,
                    blocked_by: None,
                    error: None,
                },
            );
        }
        // Reverse edges.
        let edges: Vec<(String, String)> = inner
            .nodes
            .iter()
            .flat_map(|(name, node)| {
                node.dependencies
                    .iter()
                    .map(|dep| (dep.clone(), name.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = inner.nodes.get_mut(&dep) {
                node.dependents.push(dependent);
            }
        }

        for name in already_published {
            if let Some(node) = inner.nodes.get_mut(name) {
                node.state = NodeState::Done;
                inner.done.insert(name.clone());
                inner.skipped.insert(name.clone());
            }
        }

        let seeds: Vec<String> = inner
            .nodes
            .iter()
            .filter(|(_, node)| node.state == NodeState::Pending && node.remaining_deps == 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in seeds {
            inner.mark_ready(&name);
        }

        let (pause_tx, pause_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Mutex::new(inner)),
            notify: Arc::new(Notify::new()),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            max_retries,
            pause_tx,
            pause_rx,
            cancel_tx,
            cancel_rx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            observer,
        }
    }

    /// Stop dequeueing new work; in-flight publishes finish.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
        self.observer.on_scheduler_state(SchedulerState::Paused);
    }

    /// Reopen the gate.
    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
        self.observer.on_scheduler_state(SchedulerState::Running);
        self.notify.notify_one();
    }

    /// Request cooperative cancellation. In-flight tasks receive the
    /// signal at their next suspension point.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        self.observer.on_scheduler_state(SchedulerState::Cancelling);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Wire a new package into the running graph. Dependencies already
    /// done are pre-counted; a package with none left enqueues at once.
    pub fn add_package(&self, name: &str, deps: &[String]) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        if inner.nodes.contains_key(name) {
            return;
        }
        let in_set: Vec<String> = deps
            .iter()
            .filter(|d| inner.nodes.contains_key(*d))
            .cloned()
            .collect();
        let remaining = in_set.iter().filter(|d| !inner.done.contains(*d)).count();
        for dep in &in_set {
            if let Some(node) = inner.nodes.get_mut(dep) {
                node.dependents.push(name.to_string());
            }
        }
        inner.nodes.insert(
            name.to_string(),
            Node {
                remaining_deps: remaining,
                dependents: Vec::new(),
                dependencies: in_set,
                state: NodeState::Pending,
                attempts: 0,
                blocked_by: None,
                error: None,
            },
        );
        if remaining == 0 {
            inner.mark_ready(name);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Remove a package from the run. Consulted on dequeue: an in-flight
    /// publish is not interrupted. With `block_dependents`, everything
    /// downstream transitions to blocked; otherwise dependents proceed as
    /// if the package had completed.
    pub fn remove_package(&self, name: &str, block_dependents: bool) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        inner.removed.insert(name.to_string());
        if block_dependents {
            inner.block_dependents(name, &*self.observer);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Idempotent completion: double-marking is a no-op.
    pub fn mark_done(&self, name: &str) {
        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        inner.complete(name, &*self.observer);
        drop(inner);
        self.notify.notify_one();
    }

    /// Drive the queue to completion. `publish_fn` runs once per package;
    /// transient errors retry with exponential backoff plus full jitter.
    pub async fn run<F, Fut>(&self, publish_fn: F) -> SchedulerResult
    where
        F: Fn(String) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.observer.on_scheduler_state(SchedulerState::Running);

        loop {
            if self.is_cancelled() {
                break;
            }

            // Pause gate: no new dequeue while closed. Cloned receivers
            // mark the current value as seen, so re-check before waiting
            // to avoid missing a resume or cancel that already landed.
            if *self.pause_rx.borrow() {
                let mut pause_rx = self.pause_rx.clone();
                let mut cancel_rx = self.cancel_rx.clone();
                if *pause_rx.borrow() && !*cancel_rx.borrow() {
                    tokio::select! {
                        _ = pause_rx.changed() => {}
                        _ = cancel_rx.changed() => {}
                    }
                }
                continue;
            }

            let next = {
                let mut inner = self.inner.lock().expect("scheduler state poisoned");
                inner.dequeue(&*self.observer)
            };

            match next {
                Some(package) => {
                    let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    let worker = Worker {
                        inner: Arc::clone(&self.inner),
                        notify: Arc::clone(&self.notify),
                        cancel_rx: self.cancel_rx.clone(),
                        in_flight: Arc::clone(&self.in_flight),
                        observer: Arc::clone(&self.observer),
                        max_retries: self.max_retries,
                    };
                    let publish_fn = publish_fn.clone();
                    tokio::spawn(async move {
                        worker.run_one(package, publish_fn).await;
                        drop(permit);
                    });
                }
                None => {
                    if self.in_flight.load(Ordering::SeqCst) == 0 {
                        let inner = self.inner.lock().expect("scheduler state poisoned");
                        let all_settled = inner.nodes.values().all(|n| {
                            !matches!(
                                n.state,
                                NodeState::Pending | NodeState::Ready | NodeState::Running
                            )
                        });
                        let nothing_ready = inner.ready.is_empty();
                        drop(inner);
                        if all_settled {
                            break;
                        }
                        if nothing_ready {
                            // Remaining nodes are unreachable (deps removed
                            // without completion); settle them as blocked.
                            let mut inner =
                                self.inner.lock().expect("scheduler state poisoned");
                            inner.settle_unreachable(&*self.observer);
                            continue;
                        }
                    }
                    self.notify.notified().await;
                }
            }
        }

        // Drain in-flight workers (they observe the cancel flag themselves).
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            self.notify.notified().await;
        }

        if self.is_cancelled() {
            let mut inner = self.inner.lock().expect("scheduler state poisoned");
            inner.cancel_remaining(&*self.observer);
        }

        self.observer.on_scheduler_state(SchedulerState::Finished);
        self.collect_result()
    }

    fn collect_result(&self) -> SchedulerResult {
        let inner = self.inner.lock().expect("scheduler state poisoned");
        let mut result = SchedulerResult::default();
        for (name, node) in &inner.nodes {
            match node.state {
                NodeState::Done => {
                    if inner.skipped.contains(name) {
                        result.skipped.push(name.clone());
                    } else {
                        result.done.push(name.clone());
                    }
                }
                NodeState::Failed => result.failed.push((
                    name.clone(),
                    node.error.clone().unwrap_or_else(|| "failed".into()),
                )),
                NodeState::Blocked => result.blocked.push((
                    name.clone(),
                    node.blocked_by.clone().unwrap_or_else(|| "unknown".into()),
                )),
                NodeState::Cancelled => result.cancelled.push(name.clone()),
                NodeState::Pending | NodeState::Ready | NodeState::Running => {
                    result.cancelled.push(name.clone())
                }
            }
        }
        result
    }
}

struct Worker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    cancel_rx: watch::Receiver<bool>,
    in_flight: Arc<AtomicUsize>,
    observer: Arc<dyn SchedulerObserver>,
    max_retries: u32,
}

impl Worker {
    async fn run_one<F, Fut>(&self, package: String, publish_fn: F)
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let outcome = self.attempt_with_retries(&package, &publish_fn).await;

        let mut inner = self.inner.lock().expect("scheduler state poisoned");
        match outcome {
            Outcome::Success => inner.complete(&package, &*self.observer),
            Outcome::Cancelled => {
                inner.set_state(&package, NodeState::Cancelled, &*self.observer)
            }
            Outcome::Failed(error) => {
                inner.fail(&package, &error, &*self.observer);
            }
        }
        drop(inner);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn attempt_with_retries<F, Fut>(&self, package: &str, publish_fn: &F) -> Outcome
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<()>> + Send,
    {
        let mut attempt: u32 = 0;
        loop {
            if *self.cancel_rx.borrow() {
                return Outcome::Cancelled;
            }
            attempt += 1;
            {
                let mut inner = self.inner.lock().expect("scheduler state poisoned");
                if let Some(node) = inner.nodes.get_mut(package) {
                    node.attempts = attempt;
                }
            }

            let mut cancel_rx = self.cancel_rx.clone();
            let result = tokio::select! {
                result = publish_fn(package.to_string()) => result,
                _ = cancel_rx.changed() => return Outcome::Cancelled,
            };

            match result {
                Ok(()) => return Outcome::Success,
                Err(err) if err.is_transient() && attempt <= self.max_retries => {
                    let delay = backoff_with_jitter(attempt);
                    self.observer.on_retry(package, attempt, delay);
                    let mut cancel_rx = self.cancel_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel_rx.changed() => return Outcome::Cancelled,
                    }
                }
                Err(err) => return Outcome::Failed(err.to_string()),
            }
        }
    }
}

enum Outcome {
    Success,
    Cancelled,
    Failed(String),
}

/// Exponential backoff with full jitter, capped at the ceiling.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF.saturating_mul(1u32 << attempt.min(10).saturating_sub(1));
    let capped = exp.min(MAX_BACKOFF);
    let jittered = rand::thread_rng().gen_range(0..=capped.as_millis() as u64);
    Duration::from_millis(jittered)
}

impl Inner {
    fn mark_ready(&mut self, name: &str) {
        if let Some(node) = self.nodes.get_mut(name) {
            if node.state == NodeState::Pending {
                node.state = NodeState::Ready;
                self.ready.push_back(name.to_string());
            }
        }
    }

    fn dequeue(&mut self, observer: &dyn SchedulerObserver) -> Option<String> {
        while let Some(name) = self.ready.pop_front() {
            if self.removed.contains(&name) {
                // Removed while queued: settle it and release dependents.
                self.set_state(&name, NodeState::Cancelled, observer);
                self.release_dependents(&name, observer);
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&name) {
                if node.state == NodeState::Ready {
                    node.state = NodeState::Running;
                    observer.on_state_change(&name, NodeState::Running);
                    return Some(name);
                }
            }
        }
        None
    }

    /// Idempotent completion guarded by the done set.
    fn complete(&mut self, name: &str, observer: &dyn SchedulerObserver) {
        if self.done.contains(name) {
            return;
        }
        self.done.insert(name.to_string());
        self.set_state(name, NodeState::Done, observer);
        self.release_dependents(name, observer);
    }

    fn release_dependents(&mut self, name: &str, observer: &dyn SchedulerObserver) {
        let dependents = self
            .nodes
            .get(name)
            .map(|n| n.dependents.clone())
            .unwrap_or_default();
        for dependent in dependents {
            let became_ready = {
                let Some(node) = self.nodes.get_mut(&dependent) else {
                    continue;
                };
                node.remaining_deps = node.remaining_deps.saturating_sub(1);
                node.remaining_deps == 0 && node.state == NodeState::Pending
            };
            if became_ready {
                self.mark_ready(&dependent);
                observer.on_state_change(&dependent, NodeState::Ready);
            }
        }
    }

    fn fail(&mut self, name: &str, error: &str, observer: &dyn SchedulerObserver) {
        if let Some(node) = self.nodes.get_mut(name) {
            node.error = Some(error.to_string());
        }
        self.set_state(name, NodeState::Failed, observer);
        self.block_dependents(name, observer);
    }

    /// Every transitive dependent of a failed or removed package becomes
    /// blocked-by it and is never dispatched.
    fn block_dependents(&mut self, name: &str, observer: &dyn SchedulerObserver) {
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(name.to_string());
        while let Some(current) = queue.pop_front() {
            let dependents = self
                .nodes
                .get(&current)
                .map(|n| n.dependents.clone())
                .unwrap_or_default();
            for dependent in dependents {
                let newly_blocked = {
                    let Some(node) = self.nodes.get_mut(&dependent) else {
                        continue;
                    };
                    if matches!(node.state, NodeState::Pending | NodeState::Ready) {
                        node.state = NodeState::Blocked;
                        node.blocked_by = Some(name.to_string());
                        true
                    } else {
                        false
                    }
                };
                if newly_blocked {
                    observer.on_state_change(&dependent, NodeState::Blocked);
                    queue.push_back(dependent);
                }
            }
        }
    }

    fn set_state(&mut self, name: &str, state: NodeState, observer: &dyn SchedulerObserver) {
        if let Some(node) = self.nodes.get_mut(name) {
            if node.state != state {
                node.state = state;
                observer.on_state_change(name, state);
            }
        }
    }

    fn cancel_remaining(&mut self, observer: &dyn SchedulerObserver) {
        let names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| {
                matches!(
                    n.state,
                    NodeState::Pending | NodeState::Ready | NodeState::Running
                )
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.set_state(&name, NodeState::Cancelled, observer);
        }
    }

    /// Settle nodes that can never run because a dependency was removed
    /// from the run without completing.
    fn settle_unreachable(&mut self, observer: &dyn SchedulerObserver) {
        let names: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.state, NodeState::Pending))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(node) = self.nodes.get_mut(&name) {
                node.state = NodeState::Blocked;
                node.blocked_by = Some("unreachable dependency".to_string());
            }
            observer.on_state_change(&name, NodeState::Blocked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn deps(pairs: &[(&str, &[&str])]) -> BTreeMap<String, BTreeSet<String>> {
        pairs
            .iter()
            .map(|(name, ds)| {
                (
                    name.to_string(),
                    ds.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[derive(Default)]
    struct OrderRecorder {
        order: StdMutex<Vec<String>>,
    }

    impl OrderRecorder {
        fn record(&self, name: &str) {
            self.order.lock().unwrap().push(name.to_string());
        }
        fn snapshot(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn dependencies_run_before_dependents() {
        let graph = deps(&[
            ("core", &[]),
            ("plugin-b", &["core"]),
            ("plugin-c", &["core"]),
            ("app", &["plugin-b", "plugin-c"]),
        ]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 4, 0);
        let recorder = Arc::new(OrderRecorder::default());

        let rec = Arc::clone(&recorder);
        let result = scheduler
            .run(move |name| {
                let rec = Arc::clone(&rec);
                async move {
                    rec.record(&name);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_clean());
        assert_eq!(result.done.len(), 4);
        let order = recorder.snapshot();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("core") < pos("plugin-b"));
        assert!(pos("core") < pos("plugin-c"));
        assert!(pos("app") > pos("plugin-b") && pos("app") > pos("plugin-c"));
    }

    #[tokio::test]
    async fn permanent_failure_blocks_transitive_dependents() {
        let graph = deps(&[
            ("core", &[]),
            ("mid", &["core"]),
            ("app", &["mid"]),
            ("other", &[]),
        ]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 2, 0);

        let result = scheduler
            .run(|name| async move {
                if name == "core" {
                    Err(ReleaseKitError::Publish("build exploded".into()))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.done, vec!["other"]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].0, "core");
        let blocked: BTreeMap<_, _> = result.blocked.iter().cloned().collect();
        assert_eq!(blocked.get("mid").map(String::as_str), Some("core"));
        assert_eq!(blocked.get("app").map(String::as_str), Some("core"));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let graph = deps(&[("flaky", &[])]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 1, 5);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let result = scheduler
            .run(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ReleaseKitError::RegistryTransient("503".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_clean());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_retries_to_permanent() {
        let graph = deps(&[("flaky", &[])]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 1, 2);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let result = scheduler
            .run(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ReleaseKitError::RegistryTransient("poll timed out".into()))
                }
            })
            .await;

        // Initial attempt plus max_retries retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_never_retries() {
        let graph = deps(&[("broken", &[])]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 1, 5);
        let attempts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&attempts);
        let result = scheduler
            .run(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ReleaseKitError::Publish("payload rejected".into()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(result.failed.len(), 1);
    }

    #[tokio::test]
    async fn already_published_are_skipped_and_pre_decremented() {
        let graph = deps(&[("core", &[]), ("app", &["core"])]);
        let published: BTreeSet<String> = ["core".to_string()].into_iter().collect();
        let scheduler = Scheduler::new(&graph, &published, 2, 0);
        let recorder = Arc::new(OrderRecorder::default());

        let rec = Arc::clone(&recorder);
        let result = scheduler
            .run(move |name| {
                let rec = Arc::clone(&rec);
                async move {
                    rec.record(&name);
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.skipped, vec!["core"]);
        assert_eq!(result.done, vec!["app"]);
        assert_eq!(recorder.snapshot(), vec!["app"]);
    }

    #[tokio::test]
    async fn cancel_returns_partial_result() {
        let graph = deps(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        let scheduler = Arc::new(Scheduler::new(&graph, &BTreeSet::new(), 1, 0));

        let handle = Arc::clone(&scheduler);
        let result = scheduler
            .run(move |name| {
                let handle = Arc::clone(&handle);
                async move {
                    if name == "a" {
                        // Cancel while the first package is still in flight.
                        handle.cancel();
                    }
                    Ok(())
                }
            })
            .await;

        assert!(result.done.len() <= 1);
        assert!(!result.cancelled.is_empty());
    }

    #[tokio::test]
    async fn pause_gates_dequeue_and_resume_reopens() {
        let graph = deps(&[("a", &[]), ("b", &[])]);
        let scheduler = Arc::new(Scheduler::new(&graph, &BTreeSet::new(), 1, 0));

        scheduler.pause();
        let runner = Arc::clone(&scheduler);
        let task = tokio::spawn(async move { runner.run(|_| async { Ok(()) }).await });

        // Give the paused loop a moment; nothing should complete.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        scheduler.resume();
        let result = task.await.unwrap();
        assert_eq!(result.done.len(), 2);
    }

    #[tokio::test]
    async fn mark_done_is_idempotent() {
        let graph = deps(&[("a", &[]), ("b", &["a"])]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 1, 0);
        scheduler.mark_done("a");
        scheduler.mark_done("a");
        scheduler.mark_done("a");

        let result = scheduler.run(|_| async { Ok(()) }).await;
        // a completed externally exactly once; b ran.
        assert_eq!(result.done, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn dynamic_add_enqueues_when_deps_done() {
        let graph = deps(&[("a", &[])]);
        let scheduler = Arc::new(Scheduler::new(&graph, &BTreeSet::new(), 1, 0));

        let handle = Arc::clone(&scheduler);
        let result = scheduler
            .run(move |name| {
                let handle = Arc::clone(&handle);
                async move {
                    if name == "a" {
                        handle.add_package("late", &["a".to_string()]);
                    }
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.done, vec!["a", "late"]);
    }

    #[tokio::test]
    async fn dynamic_remove_skips_on_dequeue() {
        let graph = deps(&[("a", &[]), ("doomed", &["a"]), ("after", &["doomed"])]);
        let scheduler = Arc::new(Scheduler::new(&graph, &BTreeSet::new(), 1, 0));
        scheduler.remove_package("doomed", false);

        let result = scheduler.run(|_| async { Ok(()) }).await;
        assert!(result.done.contains(&"a".to_string()));
        // Removed without blocking: dependents proceed.
        assert!(result.done.contains(&"after".to_string()));
        assert!(result.cancelled.contains(&"doomed".to_string()));
    }

    #[tokio::test]
    async fn dynamic_remove_with_blocking_blocks_dependents() {
        let graph = deps(&[("a", &[]), ("doomed", &["a"]), ("after", &["doomed"])]);
        let scheduler = Arc::new(Scheduler::new(&graph, &BTreeSet::new(), 1, 0));
        scheduler.remove_package("doomed", true);

        let result = scheduler.run(|_| async { Ok(()) }).await;
        assert!(result.done.contains(&"a".to_string()));
        assert!(result.blocked.iter().any(|(name, by)| name == "after" && by == "doomed"));
    }

    #[tokio::test]
    async fn siblings_run_concurrently_within_pool() {
        let graph = deps(&[("s1", &[]), ("s2", &[]), ("s3", &[])]);
        let scheduler = Scheduler::new(&graph, &BTreeSet::new(), 3, 0);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let (peak_ref, current_ref) = (Arc::clone(&peak), Arc::clone(&current));
        let result = scheduler
            .run(move |_| {
                let peak = Arc::clone(&peak_ref);
                let current = Arc::clone(&current_ref);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(result.is_clean());
        assert!(peak.load(Ordering::SeqCst) > 1, "siblings should overlap");
    }

    #[test]
    fn backoff_respects_ceiling() {
        for attempt in 1..=20 {
            assert!(backoff_with_jitter(attempt) <= MAX_BACKOFF);
        }
    }
}
