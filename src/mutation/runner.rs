//! Mutation runner.
//!
//! A coordinator task owns the state stream and applies the configured
//! [`MapOperator`] to incoming calls. Each call runs in its own task through
//! the retrying execution wrapper and reports back to the coordinator.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream;
use futures::{FutureExt, StreamExt};
use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{MapOperator, MutationState, MutationStatus};
use crate::cache::ClientConfig;
use crate::error::{BoxError, QueryError};
use crate::gate::{NetworkGate, NetworkMode};
use crate::query::ExecutionEvent;
use crate::query::RetryPolicy;
use crate::query::retry::Retryer;

const METRIC_MUTATION_TOTAL: &str = "querycache_mutation_total";

/// User function performing one mutation.
pub type MutationFn<V, D> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<D, BoxError>> + Send + Sync>;

type Reply<D> = oneshot::Sender<Result<Arc<D>, QueryError>>;

#[derive(Debug, Clone)]
pub struct MutationOptions {
    pub map_operator: MapOperator,
    /// Mutations do not retry unless asked to.
    pub retry: RetryPolicy,
    pub retry_delay: Duration,
    pub network_mode: NetworkMode,
    /// How long the state stream outlives the last handle.
    pub gc_time: Duration,
}

impl Default for MutationOptions {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            map_operator: MapOperator::Merge,
            retry: RetryPolicy::Never,
            retry_delay: Duration::ZERO,
            network_mode: defaults.network_mode,
            gc_time: defaults.mutation_gc_time(),
        }
    }
}

impl MutationOptions {
    pub fn with_config(mut self, config: &ClientConfig) -> Self {
        self.network_mode = config.network_mode;
        self.gc_time = config.mutation_gc_time();
        self
    }

    pub fn with_map_operator(mut self, map_operator: MapOperator) -> Self {
        self.map_operator = map_operator;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = network_mode;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }
}

enum Command<V, D> {
    Mutate { variables: V, reply: Reply<D> },
    Reset,
}

struct Update<D> {
    execution: u64,
    event: ExecutionEvent<D>,
}

/// Call waiting behind the running one under `concat`.
struct Queued<V, D> {
    variables: V,
    reply: Reply<D>,
    attached: bool,
}

struct Running {
    id: Uuid,
    abort: AbortHandle,
    /// Detached executions finish but no longer drive the state.
    attached: bool,
}

/// Handle on a mutation. Clones share the same coordinator and state.
pub struct MutationRunner<V, D> {
    commands: mpsc::UnboundedSender<Command<V, D>>,
    state: watch::Receiver<MutationState<V, D>>,
}

impl<V, D> Clone for MutationRunner<V, D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl<V, D> MutationRunner<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Start a runner for `mutation_fn`. Must be called within a Tokio runtime.
    pub fn new<F, Fut, E>(mutation_fn: F, options: MutationOptions, gate: NetworkGate) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<D, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let mutation_fn: MutationFn<V, D> = Arc::new(move |variables: V| {
            let fut = mutation_fn(variables);
            async move { fut.await.map_err(Into::<BoxError>::into) }.boxed()
        });

        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(MutationState::default());

        let coordinator = Coordinator {
            mutation_fn,
            options,
            gate,
            commands,
            updates_tx,
            updates,
            state: state_tx,
            running: HashMap::new(),
            queue: VecDeque::new(),
            next_execution: 0,
        };
        tokio::spawn(coordinator.run());

        Self {
            commands: commands_tx,
            state,
        }
    }

    /// Submit a call. The call is registered immediately; the returned
    /// future resolves with its outcome, or [`QueryError::Cancelled`] when
    /// the call was dropped by `switch` or `reset`.
    pub fn mutate(
        &self,
        variables: V,
    ) -> impl Future<Output = Result<Arc<D>, QueryError>> + Send + 'static + use<V, D> {
        let (reply, outcome) = oneshot::channel();
        let _ = self.commands.send(Command::Mutate { variables, reply });
        async move { outcome.await.unwrap_or(Err(QueryError::Cancelled)) }
    }

    /// Return to idle. Under `concat` the running call and the one queued
    /// right behind it finish detached and later calls are dropped; otherwise
    /// running calls are cancelled.
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    pub fn state(&self) -> MutationState<V, D> {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MutationState<V, D>> {
        self.state.clone()
    }

    /// Wait for the first state satisfying `predicate`, starting with the
    /// current one.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&MutationState<V, D>) -> bool,
    ) -> MutationState<V, D> {
        let mut states = self.state.clone();
        match states.wait_for(predicate).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }
}

struct Coordinator<V, D> {
    mutation_fn: MutationFn<V, D>,
    options: MutationOptions,
    gate: NetworkGate,
    commands: mpsc::UnboundedReceiver<Command<V, D>>,
    updates_tx: mpsc::UnboundedSender<Update<D>>,
    updates: mpsc::UnboundedReceiver<Update<D>>,
    state: watch::Sender<MutationState<V, D>>,
    running: HashMap<u64, Running>,
    queue: VecDeque<Queued<V, D>>,
    next_execution: u64,
}

impl<V, D> Coordinator<V, D>
where
    V: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut accepting = true;
        loop {
            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(Command::Mutate { variables, reply }) => self.submit(variables, reply),
                    Some(Command::Reset) => self.reset(),
                    None => accepting = false,
                },
                Some(update) = self.updates.recv() => self.apply(update),
            }

            if !accepting && self.running.is_empty() && self.queue.is_empty() {
                break;
            }
        }

        debug!(
            operator = %self.options.map_operator,
            gc_ms = self.options.gc_time.as_millis() as u64,
            "Mutation runner released, state kept for gc time"
        );
        tokio::time::sleep(self.options.gc_time).await;
    }

    fn submit(&mut self, variables: V, reply: Reply<D>) {
        counter!(METRIC_MUTATION_TOTAL, "operator" => self.options.map_operator.as_str())
            .increment(1);
        match self.options.map_operator {
            MapOperator::Merge => self.start(variables, reply, true),
            MapOperator::Concat => {
                if self.running.is_empty() {
                    self.start(variables, reply, true);
                } else {
                    debug!(queued = self.queue.len() + 1, "Mutation queued");
                    self.queue.push_back(Queued {
                        variables,
                        reply,
                        attached: true,
                    });
                }
            }
            MapOperator::Switch => {
                self.cancel_running("superseded");
                self.start(variables, reply, true);
            }
        }
    }

    /// Spawn one call. Detached calls run to completion without touching
    /// the observable state.
    fn start(&mut self, variables: V, reply: Reply<D>, attached: bool) {
        let execution = self.next_execution;
        self.next_execution += 1;
        let id = Uuid::new_v4();
        if attached {
            self.state.send_replace(MutationState::pending(variables.clone()));
        }

        let retryer = Retryer {
            policy: self.options.retry.clone(),
            delay: self.options.retry_delay,
            network_mode: self.options.network_mode,
            gate: self.gate.clone(),
            label: format!("mutation:{id}"),
        };
        let mutation_fn = Arc::clone(&self.mutation_fn);
        let mut events = retryer.run(Box::new(move || {
            stream::once(mutation_fn(variables.clone())).boxed()
        }));

        let updates = self.updates_tx.clone();
        let handle = tokio::spawn(async move {
            let mut outcome = Err(QueryError::Cancelled);
            while let Some(event) = events.next().await {
                match &event {
                    ExecutionEvent::Value(data) => outcome = Ok(Arc::clone(data)),
                    ExecutionEvent::Failed(error) => outcome = Err(error.clone()),
                    _ => {}
                }
                let _ = updates.send(Update { execution, event });
            }
            let _ = updates.send(Update {
                execution,
                event: ExecutionEvent::Complete,
            });
            let _ = reply.send(outcome);
        });

        debug!(execution_id = %id, operator = %self.options.map_operator, attached, "Mutation started");
        self.running.insert(
            execution,
            Running {
                id,
                abort: handle.abort_handle(),
                attached,
            },
        );
    }

    fn apply(&mut self, update: Update<D>) {
        let Some(running) = self.running.get(&update.execution) else {
            return;
        };
        let attached = running.attached;
        let id = running.id;

        match update.event {
            ExecutionEvent::Complete => {
                self.running.remove(&update.execution);
                if self.options.map_operator == MapOperator::Concat {
                    if let Some(next) = self.queue.pop_front() {
                        self.start(next.variables, next.reply, next.attached);
                    }
                }
            }
            _ if !attached => {}
            ExecutionEvent::Value(data) => {
                info!(execution_id = %id, "Mutation succeeded");
                self.state.send_modify(|state| {
                    state.status = MutationStatus::Success;
                    state.data = Some(data);
                    state.error = None;
                    state.failure_count = 0;
                    state.failure_reason = None;
                });
            }
            ExecutionEvent::Failed(error) => {
                warn!(execution_id = %id, error = %error, "Mutation failed");
                self.state.send_modify(|state| {
                    state.status = MutationStatus::Error;
                    state.error = Some(error.clone());
                    state.failure_count += 1;
                    state.failure_reason = Some(error);
                });
            }
            ExecutionEvent::Retry {
                failure_count,
                error,
            } => {
                self.state.send_modify(|state| {
                    state.failure_count = failure_count;
                    state.failure_reason = Some(error);
                });
            }
            ExecutionEvent::Paused => {
                self.state
                    .send_modify(|state| state.status = MutationStatus::Paused);
            }
            ExecutionEvent::Resumed => {
                self.state
                    .send_modify(|state| state.status = MutationStatus::Pending);
            }
        }
    }

    fn reset(&mut self) {
        debug!(operator = %self.options.map_operator, "Mutation reset");
        self.state.send_replace(MutationState::default());
        match self.options.map_operator {
            MapOperator::Concat => {
                // The head of the queue is already committed behind the
                // running call. Dropping the other replies resolves those
                // calls as cancelled.
                self.queue.truncate(1);
                for queued in self.queue.iter_mut() {
                    queued.attached = false;
                }
                for running in self.running.values_mut() {
                    running.attached = false;
                }
            }
            MapOperator::Merge | MapOperator::Switch => self.cancel_running("reset"),
        }
    }

    fn cancel_running(&mut self, reason: &'static str) {
        for (_, running) in self.running.drain() {
            debug!(execution_id = %running.id, reason, "Mutation cancelled");
            running.abort.abort();
        }
    }
}
