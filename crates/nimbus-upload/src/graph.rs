//! Dependency graph of cancellable operations, run by a bounded scheduler.
//!
//! Nodes are added in topological order (a node may only depend on nodes
//! added before it), so insertion order is a valid execution order and its
//! reverse is the most-dependent-first cancellation order.
//!
//! Scheduling rules:
//! - a node starts once all of its dependencies have succeeded
//! - at most `max_in_flight` nodes run at once
//! - after the first failure nothing new starts; in-flight nodes finish
//! - cancelling the graph cancels every unfinished node, most dependent first

use std::sync::Arc;

use async_trait::async_trait;
use nimbus_core::{NimbusError, NimbusResult};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait UploadOperation: Send + Sync {
    fn label(&self) -> String;

    /// Check `cancel` at safe points; return `NimbusError::Canceled` when it fires.
    async fn run(&self, cancel: CancellationToken) -> NimbusResult<()>;
}

pub type OpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

struct Node {
    op: Arc<dyn UploadOperation>,
    deps: Vec<OpId>,
    token: CancellationToken,
    state: NodeState,
}

/// What happened to each node, for callers and tests.
#[derive(Debug, Default, Clone)]
pub struct GraphReport {
    pub succeeded: Vec<OpId>,
    pub failed: Vec<OpId>,
    /// Nodes whose token was cancelled, in cancellation order
    pub cancelled: Vec<OpId>,
    pub never_started: Vec<OpId>,
}

#[derive(Default)]
pub struct OperationGraph {
    nodes: Vec<Node>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node. Every dependency must already be in the graph.
    pub fn add(&mut self, op: Arc<dyn UploadOperation>, deps: &[OpId]) -> NimbusResult<OpId> {
        let id = self.nodes.len();
        if let Some(bad) = deps.iter().find(|d| **d >= id) {
            return Err(NimbusError::local_state(format!(
                "operation {} depends on unknown node {bad}",
                op.label()
            )));
        }
        self.nodes.push(Node {
            op,
            deps: deps.to_vec(),
            token: CancellationToken::new(),
            state: NodeState::Pending,
        });
        Ok(id)
    }

    fn ready(&self) -> Vec<OpId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.state == NodeState::Pending)
            .filter(|(_, n)| {
                n.deps
                    .iter()
                    .all(|d| self.nodes[*d].state == NodeState::Succeeded)
            })
            .map(|(i, _)| i)
            .collect()
    }

    fn cancel_unfinished(&self, report: &mut GraphReport) {
        for (id, node) in self.nodes.iter().enumerate().rev() {
            if matches!(node.state, NodeState::Pending | NodeState::Running) {
                node.token.cancel();
                report.cancelled.push(id);
            }
        }
    }

    /// Run to completion. Returns the first error, if any, with the report.
    pub async fn run(
        mut self,
        max_in_flight: usize,
        cancel: CancellationToken,
    ) -> (NimbusResult<()>, GraphReport) {
        let max_in_flight = max_in_flight.max(1);
        let mut report = GraphReport::default();
        let mut first_error: Option<NimbusError> = None;
        let mut stopped = false;
        let mut join_set: JoinSet<(OpId, NimbusResult<()>)> = JoinSet::new();

        loop {
            if !stopped && cancel.is_cancelled() {
                stopped = true;
                first_error.get_or_insert(NimbusError::Canceled);
                self.cancel_unfinished(&mut report);
            }
            if !stopped {
                for id in self.ready() {
                    if join_set.len() >= max_in_flight {
                        break;
                    }
                    let node = &mut self.nodes[id];
                    node.state = NodeState::Running;
                    let op = node.op.clone();
                    let token = node.token.clone();
                    tracing::trace!(op = %op.label(), "operation started");
                    join_set.spawn(async move { (id, op.run(token).await) });
                }
            }
            if join_set.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !stopped => continue,
                joined = join_set.join_next() => joined,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((id, Ok(()))) => {
                    self.nodes[id].state = NodeState::Succeeded;
                    report.succeeded.push(id);
                }
                Ok((id, Err(e))) => {
                    self.nodes[id].state = NodeState::Failed;
                    report.failed.push(id);
                    if !matches!(e, NimbusError::Canceled) || first_error.is_none() {
                        tracing::debug!(op = %self.nodes[id].op.label(), error = %e, "operation failed");
                    }
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    stopped = true;
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(NimbusError::local_state(format!(
                            "operation task panicked: {join_err}"
                        )));
                    }
                    stopped = true;
                }
            }
        }

        report.never_started = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.state == NodeState::Pending)
            .map(|(i, _)| i)
            .collect();

        let result = match first_error {
            Some(e) => Err(e),
            None if report.never_started.is_empty() => Ok(()),
            None => Err(NimbusError::local_state(format!(
                "{} operations never became ready",
                report.never_started.len()
            ))),
        };
        (result, report)
    }
}
