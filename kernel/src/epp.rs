// Event Processing Point
//
// Obligations react to successful operations: each rule names the events
// it matches and the operation calls to run, as the obligation's author,
// in response.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::log::Revision;
use crate::pdp::{ancestors, Args, OperationCall, PolicyError, UserContext};
use crate::service::RpcError;
use crate::state::{lock, PolicyStore};
use crate::write::{WriteCoordinator, WriteError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObligationRule {
    pub name: String,
    #[serde(default)]
    pub event: EventPattern,
    pub response: Vec<OperationCall>,
}

/// Which events a rule reacts to. Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPattern {
    #[serde(default)]
    pub operations: Vec<String>,
    /// User or user-attribute names; a user matches through its ancestors.
    #[serde(default)]
    pub users: Vec<String>,
}

impl EventPattern {
    pub fn matches(&self, store: &dyn PolicyStore, ctx: &EventContext) -> bool {
        let operation_matches =
            self.operations.is_empty() || self.operations.iter().any(|op| *op == ctx.operation);
        if !operation_matches {
            return false;
        }
        if self.users.is_empty() {
            return true;
        }

        let Some(user) = store.node_by_name(&ctx.user.user) else {
            return false;
        };
        let scope = ancestors(store, user.id);
        self.users.iter().any(|name| {
            store
                .node_by_name(name)
                .is_some_and(|node| scope.contains(&node.id))
        })
    }
}

/// Parse obligation rules: a single rule object or a list of them.
pub fn parse_rules_value(value: &Value) -> Result<Vec<ObligationRule>, PolicyError> {
    let parsed = if value.is_array() {
        serde_json::from_value::<Vec<ObligationRule>>(value.clone())
    } else {
        serde_json::from_value::<ObligationRule>(value.clone()).map(|rule| vec![rule])
    };
    parsed.map_err(|err| PolicyError::InvalidObligation(err.to_string()))
}

pub fn parse_rules(text: &str) -> Result<Vec<ObligationRule>, PolicyError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| PolicyError::InvalidObligation(err.to_string()))?;
    parse_rules_value(&value)
}

/// A completed operation, as seen by obligations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub user: UserContext,
    pub operation: String,
    #[serde(default)]
    pub args: Args,
}

impl EventContext {
    pub fn new(user: UserContext, operation: impl Into<String>, args: Args) -> Self {
        Self {
            user,
            operation: operation.into(),
            args,
        }
    }
}

/// Calls one matched rule asks for, attributed to the obligation's author.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub obligation: String,
    pub rule: String,
    pub author: UserContext,
    pub calls: Vec<OperationCall>,
}

/// Every response triggered by `ctx`, in obligation and rule order.
pub fn matching_responses(store: &dyn PolicyStore, ctx: &EventContext) -> Vec<Response> {
    let mut responses = Vec::new();
    for obligation in store.obligations() {
        let rules = match parse_rules(&obligation.rules) {
            Ok(rules) => rules,
            Err(err) => {
                tracing::warn!("skipping obligation {}: {err}", obligation.name);
                continue;
            }
        };
        let Some(author) = store.node(obligation.author) else {
            tracing::warn!(
                "skipping obligation {}: author {} is gone",
                obligation.name,
                obligation.author
            );
            continue;
        };

        for rule in rules {
            if rule.event.matches(store, ctx) {
                responses.push(Response {
                    obligation: obligation.name.clone(),
                    rule: rule.name,
                    author: UserContext::new(author.name.clone()),
                    calls: rule.response,
                });
            }
        }
    }
    responses
}

/// Runs obligation responses through the writer.
pub struct Epp<S> {
    writer: Arc<WriteCoordinator<S>>,
}

impl<S: PolicyStore> Epp<S> {
    pub fn new(writer: Arc<WriteCoordinator<S>>) -> Self {
        Self { writer }
    }

    /// Adjudicate every response `ctx` triggers, each as its own batch.
    ///
    /// Returns the last revision appended, `0` when nothing matched. A denied
    /// response is logged and skipped; infrastructure failures abort.
    pub fn process_event(&self, ctx: &EventContext) -> Result<Revision, WriteError> {
        self.writer.settle()?;
        let responses = {
            let store = lock(self.writer.store());
            matching_responses(&*store, ctx)
        };

        let mut last = 0;
        for response in responses {
            match self.writer.adjudicate_routine(&response.author, &response.calls) {
                Ok(outcome) => last = last.max(outcome.revision),
                Err(WriteError::Policy(err)) => tracing::warn!(
                    "obligation {} rule {} rejected: {err}",
                    response.obligation,
                    response.rule
                ),
                Err(err) => return Err(err),
            }
        }
        Ok(last)
    }
}

/// Destination for event contexts handled off the caller's thread.
pub trait EventSink: Send + Sync {
    fn deliver(&self, ctx: &EventContext) -> Result<Revision, RpcError>;
}

impl<S: PolicyStore> EventSink for Epp<S> {
    fn deliver(&self, ctx: &EventContext) -> Result<Revision, RpcError> {
        Ok(self.process_event(ctx)?)
    }
}

/// Background worker draining event contexts into a sink.
pub struct AsyncEventQueue {
    tx: Option<Sender<EventContext>>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncEventQueue {
    pub fn spawn(sink: Arc<dyn EventSink>) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded::<EventContext>();
        let worker = thread::Builder::new()
            .name("epp-worker".into())
            .spawn(move || {
                for ctx in rx {
                    if let Err(err) = sink.deliver(&ctx) {
                        tracing::warn!(
                            "event {} from {} not processed: {err}",
                            ctx.operation,
                            ctx.user.user
                        );
                    }
                }
            })?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn submit(&self, ctx: EventContext) {
        let sent = self.tx.as_ref().is_some_and(|tx| tx.send(ctx).is_ok());
        if !sent {
            tracing::warn!("event queue closed; dropping event");
        }
    }

    /// Stop accepting events and wait for queued ones to drain.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for AsyncEventQueue {
    fn drop(&mut self) {
        self.close();
    }
}
