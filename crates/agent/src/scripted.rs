//! In-memory completion client for tests and offline dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rehearse_core::{CompletionError, OutputKind, RawResponse};
use serde_json::Value;

use crate::llm::{CompletionClient, CompletionRequest};

#[derive(Clone, Debug)]
pub struct ScriptedReply {
    pub delay: Duration,
    pub result: Result<Value, CompletionError>,
}

impl ScriptedReply {
    pub fn payload(payload: Value) -> Self {
        Self { delay: Duration::ZERO, result: Ok(payload) }
    }

    pub fn error(error: CompletionError) -> Self {
        Self { delay: Duration::ZERO, result: Err(error) }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Script {
    replies: BTreeMap<OutputKind, VecDeque<ScriptedReply>>,
    requests: BTreeMap<OutputKind, Vec<CompletionRequest>>,
}

/// Replies are queued per output kind and consumed in order. The last reply
/// of a queue repeats once the queue runs dry; a kind with no script at all
/// fails fatally.
#[derive(Clone, Default)]
pub struct ScriptedCompletionClient {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCompletionClient {
    pub fn with_reply(self, kind: OutputKind, reply: ScriptedReply) -> Self {
        self.push(kind, reply);
        self
    }

    pub fn push(&self, kind: OutputKind, reply: ScriptedReply) {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.replies.entry(kind).or_default().push_back(reply);
    }

    pub fn calls(&self, kind: OutputKind) -> usize {
        self.requests(kind).len()
    }

    pub fn requests(&self, kind: OutputKind) -> Vec<CompletionRequest> {
        let script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.requests.get(&kind).cloned().unwrap_or_default()
    }

    fn next_reply(&self, request: &CompletionRequest) -> Option<ScriptedReply> {
        let kind = request.schema.kind;
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        script.requests.entry(kind).or_default().push(request.clone());
        let queue = script.replies.get_mut(&kind)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<RawResponse, CompletionError> {
        let Some(reply) = self.next_reply(request) else {
            return Err(CompletionError::Fatal(format!(
                "no scripted reply for {}",
                request.schema.kind.schema_name()
            )));
        };
        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        reply.result.map(|payload| RawResponse::new(request.schema.kind, payload))
    }
}
