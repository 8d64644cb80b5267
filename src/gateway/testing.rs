//! In-process gateway double for adapter tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Envelope, Gateway, GatewayRequest, Payload};
use crate::error::Cancelled;

/// Replies from a script keyed by request path and records every call.
///
/// Each path holds a queue of envelopes; the last queued envelope is sticky.
/// Unscripted paths answer 404.
#[derive(Default)]
pub struct ScriptedGateway {
    replies: Mutex<HashMap<String, VecDeque<Envelope>>>,
    calls: Mutex<Vec<GatewayRequest>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, path: &str, envelope: Envelope) -> Self {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(envelope);
        self
    }

    pub fn json(self, path: &str, status: u16, body: Value) -> Self {
        let envelope = Envelope::from_status(target(path), status, Some(Payload::Json(body)));
        self.reply(path, envelope)
    }

    pub fn status(self, path: &str, status: u16) -> Self {
        let envelope = Envelope::from_status(target(path), status, None);
        self.reply(path, envelope)
    }

    pub fn binary(self, path: &str, content_type: &str, bytes: &[u8]) -> Self {
        let envelope = Envelope::from_status(
            target(path),
            200,
            Some(Payload::Binary {
                content_type: content_type.to_string(),
                bytes: bytes.to_vec(),
            }),
        );
        self.reply(path, envelope)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.path.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn target(path: &str) -> String {
    format!("http://gateway.test{}", path)
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn execute(
        &self,
        request: GatewayRequest,
        cancel: &CancellationToken,
    ) -> Result<Envelope, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let path = request.path.clone();
        let hint = request.hint.clone();
        self.calls.lock().unwrap().push(request);

        let mut replies = self.replies.lock().unwrap();
        let reply = match replies.get_mut(&path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        let mut envelope = reply.unwrap_or_else(|| Envelope::from_status(target(&path), 404, None));
        if envelope.diagnostic_hint.is_none() {
            envelope.diagnostic_hint = hint;
        }
        Ok(envelope)
    }
}
