//! Scripted executor for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutput, Payload, SshExecutor, SshTarget};
use crate::error::ConnectionError;

/// One canned reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Output(CommandOutput),
    Unreachable(String),
}

impl MockReply {
    pub fn output(stdout: &str, stderr: &str, exit_status: u32) -> Self {
        MockReply::Output(CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_status: Some(exit_status),
        })
    }

    pub fn unreachable(reason: &str) -> Self {
        MockReply::Unreachable(reason.to_string())
    }
}

/// A call the mock saw.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub target: SshTarget,
    pub payload: Payload,
}

/// Replays queued replies in order and records every call.
///
/// An exhausted queue answers as an unreachable host.
#[derive(Debug, Default)]
pub struct MockExecutor {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: MockReply) -> &Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl SshExecutor for MockExecutor {
    async fn execute(
        &self,
        target: &SshTarget,
        payload: &Payload,
    ) -> Result<CommandOutput, ConnectionError> {
        self.calls.lock().unwrap().push(RecordedCall {
            target: target.clone(),
            payload: payload.clone(),
        });
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(MockReply::Output(out)) => Ok(out),
            Some(MockReply::Unreachable(reason)) => Err(ConnectionError::Connect {
                host: target.host.clone(),
                reason,
            }),
            None => Err(ConnectionError::Connect {
                host: target.host.clone(),
                reason: "no scripted reply".into(),
            }),
        }
    }
}
