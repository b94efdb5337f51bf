//! A [`ModelClient`] that replays canned responses.
//!
//! Used by tests and local dry runs: each `send` pops the next scripted
//! outcome and records the request it was given.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ModelClient, ModelRequest, ModelResponse, Provider};
use crate::error::{Error, Result};

enum Step {
    Respond(ModelResponse),
    Fail(String),
    Stall(Duration, ModelResponse),
}

pub struct ScriptedModel {
    provider: Provider,
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn respond(self, response: ModelResponse) -> Self {
        self.push(Step::Respond(response));
        self
    }

    /// Fail the next call with `ModelUnavailable`.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Step::Fail(message.into()));
        self
    }

    /// Sleep before answering, for timeout tests.
    pub fn stall(self, delay: Duration, response: ModelResponse) -> Self {
        self.push(Step::Stall(delay, response));
        self
    }

    fn push(&self, step: Step) {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn default_model(&self) -> &str {
        "scripted"
    }

    async fn send(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(message)) => Err(Error::ModelUnavailable(message)),
            Some(Step::Stall(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            // An exhausted script behaves like a model that stopped calling tools.
            None => Ok(ModelResponse::text("I have nothing further to add.")),
        }
    }
}
