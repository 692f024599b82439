//! Deterministic in-process provider for tests and offline runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{ProviderError, ProviderRequest, ProviderResponse, ReasoningProvider};

type Responder = Box<dyn Fn(&ProviderRequest) -> Result<String, ProviderError> + Send + Sync>;

#[derive(Debug, Clone)]
enum Step {
    Reply(String),
    Fail(ProviderError),
    /// Never completes; exercises timeouts.
    Hang,
}

/// Provider that replays a script.
///
/// Scripted steps are consumed first, then the responder (if any), then the
/// repeating fallback step. An exhausted script with nothing else configured
/// yields a malformed-output error.
pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<Step>>,
    responder: Option<Responder>,
    fallback: Option<Step>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(Step::Reply(text.into()))
    }

    pub fn fail(self, error: ProviderError) -> Self {
        self.push(Step::Fail(error))
    }

    pub fn hang(self) -> Self {
        self.push(Step::Hang)
    }

    pub fn always(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(Step::Reply(text.into()));
        self
    }

    pub fn always_fail(mut self, error: ProviderError) -> Self {
        self.fallback = Some(Step::Fail(error));
        self
    }

    pub fn always_hang(mut self) -> Self {
        self.fallback = Some(Step::Hang);
        self
    }

    /// Answer based on the request, after scripted steps run out.
    pub fn with_responder(
        mut self,
        responder: impl Fn(&ProviderRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(self, step: Step) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    fn next_step(&self, request: &ProviderRequest) -> Step {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(step) = scripted {
            return step;
        }
        if let Some(responder) = &self.responder {
            return match responder(request) {
                Ok(text) => Step::Reply(text),
                Err(error) => Step::Fail(error),
            };
        }
        self.fallback.clone().unwrap_or_else(|| {
            Step::Fail(ProviderError::Malformed(format!("{} script exhausted", self.id)))
        })
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let step = self.next_step(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match step {
            Step::Reply(text) => Ok(ProviderResponse {
                input_tokens: approx_tokens(&request.system) + approx_tokens(&request.prompt),
                output_tokens: approx_tokens(&text),
                model: Some(format!("{}-scripted", self.id)),
                text,
            }),
            Step::Fail(error) => Err(error),
            Step::Hang => std::future::pending().await,
        }
    }
}

fn approx_tokens(text: &str) -> u32 {
    u32::try_from(text.len() / 4).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::TaskCategory;

    fn request(prompt: &str) -> ProviderRequest {
        ProviderRequest {
            request_id: "r".into(),
            category: TaskCategory::PolicyQa,
            system: String::new(),
            prompt: prompt.into(),
            max_output_tokens: 100,
            temperature: 0.0,
            json_output: false,
        }
    }

    #[tokio::test]
    async fn script_then_fallback() {
        let provider = ScriptedProvider::new("p")
            .reply("first")
            .fail(ProviderError::RateLimited)
            .always("again");

        assert_eq!(provider.complete(&request("a")).await.unwrap().text, "first");
        assert_eq!(provider.complete(&request("b")).await.unwrap_err(), ProviderError::RateLimited);
        assert_eq!(provider.complete(&request("c")).await.unwrap().text, "again");
        assert_eq!(provider.complete(&request("d")).await.unwrap().text, "again");
        assert_eq!(provider.calls(), 4);
        assert_eq!(provider.requests()[2].prompt, "c");
    }

    #[tokio::test]
    async fn responder_sees_request() {
        let provider = ScriptedProvider::new("p").with_responder(|req| Ok(req.prompt.to_uppercase()));
        assert_eq!(provider.complete(&request("abc")).await.unwrap().text, "ABC");
    }

    #[tokio::test]
    async fn exhausted_script_is_malformed() {
        let provider = ScriptedProvider::new("p");
        assert!(matches!(
            provider.complete(&request("x")).await,
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn hang_never_resolves() {
        let provider = ScriptedProvider::new("p").hang();
        let result =
            tokio::time::timeout(Duration::from_millis(20), provider.complete(&request("x"))).await;
        assert!(result.is_err());
    }
}
