use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use delve_core::config::ExecutorConfig;
use delve_core::error::{DelveError, Result};
use delve_core::traits::StepExecutor;
use delve_core::types::{StepOutput, StepRequest};

/// Step executor for dry runs: answers every step with its own input.
///
/// Loop steps can be told to emit a stop phrase from a given iteration on,
/// so loops with an output-based stop condition end early.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    delay: Option<Duration>,
    stop_after: Option<(usize, String)>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering each step.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append `phrase` to loop outputs once `iterations` have run.
    pub fn with_stop_after(mut self, iterations: usize, phrase: impl Into<String>) -> Self {
        self.stop_after = Some((iterations, phrase.into()));
        self
    }
}

impl StepExecutor for EchoExecutor {
    fn execute(&self, request: StepRequest) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = request.cancel.cancelled() => return Err(DelveError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let query = request
                .input
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or_default();
            let mut text = match request.iteration {
                Some(i) => format!("[{} #{}] {}", request.node_name, i + 1, query),
                None => format!("[{}] {}", request.node_name, query),
            };

            if let (Some((after, phrase)), Some(i)) = (&self.stop_after, request.iteration) {
                if i + 1 >= *after {
                    text.push_str(&format!(" ({})", phrase));
                }
            }

            debug!(node_id = %request.node_id, iteration = ?request.iteration, "Echo step");
            Ok(StepOutput::text(text))
        })
    }
}

/// Step executor that POSTs each step to an external agent service.
pub struct RemoteExecutor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct RemoteStepRequest<'a> {
    run_id: &'a str,
    node: &'a str,
    name: &'a str,
    role: &'a str,
    executor: &'a str,
    config: &'a serde_json::Value,
    tool_steps: usize,
    input: &'a serde_json::Value,
    iteration: Option<usize>,
    history: &'a [serde_json::Value],
}

#[derive(Deserialize)]
struct RemoteStepResponse {
    output: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

impl RemoteExecutor {
    pub fn new(endpoint: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DelveError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.map(String::from),
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        let endpoint = config.endpoint.as_deref().ok_or_else(|| {
            DelveError::Config("executor.endpoint is required for the remote executor".into())
        })?;
        Self::new(
            endpoint,
            config.api_key.as_deref(),
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    async fn call(&self, request: &StepRequest) -> Result<StepOutput> {
        let step_error = |message: String| DelveError::Step {
            node: request.node_id.clone(),
            message,
        };

        let mut req = self.client.post(&self.endpoint).json(&RemoteStepRequest {
            run_id: request.run_id.as_str(),
            node: &request.node_id,
            name: &request.node_name,
            role: &request.role,
            executor: &request.executor,
            config: &request.config,
            tool_steps: request.tool_steps,
            input: &request.input,
            iteration: request.iteration,
            history: &request.history,
        });

        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| step_error(format!("Step request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(step_error(format!("Step service error {}: {}", status, body)));
        }

        let body: RemoteStepResponse = resp
            .json()
            .await
            .map_err(|e| step_error(format!("Failed to parse step response: {}", e)))?;

        Ok(StepOutput {
            content: body.output,
            reasoning: body.reasoning,
        })
    }
}

impl StepExecutor for RemoteExecutor {
    fn execute(&self, request: StepRequest) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            tokio::select! {
                _ = request.cancel.cancelled() => Err(DelveError::Cancelled),
                result = self.call(&request) => result,
            }
        })
    }
}
