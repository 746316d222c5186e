use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::types::{
    CreatePipeRequest, CreatePipeResponse, Message, PipeRequest, PipeResponse, PipeStatus,
};
use crate::config::{LangbaseConfig, PipeConfig, RequestConfig};
use crate::error::{LangbaseError, LangbaseResult};
use crate::prompts::{EXTRACTION_PROMPT, NOTES_PROMPT, QUERY_WRITER_PROMPT, REFLECTION_PROMPT};

/// Client for interacting with Langbase Pipes API
#[derive(Clone)]
pub struct LangbaseClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
}

impl LangbaseClient {
    /// Create a new Langbase client
    pub fn new(config: &LangbaseConfig, request_config: RequestConfig) -> LangbaseResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LangbaseError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
        })
    }

    /// Call a Langbase pipe with the given request.
    ///
    /// Transport failures are retried with exponential backoff up to
    /// `max_retries`; API errors with a 4xx status are returned immediately.
    pub async fn call_pipe(&self, request: PipeRequest) -> LangbaseResult<PipeResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);
        let pipe_name = request.name.clone();

        let mut last_error = None;
        let mut retries = 0;

        while retries <= self.request_config.max_retries {
            if retries > 0 {
                let delay = Duration::from_millis(
                    self.request_config.retry_delay_ms * (2_u64.pow(retries - 1)),
                );
                warn!(
                    pipe = %pipe_name,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying Langbase request"
                );
                tokio::time::sleep(delay).await;
            }

            let start = Instant::now();

            match self.execute_request(&url, &request).await {
                Ok(response) => {
                    info!(
                        pipe = %pipe_name,
                        latency_ms = start.elapsed().as_millis(),
                        total_tokens = ?response.total_tokens(),
                        "Langbase pipe call succeeded"
                    );
                    return Ok(response);
                }
                Err(LangbaseError::Api { status, message }) if (400..500).contains(&status) => {
                    error!(pipe = %pipe_name, status, "Langbase rejected request");
                    return Err(LangbaseError::Api { status, message });
                }
                Err(e) => {
                    error!(
                        pipe = %pipe_name,
                        error = %e,
                        latency_ms = start.elapsed().as_millis(),
                        retry = retries,
                        "Langbase pipe call failed"
                    );
                    last_error = Some(e);
                    retries += 1;
                }
            }
        }

        Err(LangbaseError::Unavailable {
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
            retries,
        })
    }

    async fn execute_request(
        &self,
        url: &str,
        request: &PipeRequest,
    ) -> LangbaseResult<PipeResponse> {
        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            "Calling Langbase pipe"
        );

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LangbaseError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    LangbaseError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LangbaseError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json::<PipeResponse>()
            .await
            .map_err(|e| LangbaseError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a new pipe
    pub async fn create_pipe(
        &self,
        request: CreatePipeRequest,
    ) -> LangbaseResult<CreatePipeResponse> {
        let url = format!("{}/v1/pipes", self.base_url);

        info!(pipe = %request.name, "Creating Langbase pipe");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(LangbaseError::Http)?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LangbaseError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: CreatePipeResponse =
            response
                .json()
                .await
                .map_err(|e| LangbaseError::InvalidResponse {
                    message: format!("Failed to parse create pipe response: {}", e),
                })?;

        info!(
            pipe = %pipe_response.name,
            url = %pipe_response.url,
            "Pipe created successfully"
        );

        Ok(pipe_response)
    }

    /// Ensure a JSON-mode pipe exists, creating it if needed. A 409 means the
    /// pipe is already there.
    pub async fn ensure_pipe(
        &self,
        pipe_name: &str,
        description: &str,
        system_prompt: &str,
    ) -> LangbaseResult<()> {
        let request = CreatePipeRequest::new(pipe_name)
            .with_description(description)
            .with_status(PipeStatus::Private)
            .with_upsert(true)
            .with_json_output(true)
            .with_temperature(0.2)
            .with_max_tokens(4000)
            .with_messages(vec![Message::system(system_prompt)]);

        match self.create_pipe(request).await {
            Ok(_) => {
                info!(pipe = %pipe_name, "Research pipe ready");
                Ok(())
            }
            Err(LangbaseError::Api { status: 409, .. }) => {
                info!(pipe = %pipe_name, "Pipe already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Ensure every pipe used by the research workflow exists.
    pub async fn ensure_research_pipes(&self, pipes: &PipeConfig) -> LangbaseResult<()> {
        self.ensure_pipe(&pipes.queries, "Search query generation", QUERY_WRITER_PROMPT)
            .await?;
        self.ensure_pipe(&pipes.notes, "Research note synthesis", NOTES_PROMPT)
            .await?;
        self.ensure_pipe(&pipes.extraction, "Schema extraction from notes", EXTRACTION_PROMPT)
            .await?;
        self.ensure_pipe(&pipes.reflection, "Completeness reflection", REFLECTION_PROMPT)
            .await
    }
}
