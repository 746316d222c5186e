//! Integration tests for the Langbase client and the structured model adapter
//!
//! Tests HTTP client behavior using wiremock for request/response mocking.

use serde_json::json;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use company_research::config::{LangbaseConfig, PipeConfig, RequestConfig};
use company_research::error::{LangbaseError, ModelError};
use company_research::langbase::{LangbaseClient, Message, PipeRequest};
use company_research::model::{LangbasePipeModel, ModelTask, StructuredModel, StructuredRequest};

/// Create a test client pointing to mock server
fn create_test_client(base_url: &str) -> LangbaseClient {
    create_client_with_retries(base_url, 0)
}

fn create_client_with_retries(base_url: &str, max_retries: u32) -> LangbaseClient {
    let config = LangbaseConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
    };

    let request_config = RequestConfig {
        timeout_ms: 5000,
        max_retries,
        retry_delay_ms: 10,
    };

    LangbaseClient::new(&config, request_config).expect("Failed to create client")
}

fn create_test_request(content: &str) -> PipeRequest {
    PipeRequest::new("test-pipe", vec![Message::user(content)])
}

fn completion(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "success": true,
        "completion": body,
        "threadId": "thread-1"
    }))
}

#[cfg(test)]
mod pipe_call_tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_pipe_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "completion": "{\"queries\": [\"acme\"]}",
                "threadId": "thread-123",
                "raw": {
                    "model": "gpt-4o-mini",
                    "usage": {
                        "prompt_tokens": 100,
                        "completion_tokens": 50,
                        "total_tokens": 150
                    }
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let response = client
            .call_pipe(create_test_request("Research Acme"))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.thread_id, Some("thread-123".to_string()));
        assert_eq!(response.total_tokens(), Some(150));
    }

    #[tokio::test]
    async fn test_pipe_call_sends_thread_id_without_streaming() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(body_partial_json(json!({
                "name": "test-pipe",
                "threadId": "session-123",
                "stream": false
            })))
            .respond_with(completion("{}"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let request = create_test_request("Continue").with_thread_id("session-123");

        assert!(client.call_pipe(request).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "Invalid API key"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_client_with_retries(&mock_server.uri(), 3);
        let err = client.call_pipe(create_test_request("Test")).await.unwrap_err();

        assert!(matches!(err, LangbaseError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_server_error_is_retried_then_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let client = create_client_with_retries(&mock_server.uri(), 2);
        let err = client.call_pipe(create_test_request("Test")).await.unwrap_err();

        assert!(matches!(err, LangbaseError::Unavailable { retries: 3, .. }));
    }

    #[tokio::test]
    async fn test_malformed_response_body() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let result = client.call_pipe(create_test_request("Test")).await;

        assert!(result.is_err());
    }
}

#[cfg(test)]
mod timeout_tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(completion("{}").set_delay(Duration::from_secs(10)))
            .mount(&mock_server)
            .await;

        let config = LangbaseConfig {
            api_key: "test-api-key".to_string(),
            base_url: mock_server.uri(),
        };
        let request_config = RequestConfig {
            timeout_ms: 100,
            max_retries: 0,
            retry_delay_ms: 100,
        };
        let client = LangbaseClient::new(&config, request_config).unwrap();

        let result = client.call_pipe(create_test_request("Test")).await;

        assert!(result.is_err(), "Should timeout");
    }
}

#[cfg(test)]
mod pipe_setup_tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_research_pipes_creates_all_four() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .and(body_partial_json(json!({"upsert": true, "json": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "research-pipe",
                "description": "",
                "status": "private",
                "owner_login": "tester",
                "url": "https://langbase.com/tester/research-pipe"
            })))
            .expect(4)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        client
            .ensure_research_pipes(&PipeConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ensure_pipe_accepts_conflict() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(409).set_body_string("exists"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        assert!(client
            .ensure_pipe("research-queries-v1", "Search query generation", "prompt")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_ensure_pipe_propagates_auth_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client
            .ensure_research_pipes(&PipeConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LangbaseError::Api { status: 403, .. }));
    }
}

#[cfg(test)]
mod structured_model_tests {
    use super::*;

    fn model(base_url: &str) -> LangbasePipeModel {
        LangbasePipeModel::new(create_test_client(base_url), PipeConfig::default())
    }

    fn request(task: ModelTask) -> StructuredRequest {
        StructuredRequest::new(
            task,
            "You write search queries.",
            "Company: Acme",
            json!({"type": "object", "properties": {"queries": {"type": "array"}}}),
        )
        .with_thread_id("s1")
    }

    #[tokio::test]
    async fn test_routes_task_to_its_pipe() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .and(body_partial_json(json!({
                "name": "research-reflection-v1",
                "threadId": "s1"
            })))
            .respond_with(completion("{\"is_satisfactory\": true}"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let value = model(&mock_server.uri())
            .invoke_structured(request(ModelTask::Reflect))
            .await
            .unwrap();

        assert_eq!(value["is_satisfactory"], true);
    }

    #[tokio::test]
    async fn test_accepts_fenced_json() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(completion(
                "Here you go:\n```json\n{\"queries\": [\"acme revenue\"]}\n```",
            ))
            .mount(&mock_server)
            .await;

        let value = model(&mock_server.uri())
            .invoke_structured(request(ModelTask::GenerateQueries))
            .await
            .unwrap();

        assert_eq!(value["queries"][0], "acme revenue");
    }

    #[tokio::test]
    async fn test_prose_completion_is_malformed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(completion("I could not find anything."))
            .mount(&mock_server)
            .await;

        let err = model(&mock_server.uri())
            .invoke_structured(request(ModelTask::GenerateQueries))
            .await
            .unwrap_err();

        assert!(matches!(err, ModelError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_transport_failure_is_langbase_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/pipes/run"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&mock_server)
            .await;

        let err = model(&mock_server.uri())
            .invoke_structured(request(ModelTask::ExtractSchema))
            .await
            .unwrap_err();

        assert!(matches!(err, ModelError::Langbase(LangbaseError::Api { status: 400, .. })));
    }
}
