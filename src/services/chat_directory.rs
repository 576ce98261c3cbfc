use serde::Deserialize;
use std::time::Duration;
use url::Url;

use super::config::ChatConfig;
use crate::error::{ChatError, Result};

#[derive(Debug, Deserialize)]
struct StatusResponse {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateIdResponse {
    id: String,
}

/// Client for the relay's user directory endpoints.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: Url,
}

impl DirectoryClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        Self::with_base_url(
            config.http_base_url()?,
            Duration::from_millis(config.delivery.http_timeout_ms),
        )
    }

    pub fn with_base_url(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChatError::Http(format!("HTTP client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    /// `GET /status/{user_id}`
    pub async fn user_status(&self, user_id: &str) -> Result<bool> {
        let url = self.endpoint(&["status", user_id])?;
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::Http(format!(
                "Status lookup for {} failed: HTTP {}",
                user_id,
                resp.status()
            )));
        }
        let body: StatusResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Http(format!("Parse status response: {}", e)))?;
        Ok(body.online)
    }

    /// `GET /generate-id`
    pub async fn generate_id(&self) -> Result<String> {
        let url = self.endpoint(&["generate-id"])?;
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::Http(format!(
                "Id generation failed: HTTP {}",
                resp.status()
            )));
        }
        let body: GenerateIdResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::Http(format!("Parse id response: {}", e)))?;
        if body.id.is_empty() {
            return Err(ChatError::Http("Directory returned an empty id".to_string()));
        }
        log::info!("Directory issued id {}", body.id);
        Ok(body.id)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Config("Directory URL cannot take a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> DirectoryClient {
        DirectoryClient::with_base_url(
            Url::parse(&server.uri()).unwrap(),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_user_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status/bob"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"online": true})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status/carol"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"online": false})))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert!(client.user_status("bob").await.unwrap());
        assert!(!client.user_status("carol").await.unwrap());
    }

    #[tokio::test]
    async fn test_generate_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/generate-id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "k3x9-lq2m8"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        assert_eq!(client.generate_id().await.unwrap(), "k3x9-lq2m8");
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.user_status("bob").await.unwrap_err();
        assert!(matches!(err, ChatError::Http(_)));
    }
}
