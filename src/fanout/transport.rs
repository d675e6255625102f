//! Delivery transport for topic subscriptions

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Header carrying the message id, so subscribers can drop duplicates
pub const MESSAGE_ID_HEADER: &str = "x-notes-message-id";

/// Pushes one serialized message to one endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, endpoint: &str, body: &str, message_id: &str) -> Result<()>;
}

/// HTTP push over a shared reqwest client
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, endpoint: &str, body: &str, message_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(MESSAGE_ID_HEADER, message_id)
            .body(body.to_owned())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PipelineError::TransientIo(format!(
                "{} responded {}",
                endpoint, status
            )));
        }
        debug!(endpoint = %endpoint, message_id = %message_id, "Message pushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_http_transport_posts_json_with_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/notify"))
            .and(header("content-type", "application/json"))
            .and(header(MESSAGE_ID_HEADER, "n1"))
            .and(body_string(r#"{"id":"n1"}"#))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new());
        transport
            .deliver(&format!("{}/notify", server.uri()), r#"{"id":"n1"}"#, "n1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_transport_non_2xx_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new());
        let err = transport
            .deliver(&server.uri(), "{}", "m")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::TransientIo(_)));
    }
}
