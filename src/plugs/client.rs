//! HTTP fast path to Tasmota devices.
//!
//! Tasmota exposes a single command endpoint, `GET /cm?cmnd=...`. The client
//! is stateless beyond its base URL; it owns no plug state and surfaces all
//! errors to the manager, which decides whether to retry or report.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Deadline for a single device command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Command interface of a plug. The manager talks to devices only through
/// this trait so tests can substitute fakes.
#[async_trait]
pub trait DeviceCommander: Send + Sync {
    /// Sends one Tasmota command and returns the raw JSON response body.
    async fn execute(&self, command: &str) -> Result<Vec<u8>>;

    /// Batches several commands into one `Backlog` request.
    async fn execute_backlog(&self, commands: &[String]) -> Result<Vec<u8>>;
}

/// Real HTTP client for a single plug.
pub struct TasmotaClient {
    http: reqwest::Client,
    endpoint: String,
}

impl TasmotaClient {
    pub fn new(address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .context("failed to build device HTTP client")?;
        Ok(TasmotaClient {
            http,
            endpoint: format!("http://{address}/cm"),
        })
    }
}

#[async_trait]
impl DeviceCommander for TasmotaClient {
    async fn execute(&self, command: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("cmnd", command)])
            .send()
            .await
            .with_context(|| format!("device command {command:?} failed"))?
            .error_for_status()
            .with_context(|| format!("device rejected command {command:?}"))?;

        let body = response
            .bytes()
            .await
            .context("failed to read device response")?;
        Ok(body.to_vec())
    }

    async fn execute_backlog(&self, commands: &[String]) -> Result<Vec<u8>> {
        let backlog = format!("Backlog {}", commands.join("; "));
        self.execute(&backlog).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn executes_command_against_cm_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cm"))
            .and(query_param("cmnd", "Power ON"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"POWER":"ON"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let client = TasmotaClient::new(&server.address().to_string()).unwrap();
        let body = client.execute("Power ON").await.unwrap();
        assert_eq!(body, br#"{"POWER":"ON"}"#);
    }

    #[tokio::test]
    async fn backlog_joins_commands_into_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cm"))
            .and(query_param(
                "cmnd",
                "Backlog MqttHost 10.0.0.1; MqttPort 1883; Topic tasmota/lamp",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let client = TasmotaClient::new(&server.address().to_string()).unwrap();
        client
            .execute_backlog(&[
                "MqttHost 10.0.0.1".to_string(),
                "MqttPort 1883".to_string(),
                "Topic tasmota/lamp".to_string(),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn http_error_surfaces_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cm"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = TasmotaClient::new(&server.address().to_string()).unwrap();
        assert!(client.execute("Power ON").await.is_err());
    }
}
