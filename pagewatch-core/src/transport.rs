//! Batch delivery to the collector
//!
//! One POST per flushed batch:
//!
//! ```text
//! POST <endpoint>
//! Authorization: Bearer <api_key>
//! Content-Type: application/json
//!
//! { "errors": [...], "timestamp": 1700000000000, "sdk": { "name": "pagewatch", "version": "0.1.0" } }
//! ```
//!
//! A 2xx status with a JSON body (optionally carrying `message` and `id`) is
//! success; anything else is a delivery error.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use crate::types::{DeliveryReceipt, ReportBatch};

/// Sends one batch and reports the collector's answer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: &ReportBatch) -> Result<DeliveryReceipt>;
}

/// HTTP transport for the collector API
pub struct HttpTransport {
    http_client: reqwest::Client,
    endpoint: Url,
}

impl HttpTransport {
    /// Create a transport from delivery configuration
    ///
    /// Returns an error if no endpoint is configured or the configuration is invalid.
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        config.validate()?;

        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("delivery.endpoint is required".to_string()))?;
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid delivery.endpoint: {}", e)))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &config.api_key {
            let auth_value = format!("Bearer {}", api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid api_key: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Check if the collector answers on `/health` at the endpoint's origin
    pub async fn health_check(&self) -> Result<bool> {
        let url = self
            .endpoint
            .join("/health")
            .map_err(|e| Error::Config(format!("invalid health URL: {}", e)))?;

        match self.http_client.get(url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, batch: &ReportBatch) -> Result<DeliveryReceipt> {
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            let receipt: DeliveryReceipt = response
                .json()
                .await
                .map_err(|e| Error::Delivery(format!("failed to parse response: {}", e)))?;
            Ok(receipt)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Delivery(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SdkInfo;

    fn config(endpoint: &str) -> DeliveryConfig {
        DeliveryConfig {
            endpoint: Some(endpoint.to_string()),
            api_key: Some("pw_live_test".to_string()),
            timeout_ms: 500,
            ..Default::default()
        }
    }

    #[test]
    fn test_transport_requires_endpoint() {
        let err = HttpTransport::new(&DeliveryConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_transport_rejects_bad_api_key() {
        let mut config = config("https://collector.example.com/api/errors");
        config.api_key = Some("line\nbreak".to_string());
        assert!(HttpTransport::new(&config).is_err());
    }

    #[test]
    fn test_transport_with_valid_config() {
        let transport = HttpTransport::new(&config("https://collector.example.com/api/errors"))
            .unwrap();
        assert_eq!(
            transport.endpoint().as_str(),
            "https://collector.example.com/api/errors"
        );
    }

    #[tokio::test]
    async fn test_unreachable_collector_is_delivery_error() {
        let transport = HttpTransport::new(&config("http://127.0.0.1:9/api/errors")).unwrap();
        let batch = ReportBatch {
            errors: Vec::new(),
            timestamp: 0,
            sdk: SdkInfo::CURRENT,
        };

        let err = transport.send(&batch).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!transport.health_check().await.unwrap());
    }
}
