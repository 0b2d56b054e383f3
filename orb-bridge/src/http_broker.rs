//! HTTP execution adapter
//!
//! Posts each [`OrderIntent`] as camelCase JSON to `{base_url}/orders` and
//! reads an [`ExecutionReport`] back. A non-2xx status becomes a rejected
//! report carrying the status and body; transport and decode failures are
//! returned as execution errors.

use crate::errors::{BrokerError, BrokerResult};
use async_trait::async_trait;
use orb_core::{EngineResult, ExecutionAdapter, ExecutionReport, OrderIntent};
use reqwest::Client;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

pub const DEMO_BASE_URL: &str = "https://demo.trading212.com/api/v0";
pub const LIVE_BASE_URL: &str = "https://live.trading212.com/api/v0";

const API_KEY_HEADER: &str = "X-API-KEY";
const API_SECRET_HEADER: &str = "X-API-SECRET";
const REQUEST_ID_HEADER: &str = "X-Request-Id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerEnvironment {
    #[default]
    Demo,
    Live,
}

impl fmt::Display for BrokerEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerEnvironment::Demo => f.write_str("DEMO"),
            BrokerEnvironment::Live => f.write_str("LIVE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpBrokerConfig {
    pub environment: BrokerEnvironment,
    pub demo_url: String,
    pub live_url: String,
    pub api_key: String,
    pub api_secret: Option<String>,
    pub request_timeout: Duration,
}

impl Default for HttpBrokerConfig {
    fn default() -> Self {
        Self {
            environment: BrokerEnvironment::Demo,
            demo_url: DEMO_BASE_URL.to_string(),
            live_url: LIVE_BASE_URL.to_string(),
            api_key: String::new(),
            api_secret: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl HttpBrokerConfig {
    pub fn demo(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn live(api_key: impl Into<String>) -> Self {
        Self {
            environment: BrokerEnvironment::Live,
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Point the current environment at another server
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        match self.environment {
            BrokerEnvironment::Demo => self.demo_url = url.into(),
            BrokerEnvironment::Live => self.live_url = url.into(),
        }
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.api_secret = Some(secret.into());
        self
    }

    pub fn base_url(&self) -> &str {
        match self.environment {
            BrokerEnvironment::Demo => &self.demo_url,
            BrokerEnvironment::Live => &self.live_url,
        }
    }
}

pub struct HttpExecutionAdapter {
    config: HttpBrokerConfig,
    orders_url: Url,
    http: Client,
}

impl HttpExecutionAdapter {
    pub fn new(config: HttpBrokerConfig) -> BrokerResult<Self> {
        if config.api_key.is_empty() {
            return Err(BrokerError::AuthenticationFailed);
        }
        let base = config.base_url().trim_end_matches('/');
        let orders_url = Url::parse(&format!("{}/orders", base))?;
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BrokerError::Connection(format!("failed to build HTTP client: {}", e)))?;

        info!("🏦 HTTP broker {} at {}", config.environment, orders_url);
        Ok(Self {
            config,
            orders_url,
            http,
        })
    }

    pub fn environment(&self) -> BrokerEnvironment {
        self.config.environment
    }

    pub fn orders_url(&self) -> &Url {
        &self.orders_url
    }

    async fn post_order(&self, intent: &OrderIntent) -> BrokerResult<ExecutionReport> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(
            "📤 {} {} {} x{} @ {:.4} ({})",
            intent.intent, intent.direction, intent.symbol, intent.quantity, intent.price, request_id
        );

        let mut request = self
            .http
            .post(self.orders_url.clone())
            .header("Accept", "application/json")
            .header(API_KEY_HEADER, &self.config.api_key)
            .header(REQUEST_ID_HEADER, &request_id)
            .json(intent);
        if let Some(secret) = &self.config.api_secret {
            request = request.header(API_SECRET_HEADER, secret);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("❌ Broker {} for {}: {}", status, intent.client_order_id, body);
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(BrokerError::AuthenticationFailed);
            }
            return Ok(ExecutionReport::rejected(
                BrokerError::Http {
                    status: status.as_u16(),
                    body,
                }
                .to_string(),
            ));
        }

        let body = response.text().await?;
        let report: ExecutionReport = serde_json::from_str(&body)?;
        debug!("📥 {} -> success={}", intent.client_order_id, report.success);
        Ok(report)
    }
}

#[async_trait]
impl ExecutionAdapter for HttpExecutionAdapter {
    async fn submit(&self, intent: &OrderIntent) -> EngineResult<ExecutionReport> {
        self.post_order(intent)
            .await
            .map_err(|e| e.into_engine(&intent.symbol))
    }

    fn name(&self) -> &str {
        match self.config.environment {
            BrokerEnvironment::Demo => "http-demo",
            BrokerEnvironment::Live => "http-live",
        }
    }
}
