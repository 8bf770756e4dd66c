//! HTTP client for the anonymous chat backend.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::debug;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::session::Credentials;
use crate::types::{ChatRequirements, ConversationRequest};

const DEVICE_ID_HEADER: &str = "oai-device-id";
const REQUIREMENTS_TOKEN_HEADER: &str = "openai-sentinel-chat-requirements-token";
const PROOF_TOKEN_HEADER: &str = "openai-sentinel-proof-token";

/// Static headers sent with every upstream call so the traffic looks like it
/// comes from a desktop browser tab.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept-language", "en-US,en;q=0.9"),
    ("cache-control", "no-cache"),
    ("pragma", "no-cache"),
    ("oai-language", "en-US"),
    (
        "sec-ch-ua",
        "\"Google Chrome\";v=\"123\", \"Not:A-Brand\";v=\"8\", \"Chromium\";v=\"123\"",
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"Windows\""),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "same-origin"),
];

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: Client,
    requirements_url: String,
    conversation_url: String,
    user_agent: String,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let mut builder = Client::builder().default_headers(default_headers(config)?);

        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| ProxyError::Config(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            client,
            requirements_url: config.requirements_url(),
            conversation_url: config.conversation_url(),
            user_agent: config.user_agent.clone(),
        })
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Exchange a device id for a session token and proof-of-work challenge.
    pub async fn chat_requirements(&self, device_id: &str) -> Result<ChatRequirements> {
        let response = self
            .client
            .post(&self.requirements_url)
            .header(DEVICE_ID_HEADER, device_id)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| ProxyError::InvalidRequirements(e.to_string()))
    }

    /// Open the streamed conversation call. The returned response has a 2xx
    /// status and an unread event-stream body.
    pub async fn conversation(
        &self,
        body: &ConversationRequest,
        device_id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Response> {
        let mut request = self
            .client
            .post(&self.conversation_url)
            .header(ACCEPT, "text/event-stream")
            .header(DEVICE_ID_HEADER, device_id)
            .json(body);

        match credentials {
            Some(creds) => {
                request = request.header(REQUIREMENTS_TOKEN_HEADER, creds.token.as_str());
                if let Some(proof) = &creds.proof_token {
                    request = request.header(PROOF_TOKEN_HEADER, proof.as_str());
                }
            }
            None => debug!("no session token yet, calling conversation without one"),
        }

        let response = request.send().await?;
        ensure_success(response).await
    }
}

fn default_headers(config: &ProxyConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for &(name, value) in BROWSER_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }

    let origin = header_value(config.base_url_trimmed())?;
    headers.insert(reqwest::header::ORIGIN, origin.clone());
    headers.insert(reqwest::header::REFERER, origin);
    headers.insert(USER_AGENT, header_value(&config.user_agent)?);
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ProxyError::Config(format!("invalid header value: {:?}", value)))
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyError::UpstreamStatus {
        status: status.as_u16(),
        body,
    })
}
