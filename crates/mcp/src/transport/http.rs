//! Request/response transport: one HTTP POST per message, with the
//! correlated reply in the response body. Used for stateless servers.

use super::Transport;
use crate::config::{AuthConfig, ServerConfig};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::mpsc;

pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    auth: Option<AuthConfig>,
}

impl HttpTransport {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let url = config.url.clone().ok_or_else(|| Error::InvalidConfig {
            name: config.name.clone(),
            reason: "url is required for request transport".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .default_headers(static_headers(config)?)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            url,
            client,
            auth: config.auth.clone(),
        })
    }

    /// POST one message and decode the reply, if any.
    pub(crate) async fn post(
        client: &reqwest::Client,
        url: &str,
        auth: &Option<AuthConfig>,
        msg: &Value,
    ) -> Result<Option<Value>> {
        let mut request = client.post(url).json(msg);
        request = apply_auth(request, auth);

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::AuthFailed(format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::InvalidResponse(format!("HTTP status {status}")));
        }

        // Notifications get no reply body.
        let expects_reply = msg.get("id").is_some();
        if !expects_reply || status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.json::<Value>().await?;
        Ok(Some(body))
    }
}

fn static_headers(config: &ServerConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in &config.headers {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| Error::InvalidConfig {
            name: config.name.clone(),
            reason: format!("bad header name {key}: {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::InvalidConfig {
            name: config.name.clone(),
            reason: format!("bad header value for {key}: {e}"),
        })?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn apply_auth(request: reqwest::RequestBuilder, auth: &Option<AuthConfig>) -> reqwest::RequestBuilder {
    match auth {
        Some(AuthConfig::ApiKey { key, header }) => request.header(header.as_str(), key.as_str()),
        Some(AuthConfig::Oauth { token }) => request.bearer_auth(token),
        Some(AuthConfig::Basic { username, password }) => {
            request.basic_auth(username, Some(password))
        }
        None => request,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, msg: Value) -> Result<Option<Value>> {
        Self::post(&self.client, &self.url, &self.auth, &msg).await
    }

    fn take_incoming(&mut self) -> Option<mpsc::Receiver<Value>> {
        None
    }

    fn incoming_is_connection(&self) -> bool {
        false
    }

    async fn close(&self) {}
}
