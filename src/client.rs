use crate::config::Credentials;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
pub use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

/// Authenticated outbound request to the Fellow API.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value>;
}

pub struct FellowClient {
    http: reqwest::Client,
}

impl FellowClient {
    pub fn new(credentials: &Credentials, skip_ssl_validation: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(&credentials.api_key)
            .map_err(|_| Error::MissingCredentials("api_key is not a valid header value"))?;
        key.set_sensitive(true);
        headers.insert("X-API-KEY", key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(skip_ssl_validation)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ApiTransport for FellowClient {
    async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
        tracing::debug!(%method, %url, "fellow api request");
        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&body)?);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(parse_body(text))
    }
}

fn parse_body(text: String) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub method: Method,
        pub url: String,
        pub body: Option<Value>,
    }

    /// Records calls and replays queued responses in order.
    #[derive(Default)]
    pub struct MockTransport {
        calls: Mutex<Vec<Call>>,
        responses: Mutex<VecDeque<Result<Value>>>,
    }

    impl MockTransport {
        pub fn respond(self, response: Result<Value>) -> Self {
            self.responses.lock().unwrap().push_back(response);
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ApiTransport for MockTransport {
        async fn request(&self, method: Method, url: &str, body: Option<Value>) -> Result<Value> {
            self.calls.lock().unwrap().push(Call {
                method,
                url: url.to_string(),
                body,
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Value::Null))
        }
    }
}
