//! Connection settings for the Fellow developer API.

use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Prod,
    Staging,
    Dev,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "staging" => Self::Staging,
            "dev" | "development" => Self::Dev,
            _ => Self::Prod,
        }
    }

    pub fn url_pattern(self) -> &'static str {
        match self {
            Self::Prod => "https://{subdomain}.fellow.app/api/v1",
            Self::Staging => "https://{subdomain}.staging.fellow.co/api/v1",
            Self::Dev => "https://{subdomain}.fellow.dev/api/v1",
        }
    }
}

/// Credentials handed over by the host.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub subdomain: String,
    pub api_key: String,
}

impl Credentials {
    /// Read from `initialize` params, falling back to `FELLOW_SUBDOMAIN` and
    /// `FELLOW_API_KEY`.
    pub fn from_params(params: &Value) -> Result<Self> {
        let creds = params.get("credentials");
        let field = |key: &str, env: &str| {
            creds
                .and_then(|c| c.get(key))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .or_else(|| std::env::var(env).ok())
                .filter(|s| !s.is_empty())
        };
        Ok(Self {
            subdomain: field("subdomain", "FELLOW_SUBDOMAIN")
                .ok_or(Error::MissingCredentials("subdomain"))?,
            api_key: field("api_key", "FELLOW_API_KEY")
                .ok_or(Error::MissingCredentials("api_key"))?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub environment: Environment,
    pub url_pattern: String,
    pub skip_ssl_validation: bool,
    /// Externally reachable base for callback URLs, if different from the
    /// locally bound address.
    pub public_url: Option<String>,
}

impl ApiConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            url_pattern: environment.url_pattern().to_string(),
            skip_ssl_validation: false,
            public_url: None,
        }
    }

    pub fn from_env() -> Self {
        let environment = std::env::var("FELLOW_ENVIRONMENT")
            .map(|v| Environment::parse(&v))
            .unwrap_or(Environment::Prod);
        let mut config = Self::new(environment);
        if let Ok(pattern) = std::env::var("FELLOW_API_BASE_URL_PATTERN") {
            config.url_pattern = pattern;
        }
        config.skip_ssl_validation = std::env::var("FELLOW_SKIP_SSL_VALIDATION")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        config.public_url = std::env::var("FELLOW_PUBLIC_URL").ok().filter(|s| !s.is_empty());
        config
    }

    /// Build the API base URL for a workspace subdomain.
    pub fn base_url(&self, subdomain: &str) -> Result<String> {
        if !is_valid_subdomain(subdomain, self.environment) {
            return Err(Error::InvalidSubdomain(subdomain.to_string()));
        }
        Ok(self.url_pattern.replace("{subdomain}", subdomain))
    }
}

// Anything beyond [A-Za-z0-9-] could rewrite the host part of the URL.
fn is_valid_subdomain(subdomain: &str, environment: Environment) -> bool {
    if environment == Environment::Dev {
        return true;
    }
    !subdomain.is_empty()
        && subdomain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}
