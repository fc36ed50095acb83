//! Vault REST transport over `reqwest`.
//!
//! One shared [`reqwest::Client`] (connection pool, TLS config, per-request
//! timeout) lives in [`HttpConnector`]; each [`HttpVaultApi`] is a cheap
//! handle binding it to one base URL and token.
//!
//! Status mapping: 2xx decodes, 429 and 5xx (including 503 while sealed or in
//! standby) and connection failures are [`ClusterError::Transient`], every
//! other status is [`ClusterError::Rejected`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::api::{
    Connector, InitResponse, SealStatus, TokenInfo, TokenLifetime, TokenRequest, VaultApi,
};
use crate::error::ClusterError;
use crate::root_token::RootToken;

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Builds [`HttpVaultApi`] handles over a shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// Build the shared client.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Client`] if the TLS backend cannot be
    /// initialized.
    pub fn new(request_timeout: Duration, skip_verify: bool) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .danger_accept_invalid_certs(skip_verify)
            .user_agent(concat!("vault-keeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClusterError::Client {
                address: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }

    /// Bind the shared client to one instance.
    pub fn api(&self, address: &str, token: Option<&RootToken>) -> HttpVaultApi {
        HttpVaultApi {
            client: self.client.clone(),
            base_url: address.trim_end_matches('/').to_owned(),
            token: token.cloned(),
        }
    }
}

impl Connector for HttpConnector {
    fn connect(
        &self,
        address: &str,
        token: Option<&RootToken>,
    ) -> Result<Arc<dyn VaultApi>, ClusterError> {
        let parsed = reqwest::Url::parse(address).map_err(|e| ClusterError::Client {
            address: address.to_owned(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClusterError::Client {
                address: address.to_owned(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(Arc::new(self.api(address, token)))
    }
}

/// Vault REST client bound to one instance.
#[derive(Clone)]
pub struct HttpVaultApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<RootToken>,
}

impl std::fmt::Debug for HttpVaultApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVaultApi")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Deserialize)]
struct InitStatusBody {
    initialized: bool,
}

#[derive(Deserialize)]
struct LeaderBody {
    #[serde(default)]
    is_self: bool,
}

#[derive(Deserialize)]
struct AuthBody {
    auth: AuthData,
}

#[derive(Deserialize)]
struct AuthData {
    client_token: String,
}

#[derive(Deserialize)]
struct LookupBody {
    data: LookupData,
}

#[derive(Deserialize)]
struct LookupData {
    #[serde(default)]
    ttl: u64,
    #[serde(default)]
    renewable: bool,
}

impl HttpVaultApi {
    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<String, ClusterError> {
        let url = format!("{}/v1/{path}", self.base_url);
        let mut req = self.client.request(method, &url);
        if let Some(token) = &self.token {
            req = req.header(TOKEN_HEADER, token.expose());
        }
        if let Some(ref b) = body {
            req = req.json(b);
        }

        let resp = req.send().await.map_err(|e| ClusterError::Transient {
            address: self.base_url.clone(),
            operation,
            reason: if e.is_timeout() {
                "request timed out".to_owned()
            } else {
                e.to_string()
            },
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| ClusterError::Transient {
            address: self.base_url.clone(),
            operation,
            reason: e.to_string(),
        })?;

        if status.is_success() {
            return Ok(text);
        }

        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .filter(|b| !b.errors.is_empty())
            .map_or_else(|| format!("HTTP {}", status.as_u16()), |b| b.errors.join("; "));

        if is_retryable(status) {
            Err(ClusterError::Transient {
                address: self.base_url.clone(),
                operation,
                reason: format!("HTTP {}: {message}", status.as_u16()),
            })
        } else {
            Err(ClusterError::Rejected {
                address: self.base_url.clone(),
                operation,
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ClusterError> {
        let text = self.send(operation, method, path, body).await?;
        serde_json::from_str(&text).map_err(|e| ClusterError::Decode {
            address: self.base_url.clone(),
            operation,
            reason: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl VaultApi for HttpVaultApi {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn init_status(&self) -> Result<bool, ClusterError> {
        let body: InitStatusBody = self
            .request("init-status", Method::GET, "sys/init", None)
            .await?;
        Ok(body.initialized)
    }

    async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, ClusterError> {
        self.request(
            "init",
            Method::PUT,
            "sys/init",
            Some(json!({ "secret_shares": shares, "secret_threshold": threshold })),
        )
        .await
    }

    async fn seal_status(&self) -> Result<SealStatus, ClusterError> {
        self.request("seal-status", Method::GET, "sys/seal-status", None)
            .await
    }

    async fn unseal_key(&self, key: &str) -> Result<SealStatus, ClusterError> {
        self.request(
            "unseal",
            Method::PUT,
            "sys/unseal",
            Some(json!({ "key": key })),
        )
        .await
    }

    async fn leader(&self) -> Result<bool, ClusterError> {
        let body: LeaderBody = self
            .request("leader-status", Method::GET, "sys/leader", None)
            .await?;
        Ok(body.is_self)
    }

    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), ClusterError> {
        let path = format!("sys/policy/{}", urlencoding::encode(name));
        self.send(
            "put-policy",
            Method::PUT,
            &path,
            Some(json!({ "policy": rules })),
        )
        .await?;
        Ok(())
    }

    async fn create_token(&self, request: &TokenRequest) -> Result<String, ClusterError> {
        let mut body = json!({
            "policies": request.policies,
            "display_name": request.display_name,
            "renewable": true,
        });
        match request.lifetime {
            TokenLifetime::Ttl(secs) => body["ttl"] = json!(format!("{secs}s")),
            TokenLifetime::Period(secs) => body["period"] = json!(format!("{secs}s")),
        }
        let resp: AuthBody = self
            .request("token-create", Method::PUT, "auth/token/create", Some(body))
            .await?;
        Ok(resp.auth.client_token)
    }

    async fn lookup_token(&self, token: &str) -> Result<TokenInfo, ClusterError> {
        let resp: LookupBody = self
            .request(
                "token-lookup",
                Method::PUT,
                "auth/token/lookup",
                Some(json!({ "token": token })),
            )
            .await?;
        Ok(TokenInfo {
            ttl_seconds: resp.data.ttl,
            renewable: resp.data.renewable,
        })
    }

    async fn renew_token(&self, token: &str, increment: u64) -> Result<(), ClusterError> {
        self.send(
            "token-renew",
            Method::PUT,
            "auth/token/renew",
            Some(json!({ "token": token, "increment": format!("{increment}s") })),
        )
        .await?;
        Ok(())
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}
