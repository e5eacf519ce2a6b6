use std::{env, fmt, time::Duration};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::remote::{
    RemoteCallError, RemoteCatalog, RemoteVotemapConfig, RemoteVotemapState, RemoteWhitelist,
};
use crate::{ApiResult, LayerRecord, MapLayer, VotemapUserConfig, WhitelistSnapshot};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const GET_MAPS: &str = "api/get_maps";
const GET_WHITELIST: &str = "api/get_votemap_whitelist";
const SET_WHITELIST: &str = "api/set_votemap_whitelist";
const RESET_VOTEMAP: &str = "api/reset_votemap_state";
const GET_VOTEMAP_CONFIG: &str = "api/get_votemap_config";

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("environment variable {0} is not set")]
    MissingVariable(&'static str),
    #[error("invalid remote tool url '{value}': {message}")]
    InvalidUrl { value: String, message: String },
    #[error("invalid value '{value}' for {variable}")]
    InvalidValue {
        variable: &'static str,
        value: String,
    },
    #[error("api key contains characters that are not allowed in an HTTP header")]
    InvalidApiKey,
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where and how to reach the remote administration tool.
#[derive(Clone)]
pub struct CrconConnection {
    api_url: Url,
    api_key: String,
    timeout: Duration,
}

impl CrconConnection {
    pub fn new(api_url: &str, api_key: impl Into<String>, timeout: Duration) -> Result<Self, ConnectionError> {
        let mut normalized = api_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let parsed = Url::parse(&normalized).map_err(|err| ConnectionError::InvalidUrl {
            value: api_url.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            api_url: parsed,
            api_key: api_key.into(),
            timeout,
        })
    }

    /// Reads `CRCON_API_URL`, `CRCON_API_KEY` and the optional
    /// `CRCON_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConnectionError> {
        let api_url =
            env::var("CRCON_API_URL").map_err(|_| ConnectionError::MissingVariable("CRCON_API_URL"))?;
        let api_key =
            env::var("CRCON_API_KEY").map_err(|_| ConnectionError::MissingVariable("CRCON_API_KEY"))?;
        let timeout = match env::var("CRCON_TIMEOUT_MS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConnectionError::InvalidValue {
                    variable: "CRCON_TIMEOUT_MS",
                    value: raw,
                })?,
            Err(_) => DEFAULT_TIMEOUT,
        };
        Self::new(&api_url, api_key, timeout)
    }

    pub fn api_url(&self) -> &Url {
        &self.api_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for CrconConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrconConnection")
            .field("api_url", &self.api_url.as_str())
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Blocking REST client for the remote tool.
///
/// Each method issues exactly one request; retries are left to the caller.
#[derive(Debug, Clone)]
pub struct CrconClient {
    http: Client,
    base: Url,
}

impl CrconClient {
    pub fn connect(connection: &CrconConnection) -> Result<Self, ConnectionError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", connection.api_key))
            .map_err(|_| ConnectionError::InvalidApiKey)?;
        auth.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let http = Client::builder()
            .default_headers(headers)
            .timeout(connection.timeout)
            .build()?;
        Ok(Self {
            http,
            base: connection.api_url.clone(),
        })
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Option<T>, RemoteCallError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|err| RemoteCallError::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            })?;
        debug!(target: "votemap::remote", %method, endpoint, "remote.call");

        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().map_err(|err| RemoteCallError::Transport {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteCallError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let envelope: ApiResult<T> = response.json().map_err(|err| RemoteCallError::Decode {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        if envelope.failed {
            return Err(RemoteCallError::Rejected {
                command: envelope.command,
                message: envelope.error.unwrap_or_default(),
            });
        }
        Ok(envelope.result)
    }

    fn call_required<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
    ) -> Result<T, RemoteCallError> {
        self.call(method, endpoint, None)?
            .ok_or_else(|| RemoteCallError::Decode {
                endpoint: endpoint.to_string(),
                message: "response carried no result".to_string(),
            })
    }
}

impl RemoteCatalog for CrconClient {
    fn current_layers(&self) -> Result<Vec<MapLayer>, RemoteCallError> {
        let records: Vec<LayerRecord> = self.call_required(Method::GET, GET_MAPS)?;
        Ok(records.into_iter().map(MapLayer::from).collect())
    }
}

impl RemoteWhitelist for CrconClient {
    fn get(&self) -> Result<WhitelistSnapshot, RemoteCallError> {
        let layer_ids: Vec<String> = self.call_required(Method::GET, GET_WHITELIST)?;
        Ok(WhitelistSnapshot::new(layer_ids))
    }

    fn set(&self, layer_ids: &[String]) -> Result<(), RemoteCallError> {
        let body = json!({ "map_names": layer_ids });
        self.call::<Value>(Method::POST, SET_WHITELIST, Some(&body))?;
        Ok(())
    }
}

impl RemoteVotemapState for CrconClient {
    fn reset(&self) -> Result<(), RemoteCallError> {
        let body = json!({});
        self.call::<Value>(Method::POST, RESET_VOTEMAP, Some(&body))?;
        Ok(())
    }
}

impl RemoteVotemapConfig for CrconClient {
    fn votemap_config(&self) -> Result<VotemapUserConfig, RemoteCallError> {
        self.call_required(Method::GET, GET_VOTEMAP_CONFIG)
    }
}
