// Smart-LED backend REST client
//
// Only the endpoints the provisioning flow needs: identity of the logged-in
// user, room (location) lookup/creation, system config for the broker URL,
// and the device claim. The bearer token lives in memory only.

use crate::error::BackendError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const USER_AGENT: &str = concat!("smartled-provision/", env!("CARGO_PKG_VERSION"));

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    #[serde(default)]
    pub mqtt_broker_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub mac_address: String,
    pub proof_of_possession: String,
    pub location_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub location_id: Option<i64>,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Serialize)]
struct CreateLocationRequest<'a> {
    name: &'a str,
}

/// Room selection made by the user before writes begin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationChoice {
    Id(i64),
    /// Resolved case-insensitively; created if no room has this name.
    Name(String),
}

// ============================================================================
// API seam
// ============================================================================

#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn current_user(&self) -> Result<UserProfile, BackendError>;

    async fn list_locations(&self) -> Result<Vec<Location>, BackendError>;

    async fn create_location(&self, name: &str) -> Result<Location, BackendError>;

    async fn system_config(&self) -> Result<SystemConfig, BackendError>;

    async fn claim_device(&self, request: &ClaimRequest) -> Result<DeviceRecord, BackendError>;
}

/// Turn a room choice into a numeric location id.
pub async fn resolve_location<B>(backend: &B, choice: &LocationChoice) -> Result<i64, BackendError>
where
    B: BackendApi + ?Sized,
{
    match choice {
        LocationChoice::Id(id) => Ok(*id),
        LocationChoice::Name(name) => {
            let wanted = name.trim();
            let existing = backend.list_locations().await?;
            if let Some(location) = existing
                .iter()
                .find(|l| l.name.trim().eq_ignore_ascii_case(wanted))
            {
                return Ok(location.id);
            }
            tlog!("[backend] Room '{wanted}' not found, creating it");
            Ok(backend.create_location(wanted).await?.id)
        }
    }
}

// ============================================================================
// reqwest implementation
// ============================================================================

pub struct RestBackend {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BackendError::Request(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// `POST /login`; keeps the returned token for subsequent calls.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url("login"))
            .json(&LoginRequest { email, password })
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let login: LoginResponse = decode(response, "Login failed").await?;
        self.token = Some(login.token);
        tlog!("[backend] Logged in as {email}");
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, fallback: &str) -> Result<T, BackendError> {
        let response = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        decode(response, fallback).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<T, BackendError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        decode(response, fallback).await
    }
}

/// Decode a JSON body, or turn a non-success status into `Status` carrying
/// the response text (or `fallback` when the body is empty).
async fn decode<T: DeserializeOwned>(response: reqwest::Response, fallback: &str) -> Result<T, BackendError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = if text.trim().is_empty() {
            fallback.to_string()
        } else {
            text.trim().to_string()
        };
        return Err(BackendError::Status {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json()
        .await
        .map_err(|e| BackendError::Decode(format!("{fallback}: {e}")))
}

#[async_trait]
impl BackendApi for RestBackend {
    async fn current_user(&self) -> Result<UserProfile, BackendError> {
        self.get_json("users/me", "Failed to fetch user profile").await
    }

    async fn list_locations(&self) -> Result<Vec<Location>, BackendError> {
        self.get_json("locations", "Failed to fetch locations").await
    }

    async fn create_location(&self, name: &str) -> Result<Location, BackendError> {
        self.post_json("locations", &CreateLocationRequest { name }, "Failed to create location")
            .await
    }

    async fn system_config(&self) -> Result<SystemConfig, BackendError> {
        self.get_json("config", "Failed to fetch system config").await
    }

    async fn claim_device(&self, request: &ClaimRequest) -> Result<DeviceRecord, BackendError> {
        self.post_json("devices/claim", request, "Failed to claim device").await
    }
}
