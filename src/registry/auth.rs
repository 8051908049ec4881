//! Registry Authentication
//!
//! Implements the Docker registry token flow:
//! 1. GET `/v2/` on the registry returns 401 with a WWW-Authenticate header
//! 2. Parse realm, service, and scope from the header
//! 3. Request a token from the auth server (basic auth when credentials exist)
//! 4. Use the bearer token on subsequent requests
//!
//! Credentials come from container auth files (`auth.json`,
//! `~/.docker/config.json`); tokens are cached per `(registry, repo)` for
//! at most five minutes regardless of the server-stated TTL.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use base64::Engine;
use serde::Deserialize;

use crate::image::DOCKER_HUB_REGISTRY;
use crate::registry::{RegistryError, Result};

/// Hard cap on cached token lifetime, regardless of server `expires_in`.
const TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Environment variable naming an explicit credentials file.
const AUTH_FILE_ENV: &str = "REGISTRY_AUTH_FILE";

#[derive(Debug, Clone)]
struct TokenEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct Challenge {
    realm: String,
    service: String,
}

/// Credential lookup and bearer-token cache for registries.
pub struct AuthStore {
    http: reqwest::Client,
    /// Cached tokens keyed by `registry/repo`.
    tokens: RwLock<HashMap<String, TokenEntry>>,
    insecure: HashSet<String>,
}

impl AuthStore {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            tokens: RwLock::new(HashMap::new()),
            insecure: HashSet::new(),
        }
    }

    /// Mark a registry as insecure (HTTP instead of HTTPS).
    pub fn set_insecure(&mut self, registry: &str) {
        self.insecure.insert(registry.to_string());
    }

    fn registry_url(&self, registry: &str) -> String {
        let scheme = if self.insecure.contains(registry) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, registry)
    }

    /// Return the Authorization header value for a registry and repo,
    /// or `None` when the registry needs no auth.
    pub async fn get_auth(&self, registry: &str, repo: &str) -> Result<Option<String>> {
        let cache_key = format!("{}/{}", registry, repo);

        {
            let tokens = self
                .tokens
                .read()
                .map_err(|e| RegistryError::Auth(format!("token cache poisoned: {}", e)))?;
            if let Some(entry) = tokens.get(&cache_key) {
                if Instant::now() < entry.expires_at {
                    return Ok(Some(format!("Bearer {}", entry.token)));
                }
            }
        }

        let credentials = load_credentials(registry);

        if let Some(challenge) = self.fetch_challenge(registry).await? {
            let token = self
                .request_token(&challenge, repo, credentials.as_ref())
                .await?;

            let mut tokens = self
                .tokens
                .write()
                .map_err(|e| RegistryError::Auth(format!("token cache poisoned: {}", e)))?;
            tokens.insert(
                cache_key,
                TokenEntry {
                    token: token.clone(),
                    expires_at: Instant::now() + TOKEN_TTL,
                },
            );

            return Ok(Some(format!("Bearer {}", token)));
        }

        // No challenge advertised. Fall back to Basic when we hold credentials.
        if let Some((username, password)) = credentials {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            return Ok(Some(format!("Basic {}", encoded)));
        }

        Ok(None)
    }

    /// Probe `/v2/` for a Bearer challenge.
    async fn fetch_challenge(&self, registry: &str) -> Result<Option<Challenge>> {
        let url = format!("{}/v2/", self.registry_url(registry));

        let response = self.http.get(&url).send().await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            let header = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            return Ok(parse_challenge(header));
        }

        Ok(None)
    }

    /// Request a pull token from the challenge's realm.
    ///
    /// The scope is added unconditionally; some registries permit
    /// anonymous token requests, so missing credentials are not fatal.
    async fn request_token(
        &self,
        challenge: &Challenge,
        repo: &str,
        credentials: Option<&(String, String)>,
    ) -> Result<String> {
        let mut request = self.http.get(&challenge.realm);

        if !challenge.service.is_empty() {
            request = request.query(&[("service", challenge.service.as_str())]);
        }
        request = request.query(&[("scope", format!("repository:{}:pull", repo))]);

        if let Some((username, password)) = credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RegistryError::Auth(format!(
                "token request failed: {} {}",
                status, body
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let parsed: TokenResponse = serde_json::from_str(&body)?;

        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Auth("no token in response".to_string()))
    }
}

impl Default for AuthStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `WWW-Authenticate: Bearer realm="…",service="…"` header.
fn parse_challenge(header: &str) -> Option<Challenge> {
    if header.is_empty() {
        return None;
    }

    let header = header.strip_prefix("Bearer ").unwrap_or(header);
    let mut challenge = Challenge::default();

    for part in header.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            let value = value.trim_matches('"');
            match key {
                "realm" => challenge.realm = value.to_string(),
                "service" => challenge.service = value.to_string(),
                _ => {}
            }
        }
    }

    if challenge.realm.is_empty() {
        return None;
    }

    Some(challenge)
}

/// Search the standard auth files for credentials, in precedence order.
fn load_credentials(registry: &str) -> Option<(String, String)> {
    for path in credential_paths() {
        if let Some(creds) = load_from_file(&path, registry) {
            return Some(creds);
        }
    }

    None
}

fn credential_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(5);

    // An explicit auth file wins over every default location.
    if let Ok(explicit) = std::env::var(AUTH_FILE_ENV) {
        if !explicit.is_empty() {
            paths.push(PathBuf::from(explicit));
        }
    }

    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        if !xdg_runtime.is_empty() {
            paths.push(PathBuf::from(xdg_runtime).join("containers/auth.json"));
        }
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".docker/config.json"));
        paths.push(home.join(".config/containers/auth.json"));
    }

    paths.push(PathBuf::from("/etc/containers/auth.json"));

    paths
}

#[derive(Deserialize)]
struct AuthConfig {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: String,
}

fn load_from_file(path: &PathBuf, registry: &str) -> Option<(String, String)> {
    let data = std::fs::read(path).ok()?;
    let config: AuthConfig = serde_json::from_slice(&data).ok()?;

    let lookup = |key: &str| {
        config
            .auths
            .get(key)
            .filter(|e| !e.auth.is_empty())
            .and_then(|e| decode_auth(&e.auth))
    };

    if let Some(creds) = lookup(registry).or_else(|| lookup(&format!("https://{}", registry))) {
        return Some(creds);
    }

    if registry == DOCKER_HUB_REGISTRY {
        for key in ["docker.io", "https://index.docker.io/v1/", "index.docker.io"] {
            if let Some(creds) = lookup(key) {
                return Some(creds);
            }
        }
    }

    None
}

/// Decode a base64 `user:pass` auth entry.
fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (username, password) = text.split_once(':')?;

    Some((username.to_string(), password.to_string()))
}
