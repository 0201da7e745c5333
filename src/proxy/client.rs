use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::configuration::{self, ProxyConfig};
use crate::oci::{Digest, Reference};
use crate::registry::Error;

const TOKEN_GRACE: Duration = Duration::from_secs(10);

/// HTTP client for the upstream registry. Speaks the v2 API, performs
/// the challenge-driven bearer-token dance and caches the token until
/// it expires.
pub struct UpstreamClient {
    base: String,
    http: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

impl UpstreamClient {
    pub fn new(config: &ProxyConfig) -> Result<Self, configuration::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| configuration::Error::Proxy(format!("failed to build client: {e}")))?;

        Ok(UpstreamClient {
            base: config.remote_url.trim_end_matches('/').to_string(),
            http,
            username: config.username.clone(),
            password: config.password.clone(),
            token: Mutex::new(None),
        })
    }

    pub fn remote_url(&self) -> &str {
        &self.base
    }

    #[instrument(skip(self))]
    pub async fn head_blob(&self, namespace: &str, digest: &Digest) -> Result<u64, Error> {
        let url = format!("{}/v2/{namespace}/blobs/{digest}", self.base);
        let response = self.request(Method::HEAD, &url, &[], namespace).await?;

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| Error::Upstream(Some("upstream sent no content length".to_string())))
    }

    #[instrument(skip(self))]
    pub async fn get_blob(&self, namespace: &str, digest: &Digest) -> Result<Response, Error> {
        let url = format!("{}/v2/{namespace}/blobs/{digest}", self.base);
        self.request(Method::GET, &url, &[], namespace).await
    }

    /// Fetch a manifest; returns its media type and raw bytes.
    #[instrument(skip(self, accepted_media_types))]
    pub async fn get_manifest(
        &self,
        namespace: &str,
        reference: &Reference,
        accepted_media_types: &[String],
    ) -> Result<(Option<String>, Vec<u8>), Error> {
        let url = format!("{}/v2/{namespace}/manifests/{reference}", self.base);
        let response = self
            .request(Method::GET, &url, accepted_media_types, namespace)
            .await?;

        let media_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let content = response.bytes().await?.to_vec();
        Ok((media_type, content))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        accepted_media_types: &[String],
        namespace: &str,
    ) -> Result<Response, Error> {
        let response = self
            .send(method.clone(), url, accepted_media_types, self.cached_token().await)
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let token = match challenge {
            Some(header) if header.trim_start().starts_with("Bearer ") => {
                self.fetch_token(&header, namespace).await?
            }
            _ => {
                return Err(Error::Upstream(Some(
                    "upstream rejected configured credentials".to_string(),
                )))
            }
        };

        let response = self
            .send(method, url, accepted_media_types, Some(token))
            .await?;
        check_status(response)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        accepted_media_types: &[String],
        token: Option<String>,
    ) -> Result<Response, Error> {
        let mut request = self.http.request(method, url);

        for media_type in accepted_media_types {
            request = request.header(ACCEPT, media_type);
        }

        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        } else if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        Ok(request.send().await?)
    }

    async fn cached_token(&self) -> Option<String> {
        let token = self.token.lock().await;
        token
            .as_ref()
            .filter(|cached| cached.expires_at > Instant::now() + TOKEN_GRACE)
            .map(|cached| cached.value.clone())
    }

    /// Resolve a `Bearer realm=…,service=…,scope=…` challenge into a
    /// token, authenticating with the configured credentials.
    async fn fetch_token(&self, challenge: &str, namespace: &str) -> Result<String, Error> {
        let params = parse_bearer_challenge(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| Error::Upstream(Some("bearer challenge without realm".to_string())))?;

        let mut request = self.http.get(realm);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{namespace}:pull"));
        request = request.query(&[("scope", scope.as_str())]);

        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            warn!("Token endpoint answered {}", response.status());
            return Err(Error::Upstream(Some(
                "failed to obtain upstream token".to_string(),
            )));
        }

        let token_response: TokenResponse = response.json().await?;
        let value = token_response
            .token
            .or(token_response.access_token)
            .ok_or_else(|| Error::Upstream(Some("token endpoint sent no token".to_string())))?;

        let expires_in = token_response.expires_in.unwrap_or(60).max(60);
        debug!("Obtained upstream token, valid for {expires_in}s");

        let mut cached = self.token.lock().await;
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });

        Ok(value)
    }
}

fn check_status(response: Response) -> Result<Response, Error> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(Error::NotFound),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Upstream(Some(
            "upstream denied access".to_string(),
        ))),
        status => Err(Error::Upstream(Some(format!(
            "upstream answered {status}"
        )))),
    }
}

fn parse_bearer_challenge(header: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    let Some(rest) = header.trim_start().strip_prefix("Bearer ") else {
        return params;
    };

    for part in rest.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        params.insert(
            key.trim().to_string(),
            value.trim().trim_matches('"').to_string(),
        );
    }

    params
}
