//! Portal endpoint resolution.
//!
//! Every server publishes `/.well-known/vpn-user-portal` naming its API,
//! authorization, and token endpoints. All three must stay on the base
//! URL's origin. Resolved sets age out quickly and are re-resolved after a
//! 401, so portal reconfigurations are picked up.

use chrono::{DateTime, Duration, Utc};
use fedvpn_core::error::{CoreResult, Error};
use fedvpn_core::http::HttpClient;
use fedvpn_core::urls;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const WELL_KNOWN_PATH: &str = ".well-known/vpn-user-portal";

/// The API version this client speaks.
pub const API_ID: &str = "http://eduvpn.org/api#3";

/// Resolved endpoint sets are reused for this long.
const ENDPOINT_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub api_endpoint: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub resolved_at: DateTime<Utc>,
}

impl Endpoints {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.resolved_at >= Duration::seconds(ENDPOINT_TTL_SECS)
    }
}

#[derive(Debug, Deserialize)]
struct WellKnownDoc {
    api: BTreeMap<String, ApiEndpoints>,
}

#[derive(Debug, Deserialize)]
struct ApiEndpoints {
    api_endpoint: String,
    authorization_endpoint: String,
    token_endpoint: String,
}

/// Fetch and validate the endpoint set for a canonical base URL.
pub async fn resolve(
    http: &HttpClient,
    base_url: &str,
    cancel: &CancellationToken,
) -> CoreResult<Endpoints> {
    let well_known = urls::join_url(base_url, WELL_KNOWN_PATH)?;
    let resp = http.get(&well_known, cancel).await?;
    if !resp.is_success() {
        return Err(Error::unreachable(format!(
            "'{well_known}' returned HTTP {}",
            resp.status
        )));
    }

    let doc: WellKnownDoc = resp.json()?;
    let api = doc.api.get(API_ID).ok_or_else(|| {
        Error::internal(format!("'{base_url}' does not offer the {API_ID} API"))
    })?;

    for uri in [
        &api.api_endpoint,
        &api.authorization_endpoint,
        &api.token_endpoint,
    ] {
        if !urls::same_origin(base_url, uri) {
            return Err(Error::internal(format!(
                "endpoint '{uri}' is not on the origin of '{base_url}'"
            )));
        }
    }

    debug!(%base_url, api = %api.api_endpoint, "endpoints resolved");
    Ok(Endpoints {
        api_endpoint: api.api_endpoint.clone(),
        authorization_endpoint: api.authorization_endpoint.clone(),
        token_endpoint: api.token_endpoint.clone(),
        resolved_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve a well-known document built from the fixture's own base URL.
    async fn serve_well_known(make_body: fn(&str) -> String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/", listener.local_addr().unwrap());
        let body = make_body(&base);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        base
    }

    fn doc(base: &str) -> String {
        format!(
            r#"{{"api": {{"http://eduvpn.org/api#3": {{
                "api_endpoint": "{base}api",
                "authorization_endpoint": "{base}oauth/authorize",
                "token_endpoint": "{base}oauth/token"
            }}}}}}"#
        )
    }

    #[tokio::test]
    async fn resolves_matching_origin() {
        let base = serve_well_known(doc).await;
        let http = HttpClient::new("test/1.0").unwrap();
        let endpoints = resolve(&http, &base, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(endpoints.api_endpoint, format!("{base}api"));
        assert_eq!(endpoints.token_endpoint, format!("{base}oauth/token"));
        assert!(!endpoints.expired(Utc::now()));
    }

    #[tokio::test]
    async fn foreign_origin_is_rejected() {
        let base = serve_well_known(|_| doc("https://evil.example/")).await;
        let http = HttpClient::new("test/1.0").unwrap();
        let err = resolve(&http, &base, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("origin"));
    }

    #[tokio::test]
    async fn missing_api_version_is_rejected() {
        let base = serve_well_known(|_| {
            r#"{"api": {"http://eduvpn.org/api#2": {
                "api_endpoint": "https://x.example/api",
                "authorization_endpoint": "https://x.example/a",
                "token_endpoint": "https://x.example/t"
            }}}"#
                .to_string()
        })
        .await;
        let http = HttpClient::new("test/1.0").unwrap();
        let err = resolve(&http, &base, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.message.contains("api#3"));
    }

    #[tokio::test]
    async fn endpoint_ttl() {
        let endpoints = Endpoints {
            api_endpoint: "https://vpn.example.org/api".into(),
            authorization_endpoint: "https://vpn.example.org/oauth/authorize".into(),
            token_endpoint: "https://vpn.example.org/oauth/token".into(),
            resolved_at: Utc::now(),
        };
        assert!(!endpoints.expired(Utc::now() + Duration::seconds(599)));
        assert!(endpoints.expired(Utc::now() + Duration::seconds(601)));
    }
}
