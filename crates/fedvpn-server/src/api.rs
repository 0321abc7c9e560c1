//! Authenticated portal calls.
//!
//! Every request carries a Bearer token obtained from the orchestrator's
//! token capability. A 401 marks the tokens expired and retries once with a
//! freshly ensured token; a second 401 surfaces `TokensInvalid`.

use crate::endpoints::Endpoints;
use crate::types::{Profile, Protocol};
use crate::wireguard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedvpn_core::error::{CoreResult, Error};
use fedvpn_core::http::{HttpClient, HttpResponse};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Token capability the orchestrator hands to the server layer instead of a
/// back-pointer: obtain a valid access token, or force the next obtain to
/// refresh.
#[async_trait]
pub trait AccessTokens: Send + Sync {
    async fn access_token(&self, cancel: &CancellationToken) -> CoreResult<String>;
    /// Mark the cached access token expired (after a 401).
    async fn mark_expired(&self);
}

/// What `/connect` is asked for.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub profile_id: String,
    pub prefer_tcp: bool,
    /// Protocols the host can drive, in preference order.
    pub protocols: Vec<Protocol>,
}

/// A configuration blob ready for the host's tunnel layer.
#[derive(Debug, Clone)]
pub struct VpnConfig {
    pub config: String,
    pub protocol: Protocol,
    /// Parsed from the `Expires` response header.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    info: InfoBody,
}

#[derive(Debug, Deserialize)]
struct InfoBody {
    #[serde(default)]
    profile_list: Vec<Profile>,
}

/// `GET /info`: the profile catalog.
pub async fn fetch_info(
    http: &HttpClient,
    endpoints: &Endpoints,
    tokens: &dyn AccessTokens,
    cancel: &CancellationToken,
) -> CoreResult<Vec<Profile>> {
    let url = api_url(endpoints, "info");
    let resp = authorized(tokens, cancel, |token| {
        let http = http.clone();
        let url = url.clone();
        async move { http.get_authorized(&url, &token, cancel).await }
    })
    .await?;

    let parsed: InfoResponse = resp.json()?;
    debug!(profiles = parsed.info.profile_list.len(), "fetched /info");
    Ok(parsed.info.profile_list)
}

/// `POST /connect`: obtain a configuration for a profile.
///
/// For WireGuard-capable requests a fresh keypair is generated and its
/// private key is folded into the returned config.
pub async fn connect(
    http: &HttpClient,
    endpoints: &Endpoints,
    tokens: &dyn AccessTokens,
    request: &ConnectRequest,
    cancel: &CancellationToken,
) -> CoreResult<VpnConfig> {
    let url = api_url(endpoints, "connect");

    let keypair = request
        .protocols
        .contains(&Protocol::WireGuard)
        .then(wireguard::generate_keypair);

    let prefer_tcp = if request.prefer_tcp { "yes" } else { "no" };
    let mut params: Vec<(&str, &str)> = vec![
        ("profile_id", request.profile_id.as_str()),
        ("prefer_tcp", prefer_tcp),
    ];
    if let Some(keypair) = &keypair {
        params.push(("public_key", keypair.public.as_str()));
    }

    let resp = authorized(tokens, cancel, |token| {
        let http = http.clone();
        let url = url.clone();
        let params = params.clone();
        async move {
            http.post_form_authorized(&url, &params, &token, cancel)
                .await
        }
    })
    .await?;

    let protocol = protocol_from_config(&resp)?;
    let mut config = resp.text()?;
    if protocol == Protocol::WireGuard {
        let keypair = keypair
            .ok_or_else(|| Error::internal("portal sent WireGuard to an OpenVPN-only request"))?;
        config = wireguard::insert_private_key(&config, &keypair.private);
    }

    let expires_at = resp.expires.as_deref().and_then(parse_http_date);

    Ok(VpnConfig {
        config,
        protocol,
        expires_at,
    })
}

/// `POST /disconnect`: release server-side resources. Best-effort.
pub async fn disconnect(
    http: &HttpClient,
    endpoints: &Endpoints,
    tokens: &dyn AccessTokens,
    cancel: &CancellationToken,
) -> CoreResult<()> {
    let url = api_url(endpoints, "disconnect");
    let resp = authorized(tokens, cancel, |token| {
        let http = http.clone();
        let url = url.clone();
        async move { http.post_form_authorized(&url, &[], &token, cancel).await }
    })
    .await?;
    if !resp.is_success() {
        warn!(status = resp.status, "/disconnect did not succeed");
    }
    Ok(())
}

/// Run an authenticated request with the single 401 retry.
async fn authorized<F, Fut>(
    tokens: &dyn AccessTokens,
    cancel: &CancellationToken,
    mut send: F,
) -> CoreResult<HttpResponse>
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = CoreResult<HttpResponse>>,
{
    let token = tokens.access_token(cancel).await?;
    let resp = send(token).await?;
    if resp.status != 401 {
        return check_api_status(resp);
    }

    debug!("got 401, refreshing tokens and retrying once");
    tokens.mark_expired().await;
    let token = tokens.access_token(cancel).await?;
    let resp = send(token).await?;
    if resp.status == 401 {
        return Err(Error::tokens_invalid("portal rejected a fresh token"));
    }
    check_api_status(resp)
}

/// API paths hang directly off the advertised endpoint, with or without
/// its trailing slash.
fn api_url(endpoints: &Endpoints, path: &str) -> String {
    format!("{}/{}", endpoints.api_endpoint.trim_end_matches('/'), path)
}

fn check_api_status(resp: HttpResponse) -> CoreResult<HttpResponse> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(Error::unreachable(format!(
            "portal returned HTTP {}",
            resp.status
        )))
    }
}

/// The portal answers `/connect` with a config whose first meaningful line
/// tells the protocol: WireGuard configs open with `[Interface]`.
fn protocol_from_config(resp: &HttpResponse) -> CoreResult<Protocol> {
    let text = resp.text()?;
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .unwrap_or("");
    if first.eq_ignore_ascii_case("[interface]") {
        Ok(Protocol::WireGuard)
    } else {
        Ok(Protocol::OpenVpn)
    }
}

/// `Expires` headers use the RFC 7231 HTTP-date format.
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Capability stub handing out sequential tokens.
    struct SequentialTokens {
        issued: AtomicUsize,
        expired: AtomicUsize,
    }

    impl SequentialTokens {
        fn new() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                expired: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AccessTokens for SequentialTokens {
        async fn access_token(&self, _cancel: &CancellationToken) -> CoreResult<String> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{n}"))
        }
        async fn mark_expired(&self) {
            self.expired.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Fixture: 401 for `reject_first` requests, then a fixed response.
    async fn api_fixture(
        reject_first: usize,
        body: &'static str,
        extra_headers: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let n = served.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    let resp = if n < reject_first {
                        "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
                    } else {
                        format!(
                            "HTTP/1.1 200 OK\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            extra_headers,
                            body.len(),
                            body
                        )
                    };
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn endpoints(base: &str) -> Endpoints {
        Endpoints {
            api_endpoint: format!("{base}/api/"),
            authorization_endpoint: format!("{base}/oauth/authorize"),
            token_endpoint: format!("{base}/oauth/token"),
            resolved_at: Utc::now(),
        }
    }

    const INFO_BODY: &str = r#"{"info": {"profile_list": [
      {"profile_id": "employees", "display_name": {"en": "Employees"},
       "vpn_proto_list": ["openvpn", "wireguard"], "default_gateway": true}
    ]}}"#;

    #[tokio::test]
    async fn info_parses_profiles() {
        let base = api_fixture(0, INFO_BODY, "").await;
        let http = HttpClient::new("test/1.0").unwrap();
        let tokens = SequentialTokens::new();
        let profiles = fetch_info(&http, &endpoints(&base), &tokens, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].profile_id, "employees");
        assert!(profiles[0].supported_by(&[Protocol::OpenVpn]));
    }

    #[tokio::test]
    async fn single_401_refreshes_and_retries() {
        let base = api_fixture(1, INFO_BODY, "").await;
        let http = HttpClient::new("test/1.0").unwrap();
        let tokens = SequentialTokens::new();
        let profiles = fetch_info(&http, &endpoints(&base), &tokens, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(tokens.expired.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.issued.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_401_is_tokens_invalid() {
        let base = api_fixture(2, INFO_BODY, "").await;
        let http = HttpClient::new("test/1.0").unwrap();
        let tokens = SequentialTokens::new();
        let err = fetch_info(&http, &endpoints(&base), &tokens, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, fedvpn_core::error::ErrorKind::TokensInvalid);
    }

    #[tokio::test]
    async fn connect_returns_openvpn_config_with_expiry() {
        let body = "client\ndev tun\nremote vpn.example.org 1194 udp\nscript-security 0";
        let base = api_fixture(
            0,
            body,
            "Expires: Fri, 06 Feb 2026 10:00:00 GMT\r\nContent-Type: application/x-openvpn-profile\r\n",
        )
        .await;
        let http = HttpClient::new("test/1.0").unwrap();
        let tokens = SequentialTokens::new();
        let config = connect(
            &http,
            &endpoints(&base),
            &tokens,
            &ConnectRequest {
                profile_id: "employees".into(),
                prefer_tcp: false,
                protocols: vec![Protocol::OpenVpn],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(config.protocol, Protocol::OpenVpn);
        assert!(config.config.ends_with("script-security 0"));
        let expires = config.expires_at.unwrap();
        assert_eq!(expires.to_rfc3339(), "2026-02-06T10:00:00+00:00");
    }

    #[tokio::test]
    async fn connect_inserts_wireguard_private_key() {
        let body = "[Interface]\nAddress = 10.10.10.2/24\n\n[Peer]\nPublicKey = AAAA\nEndpoint = vpn.example.org:51820";
        let base = api_fixture(0, body, "Content-Type: application/x-wireguard-profile\r\n").await;
        let http = HttpClient::new("test/1.0").unwrap();
        let tokens = SequentialTokens::new();
        let config = connect(
            &http,
            &endpoints(&base),
            &tokens,
            &ConnectRequest {
                profile_id: "employees".into(),
                prefer_tcp: false,
                protocols: vec![Protocol::WireGuard, Protocol::OpenVpn],
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(config.protocol, Protocol::WireGuard);
        assert!(config.config.contains("PrivateKey = "));
        assert!(config.config.contains("Address = 10.10.10.2/24"));
    }

    #[test]
    fn http_date_parses() {
        let parsed = parse_http_date("Fri, 06 Feb 2026 10:30:00 GMT").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-02-06T10:30:00+00:00");
        assert!(parse_http_date("not a date").is_none());
    }
}
