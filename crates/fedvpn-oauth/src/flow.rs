//! The authorization-code + PKCE flow against a portal's endpoints.

use crate::pkce;
use crate::types::{AuthRequest, OAuthErrorResponse, TokenResponse, TokenSet};
use chrono::{Duration, Utc};
use fedvpn_core::error::{CoreResult, Error};
use fedvpn_core::http::HttpClient;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Scope the portals hand configuration rights under.
const SCOPE: &str = "config";

/// Access-token lifetime assumed when the endpoint omits `expires_in`.
const DEFAULT_EXPIRY_SECS: i64 = 3600;

/// Build the browser URL and the pending-authorization state.
pub fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
) -> CoreResult<AuthRequest> {
    let verifier = pkce::generate_verifier();
    let challenge = pkce::challenge_s256(&verifier);
    let state = pkce::generate_state();

    let url = url::Url::parse_with_params(
        authorization_endpoint,
        &[
            ("client_id", client_id),
            ("response_type", "code"),
            ("scope", SCOPE),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("state", state.as_str()),
            ("redirect_uri", redirect_uri),
        ],
    )
    .map_err(|e| Error::invalid_url(authorization_endpoint, e.to_string()))?;

    Ok(AuthRequest {
        url: url.to_string(),
        state,
        verifier,
        redirect_uri: redirect_uri.to_string(),
    })
}

/// Validate callback parameters and extract the authorization code.
///
/// `expected_iss` is the portal's origin and is enforced when the portal
/// advertises ISS checking.
pub fn validate_callback(
    params: &HashMap<String, String>,
    expected_state: &str,
    expected_iss: Option<&str>,
) -> CoreResult<String> {
    if let Some(error) = params.get("error") {
        return Err(Error::signature_invalid(format!(
            "authorization denied: {error}"
        )));
    }

    let state = params
        .get("state")
        .ok_or_else(|| Error::signature_invalid("callback lacks a state parameter"))?;
    if state != expected_state {
        return Err(Error::signature_invalid("callback state does not match"));
    }

    if let Some(expected) = expected_iss {
        let iss = params
            .get("iss")
            .ok_or_else(|| Error::signature_invalid("callback lacks the iss parameter"))?;
        if iss.trim_end_matches('/') != expected.trim_end_matches('/') {
            return Err(Error::signature_invalid(format!(
                "callback iss '{iss}' does not match '{expected}'"
            )));
        }
    }

    params
        .get("code")
        .cloned()
        .ok_or_else(|| Error::signature_invalid("callback lacks a code parameter"))
}

/// Exchange the authorization code for a token set.
pub async fn exchange_authorization_code(
    http: &HttpClient,
    token_endpoint: &str,
    client_id: &str,
    request: &AuthRequest,
    code: &str,
    issuer: &str,
    cancel: &CancellationToken,
) -> CoreResult<TokenSet> {
    debug!("exchanging authorization code");
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", request.verifier.as_str()),
        ("redirect_uri", request.redirect_uri.as_str()),
        ("client_id", client_id),
    ];
    let resp = http.post_form(token_endpoint, &params, cancel).await?;
    if !resp.is_success() {
        return Err(token_endpoint_error(resp.status, &resp.body));
    }
    let parsed: TokenResponse = resp.json()?;
    Ok(token_set_from_response(parsed, None, issuer))
}

/// Refresh an expiring token set.
///
/// Some portal versions omit the refresh token in a refresh response; the
/// previous one is carried forward then.
pub async fn refresh_tokens(
    http: &HttpClient,
    token_endpoint: &str,
    client_id: &str,
    previous: &TokenSet,
    cancel: &CancellationToken,
) -> CoreResult<TokenSet> {
    if previous.refresh.is_empty() {
        return Err(Error::tokens_invalid("no refresh token available"));
    }

    debug!("refreshing access token");
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", previous.refresh.as_str()),
        ("client_id", client_id),
    ];
    let resp = http.post_form(token_endpoint, &params, cancel).await?;
    if !resp.is_success() {
        return Err(token_endpoint_error(resp.status, &resp.body));
    }
    let parsed: TokenResponse = resp.json()?;
    Ok(token_set_from_response(
        parsed,
        Some(previous.refresh.as_str()),
        &previous.issuer,
    ))
}

fn token_set_from_response(
    resp: TokenResponse,
    previous_refresh: Option<&str>,
    issuer: &str,
) -> TokenSet {
    let refresh = match resp.refresh_token.filter(|r| !r.is_empty()) {
        Some(r) => r,
        None => previous_refresh.unwrap_or_default().to_string(),
    };
    TokenSet {
        access: resp.access_token,
        refresh,
        expires_at: Utc::now()
            + Duration::seconds(resp.expires_in.unwrap_or(DEFAULT_EXPIRY_SECS)),
        issuer: issuer.to_string(),
    }
}

/// Classify a token endpoint failure; `invalid_grant` means the refresh
/// token is dead and a reauthorization is needed.
fn token_endpoint_error(status: u16, body: &[u8]) -> Error {
    if let Ok(parsed) = serde_json::from_slice::<OAuthErrorResponse>(body) {
        let detail = parsed.error_description.unwrap_or_default();
        if parsed.error == "invalid_grant" {
            return Error::tokens_invalid(format!("token endpoint: invalid_grant {detail}"));
        }
        return Error::tokens_invalid(format!("token endpoint: {} {detail}", parsed.error));
    }
    Error::unreachable(format!("token endpoint returned HTTP {status}"))
}
