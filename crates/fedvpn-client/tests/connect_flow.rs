//! End-to-end connect cycles against a loopback portal.
//!
//! The fixture plays a complete vpn-user-portal: well-known endpoint
//! document, OAuth token endpoint, `/info`, `/connect`, `/disconnect`. The
//! transition hook plays the browser by hitting the client's loopback
//! redirect with the expected `code` and `state`, and answers profile
//! choices on the operation's cookie.

use fedvpn_client::service::Client;
use fedvpn_core::cookie::Cookie;
use fedvpn_core::error::ErrorKind;
use fedvpn_core::fsm::{FsmPayload, FsmState, TransitionHook};
use fedvpn_server::types::{Protocol, ServerType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const OPENVPN_CONFIG: &str = "client\ndev tun\nremote 127.0.0.1 1194\nproto udp\nscript-security 0";
const EXPIRES_HEADER: &str = "Fri, 01 Jan 2027 00:00:00 GMT";

// ── Portal fixture ───────────────────────────────────────────────────

async fn read_request(stream: &mut TcpStream) -> Option<(String, String)> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }
    let head = String::from_utf8_lossy(&raw).to_string();
    let mut first = head.lines().next()?.split_whitespace();
    let method = first.next()?.to_string();
    let path = first.next()?.to_string();

    // Drain the body so the client never sees a reset mid-write.
    if let Some(length) = head
        .lines()
        .find_map(|l| {
            let lower = l.to_ascii_lowercase();
            lower.strip_prefix("content-length: ").map(str::to_string)
        })
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        let header_end = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut remaining = length.saturating_sub(raw.len() - header_end);
        while remaining > 0 {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => remaining = remaining.saturating_sub(n),
            }
        }
    }
    Some((method, path))
}

fn route(base: &str, path: &str, tokens_issued: &AtomicUsize) -> (u16, String, String) {
    match path {
        "/.well-known/vpn-user-portal" => (
            200,
            String::new(),
            format!(
                r#"{{"api": {{"http://eduvpn.org/api#3": {{
                    "api_endpoint": "{base}api",
                    "authorization_endpoint": "{base}oauth/authorize",
                    "token_endpoint": "{base}oauth/token"
                }}}}}}"#
            ),
        ),
        "/oauth/token" => {
            let n = tokens_issued.fetch_add(1, Ordering::SeqCst);
            (
                200,
                String::new(),
                format!(
                    r#"{{"access_token": "access-{n}", "refresh_token": "refresh-{n}",
                        "expires_in": 3600, "token_type": "bearer"}}"#
                ),
            )
        }
        "/api/info" => (
            200,
            String::new(),
            r#"{"info": {"profile_list": [
                {"profile_id": "employees", "display_name": {"en": "Employees"},
                 "vpn_proto_list": ["openvpn"], "default_gateway": true},
                {"profile_id": "admins", "display_name": {"en": "Admins"},
                 "vpn_proto_list": ["openvpn"], "default_gateway": false}
            ]}}"#
                .to_string(),
        ),
        "/api/connect" => (
            200,
            format!("Expires: {EXPIRES_HEADER}\r\nContent-Type: application/x-openvpn-profile\r\n"),
            OPENVPN_CONFIG.to_string(),
        ),
        "/api/disconnect" => (200, String::new(), "{}".to_string()),
        _ => (404, String::new(), String::new()),
    }
}

async fn spawn_portal() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}/", listener.local_addr().unwrap());
    let serve_base = base.clone();
    tokio::spawn(async move {
        let tokens_issued = Arc::new(AtomicUsize::new(0));
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let base = serve_base.clone();
            let tokens_issued = Arc::clone(&tokens_issued);
            tokio::spawn(async move {
                let Some((_method, path)) = read_request(&mut stream).await else {
                    return;
                };
                let (status, headers, body) = route(&base, &path, &tokens_issued);
                let response = format!(
                    "HTTP/1.1 {status} X\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    base
}

// ── Browser + profile-choice hook ────────────────────────────────────

type CookieSlot = Arc<Mutex<Option<Arc<Cookie>>>>;

/// A hook that opens "the browser" (hits the loopback redirect with the
/// right code and state) and answers profile choices on the cookie.
fn host_hook(slot: CookieSlot) -> Arc<TransitionHook> {
    Arc::new(move |_old, new, payload| {
        match (new, payload) {
            (FsmState::OAuthStarted, FsmPayload::OpenUrl(auth_url)) => {
                let auth_url = auth_url.clone();
                tokio::spawn(async move {
                    let parsed = url::Url::parse(&auth_url).unwrap();
                    let params: std::collections::HashMap<String, String> =
                        parsed.query_pairs().into_owned().collect();
                    let redirect = format!(
                        "{}?code=TESTCODE&state={}",
                        params["redirect_uri"], params["state"]
                    );
                    let _ = reqwest::get(&redirect).await;
                });
            }
            (FsmState::AskProfile, FsmPayload::Json(_)) => {
                if let Some(cookie) = slot.lock().unwrap().as_ref() {
                    cookie.send("employees").unwrap();
                }
            }
            _ => {}
        }
        true
    })
}

async fn connected_client(state_dir: &std::path::Path) -> (Arc<Client>, CookieSlot) {
    let slot: CookieSlot = Arc::default();
    let client = Client::new(
        "org.eduvpn.app.linux",
        "0.1.0",
        state_dir,
        Some(host_hook(Arc::clone(&slot))),
        None,
        false,
    )
    .await
    .unwrap();
    client.register().await.unwrap();
    (client, slot)
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn custom_server_happy_path() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, slot) = connected_client(dir.path()).await;

    // Add the server: runs the full OAuth loopback dance.
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client
        .add_server(&cookie, &base, ServerType::Custom, None)
        .await
        .unwrap();
    assert_eq!(client.current_state().await, FsmState::Main);

    // Obtain a configuration, preferring TCP.
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    let config = client
        .get_config(&cookie, &base, ServerType::Custom, true, false)
        .await
        .unwrap();

    assert_eq!(config.protocol, Protocol::OpenVpn);
    assert!(config.config.ends_with("udp\nscript-security 0"));
    assert!(config.default_gateway);
    let expiry = config.expiry.unwrap();
    assert_eq!(expiry.end_time.to_rfc3339(), "2027-01-01T00:00:00+00:00");
    assert!(expiry.button_time <= expiry.countdown_time);
    assert_eq!(expiry.notification_times.len(), 4);
    assert_eq!(client.current_state().await, FsmState::GotConfig);

    // The chosen profile is remembered and shown.
    let current = client.current_server().await.unwrap();
    assert_eq!(current.profiles.current.as_deref(), Some("employees"));
    assert!(client.expiry_times().await.is_some());

    // Cleanup posts /disconnect and lands back on Main.
    let cookie = Cookie::new();
    client.cleanup(&cookie).await.unwrap();
    assert_eq!(client.current_state().await, FsmState::Main);
}

#[tokio::test]
async fn corrupted_profile_choice_is_reset_by_get_config() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();

    // First cycle: authorize and connect, remembering "employees".
    {
        let (client, slot) = connected_client(dir.path()).await;
        let cookie = Cookie::new();
        *slot.lock().unwrap() = Some(Arc::clone(&cookie));
        client
            .add_server(&cookie, &base, ServerType::Custom, None)
            .await
            .unwrap();
        let cookie = Cookie::new();
        *slot.lock().unwrap() = Some(Arc::clone(&cookie));
        client
            .get_config(&cookie, &base, ServerType::Custom, false, false)
            .await
            .unwrap();
    }

    // Corrupt the persisted choice behind the client's back.
    let state_path = dir.path().join("state.json");
    let raw = std::fs::read_to_string(&state_path).unwrap();
    assert!(raw.contains("employees"));
    std::fs::write(&state_path, raw.replace("\"employees\"", "\"IDONOTEXIST\"")).unwrap();

    // A fresh client (no cached tokens) reauthorizes, clears the bogus
    // choice, asks again, and ends up on a profile the server offers.
    let (client, slot) = connected_client(dir.path()).await;
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client
        .get_config(&cookie, &base, ServerType::Custom, false, false)
        .await
        .unwrap();

    let current = client.current_server().await.unwrap();
    assert_eq!(current.profiles.current.as_deref(), Some("employees"));
}

#[tokio::test]
async fn autoconnect_without_tokens_needs_reauth() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();

    {
        let (client, slot) = connected_client(dir.path()).await;
        let cookie = Cookie::new();
        *slot.lock().unwrap() = Some(Arc::clone(&cookie));
        client
            .add_server(&cookie, &base, ServerType::Custom, None)
            .await
            .unwrap();
    }

    // A fresh process has no tokens; autoconnect must not open a browser.
    let (client, _slot) = connected_client(dir.path()).await;
    let cookie = Cookie::new();
    let err = client
        .get_config(&cookie, &base, ServerType::Custom, false, true)
        .await
        .unwrap_err();

    assert_eq!(err.kind, ErrorKind::AutoconnectNeedsReauth);
    let (key, _args) = err.translation().unwrap();
    assert_eq!(key, "autoconnect_needs_reauth");
    assert_eq!(client.current_state().await, FsmState::Main);
}

#[tokio::test]
async fn refused_browser_open_fails_the_operation() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();

    // A host that never opens the browser: the authorization payload is
    // reported unhandled, so the operation must fail rather than block on
    // a callback that will never come.
    let hook: Arc<TransitionHook> =
        Arc::new(|_old, new, _payload| new != FsmState::OAuthStarted);
    let client = Client::new(
        "org.eduvpn.app.linux",
        "0.1.0",
        dir.path(),
        Some(hook),
        None,
        false,
    )
    .await
    .unwrap();
    client.register().await.unwrap();

    let cookie = Cookie::new();
    let err = client
        .add_server(&cookie, &base, ServerType::Custom, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::AddServerFailed);
    assert_eq!(client.current_state().await, FsmState::Main);
    assert!(client.server_list().await.is_empty());
}

#[tokio::test]
async fn mobile_client_authorizes_via_custom_scheme() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();

    // Mobile ids get the redirect handed back by the OS; the hook plays
    // that part by answering the cookie with the full redirect URI.
    let slot: CookieSlot = Arc::default();
    let reply_slot = Arc::clone(&slot);
    let hook: Arc<TransitionHook> = Arc::new(move |_old, new, payload| {
        if let (FsmState::OAuthStarted, FsmPayload::OpenUrl(auth_url)) = (new, payload) {
            let parsed = url::Url::parse(auth_url).unwrap();
            let params: std::collections::HashMap<String, String> =
                parsed.query_pairs().into_owned().collect();
            let redirect = format!(
                "org.eduvpn.app:/api/callback?code=TESTCODE&state={}",
                params["state"]
            );
            if let Some(cookie) = reply_slot.lock().unwrap().as_ref() {
                let _ = cookie.send(redirect);
            }
        }
        true
    });

    let client = Client::new(
        "org.eduvpn.app.android",
        "0.1.0",
        dir.path(),
        Some(hook),
        None,
        false,
    )
    .await
    .unwrap();
    client.register().await.unwrap();

    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client
        .add_server(&cookie, &base, ServerType::Custom, None)
        .await
        .unwrap();
    assert_eq!(client.current_state().await, FsmState::Main);
    assert_eq!(client.server_list().await.len(), 1);
}

#[tokio::test]
async fn renew_session_runs_a_fresh_authorization() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, slot) = connected_client(dir.path()).await;

    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client
        .add_server(&cookie, &base, ServerType::Custom, None)
        .await
        .unwrap();
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client
        .get_config(&cookie, &base, ServerType::Custom, false, false)
        .await
        .unwrap();
    let cookie = Cookie::new();
    client.cleanup(&cookie).await.unwrap();

    // Renewal drops the tokens and walks the browser dance again.
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    client.renew_session(&cookie).await.unwrap();
    assert_eq!(client.current_state().await, FsmState::Main);

    // The renewed session still yields configurations.
    let cookie = Cookie::new();
    *slot.lock().unwrap() = Some(Arc::clone(&cookie));
    let config = client
        .get_config(&cookie, &base, ServerType::Custom, false, false)
        .await
        .unwrap();
    assert_eq!(config.protocol, Protocol::OpenVpn);
}

#[tokio::test]
async fn remove_server_forgets_record_and_choice() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, _slot) = connected_client(dir.path()).await;

    let cookie = Cookie::new();
    client
        .add_server(
            &cookie,
            &base,
            ServerType::Custom,
            Some(chrono::Utc::now()),
        )
        .await
        .unwrap();
    assert_eq!(client.server_list().await.len(), 1);

    client
        .remove_server(&base, ServerType::Custom)
        .await
        .unwrap();
    assert!(client.server_list().await.is_empty());
    assert!(client.current_server().await.is_none());
}

#[tokio::test]
async fn non_interactive_add_skips_oauth() {
    let base = spawn_portal().await;
    let dir = tempfile::tempdir().unwrap();
    let (client, _slot) = connected_client(dir.path()).await;

    // No browser hook interaction happens: the host vouches for a previous
    // authorization moment.
    let cookie = Cookie::new();
    client
        .add_server(
            &cookie,
            &base,
            ServerType::Custom,
            Some(chrono::Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .unwrap();
    assert_eq!(client.current_state().await, FsmState::Main);

    let servers = client.server_list().await;
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].server_type, ServerType::Custom);
}
