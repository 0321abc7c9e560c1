//! The orchestrator: the host-facing client API.
//!
//! Every public operation runs under one lock so concurrent host calls
//! observe a consistent state machine, and every error path rolls the FSM
//! back to where the operation started. Host callbacks never run under the
//! lock: transitions are reported through the FSM's notifier lane and
//! answered through cookies.

use crate::proxyguard::{Proxyguard, ProxyguardConfig};
use crate::registry::{self, ClientId};
use chrono::{DateTime, Utc};
use fedvpn_core::cookie::Cookie;
use fedvpn_core::error::{CoreResult, Error, ErrorKind};
use fedvpn_core::fsm::{Fsm, FsmPayload, FsmState, TransitionHook};
use fedvpn_core::http::HttpClient;
use fedvpn_core::urls;
use fedvpn_discovery::manager::Discovery;
use fedvpn_discovery::types::{DiscoveryServer, Organization};
use fedvpn_failover::probe::{probe_dropped, ProbeConfig};
use fedvpn_oauth::cache::{TokenCache, TokenStore};
use fedvpn_oauth::flow;
use fedvpn_oauth::listener::CallbackListener;
use fedvpn_server::api::{self, AccessTokens, ConnectRequest};
use fedvpn_server::endpoints::{self, Endpoints};
use fedvpn_server::expiry::Expiry;
use fedvpn_server::types::{Protocol, ServerKey, ServerRecord, ServerType};
use fedvpn_state::{StateFile, StateStore};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A finished connect cycle, ready for the host's tunnel layer.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigResult {
    pub config: String,
    pub protocol: Protocol,
    pub default_gateway: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry: Option<ExpiryTimes>,
}

/// Wall-clock session instants for the host's renew UI.
#[derive(Debug, Clone, Serialize)]
pub struct ExpiryTimes {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub button_time: DateTime<Utc>,
    pub countdown_time: DateTime<Utc>,
    pub notification_times: Vec<DateTime<Utc>>,
}

impl From<Expiry> for ExpiryTimes {
    fn from(e: Expiry) -> Self {
        Self {
            start_time: e.start_time,
            end_time: e.end_time,
            button_time: e.renew_button_time(),
            countdown_time: e.countdown_time(),
            notification_times: e.notification_times(),
        }
    }
}

/// A server as shown to the host.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub identifier: String,
    pub server_type: ServerType,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    pub profiles: fedvpn_server::types::ProfileInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct ClientState {
    fsm: Fsm,
    state: StateFile,
    /// Transient endpoint cache per base URL.
    endpoints: HashMap<String, Endpoints>,
}

/// The client core handle. One per host application instance.
#[derive(Debug)]
pub struct Client {
    client_id: ClientId,
    version: String,
    debug: bool,
    http: HttpClient,
    discovery: Discovery,
    tokens: TokenCache,
    store: StateStore,
    protocols: std::sync::Mutex<Vec<Protocol>>,
    /// The orchestrator lock: public operations serialize on it.
    inner: Mutex<ClientState>,
    proxyguard: Mutex<Option<Proxyguard>>,
}

impl Client {
    /// Validate the application identity, load (or migrate) persisted
    /// state, and assemble the component stack.
    pub async fn new(
        client_id: &str,
        version: &str,
        state_dir: &Path,
        transition_hook: Option<Arc<TransitionHook>>,
        token_store: Option<Arc<dyn TokenStore>>,
        debug: bool,
    ) -> CoreResult<Arc<Self>> {
        let client_id = ClientId::parse(client_id)?;
        registry::validate_version(version)?;

        let user_agent = registry::user_agent(&client_id, version);
        let http = HttpClient::new(&user_agent)?;
        let discovery = Discovery::new(http.clone());

        let store = StateStore::new(state_dir);
        let state = store.load()?;
        discovery.restore(state.discovery.clone()).await;

        let fsm = match transition_hook {
            Some(hook) => Fsm::with_hook(hook),
            None => Fsm::new(),
        };

        info!(id = %client_id, version, "client constructed");
        Ok(Arc::new(Self {
            client_id,
            version: version.to_string(),
            debug,
            http,
            discovery,
            tokens: TokenCache::new(token_store),
            store,
            protocols: std::sync::Mutex::new(vec![Protocol::OpenVpn, Protocol::WireGuard]),
            inner: Mutex::new(ClientState {
                fsm,
                state,
                endpoints: HashMap::new(),
            }),
            proxyguard: Mutex::new(None),
        }))
    }

    /// Restrict the protocols this host can drive (default: both).
    pub fn set_supported_protocols(&self, protocols: Vec<Protocol>) {
        *self.protocols.lock().expect("protocol lock poisoned") = protocols;
    }

    pub fn user_agent(&self) -> &str {
        self.http.user_agent()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    // ── Registration ─────────────────────────────────────────────

    pub async fn register(&self) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        guard.fsm.go(FsmState::Main, FsmPayload::Empty)
    }

    /// Flush state and leave the registered world.
    pub async fn deregister(&self) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        self.persist(&mut guard).await;
        guard.fsm.rollback_to(FsmState::Deregistered);
        Ok(())
    }

    pub async fn current_state(&self) -> FsmState {
        self.inner.lock().await.fsm.current()
    }

    // ── Discovery ────────────────────────────────────────────────

    /// Kick a background discovery refresh; `on_refreshed` fires if the
    /// client still sits on Main when the refresh lands.
    pub fn discovery_startup<F>(self: &Arc<Self>, on_refreshed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.client_id.discovery_enabled() {
            debug!("discovery startup skipped: capability disabled");
            return;
        }
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(e) = client.discovery.refresh_servers(&cancel).await {
                warn!("startup server-list refresh failed: {e}");
            }
            if let Err(e) = client.discovery.refresh_organizations(&cancel).await {
                warn!("startup organization-list refresh failed: {e}");
            }
            let on_main = client.inner.lock().await.fsm.in_state(FsmState::Main);
            if on_main {
                on_refreshed();
            }
        });
    }

    pub async fn discover_servers(
        &self,
        cookie: &Arc<Cookie>,
        search: &str,
    ) -> CoreResult<Vec<DiscoveryServer>> {
        self.require_discovery()?;
        self.discovery.servers(&cookie.cancel_token()).await?;
        Ok(self.discovery.search_servers(search).await)
    }

    pub async fn discover_organizations(
        &self,
        cookie: &Arc<Cookie>,
        search: &str,
    ) -> CoreResult<Vec<Organization>> {
        self.require_discovery()?;
        self.discovery.organizations(&cookie.cancel_token()).await?;
        Ok(self.discovery.search_organizations(search).await)
    }

    fn require_discovery(&self) -> CoreResult<()> {
        if self.client_id.discovery_enabled() {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::CapabilityDisabled,
                format!("'{}' has no discovery capability", self.client_id),
            ))
        }
    }

    // ── Server management ────────────────────────────────────────

    /// Add a server and, unless a previous authorization moment is given,
    /// run the browser authorization for it.
    pub async fn add_server(
        &self,
        cookie: &Arc<Cookie>,
        identifier: &str,
        server_type: ServerType,
        oauth_start: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        let prev = guard.fsm.current();
        let key = ServerKey::new(server_type, canonical_identifier(server_type, identifier)?);

        let result = self
            .add_server_inner(&mut guard, cookie, &key, oauth_start)
            .await;
        if let Err(e) = result {
            // A half-added server is removed again.
            if guard.state.remove_server(&key).is_some() {
                self.tokens.clear(&key.storage_key()).await;
                self.persist(&mut guard).await;
            }
            guard.fsm.rollback_to(prev);
            return Err(match e.kind {
                ErrorKind::Cancelled => e,
                _ => Error::add_server_failed(&key.identifier, e),
            });
        }
        Ok(())
    }

    async fn add_server_inner(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
        oauth_start: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        guard.fsm.go(
            FsmState::AddingServer,
            FsmPayload::Json(serde_json::json!({
                "identifier": key.identifier,
                "server_type": key.server_type,
            })),
        )?;

        if key.server_type == ServerType::SecureInternet {
            if let Some((existing, _)) = guard.state.secure_internet() {
                if existing.identifier != key.identifier {
                    return Err(Error::internal(format!(
                        "a secure internet server for '{}' already exists",
                        existing.identifier
                    )));
                }
            }
        }

        let cancel = cookie.cancel_token();
        let mut record = ServerRecord::default();
        let base_url = match key.server_type {
            ServerType::Custom => key.identifier.clone(),
            ServerType::InstituteAccess => {
                self.discovery.servers(&cancel).await?;
                let entry = self
                    .discovery
                    .server_by_url(&key.identifier, fedvpn_discovery::types::DiscoveryServerType::InstituteAccess)
                    .await?;
                record.display_name = Some(entry.display_name.clone());
                key.identifier.clone()
            }
            ServerType::SecureInternet => {
                // Adding secure internet always requires authorization, so
                // the organization list is invalidated up front.
                self.discovery.expire_organizations().await;
                self.discovery.organizations(&cancel).await?;
                self.discovery.servers(&cancel).await?;
                let (org, home) = self.discovery.secure_home_args(&key.identifier).await?;
                record.display_name = Some(org.display_name.clone());
                home.base_url
            }
        };

        guard.state.insert_server(key, record);
        self.persist(guard).await;

        if let Some(started) = oauth_start {
            // Non-interactive add: the host vouches for an existing
            // authorization (import path).
            if let Some(record) = guard.state.server_mut(key) {
                record.last_authorize_time = Some(started);
            }
            self.persist(guard).await;
            guard.fsm.go(FsmState::Main, FsmPayload::Empty)?;
            return Ok(());
        }

        let endpoints = self.endpoints_for(guard, &base_url, &cancel).await?;
        self.authorize(guard, cookie, key, &base_url, &endpoints).await?;
        self.persist(guard).await;
        guard.fsm.go(FsmState::Main, FsmPayload::Empty)?;
        Ok(())
    }

    pub async fn remove_server(
        &self,
        identifier: &str,
        server_type: ServerType,
    ) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        let key = ServerKey::new(server_type, canonical_identifier(server_type, identifier)?);
        if guard.state.remove_server(&key).is_none() {
            return Err(Error::internal(format!("no server '{key}' to remove")));
        }
        self.tokens.clear(&key.storage_key()).await;
        if server_type == ServerType::SecureInternet {
            self.discovery.expire_organizations().await;
        }
        self.persist(&mut guard).await;
        Ok(())
    }

    pub async fn server_list(&self) -> Vec<ServerInfo> {
        let guard = self.inner.lock().await;
        guard
            .state
            .server_list
            .iter()
            .filter_map(|(raw, record)| {
                let key = ServerKey::parse(raw).ok()?;
                Some(server_info(&key, record))
            })
            .collect()
    }

    /// The last server a configuration was obtained for.
    pub async fn current_server(&self) -> Option<ServerInfo> {
        let guard = self.inner.lock().await;
        let key = guard.state.last_chosen()?;
        let record = guard.state.server(&key)?;
        Some(server_info(&key, record))
    }

    /// Session expiry instants for the current server.
    pub async fn expiry_times(&self) -> Option<ExpiryTimes> {
        let guard = self.inner.lock().await;
        let key = guard.state.last_chosen()?;
        let record = guard.state.server(&key)?;
        let expiry = Expiry::new(record.start_time?, record.expire_time?);
        Some(expiry.into())
    }

    /// Remember a profile choice for the current server.
    pub async fn set_profile_id(&self, profile_id: &str) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        let key = guard
            .state
            .last_chosen()
            .ok_or_else(|| Error::internal("no current server"))?;
        let record = guard
            .state
            .server_mut(&key)
            .ok_or_else(|| Error::internal("current server has no record"))?;
        record.profiles.set_current(profile_id)?;
        if key.server_type == ServerType::SecureInternet {
            if let Some(cc) = record.country_code.clone() {
                record
                    .profile_by_country
                    .insert(cc, profile_id.to_string());
            }
        }
        self.persist(&mut guard).await;
        Ok(())
    }

    /// Choose the secure-internet country.
    pub async fn set_secure_location(
        &self,
        cookie: &Arc<Cookie>,
        country_code: &str,
    ) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        let (key, _) = guard
            .state
            .secure_internet()
            .ok_or_else(|| Error::internal("no secure internet server"))?;

        // Validate the country against the catalog.
        self.discovery.servers(&cookie.cancel_token()).await?;
        self.discovery.server_by_country_code(country_code).await?;

        let record = guard
            .state
            .server_mut(&key)
            .ok_or_else(|| Error::internal("secure internet record vanished"))?;
        record.country_code = Some(country_code.to_string());
        // Profile memory follows the country.
        record.profiles.current = record.profile_by_country.get(country_code).cloned();
        // The roaming API base changed, so cached endpoints may be stale.
        guard.endpoints.clear();
        self.persist(&mut guard).await;
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────

    /// Drive a server from identifier to a VPN configuration.
    ///
    /// With `startup` set no interactive callback is allowed: a needed
    /// authorization fails with `AutoconnectNeedsReauth` instead.
    pub async fn get_config(
        &self,
        cookie: &Arc<Cookie>,
        identifier: &str,
        server_type: ServerType,
        prefer_tcp: bool,
        startup: bool,
    ) -> CoreResult<ConfigResult> {
        let mut guard = self.inner.lock().await;
        let prev = guard.fsm.current();
        let key = ServerKey::new(server_type, canonical_identifier(server_type, identifier)?);

        let result = self
            .get_config_inner(&mut guard, cookie, &key, prefer_tcp, startup)
            .await;
        match result {
            Ok(config) => Ok(config),
            Err(e) => {
                guard.fsm.rollback_to(prev);
                Err(match e.kind {
                    ErrorKind::Cancelled
                    | ErrorKind::AutoconnectNeedsReauth
                    | ErrorKind::InvalidFsmTransition => e,
                    _ => Error::config_fetch_failed(&key.identifier, e),
                })
            }
        }
    }

    async fn get_config_inner(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
        prefer_tcp: bool,
        startup: bool,
    ) -> CoreResult<ConfigResult> {
        if guard.state.server(key).is_none() {
            return Err(Error::internal(format!(
                "server '{key}' is unknown; add it first"
            )));
        }
        let cancel = cookie.cancel_token();

        // Secure internet needs a country before anything else.
        if key.server_type == ServerType::SecureInternet {
            self.discovery.servers(&cancel).await?;
            let has_country = guard
                .state
                .server(key)
                .and_then(|r| r.country_code.clone())
                .is_some();
            if !has_country {
                if startup {
                    return Err(Error::internal(
                        "a location choice is needed, which autoconnect cannot ask for",
                    ));
                }
                self.ask_location(guard, cookie, key).await?;
            }
        }
        guard.fsm.go(FsmState::GettingConfig, FsmPayload::Empty)?;

        let base_url = self.base_url_for(guard, key).await?;

        // One uniform retry when the tokens turn out dead mid-flight.
        let mut reauthorized = false;
        loop {
            match self
                .try_config(guard, cookie, key, &base_url, prefer_tcp, startup)
                .await
            {
                Ok(config) => {
                    guard.state.set_last_chosen(key);
                    self.persist(guard).await;
                    guard.fsm.go(
                        FsmState::GotConfig,
                        FsmPayload::Json(serde_json::json!({
                            "protocol": config.protocol,
                            "server": key.identifier,
                        })),
                    )?;
                    return Ok(config);
                }
                Err(e) if e.chain_has(ErrorKind::TokensInvalid) && !reauthorized => {
                    if startup {
                        return Err(Error::autoconnect_needs_reauth(&key.identifier));
                    }
                    debug!("tokens invalid, driving one reauthorization");
                    reauthorized = true;
                    guard.endpoints.remove(&base_url);
                    let endpoints = self.endpoints_for(guard, &base_url, &cancel).await?;
                    self.authorize(guard, cookie, key, &base_url, &endpoints).await?;
                    guard.fsm.go(FsmState::GettingConfig, FsmPayload::Empty)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_config(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
        base_url: &str,
        prefer_tcp: bool,
        startup: bool,
    ) -> CoreResult<ConfigResult> {
        let cancel = cookie.cancel_token();
        let endpoints = self.endpoints_for(guard, base_url, &cancel).await?;
        let capability = self.capability(key, base_url, &endpoints);
        let protocols = self.supported_protocols();

        let profile_list = api::fetch_info(&self.http, &endpoints, &capability, &cancel).await?;
        {
            let record = guard
                .state
                .server_mut(key)
                .ok_or_else(|| Error::internal("server record vanished"))?;
            record.profiles.update_list(profile_list, &protocols);
        }
        self.persist(guard).await;

        self.ensure_profile_chosen(guard, cookie, key, &protocols, startup)
            .await?;

        let (profile_id, default_gateway) = {
            let record = guard
                .state
                .server(key)
                .ok_or_else(|| Error::internal("server record vanished"))?;
            let profile = record
                .profiles
                .current_profile()
                .ok_or_else(|| Error::internal("no profile chosen"))?;
            (profile.profile_id.clone(), profile.default_gateway)
        };

        let config = api::connect(
            &self.http,
            &endpoints,
            &capability,
            &ConnectRequest {
                profile_id,
                prefer_tcp,
                protocols,
            },
            &cancel,
        )
        .await?;

        let now = Utc::now();
        let expiry = {
            let record = guard
                .state
                .server_mut(key)
                .ok_or_else(|| Error::internal("server record vanished"))?;
            record.start_time = Some(now);
            record.expire_time = config.expires_at;
            config
                .expires_at
                .map(|end| ExpiryTimes::from(Expiry::new(now, end)))
        };
        self.persist(guard).await;

        Ok(ConfigResult {
            config: config.config,
            protocol: config.protocol,
            default_gateway,
            expiry,
        })
    }

    /// Make sure a valid profile is chosen, asking the host when several
    /// are usable.
    async fn ensure_profile_chosen(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
        protocols: &[Protocol],
        startup: bool,
    ) -> CoreResult<()> {
        let (needs_choice, payload) = {
            let record = guard
                .state
                .server(key)
                .ok_or_else(|| Error::internal("server record vanished"))?;
            if record.profiles.current_profile().is_some() {
                return Ok(());
            }
            let usable: Vec<_> = record.profiles.usable(protocols);
            match usable.len() {
                0 => {
                    return Err(Error::internal(
                        "the server offers no profile this client can use",
                    ))
                }
                1 => (Some(usable[0].profile_id.clone()), FsmPayload::Empty),
                _ => (
                    None,
                    FsmPayload::Json(serde_json::json!({
                        "profiles": record.profiles.profile_list,
                    })),
                ),
            }
        };

        let chosen = match needs_choice {
            Some(only) => only,
            None => {
                if startup {
                    return Err(Error::internal(
                        "a profile choice is needed, which autoconnect cannot ask for",
                    ));
                }
                guard
                    .fsm
                    .go_required(FsmState::AskProfile, payload, cookie)?;
                let choice = cookie.receive().await?;
                guard.fsm.go(FsmState::GettingConfig, FsmPayload::Empty)?;
                choice
            }
        };

        let record = guard
            .state
            .server_mut(key)
            .ok_or_else(|| Error::internal("server record vanished"))?;
        record.profiles.set_current(&chosen)?;
        if key.server_type == ServerType::SecureInternet {
            if let Some(cc) = record.country_code.clone() {
                record.profile_by_country.insert(cc, chosen);
            }
        }
        self.persist(guard).await;
        Ok(())
    }

    async fn ask_location(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
    ) -> CoreResult<()> {
        let locations = {
            let snapshot = self.discovery.snapshot().await;
            snapshot
                .servers
                .map(|c| c.document.country_codes())
                .unwrap_or_default()
        };
        guard.fsm.go_required(
            FsmState::AskLocation,
            FsmPayload::Json(serde_json::json!({ "locations": locations })),
            cookie,
        )?;
        let choice = cookie.receive().await?;
        self.discovery.server_by_country_code(&choice).await?;

        let record = guard
            .state
            .server_mut(key)
            .ok_or_else(|| Error::internal("server record vanished"))?;
        record.country_code = Some(choice.clone());
        record.profiles.current = record.profile_by_country.get(&choice).cloned();
        self.persist(guard).await;
        Ok(())
    }

    // ── Session lifecycle ────────────────────────────────────────

    /// Drop tokens and force a fresh authorization for the current server.
    pub async fn renew_session(&self, cookie: &Arc<Cookie>) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        let prev = guard.fsm.current();
        let result = self.renew_session_inner(&mut guard, cookie).await;
        if let Err(e) = result {
            guard.fsm.rollback_to(prev);
            return Err(e);
        }
        Ok(())
    }

    async fn renew_session_inner(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
    ) -> CoreResult<()> {
        let key = guard
            .state
            .last_chosen()
            .ok_or_else(|| Error::internal("no current server to renew"))?;
        self.tokens.clear(&key.storage_key()).await;

        let cancel = cookie.cancel_token();
        let base_url = self.base_url_for(guard, &key).await?;
        guard.endpoints.remove(&base_url);
        let endpoints = self.endpoints_for(guard, &base_url, &cancel).await?;
        self.authorize(guard, cookie, &key, &base_url, &endpoints).await?;
        self.persist(guard).await;
        guard.fsm.go(FsmState::Main, FsmPayload::Empty)?;
        Ok(())
    }

    /// Tear down: tell the server goodbye and stop any proxyguard task.
    pub async fn cleanup(&self, cookie: &Arc<Cookie>) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        if guard.fsm.in_state(FsmState::GotConfig) {
            guard.fsm.go(FsmState::Disconnected, FsmPayload::Empty)?;
        }

        if let Some(key) = guard.state.last_chosen() {
            let cancel = cookie.cancel_token();
            if let Ok(base_url) = self.base_url_for(&mut guard, &key).await {
                if let Ok(endpoints) = self.endpoints_for(&mut guard, &base_url, &cancel).await {
                    let capability = self.capability(&key, &base_url, &endpoints);
                    if let Err(e) =
                        api::disconnect(&self.http, &endpoints, &capability, &cancel).await
                    {
                        // Best-effort: the server will reap the session.
                        debug!("disconnect call failed: {e}");
                    }
                }
            }
        }

        if let Some(task) = self.proxyguard.lock().await.take() {
            task.cancel().await;
        }

        if Fsm::allowed(guard.fsm.current(), FsmState::Main) {
            guard.fsm.go(FsmState::Main, FsmPayload::Empty)?;
        }
        Ok(())
    }

    // ── Failover & proxyguard ────────────────────────────────────

    /// Probe whether the current tunnel silently died. `true` = dropped.
    pub async fn start_failover<F>(
        &self,
        cookie: &Arc<Cookie>,
        gateway: IpAddr,
        mtu: u32,
        read_rx_bytes: F,
    ) -> CoreResult<bool>
    where
        F: Fn() -> Result<u64, String> + Send + 'static,
    {
        probe_dropped(
            ProbeConfig::new(gateway, mtu),
            read_rx_bytes,
            cookie.cancel_token(),
        )
        .await
        .map_err(|e| match e {
            fedvpn_failover::FailoverError::Cancelled => Error::cancelled(),
            other => Error::internal(other.to_string()),
        })
    }

    /// Launch the WireGuard-over-TCP helper process.
    pub async fn start_proxyguard(&self, config: &ProxyguardConfig) -> CoreResult<()> {
        let mut slot = self.proxyguard.lock().await;
        if let Some(previous) = slot.take() {
            previous.cancel().await;
        }
        *slot = Some(Proxyguard::launch(config, self.http.user_agent())?);
        Ok(())
    }

    pub async fn stop_proxyguard(&self) {
        if let Some(task) = self.proxyguard.lock().await.take() {
            task.cancel().await;
        }
    }

    // ── Internals ────────────────────────────────────────────────

    fn supported_protocols(&self) -> Vec<Protocol> {
        self.protocols.lock().expect("protocol lock poisoned").clone()
    }

    fn capability(&self, key: &ServerKey, base_url: &str, endpoints: &Endpoints) -> TokenCapability {
        TokenCapability {
            cache: self.tokens.clone(),
            http: self.http.clone(),
            key: key.storage_key(),
            token_endpoint: endpoints.token_endpoint.clone(),
            client_id: self.client_id.as_str().to_string(),
            issuer: base_url.to_string(),
        }
    }

    /// The effective API base: the roamed country's server for secure
    /// internet, the identifier itself otherwise.
    async fn base_url_for(&self, guard: &mut ClientState, key: &ServerKey) -> CoreResult<String> {
        match key.server_type {
            ServerType::SecureInternet => {
                let cc = guard
                    .state
                    .server(key)
                    .and_then(|r| r.country_code.clone())
                    .ok_or_else(|| Error::internal("no secure internet location chosen"))?;
                Ok(self.discovery.server_by_country_code(&cc).await?.base_url)
            }
            _ => Ok(key.identifier.clone()),
        }
    }

    async fn endpoints_for(
        &self,
        guard: &mut ClientState,
        base_url: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<Endpoints> {
        if let Some(cached) = guard.endpoints.get(base_url) {
            if !cached.expired(Utc::now()) {
                return Ok(cached.clone());
            }
        }
        let resolved = endpoints::resolve(&self.http, base_url, cancel).await?;
        guard
            .endpoints
            .insert(base_url.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Run the browser authorization dance and store the won tokens.
    async fn authorize(
        &self,
        guard: &mut ClientState,
        cookie: &Arc<Cookie>,
        key: &ServerKey,
        base_url: &str,
        endpoints: &Endpoints,
    ) -> CoreResult<()> {
        if key.server_type == ServerType::SecureInternet {
            self.discovery.expire_organizations().await;
        }
        let cancel = cookie.cancel_token();
        let client_id = self.client_id.as_str();

        let (params, request) = if self.client_id.uses_custom_scheme() {
            // The OS hands the redirect to the host, the host answers the
            // cookie with the full redirect URI.
            let request = flow::build_authorization_url(
                &endpoints.authorization_endpoint,
                client_id,
                &self.client_id.custom_scheme_redirect(),
            )?;
            guard.fsm.go_required(
                FsmState::OAuthStarted,
                FsmPayload::OpenUrl(request.url.clone()),
                cookie,
            )?;
            let redirect = cookie.receive().await?;
            (redirect_params(&redirect)?, request)
        } else {
            let listener = CallbackListener::bind().await?;
            let request = flow::build_authorization_url(
                &endpoints.authorization_endpoint,
                client_id,
                &listener.redirect_uri(),
            )?;
            guard.fsm.go_required(
                FsmState::OAuthStarted,
                FsmPayload::OpenUrl(request.url.clone()),
                cookie,
            )?;
            // The callback parameters arrive on the listener; the cookie
            // resolves first only on cancellation, a deadline, or the host
            // refusing to open the browser.
            let params = tokio::select! {
                params = listener.wait(&cancel) => params?,
                outcome = cookie.receive() => {
                    return Err(match outcome {
                        Ok(_) => Error::internal(
                            "unexpected cookie reply during loopback authorization",
                        ),
                        Err(e) => e,
                    });
                }
            };
            (params, request)
        };

        let expected_iss = params.contains_key("iss").then_some(base_url);
        let code = flow::validate_callback(&params, &request.state, expected_iss)?;
        let tokens = flow::exchange_authorization_code(
            &self.http,
            &endpoints.token_endpoint,
            client_id,
            &request,
            &code,
            base_url,
            &cancel,
        )
        .await?;
        self.tokens.put(&key.storage_key(), tokens).await;

        if let Some(record) = guard.state.server_mut(key) {
            record.last_authorize_time = Some(Utc::now());
        }
        info!(server = %key, "authorization completed");
        Ok(())
    }

    /// Snapshot the discovery cache into the state and save, best-effort.
    async fn persist(&self, guard: &mut ClientState) {
        guard.state.discovery = self.discovery.snapshot().await;
        if let Err(e) = self.store.save(&guard.state) {
            warn!("state save failed: {e}");
        }
    }
}

/// The token capability handed to the server layer.
struct TokenCapability {
    cache: TokenCache,
    http: HttpClient,
    key: String,
    token_endpoint: String,
    client_id: String,
    issuer: String,
}

#[async_trait::async_trait]
impl AccessTokens for TokenCapability {
    async fn access_token(&self, cancel: &CancellationToken) -> CoreResult<String> {
        self.cache
            .ensure_valid(
                &self.key,
                &self.http,
                &self.token_endpoint,
                &self.client_id,
                &self.issuer,
                cancel,
            )
            .await
            .map(|t| t.access)
    }

    async fn mark_expired(&self) {
        self.cache.mark_expired(&self.key).await;
    }
}

/// URLs are canonicalized; organization ids are opaque.
fn canonical_identifier(server_type: ServerType, identifier: &str) -> CoreResult<String> {
    if server_type.identified_by_url() {
        urls::canonicalize_url(identifier)
    } else {
        Ok(identifier.trim().to_string())
    }
}

/// Parse a custom-scheme redirect URI into its query parameters.
fn redirect_params(redirect: &str) -> CoreResult<HashMap<String, String>> {
    let parsed = url::Url::parse(redirect)
        .map_err(|e| Error::invalid_url(redirect, format!("bad redirect: {e}")))?;
    Ok(parsed.query_pairs().into_owned().collect())
}

fn server_info(key: &ServerKey, record: &ServerRecord) -> ServerInfo {
    let display_name = record
        .display_name
        .as_ref()
        .map(|t| t.best("en").to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| key.identifier.clone());
    ServerInfo {
        identifier: key.identifier.clone(),
        server_type: key.server_type,
        display_name,
        country_code: record.country_code.clone(),
        profiles: record.profiles.clone(),
        expire_time: record.expire_time,
    }
}
