//! HTTP wrapper shared by discovery, OAuth, and the server API layer.
//!
//! Wraps `reqwest::Client` with the client's registered User-Agent, caps
//! response bodies at 16 MiB, and races every request against the calling
//! cookie's cancellation token. No unconditional timeout is installed so a
//! host-initiated cancel is never masked.

use crate::error::{CoreResult, Error, ErrorKind};
use futures::StreamExt;
use reqwest::header::{EXPIRES, IF_MODIFIED_SINCE, LAST_MODIFIED};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hard cap on any response body.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// A fully-read HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// `Last-Modified` header, verbatim.
    pub last_modified: Option<String>,
    /// `Expires` header, verbatim.
    pub expires: Option<String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status == 304
    }

    /// Body as UTF-8 text.
    pub fn text(&self) -> CoreResult<String> {
        String::from_utf8(self.body.clone())
            .map_err(|e| Error::new(ErrorKind::JsonParse, format!("body is not UTF-8: {e}")))
    }

    /// Body parsed as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_slice(&self.body).map_err(Error::from)
    }
}

/// HTTP client carrying the orchestrator's User-Agent.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> CoreResult<Self> {
        let inner = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| Error::internal(format!("could not build HTTP client: {e}")))?;
        Ok(Self {
            inner,
            user_agent: user_agent.to_string(),
        })
    }

    /// The User-Agent registered at construction.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> CoreResult<HttpResponse> {
        self.execute(self.inner.get(url), cancel).await
    }

    /// GET with an `If-Modified-Since` header when a cached date is known.
    pub async fn get_if_modified_since(
        &self,
        url: &str,
        since: Option<&str>,
        cancel: &CancellationToken,
    ) -> CoreResult<HttpResponse> {
        let mut req = self.inner.get(url);
        if let Some(since) = since {
            req = req.header(IF_MODIFIED_SINCE, since);
        }
        self.execute(req, cancel).await
    }

    pub async fn get_authorized(
        &self,
        url: &str,
        access_token: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<HttpResponse> {
        self.execute(self.inner.get(url).bearer_auth(access_token), cancel)
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> CoreResult<HttpResponse> {
        self.execute(self.inner.post(url).form(params), cancel).await
    }

    pub async fn post_form_authorized(
        &self,
        url: &str,
        params: &[(&str, &str)],
        access_token: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<HttpResponse> {
        self.execute(
            self.inner.post(url).form(params).bearer_auth(access_token),
            cancel,
        )
        .await
    }

    /// Send the request, racing it against the cancellation token, and read
    /// the body under the size cap.
    async fn execute(
        &self,
        req: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> CoreResult<HttpResponse> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::cancelled()),
            res = Self::send_and_read(req) => res,
        }
    }

    async fn send_and_read(req: reqwest::RequestBuilder) -> CoreResult<HttpResponse> {
        let resp = req.send().await.map_err(Error::from)?;
        let status = resp.status().as_u16();
        let last_modified = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let expires = resp
            .headers()
            .get(EXPIRES)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Error::from)?;
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(Error::internal("response body exceeds the 16 MiB cap"));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status, bytes = body.len(), "http response");
        Ok(HttpResponse {
            status,
            body,
            last_modified,
            expires,
        })
    }
}
