//! Loopback redirect listener.
//!
//! Binds an ephemeral port on `127.0.0.1` and serves `/callback` exactly
//! once: the first hit carrying query parameters resolves the pending
//! authorization and later hits get a 404 without touching state. The
//! listener shuts down on the first handled callback and on cancellation.

use fedvpn_core::error::{CoreResult, Error};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CALLBACK_PATH: &str = "/callback";

const LANDING_PAGE: &str = "<!DOCTYPE html>\
<html><head><title>Authorized</title></head>\
<body><p>The application has been authorized. You can close this tab.</p></body></html>";

/// A bound loopback listener waiting for one authorization callback.
pub struct CallbackListener {
    addr: SocketAddr,
    shutdown: CancellationToken,
    result_rx: oneshot::Receiver<HashMap<String, String>>,
}

impl CallbackListener {
    /// Bind `127.0.0.1:<ephemeral>` and start serving.
    pub async fn bind() -> CoreResult<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::internal(format!("could not bind the redirect listener: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::internal(format!("redirect listener has no address: {e}")))?;

        let shutdown = CancellationToken::new();
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(serve(listener, shutdown.clone(), result_tx));

        debug!(%addr, "redirect listener bound");
        Ok(Self {
            addr,
            shutdown,
            result_rx,
        })
    }

    /// The redirect URI to register with the authorization request.
    pub fn redirect_uri(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Wait for the callback parameters, or for the cancel signal.
    ///
    /// The listener is shut down on either outcome.
    pub async fn wait(mut self, cancel: &CancellationToken) -> CoreResult<HashMap<String, String>> {
        let result = tokio::select! {
            params = &mut self.result_rx => {
                params.map_err(|_| Error::internal("redirect listener closed unexpectedly"))
            }
            _ = cancel.cancelled() => Err(Error::cancelled()),
        };
        self.shutdown.cancel();
        result
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve(
    listener: TcpListener,
    shutdown: CancellationToken,
    result_tx: oneshot::Sender<HashMap<String, String>>,
) {
    // The oneshot sender doubles as the handled-once marker.
    let mut result_tx = Some(result_tx);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(_) => continue,
            },
        };

        if result_tx.is_none() {
            // Handled already: nothing left to decide, 404s can go out
            // concurrently.
            tokio::spawn(async move {
                let _ = handle_connection(stream, true).await;
            });
            continue;
        }

        // Until the first callback is consumed, connections are handled on
        // this task: the handled-once decision and the marker flip happen
        // before the next accept, so two racing hits cannot both claim it.
        if let Ok(Some(params)) = handle_connection(stream, false).await {
            if let Some(tx) = result_tx.take() {
                let _ = tx.send(params);
            }
        }
    }
}

/// Answer one connection. Returns the query parameters when this was the
/// first valid `/callback` hit.
async fn handle_connection(
    mut stream: TcpStream,
    already_handled: bool,
) -> std::io::Result<Option<HashMap<String, String>>> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 2048];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf).await? {
            0 => break,
            n => raw.extend_from_slice(&buf[..n]),
        }
        if raw.len() > 16 * 1024 {
            break;
        }
    }

    let head = String::from_utf8_lossy(&raw);
    let target = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };

    if already_handled || path != CALLBACK_PATH {
        write_response(&mut stream, 404, "Not Found", "").await?;
        return Ok(None);
    }

    let params: HashMap<String, String> = url::form_urlencoded::parse(
        query.unwrap_or("").as_bytes(),
    )
    .into_owned()
    .collect();

    write_response(&mut stream, 200, "OK", LANDING_PAGE).await?;
    Ok(Some(params))
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
