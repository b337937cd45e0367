use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

const CODE_RECEIVED_BODY: &str = "smartthings-cli received auth code";

/// How long in-flight connections get to finish writing after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Write-once slot for the captured authorization code.
struct PendingAuthorization {
    sender: Mutex<Option<oneshot::Sender<String>>>,
}

impl PendingAuthorization {
    fn new(sender: oneshot::Sender<String>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns false if a code was already delivered.
    fn fulfil(&self, code: String) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }
}

/// Handle to a running callback listener. Owns the bound port until
/// [`CallbackListener::wait_for_code`] returns or the handle is dropped.
pub struct CallbackListener {
    port: u16,
    code_rx: oneshot::Receiver<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind `0.0.0.0:port` and start serving. Port 0 picks a free port.
    pub async fn start(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| Error::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| Error::Bind { port, source })?
            .port();

        let (code_tx, code_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let pending = Arc::new(PendingAuthorization::new(code_tx));

        let task = tokio::spawn(serve(listener, pending, shutdown_rx));
        debug!("Callback listener bound on port {port}");

        Ok(Self {
            port,
            code_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until a code is captured, then stop the listener.
    ///
    /// `None` waits forever. On expiry the listener is stopped as well and
    /// [`Error::AuthTimeout`] is returned.
    pub async fn wait_for_code(mut self, timeout: Option<Duration>) -> Result<String> {
        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut self.code_rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.stop().await;
                    return Err(Error::AuthTimeout {
                        secs: limit.as_secs(),
                    });
                }
            },
            None => (&mut self.code_rx).await,
        };
        self.stop().await;
        received.map_err(|_| Error::ListenerClosed)
    }

    async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Callback listener task ended abnormally: {e}");
            }
        }
        debug!("Callback listener on port {} stopped", self.port);
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn serve(
    listener: TcpListener,
    pending: Arc<PendingAuthorization>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Callback listener accept failed: {e}");
                        continue;
                    }
                };
                debug!("Callback connection from {peer}");
                let pending = Arc::clone(&pending);
                connections.spawn(async move {
                    let service = service_fn(move |req| {
                        let pending = Arc::clone(&pending);
                        async move { Ok::<_, Infallible>(handle(&req, &pending)) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .keep_alive(false)
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!("Callback connection from {peer} ended: {e}");
                    }
                });
            }
        }
    }

    // Stop accepting first (listener dropped here), then let the response to
    // the code-bearing request finish writing.
    drop(listener);
    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        connections.abort_all();
    }
}

fn handle(req: &Request<Incoming>, pending: &PendingAuthorization) -> Response<Full<Bytes>> {
    debug!("Received {} {}", req.method(), req.uri());

    if req.method() != Method::GET {
        return reply(StatusCode::METHOD_NOT_ALLOWED, "");
    }

    match extract_code(req.uri().query()) {
        Some(code) => {
            info!("Received auth code");
            debug!("Parsed auth code: {code}");
            if !pending.fulfil(code) {
                debug!("Auth code already captured, ignoring repeat");
            }
            reply(StatusCode::OK, CODE_RECEIVED_BODY)
        }
        None => reply(StatusCode::OK, ""),
    }
}

fn extract_code(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
}

fn reply(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
