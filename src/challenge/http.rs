use crate::CRATE_NAME;
use crate::challenge::{ChallengeHandler, ChallengeType};
use crate::error::ChallengeError;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const MAX_OPEN_CONNECTIONS: usize = 200;
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

type ChallengeTable = Arc<RwLock<HashMap<String, String>>>;

struct RunningListener {
    local_addr: SocketAddr,
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

/// Answers HTTP-01 validation requests on a listener that only runs while challenges are pending.
///
/// All hostnames of one order share a single listener. It is started by the first `offer` and
/// stopped by the `withdraw` that empties the challenge table.
pub struct HttpChallengeResponder {
    listen: SocketAddr,
    challenges: ChallengeTable,
    listener: Mutex<Option<RunningListener>>,
    listener_starts: AtomicUsize,
    listener_stops: AtomicUsize,
}

impl HttpChallengeResponder {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            challenges: Arc::default(),
            listener: Mutex::new(None),
            listener_starts: AtomicUsize::new(0),
            listener_stops: AtomicUsize::new(0),
        }
    }

    pub async fn offer(&self, token: &str, key_authorization: &str) -> Result<(), ChallengeError> {
        let mut listener = self.listener.lock().await;
        if listener.is_none() {
            *listener = Some(self.start_listener().await?);
        }
        self.challenges
            .write()
            .insert(token.to_string(), key_authorization.to_string());
        debug!(token, "Serving HTTP-01 challenge");
        Ok(())
    }

    pub async fn withdraw(&self, token: &str) {
        let mut listener = self.listener.lock().await;
        let now_empty = {
            let mut challenges = self.challenges.write();
            if challenges.remove(token).is_some() {
                debug!(token, "Withdrew HTTP-01 challenge");
            }
            challenges.is_empty()
        };
        if now_empty {
            if let Some(running) = listener.take() {
                running.cancellation_token.cancel();
                if let Err(e) = running.task.await {
                    error!("HTTP-01 challenge listener task failed: {e}");
                }
                self.listener_stops.fetch_add(1, Ordering::SeqCst);
                info!("Stopped HTTP-01 challenge listener on {}", running.local_addr);
            }
        }
    }

    pub fn listener_starts(&self) -> usize {
        self.listener_starts.load(Ordering::SeqCst)
    }

    pub fn listener_stops(&self) -> usize {
        self.listener_stops.load(Ordering::SeqCst)
    }

    pub async fn is_listening(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    /// Address the listener is actually bound to, if it runs.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    async fn start_listener(&self) -> Result<RunningListener, ChallengeError> {
        let socket = TcpListener::bind(self.listen)
            .await
            .map_err(ChallengeError::Listener)?;
        let local_addr = socket.local_addr().map_err(ChallengeError::Listener)?;
        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(serve(
            socket,
            self.challenges.clone(),
            cancellation_token.clone(),
        ));
        self.listener_starts.fetch_add(1, Ordering::SeqCst);
        info!("Started HTTP-01 challenge listener on {local_addr}");
        Ok(RunningListener {
            local_addr,
            cancellation_token,
            task,
        })
    }
}

#[async_trait]
impl ChallengeHandler for HttpChallengeResponder {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::Http01
    }

    async fn offer(
        &self,
        _identifier: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError> {
        HttpChallengeResponder::offer(self, token, key_authorization).await
    }

    async fn withdraw(&self, _identifier: &str, token: &str) -> Result<(), ChallengeError> {
        HttpChallengeResponder::withdraw(self, token).await;
        Ok(())
    }
}

async fn serve(
    socket: TcpListener,
    challenges: ChallengeTable,
    cancellation_token: CancellationToken,
) {
    // Limit the max number of open connections to avoid an FD-based DoS
    let connection_limiter = Arc::new(Semaphore::new(MAX_OPEN_CONNECTIONS));
    loop {
        let permit = tokio::select! {
            permit = connection_limiter.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            () = cancellation_token.cancelled() => break,
        };
        let (client, client_addr) = tokio::select! {
            accept_result = socket.accept() => match accept_result {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accepting HTTP-01 connection failed: {e}");
                    continue;
                }
            },
            () = cancellation_token.cancelled() => break,
        };

        let io = TokioIo::new(client);
        let challenges = challenges.clone();
        tokio::spawn(async move {
            let connection = http1::Builder::new().keep_alive(false).serve_connection(
                io,
                service_fn(|request| {
                    let response = challenge_response(&challenges, &request);
                    async move { Ok::<_, Infallible>(response) }
                }),
            );
            match tokio::time::timeout(CONNECTION_TIMEOUT, connection).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!("Error serving HTTP-01 connection from {client_addr}: {err}"),
                Err(_) => debug!("HTTP-01 connection from {client_addr} timed out"),
            }
            // Explicit drop to move the permit to this task
            drop(permit);
        });
    }
}

fn challenge_response<B>(challenges: &RwLock<HashMap<String, String>>, request: &Request<B>) -> Response<Full<Bytes>> {
    let uri = request.uri();
    if let Some(token) = uri.path().strip_prefix(CHALLENGE_PATH_PREFIX) {
        if *request.method() != Method::GET && *request.method() != Method::HEAD {
            return response(StatusCode::METHOD_NOT_ALLOWED, "text/plain")
                .header(http::header::ALLOW, "GET, HEAD")
                .body(Full::new(Bytes::from_static(b"Method Not Allowed")))
                .unwrap_or_else(|_| internal_error());
        }
        return match challenges.read().get(token) {
            Some(key_authorization) => {
                debug!(token, "Answering HTTP-01 validation request");
                response(StatusCode::OK, "application/octet-stream")
                    .body(Full::new(Bytes::from(key_authorization.clone())))
            }
            None => response(StatusCode::NOT_FOUND, "text/plain").body(Full::new(Bytes::from_static(b"Not Found"))),
        }
        .unwrap_or_else(|_| internal_error());
    }

    let host = request
        .headers()
        .get(http::header::HOST)
        .and_then(|host| host.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()));
    let Some(host) = host else {
        return response(StatusCode::BAD_REQUEST, "text/plain")
            .body(Full::new(Bytes::from_static(b"Missing Host header")))
            .unwrap_or_else(|_| internal_error());
    };
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    response(StatusCode::FOUND, "text/plain")
        .header(http::header::LOCATION, format!("https://{host}{path_and_query}"))
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| internal_error())
}

fn response(status: StatusCode, content_type: &'static str) -> http::response::Builder {
    Response::builder()
        .status(status)
        .header(http::header::SERVER, CRATE_NAME)
        .header(http::header::CONTENT_TYPE, content_type)
}

fn internal_error() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
