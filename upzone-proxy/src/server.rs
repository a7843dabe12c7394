//! Server module exposing the query binding over HTTP.
//!
//! Every operation is a `POST /dynamic/<operation>` whose body is the JSON
//! array of arguments. The reply is always the two-part
//! `{"result": ..., "error": ...}` object; HTTP status codes only report
//! transport-level problems.

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use upzone_admin::{Operation, QueryBinding, Reply, Value};
use upzone_core::ZoneDirectory;

const ROUTE_PREFIX: &str = "/dynamic/";

/// Largest argument array accepted, in bytes.
pub const MAX_BODY_BYTES: usize = 16 * 1024;

/// State shared by every connection.
#[derive(Debug)]
pub struct AdminState {
    directory: ZoneDirectory,
    binding: QueryBinding,
}

impl AdminState {
    /// Serve `directory` through `binding`.
    pub fn new(directory: ZoneDirectory, binding: QueryBinding) -> Self {
        Self { directory, binding }
    }
}

/// Binds `addr` and serves until the listener fails.
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<AdminState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "admin listener bound");
    serve(listener, state).await
}

/// Accepts connections on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AdminState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(%peer, "error serving connection: {err:?}");
            }
        });
    }
}

/// Routes one request onto the binding.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    debug!(method = %req.method(), uri = %req.uri(), "admin request");

    let Some(name) = req.uri().path().strip_prefix(ROUTE_PREFIX) else {
        return Ok(plain(StatusCode::NOT_FOUND, "not found"));
    };
    let Ok(op) = name.parse::<Operation>() else {
        return Ok(plain(StatusCode::NOT_FOUND, "unknown operation"));
    };
    if req.method() != Method::POST {
        return Ok(plain(StatusCode::METHOD_NOT_ALLOWED, "use POST"));
    }

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) if err.is::<LengthLimitError>() => {
            return Ok(plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"));
        }
        Err(err) => {
            debug!(operation = %op, "reading request body: {err}");
            return Ok(plain(StatusCode::BAD_REQUEST, "unreadable request body"));
        }
    };
    let args: Vec<Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Vec::new()
    } else {
        match serde_json::from_slice(&body) {
            Ok(args) => args,
            Err(err) => {
                let reply = Reply {
                    result: Value::Nil,
                    error: Some(format!("arguments must be a JSON array: {err}")),
                };
                return Ok(json(StatusCode::BAD_REQUEST, &reply));
            }
        }
    };

    // Name resolution and the zone spin lock must stay off the reactor.
    let reply = tokio::task::spawn_blocking(move || {
        state.binding.reply(Some(&state.directory), op, &args)
    })
    .await;

    Ok(match reply {
        Ok(reply) => {
            if let Some(err) = &reply.error {
                debug!(operation = %op, error = %err, "binding call failed");
            }
            json(StatusCode::OK, &reply)
        }
        Err(err) => {
            error!(operation = %op, "binding task failed: {err}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    })
}

fn json(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            error!("encoding reply: {err}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn plain(status: StatusCode, text: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(text.as_bytes())));
    *response.status_mut() = status;
    response
}
