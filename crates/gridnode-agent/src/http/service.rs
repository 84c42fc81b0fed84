//! The agent's HTTP server and endpoint handlers.
//!
//! Serves the Coordinator-facing REST API: session create/modify/delete and
//! signalling, per-session status and performance, node health and status,
//! tag management, and node status control. Built on hyper's HTTP/1 server
//! with one task per connection.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use gridnode_common::ban::BanList;
use gridnode_common::error::{GridError, Result};

use crate::http::router::{Handler, HttpResponse, UrlRouter};
use crate::node::Agent;
use crate::session::manager::SessionManager;

/// Maximum request body size (10 MB). Rejects oversized payloads before
/// they can allocate.
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const NODE_API_VERSION: &str = "4.1";

struct ServiceState {
    ban: Option<Arc<BanList>>,
    get: UrlRouter,
    put: UrlRouter,
    post: UrlRouter,
    delete: UrlRouter,
}

/// The running HTTP service.
pub struct HttpService {
    port: u16,
    shutdown: watch::Sender<bool>,
}

impl HttpService {
    /// Binds the listener, builds the routing tables and starts serving.
    pub async fn start(
        agent: Arc<Agent>,
        manager: Arc<SessionManager>,
        bind: SocketAddr,
        use_ban_list: bool,
    ) -> Result<HttpService> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| GridError::Transport(format!("failed to bind to {bind}: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| GridError::Transport(format!("failed to get local address: {e}")))?
            .port();

        let ban = use_ban_list.then(|| Arc::new(BanList::default()));
        let state = Arc::new(build_routes(agent, manager, ban));

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(err) => {
                                tracing::error!("HTTP accept failed: {err}");
                                continue;
                            }
                        };
                        let state = state.clone();
                        tokio::spawn(serve_connection(state, stream, peer.ip()));
                    }
                    _ = shutdown_rx.wait_for(|s| *s) => return,
                }
            }
        });

        tracing::info!("node service listening on HTTP port {}", port);
        Ok(HttpService { port, shutdown })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn serve_connection(state: Arc<ServiceState>, stream: tokio::net::TcpStream, ip: IpAddr) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move {
            Ok::<_, std::convert::Infallible>(dispatch(state, ip, req).await)
        }
    });
    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
        tracing::debug!("error serving connection: {err}");
    }
}

async fn dispatch(state: Arc<ServiceState>, ip: IpAddr, req: Request<Incoming>) -> HttpResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let source = ip.to_string();

    // the ban list applies to GETs only
    if method == Method::GET {
        if let Some(ban) = &state.ban {
            if ban.is_banned(&source) {
                return status_response(StatusCode::TOO_MANY_REQUESTS);
            }
        }
    }

    let router = if method == Method::GET {
        &state.get
    } else if method == Method::PUT {
        &state.put
    } else if method == Method::POST {
        &state.post
    } else if method == Method::DELETE {
        &state.delete
    } else {
        return text_response(StatusCode::BAD_REQUEST, "Unsupported method");
    };

    match router.find(&path) {
        Some((handler, vars)) => handler(req, vars).await,
        None => {
            let response = unhandled(&method, &path);
            if method == Method::GET && response.status() == StatusCode::NOT_FOUND {
                if let Some(ban) = &state.ban {
                    ban.track(&source);
                }
            }
            response
        }
    }
}

fn unhandled(method: &Method, path: &str) -> HttpResponse {
    let err = format!("Unsupported {method} endpoint: {path}");
    tracing::warn!("{}", err);
    let status = if *method == Method::GET {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::BAD_REQUEST
    };
    text_response(status, &err)
}

fn build_routes(
    agent: Arc<Agent>,
    manager: Arc<SessionManager>,
    ban: Option<Arc<BanList>>,
) -> ServiceState {
    let mut get = UrlRouter::new();
    let mut put = UrlRouter::new();
    let mut post = UrlRouter::new();
    let mut delete = UrlRouter::new();

    // --- GET ---

    let a = agent.clone();
    get.add(
        "node/1/health",
        route(move |_req, _vars| {
            let a = a.clone();
            async move { health_response(&a, None, None) }
        }),
    );

    let a = agent.clone();
    let m = manager.clone();
    let b = ban.clone();
    get.add(
        "node/1/status",
        route(move |_req, _vars| {
            let (a, m, b) = (a.clone(), m.clone(), b.clone());
            async move { health_response(&a, Some(m.as_ref()), b.as_deref()) }
        }),
    );

    let m = manager.clone();
    get.add(
        "node/1/sessions",
        route(move |_req, _vars| {
            let m = m.clone();
            async move {
                let ids: Vec<String> = m
                    .active_session_ids()
                    .iter()
                    .map(Uuid::to_string)
                    .collect();
                json_response(StatusCode::OK, &json!(ids))
            }
        }),
    );

    let m = manager.clone();
    get.add(
        "node/1/sessions/*/status",
        route(move |_req, vars| {
            let m = m.clone();
            async move {
                result_response(
                    parse_session_id(&vars).and_then(|id| m.status(&id)),
                )
            }
        }),
    );

    let m = manager.clone();
    get.add(
        "node/1/sessions/*/performance",
        route(move |_req, vars| {
            let m = m.clone();
            async move {
                result_response(
                    parse_session_id(&vars).and_then(|id| m.performance(&id)),
                )
            }
        }),
    );

    // mapped so browsers asking for it don't collect ban strikes
    get.add(
        "favicon.ico",
        route(|_req, _vars| async {
            text_response(StatusCode::NOT_FOUND, "Unsupported GET endpoint: favicon.ico")
        }),
    );

    // --- POST ---

    for path in ["sessions", "node/1/sessions"] {
        let m = manager.clone();
        post.add(
            path,
            route(move |req, _vars| {
                let m = m.clone();
                async move {
                    let payload = payload(req).await;
                    result_response(m.create_session(&payload).await)
                }
            }),
        );
    }

    // --- PUT ---

    for path in ["sessions/modify", "node/1/sessions/modify"] {
        let m = manager.clone();
        put.add(
            path,
            route(move |req, _vars| {
                let m = m.clone();
                async move {
                    let payload = payload(req).await;
                    result_response(m.modify_session(&payload))
                }
            }),
        );
    }

    for path in ["sessions/*/status", "node/1/sessions/*/status"] {
        let m = manager.clone();
        put.add(
            path,
            route(move |req, vars| {
                let m = m.clone();
                async move {
                    let payload = payload(req).await;
                    success_or_error(
                        parse_session_id(&vars)
                            .and_then(|id| m.signal_session(&id, &payload)),
                    )
                }
            }),
        );
    }

    for path in ["registration", "status"] {
        let a = agent.clone();
        let m = manager.clone();
        put.add(
            path,
            route(move |req, _vars| {
                let (a, m) = (a.clone(), m.clone());
                async move {
                    let payload = payload(req).await;
                    success_or_error(a.set_status(&payload, &m))
                }
            }),
        );
    }

    let a = agent.clone();
    put.add(
        "node/tags",
        route(move |req, _vars| {
            let a = a.clone();
            async move {
                let payload = payload(req).await;
                success_or_error(a.update_tags(&payload))
            }
        }),
    );

    // --- DELETE ---

    for path in ["sessions/*", "node/1/sessions/*"] {
        let m = manager.clone();
        delete.add(
            path,
            route(move |req, vars| {
                let m = m.clone();
                async move {
                    let reason = header_value(&req, "X-Session-Delete-Reason");
                    tracing::debug!(
                        "received DELETE session {:?} reason: {}",
                        vars.first(),
                        reason
                    );
                    success_or_error(
                        parse_session_id(&vars)
                            .and_then(|id| m.delete_session(&id, &reason)),
                    )
                }
            }),
        );
    }

    let a = agent.clone();
    delete.add(
        "node/tag/*",
        route(move |_req, vars| {
            let a = a.clone();
            async move {
                let tag = vars.first().cloned().unwrap_or_default();
                success_or_error(a.delete_tags(&json!([tag])))
            }
        }),
    );

    let a = agent.clone();
    delete.add(
        "node/tags",
        route(move |req, _vars| {
            let a = a.clone();
            async move {
                let payload = payload(req).await;
                success_or_error(a.delete_tags(&payload))
            }
        }),
    );

    ServiceState {
        ban,
        get,
        put,
        post,
        delete,
    }
}

fn route<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>, Vec<String>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HttpResponse> + Send + 'static,
{
    Arc::new(move |req, vars| -> futures::future::BoxFuture<'static, HttpResponse> {
        Box::pin(f(req, vars))
    })
}

/// Health plus, for the status endpoint, idle times, the ban summary and
/// the API version.
fn health_response(
    agent: &Agent,
    manager: Option<&SessionManager>,
    ban: Option<&BanList>,
) -> HttpResponse {
    match agent.check_health() {
        Ok(()) => {
            let mut body = json!({ "status": "UP" });
            if let Some(manager) = manager {
                let idle = manager.idle_status();
                body["sessions"] = idle["sessions"].clone();
                body["idletime"] = idle["idletime"].clone();
                if let Some(ban) = ban {
                    let summary = ban.summary();
                    body["banned"] = summary["banned"].clone();
                    body["tracked"] = summary["tracked"].clone();
                }
                body["apiVersion"] = json!(NODE_API_VERSION);
            }
            json_response(StatusCode::OK, &body)
        }
        Err(err) => {
            tracing::error!("node health check failed: {err}");
            let body = json!({ "status": "DOWN", "info": err.to_string() });
            json_response(
                StatusCode::from_u16(err.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                &body,
            )
        }
    }
}

/// Reads and parses the request body; malformed or oversized bodies yield
/// `Null`, which handlers reject per field.
async fn payload(req: Request<Incoming>) -> Value {
    match req.into_body().collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            if bytes.len() > MAX_BODY_SIZE {
                tracing::error!(
                    "request body too large: {} bytes (max {} bytes)",
                    bytes.len(),
                    MAX_BODY_SIZE
                );
                return Value::Null;
            }
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        }
        Err(err) => {
            tracing::error!("failed to read request body: {err}");
            Value::Null
        }
    }
}

fn header_value(req: &Request<Incoming>, name: &str) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn parse_session_id(vars: &[String]) -> Result<Uuid> {
    vars.first()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| GridError::NotFound("Session does not exist".to_string()))
}

fn json_response(status: StatusCode, body: &Value) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(http_body_util::Full::new(Bytes::from(body.to_string())))
        .expect("response construction")
}

fn text_response(status: StatusCode, text: &str) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(http_body_util::Full::new(Bytes::from(text.to_string())))
        .expect("response construction")
}

fn status_response(status: StatusCode) -> HttpResponse {
    Response::builder()
        .status(status)
        .body(http_body_util::Full::new(Bytes::new()))
        .expect("response construction")
}

fn error_response(err: &GridError) -> HttpResponse {
    text_response(
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &err.to_string(),
    )
}

fn result_response(result: Result<Value>) -> HttpResponse {
    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => error_response(&err),
    }
}

fn success_or_error(result: Result<()>) -> HttpResponse {
    match result {
        Ok(()) => json_response(StatusCode::OK, &json!({ "success": "true" })),
        Err(err) => error_response(&err),
    }
}
