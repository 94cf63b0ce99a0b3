//! HTTP server implementation
//!
//! hyper http1 with TokioIo, one task per connection, match-based routing.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Args;
use crate::pipeline::SendPipeline;
use crate::routes;
use crate::supervisor::Supervisor;
use crate::transport::MediaKind;
use crate::types::{PosternError, Result};

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub supervisor: Arc<Supervisor>,
    pub pipeline: Arc<SendPipeline>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, supervisor: Arc<Supervisor>, pipeline: Arc<SendPipeline>) -> Self {
        Self {
            args,
            supervisor,
            pipeline,
            started_at: Instant::now(),
        }
    }
}

/// Serve HTTP until `shutdown` flips to true
pub async fn run(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen)
        .await
        .map_err(|e| PosternError::Config(format!("failed to bind {}: {}", state.args.listen, e)))?;

    info!("Postern listening on {}", state.args.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move {
                                    Ok::<_, hyper::Error>(handle_request(state, addr, req).await)
                                }
                            });

                            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                error!("Error serving connection from {}: {:?}", addr, err);
                            }
                        });
                    }
                    Err(e) => error!("Error accepting connection: {:?}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("HTTP server stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<hyper::body::Incoming>,
) -> Response<http_body_util::Full<bytes::Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    info!("[{}] {} {}", addr, method, path);

    match (method, path.as_str()) {
        (Method::GET, "/") => routes::health::root(state),
        (Method::GET, "/health") | (Method::GET, "/health/") => {
            routes::health::health(state).await
        }

        (Method::POST, "/wa/add") => routes::sessions::add_session(state, req).await,
        (Method::GET, "/wa/qr") => routes::sessions::qr(state, req).await,
        (Method::GET, "/wa/status") | (Method::POST, "/wa/status") => {
            routes::sessions::status(state, req).await
        }
        (Method::POST, "/wa/restart") => routes::sessions::restart(state, req).await,
        (Method::POST, "/wa/logout") => routes::sessions::logout(state, req).await,

        (Method::POST, "/contact") => {
            routes::contacts::list(state, req, routes::contacts::ContactScope::All).await
        }
        (Method::POST, "/contact/saved") => {
            routes::contacts::list(state, req, routes::contacts::ContactScope::Saved).await
        }
        (Method::POST, "/contact/unsaved") => {
            routes::contacts::list(state, req, routes::contacts::ContactScope::Unsaved).await
        }
        (Method::POST, "/contact/refresh") => routes::contacts::refresh(state, req).await,

        (Method::POST, "/send") => routes::messages::send_message(state, req).await,
        (Method::POST, "/send/image") => {
            routes::messages::send_media(state, req, MediaKind::Image).await
        }
        (Method::POST, "/send/video") => {
            routes::messages::send_media(state, req, MediaKind::Video).await
        }
        (Method::POST, "/send/file") => {
            routes::messages::send_media(state, req, MediaKind::File).await
        }

        (Method::POST, "/msg/read") => routes::messages::mark_read(state, req).await,

        (Method::OPTIONS, _) => routes::preflight_response(),
        _ => routes::not_found_response(&path),
    }
}
