//! HTTP server implementation
//!
//! hyper http1 with TokioIo; routing is a single match over method and
//! path delegating to the handlers under routes/.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::context::SystemContext;
use crate::jobs::JobKind;
use crate::routes;
use crate::types::{GatewayError, Result};

/// Start the HTTP server and serve until the process is signalled
pub async fn run(ctx: Arc<SystemContext>) -> Result<()> {
    let listener = TcpListener::bind(ctx.args.listen)
        .await
        .map_err(|e| GatewayError::Config(format!("Cannot bind {}: {e}", ctx.args.listen)))?;

    info!("Gateway listening on {}", ctx.args.listen);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move { handle_request(ctx, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    ctx: Arc<SystemContext>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    debug!("{} {}", method, path);

    let response = match (method, path.as_str()) {
        // Liveness: 200 while a worker is healthy and the scheduler runs
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(Arc::clone(&ctx))
        }

        // Readiness: can this instance take traffic right now
        (Method::GET, "/ready") | (Method::GET, "/readyz") => {
            routes::readiness_check(Arc::clone(&ctx))
        }

        // Build info for deployment verification
        (Method::GET, "/version") => routes::version_info(),

        // Operator status view
        (Method::GET, "/status") => routes::status_check(Arc::clone(&ctx)),

        // Metrics snapshot and recent errors
        (Method::GET, "/status/metrics") | (Method::GET, "/api/metrics") => {
            routes::handle_metrics(Arc::clone(&ctx))
        }
        (Method::GET, "/api/metrics/errors") => routes::handle_recent_errors(Arc::clone(&ctx)),

        // Circuit breaker admin
        (Method::GET, "/api/circuit-breakers") => routes::handle_list_breakers(Arc::clone(&ctx)),
        (Method::POST, p) if p.starts_with("/api/circuit-breakers/") => {
            let remainder = p.strip_prefix("/api/circuit-breakers/").unwrap_or("");
            match remainder.rsplit_once('/') {
                Some((name, command)) => {
                    routes::handle_breaker_command(Arc::clone(&ctx), name, command)
                }
                None => bad_request_response("Expected /api/circuit-breakers/{name}/{open|close}"),
            }
        }

        // Processing endpoints (sync by default, async on request)
        (Method::POST, "/api/remove-background") => {
            routes::handle_process(req, Arc::clone(&ctx), JobKind::RemoveBackground, false).await
        }
        (Method::POST, "/api/upscale-image") => {
            routes::handle_process(req, Arc::clone(&ctx), JobKind::Upscale, false).await
        }
        (Method::POST, "/api/upscale-remove-bg") => {
            routes::handle_process(req, Arc::clone(&ctx), JobKind::UpscaleRemoveBg, false).await
        }

        // Always-async variants
        (Method::POST, p) if p.starts_with("/api/async/") => {
            let kind_str = p.strip_prefix("/api/async/").unwrap_or("");
            match JobKind::parse(kind_str) {
                Some(kind) => routes::handle_process(req, Arc::clone(&ctx), kind, true).await,
                None => bad_request_response(&format!("Unknown processing kind '{kind_str}'")),
            }
        }

        // Job tracking
        (Method::GET, "/api/jobs/list") => {
            routes::handle_job_list(Arc::clone(&ctx), query.as_deref())
        }
        (Method::GET, "/api/jobs/stats") => routes::handle_job_stats(Arc::clone(&ctx)),
        (Method::POST, "/api/jobs/cleanup") => routes::handle_job_cleanup(Arc::clone(&ctx)),
        (Method::GET, p) if p.starts_with("/api/jobs/") && p.ends_with("/status") => {
            let id = p
                .strip_prefix("/api/jobs/")
                .and_then(|s| s.strip_suffix("/status"))
                .unwrap_or("");
            routes::handle_job_status(Arc::clone(&ctx), id)
        }
        (Method::GET, p) if p.starts_with("/api/jobs/") && p.ends_with("/result") => {
            let id = p
                .strip_prefix("/api/jobs/")
                .and_then(|s| s.strip_suffix("/result"))
                .unwrap_or("");
            routes::handle_job_result(Arc::clone(&ctx), id)
        }
        (Method::DELETE, p) if p.starts_with("/api/jobs/") => {
            let id = p.strip_prefix("/api/jobs/").unwrap_or("");
            routes::handle_job_delete(Arc::clone(&ctx), id)
        }

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        // Not found
        _ => not_found_response(&path),
    };

    Ok(response)
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    routes::json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "Not Found",
            "path": path,
        }),
    )
}

/// Bad request response
fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    routes::error_response(StatusCode::BAD_REQUEST, message)
}
