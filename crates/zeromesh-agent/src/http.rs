//! Local introspection endpoint: Prometheus metrics, a health probe, and
//! a JSON snapshot of the peer table.

use crate::metrics::Metrics;
use crate::peers::PeerTable;
use anyhow::Result;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

/// Serves `/metrics`, `/health`, and `/status` on localhost.
pub async fn serve(metrics: Arc<Metrics>, peers: Arc<PeerTable>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("introspection endpoint on http://{}/metrics", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);
        let peers = Arc::clone(&peers);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let metrics = Arc::clone(&metrics);
                let peers = Arc::clone(&peers);
                handle_request(req, metrics, peers)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
            if let Err(e) = conn.await {
                error!("connection error: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    peers: Arc<PeerTable>,
) -> Result<Response<String>, Infallible> {
    match req.uri().path() {
        "/metrics" => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(metrics.to_prometheus())
            .unwrap()),
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body("OK".to_string())
            .unwrap()),
        "/status" => {
            let snapshots: Vec<_> = peers.all().iter().map(|p| p.snapshot()).collect();
            let body = serde_json::to_string_pretty(&serde_json::json!({ "peers": snapshots }))
                .unwrap_or_else(|_| "{}".to_string());
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(body)
                .unwrap())
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body("Not Found".to_string())
            .unwrap()),
    }
}
