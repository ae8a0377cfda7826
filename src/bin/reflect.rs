//! Forwarding front-end ("reflector").
//!
//! A tiny HTTP server that forwards every request to a fixed upstream URL
//! and reflects the response back. Only a whitelisted set of header fields
//! crosses in either direction: requests arrive decorated with things like
//! User-Agent that the upstream doesn't need to see, and responses may
//! carry hop-by-hop fields that would clash with this server's own.
//!
//! Run it on infrastructure whose host name is worth fronting through when
//! a real CDN front-end is not available.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use fronthaul::client::DirectClient;

/// Header fields copied through in both directions.
const REFLECTED_HEADER_FIELDS: &[&str] = &["Content-Type", "X-Session-Id"];

/// Deadline for the upstream roundtrip.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "fronthaul-reflect")]
#[command(about = "Forwarding front-end for the tunnel server")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Upstream URL requests are forwarded to
    #[arg(long)]
    forward: Url,

    /// Name of the log file
    #[arg(long)]
    log: Option<PathBuf>,
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file {}", path.display()))?;
            builder
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

/// Join the configured forward path with the incoming request path.
fn path_join(a: &str, b: &str) -> String {
    let a = a.strip_suffix('/').unwrap_or(a);
    if b.starts_with('/') {
        format!("{a}{b}")
    } else {
        format!("{a}/{b}")
    }
}

async fn reflect(
    req: Request<Incoming>,
    forward: &Url,
    client: &DirectClient,
) -> Response<Full<Bytes>> {
    let mut upstream_url = forward.clone();
    upstream_url.set_path(&path_join(forward.path(), req.uri().path()));

    // Copy the method and the whitelisted headers; everything else stays
    // behind.
    let mut builder = Request::builder().method(req.method().clone());
    for name in REFLECTED_HEADER_FIELDS {
        if let Some(value) = req.headers().get(*name) {
            builder = builder.header(*name, value.clone());
        }
    }
    let host = upstream_url
        .host_str()
        .map(str::to_owned)
        .unwrap_or_default();
    builder = builder.header(http::header::HOST, host);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("reading request body: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    let upstream_req = match builder.body(Full::new(body)) {
        Ok(r) => r,
        Err(e) => {
            warn!("building upstream request: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let upstream_resp = match tokio::time::timeout(
        UPSTREAM_TIMEOUT,
        client.fetch(&upstream_url, None, upstream_req),
    )
    .await
    {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!("upstream roundtrip: {e}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(_) => {
            warn!("upstream roundtrip timed out");
            return error_response(StatusCode::GATEWAY_TIMEOUT);
        }
    };

    let mut resp = Response::new(Full::new(upstream_resp.body));
    *resp.status_mut() =
        StatusCode::from_u16(upstream_resp.status).unwrap_or(StatusCode::BAD_GATEWAY);
    for name in REFLECTED_HEADER_FIELDS {
        let header = http::header::HeaderName::from_bytes(name.as_bytes());
        if let (Ok(header), Some(value)) = (header, upstream_resp.headers.get(*name)) {
            resp.headers_mut().insert(header, value.clone());
        }
    }
    resp
}

fn error_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    resp
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref())?;

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("can't listen on {}", args.listen))?;
    info!("reflecting {} on {}", args.forward, listener.local_addr()?);

    let forward = Arc::new(args.forward);
    let client = Arc::new(DirectClient::new());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                };
                let forward = Arc::clone(&forward);
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let forward = Arc::clone(&forward);
                        let client = Arc::clone(&client);
                        async move { Ok::<_, Infallible>(reflect(req, &forward, &client).await) }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!("connection from {peer}: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
