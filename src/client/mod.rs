//! Client transport: SOCKS front surface, per-session request metadata,
//! the request dispatchers and the copy loop.
//!
//! One accepted SOCKS connection is one session: a fresh session id, a
//! [`RequestInfo`] derived from the connection's arguments overlaid on the
//! process-wide defaults, and a [`copy_loop`] that runs until either side
//! closes.

pub mod copy_loop;
pub mod dispatch;
pub mod helper;
pub mod socks;

pub use copy_loop::copy_loop;
pub use dispatch::{DirectClient, Dispatcher, TransportResponse};

use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use url::Url;

use crate::client::socks::{SocksArgs, SocksConn};
use crate::error::{Error, Result};
use crate::SESSION_ID_LENGTH;

/// Process-wide client defaults; per-connection SOCKS args override them.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// URL to request if no `url=` SOCKS arg.
    pub url: Option<Url>,
    /// Front domain name if no `front=` SOCKS arg.
    pub front: Option<String>,
    /// Upstream proxy URL if no `proxy=` SOCKS arg.
    pub proxy_url: Option<Url>,
    /// Address of the HTTP helper (browser extension), if any.
    pub helper_addr: Option<SocketAddr>,
}

/// Everything needed for one request/response roundtrip, fixed for the
/// lifetime of a session.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// What to put in the X-Session-Id header.
    pub session_id: String,
    /// The URL to request.
    pub url: Url,
    /// Host header override (differs from the URL host when fronting).
    pub host: Option<String>,
    /// URL of an upstream proxy to use. If absent, no proxy is used.
    pub proxy_url: Option<Url>,
}

/// A session id is a randomly generated token that identifies a long-lived
/// session. A TCP stream is split across multiple HTTP requests; those with
/// the same session id belong to the same stream.
pub fn gen_session_id() -> String {
    let mut buf = [0u8; SESSION_ID_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    STANDARD.encode(buf)
}

/// Derive the request metadata for one connection: SOCKS args take
/// precedence over the configured defaults, and the URL falls back to the
/// SOCKS target itself as a last resort.
pub fn request_info(config: &ClientConfig, args: &SocksArgs, target: &str) -> Result<RequestInfo> {
    let mut url = match args.get("url") {
        Some(u) => Url::parse(u)?,
        None => match &config.url {
            Some(u) => u.clone(),
            None => Url::parse(&format!("http://{target}/"))?,
        },
    };

    // Fronting: the URL host becomes the front name (DNS, TCP, SNI) while
    // the Host header keeps the covert authority, explicit port included,
    // for the front-end's routing. The front itself is reached on the
    // scheme-default port.
    let front = args
        .get("front")
        .map(str::to_owned)
        .or_else(|| config.front.clone());
    let mut host = None;
    if let Some(front) = front {
        host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => Some(format!("{h}:{p}")),
            (Some(h), None) => Some(h.to_owned()),
            (None, _) => None,
        };
        url.set_host(Some(&front))
            .map_err(|_| Error::config(format!("bad front domain {front:?}")))?;
        url.set_port(None)
            .map_err(|_| Error::config(format!("URL {url} cannot carry an authority")))?;
    }

    // "http-proxy" is the historical spelling of the same argument.
    let proxy_url = match args.get("proxy").or_else(|| args.get("http-proxy")) {
        Some(p) => Some(Url::parse(p)?),
        None => config.proxy_url.clone(),
    };

    Ok(RequestInfo {
        session_id: gen_session_id(),
        url,
        host,
        proxy_url,
    })
}

/// Handle one accepted SOCKS connection to completion.
pub async fn handle_socks_conn(
    mut conn: SocksConn,
    config: &ClientConfig,
    dispatcher: &Dispatcher,
) -> Result<()> {
    conn.grant().await?;
    let info = request_info(config, &conn.args, &conn.target)?;
    copy_loop(conn.into_stream(), info, dispatcher).await
}
