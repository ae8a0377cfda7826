//! Tunnel client binary.
//!
//! Listens for SOCKS5 connections from the local daemon and tunnels each
//! one through a sequence of HTTP requests to `--url`. When `--front` is
//! given, the domain in the URL is replaced by the front domain for the
//! purpose of the DNS lookup, TCP connection and TLS SNI, but the HTTP Host
//! header in the request keeps the covert name; the front-end's routing
//! dispatches on the Host header. With `--helper`, no network operations
//! toward the front-end happen in this process at all: every request goes
//! through a browser extension so the observable TLS fingerprint is the
//! browser's.
//!
//! Most configuration can come either per-connection through SOCKS args
//! (`url=`, `front=`, `proxy=`) or process-wide through these options;
//! SOCKS args take precedence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use fronthaul::client::socks::SocksListener;
use fronthaul::client::{handle_socks_conn, ClientConfig, Dispatcher};
use fronthaul::proxy;

#[derive(Parser, Debug)]
#[command(name = "fronthaul-client")]
#[command(about = "Domain-fronted tunnel client")]
#[command(version)]
struct Args {
    /// SOCKS5 listen address for the local daemon
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// URL to request if no url= SOCKS arg
    #[arg(long)]
    url: Option<Url>,

    /// Front domain name if no front= SOCKS arg
    #[arg(long)]
    front: Option<String>,

    /// Proxy URL if no proxy= SOCKS arg
    #[arg(long)]
    proxy: Option<Url>,

    /// Address of the HTTP helper (browser extension)
    #[arg(long)]
    helper: Option<String>,

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref())?;

    let helper_addr = match &args.helper {
        Some(spec) => {
            let addr = tokio::net::lookup_host(spec.as_str())
                .await
                .context("can't resolve helper address")?
                .next()
                .context("helper address resolved to nothing")?;
            info!("using helper on {addr}");
            Some(addr)
        }
        None => None,
    };

    // Command-line proxy overrides the managed TOR_PT_PROXY configuration.
    let managed_proxy = match proxy::pt_get_proxy_url() {
        Ok(u) => u,
        Err(e) => {
            proxy::proxy_error(&e.to_string());
            return Err(e).context("can't get managed proxy configuration");
        }
    };
    let have_managed = managed_proxy.is_some();
    let proxy_url = args.proxy.clone().or(managed_proxy);
    if let Some(u) = &proxy_url {
        if let Err(e) = proxy::check_proxy_url(u, helper_addr.is_some()) {
            proxy::proxy_error(&e.to_string());
            anyhow::bail!("proxy error: {e}");
        }
        info!("using proxy {u}");
        // The host set TOR_PT_PROXY and is waiting on the proxy handshake,
        // even when the command line ends up overriding the proxy used.
        if have_managed {
            proxy::proxy_done();
        }
    }

    let config = Arc::new(ClientConfig {
        url: args.url.clone(),
        front: args.front.clone(),
        proxy_url,
        helper_addr,
    });
    let dispatcher = Arc::new(match helper_addr {
        Some(addr) => Dispatcher::helper(addr),
        None => Dispatcher::direct(),
    });

    let listener = SocksListener::bind(args.listen)
        .await
        .context("can't bind SOCKS listener")?;
    let local_addr = listener.local_addr().context("no local address")?;
    info!("listening on {local_addr}");
    // The host daemon scrapes this line to find the SOCKS port.
    println!("SOCKS5 {local_addr}");

    // Handlers report +1 on entry and -1 on exit; the supervision loop
    // below folds the events into the outstanding count.
    let (handler_tx, mut handler_rx) = mpsc::unbounded_channel::<i32>();
    let accept = tokio::spawn(accept_loop(listener, config, dispatcher, handler_tx));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut num_handlers: i32 = 0;

    // Wait for the first signal.
    let terminate = loop {
        tokio::select! {
            event = handler_rx.recv() => {
                if let Some(n) = event {
                    num_handlers += n;
                }
            }
            _ = sigint.recv() => break false,
            _ = sigterm.recv() => break true,
        }
    };

    // Stop accepting new connections either way.
    accept.abort();

    if terminate {
        info!("done");
        return Ok(());
    }

    // SIGINT: wait for a second signal or for the handlers to drain.
    while num_handlers > 0 {
        tokio::select! {
            event = handler_rx.recv() => {
                match event {
                    Some(n) => num_handlers += n,
                    None => break,
                }
            }
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }

    info!("done");
    Ok(())
}

async fn accept_loop(
    listener: SocksListener,
    config: Arc<ClientConfig>,
    dispatcher: Arc<Dispatcher>,
    handler_tx: mpsc::UnboundedSender<i32>,
) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                let config = Arc::clone(&config);
                let dispatcher = Arc::clone(&dispatcher);
                let handler_tx = handler_tx.clone();
                tokio::spawn(async move {
                    let _ = handler_tx.send(1);
                    if let Err(e) = handle_socks_conn(conn, &config, &dispatcher).await {
                        warn!("error in handling request: {e}");
                    }
                    let _ = handler_tx.send(-1);
                });
            }
            Err(e) => {
                warn!("error in accept: {e}");
            }
        }
    }
}
