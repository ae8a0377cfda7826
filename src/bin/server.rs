//! Tunnel server binary.
//!
//! Terminates HTTPS (or plain HTTP with `--disable-tls`, for use behind a
//! separate TLS terminator), answers `GET /` with a decoy page, and routes
//! tunnel POSTs to per-session back-end connections dialed to `--backend`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fronthaul::server::{Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "fronthaul-server")]
#[command(about = "Domain-fronted tunnel server")]
#[command(version)]
struct Args {
    /// Listen address
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: SocketAddr,

    /// Port to listen on (overrides the port in --listen)
    #[arg(long)]
    port: Option<u16>,

    /// Back-end address each new session connects to
    #[arg(long)]
    backend: SocketAddr,

    /// Don't use HTTPS
    #[arg(long)]
    disable_tls: bool,

    /// TLS certificate file (required without --disable-tls)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key file (required without --disable-tls)
    #[arg(long)]
    key: Option<PathBuf>,

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

/// Load the certificate chain from a PEM file.
fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path)
            .with_context(|| format!("failed to open cert file {}", path.display()))?,
    );
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse PEM certificates")?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Load the private key from a PEM file.
fn load_private_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let mut file = std::io::BufReader::new(
        std::fs::File::open(path)
            .with_context(|| format!("failed to open key file {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut file)
        .context("failed to parse PEM private key")?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn build_tls_acceptor(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert)?;
    let key = load_private_key(key)?;
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build TLS server config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref())?;

    let tls = if args.disable_tls {
        if args.cert.is_some() || args.key.is_some() {
            anyhow::bail!("the --cert and --key options are not allowed with --disable-tls");
        }
        None
    } else {
        let cert = args
            .cert
            .as_deref()
            .ok_or_else(|| anyhow!("the --cert and --key options are required"))?;
        let key = args
            .key
            .as_deref()
            .ok_or_else(|| anyhow!("the --cert and --key options are required"))?;
        Some(build_tls_acceptor(cert, key)?)
    };

    let mut listen_addr = args.listen;
    if let Some(port) = args.port {
        listen_addr.set_port(port);
    }
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("can't listen on {listen_addr}"))?;
    let local_addr = listener.local_addr()?;
    if tls.is_some() {
        info!("listening with HTTPS on {local_addr}");
    } else {
        info!("listening with plain HTTP on {local_addr}");
    }

    let (handler_tx, mut handler_rx) = mpsc::unbounded_channel::<i32>();
    let server = Arc::new(Server::new(ServerConfig::new(args.backend), handler_tx));
    let serve = tokio::spawn(server.run(listener, tls));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut num_handlers: i32 = 0;

    // Wait for the first signal, folding handler events meanwhile.
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

    // Stop the listener.
    serve.abort();

    if terminate {
        return Ok(());
    }

    // SIGINT: wait for a second signal or no more handlers.
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
