//! Client-side SOCKS5 listener.
//!
//! The host daemon speaks SOCKS5 to us on a loopback port. Besides the
//! CONNECT target, each connection can carry per-connection `key=value`
//! arguments in the RFC 1929 username/password fields (the pluggable
//! transport convention: the argument string is `;`-separated with `\`
//! escapes, split across username and password, a lone NUL password meaning
//! "nothing in the password field").

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};

/// Per-connection arguments recognized on the listener: `url`, `front`,
/// `proxy`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocksArgs(HashMap<String, String>);

impl SocksArgs {
    /// Parse a `k1=v1;k2=v2` argument string with `\` escapes.
    pub fn parse(s: &str) -> Result<Self> {
        parse_client_args(s)
    }

    /// Look up an argument by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of arguments present.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_client_args(s: &str) -> Result<SocksArgs> {
    let mut args = HashMap::new();
    if s.is_empty() {
        return Ok(SocksArgs(args));
    }

    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = s.chars();

    loop {
        let c = chars.next();
        match c {
            Some('\\') => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| Error::socks("unescaped trailing backslash in args"))?;
                if in_value {
                    value.push(escaped);
                } else {
                    key.push(escaped);
                }
            }
            Some('=') if !in_value => in_value = true,
            Some(';') | None => {
                if !in_value {
                    return Err(Error::socks(format!("arg {key:?} has no value")));
                }
                args.insert(std::mem::take(&mut key), std::mem::take(&mut value));
                in_value = false;
                if c.is_none() {
                    break;
                }
            }
            Some(c) => {
                if in_value {
                    value.push(c);
                } else {
                    key.push(c);
                }
            }
        }
    }

    Ok(SocksArgs(args))
}

/// An accepted SOCKS connection, pending a [`grant`](SocksConn::grant).
pub struct SocksConn {
    stream: TcpStream,
    /// Requested CONNECT target as `host:port`.
    pub target: String,
    /// Per-connection arguments.
    pub args: SocksArgs,
}

impl SocksConn {
    /// Send a success reply. The bound address reported to the peer is the
    /// all-zero placeholder; the real traffic flows over this same stream.
    pub async fn grant(&mut self) -> Result<()> {
        self.stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        Ok(())
    }

    /// Consume the connection, yielding the raw stream for the copy loop.
    pub fn into_stream(self) -> TcpStream {
        self.stream
    }
}

/// SOCKS5 listener for the local daemon.
pub struct SocksListener {
    listener: TcpListener,
}

impl SocksListener {
    /// Bind to the given loopback address.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound local address (to report to the host daemon).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and run the SOCKS5 negotiation up to (but not
    /// including) the reply; call [`SocksConn::grant`] to finish.
    pub async fn accept(&self) -> Result<SocksConn> {
        let (stream, _peer) = self.listener.accept().await?;
        negotiate(stream).await
    }
}

async fn negotiate(mut stream: TcpStream) -> Result<SocksConn> {
    // Greeting: version and offered methods.
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != 0x05 {
        return Err(Error::socks(format!("unsupported version {:#x}", header[0])));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    // Prefer username/password so per-connection args can ride along.
    let args = if methods.contains(&0x02) {
        stream.write_all(&[0x05, 0x02]).await?;
        read_args_auth(&mut stream).await?
    } else if methods.contains(&0x00) {
        stream.write_all(&[0x05, 0x00]).await?;
        SocksArgs::default()
    } else {
        stream.write_all(&[0x05, 0xFF]).await?;
        return Err(Error::socks("no acceptable authentication method"));
    };

    // Request: only CONNECT is meaningful here.
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;
    if req[0] != 0x05 {
        return Err(Error::socks(format!("bad request version {:#x}", req[0])));
    }
    if req[1] != 0x01 {
        stream
            .write_all(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
        return Err(Error::socks(format!("unsupported command {:#x}", req[1])));
    }

    let target = match req[3] {
        0x01 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            format!("{ip}:{port}")
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let (name, portb) = buf.split_at(len[0] as usize);
            let name = String::from_utf8_lossy(name).into_owned();
            let port = u16::from_be_bytes([portb[0], portb[1]]);
            format!("{name}:{port}")
        }
        0x04 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            format!("[{ip}]:{port}")
        }
        atyp => {
            stream
                .write_all(&[0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Err(Error::socks(format!("unsupported address type {atyp:#x}")));
        }
    };

    Ok(SocksConn {
        stream,
        target,
        args,
    })
}

/// Read an RFC 1929 exchange and decode the argument string it carries.
async fn read_args_auth(stream: &mut TcpStream) -> Result<SocksArgs> {
    let mut ver = [0u8; 1];
    stream.read_exact(&mut ver).await?;
    if ver[0] != 0x01 {
        return Err(Error::socks(format!("bad auth version {:#x}", ver[0])));
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut username = vec![0u8; len[0] as usize];
    stream.read_exact(&mut username).await?;

    stream.read_exact(&mut len).await?;
    let mut password = vec![0u8; len[0] as usize];
    stream.read_exact(&mut password).await?;

    // Success regardless; args are advisory, not credentials.
    stream.write_all(&[0x01, 0x00]).await?;

    let mut combined = username;
    if password != [0x00] {
        combined.extend_from_slice(&password);
    }
    let combined = String::from_utf8(combined)
        .map_err(|_| Error::socks("arguments are not valid UTF-8"))?;
    parse_client_args(&combined)
}
