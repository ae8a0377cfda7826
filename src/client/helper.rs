//! Browser helper bridge.
//!
//! With `--helper`, this process performs no network operations toward the
//! front-end itself. Each roundtrip is handed to an instrumented browser
//! over a local TCP socket, so the TLS fingerprint observed on the wire is
//! the browser's own. One request is one connection: dial, exchange a
//! single length-prefixed JSON message pair, hang up.
//!
//! Framing: a big-endian `u32` length prefix followed by that many bytes of
//! UTF-8 JSON.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::client::dispatch::TransportResponse;
use crate::client::RequestInfo;
use crate::error::{Error, Result};
use crate::proxy::{make_proxy_spec, ProxySpec};
use crate::{
    HELPER_READ_TIMEOUT, HELPER_WRITE_TIMEOUT, MAX_HELPER_RESPONSE_LENGTH, SESSION_ID_HEADER,
};

/// Body bytes ride inside the JSON as standard base64.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct HelperRequest {
    pub method: String,
    pub url: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,
    #[serde(with = "b64", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelperResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status: u16,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
}

/// Do one roundtrip through the configured browser extension.
pub(crate) async fn round_trip_with_helper(
    addr: SocketAddr,
    body: &[u8],
    info: &RequestInfo,
) -> Result<TransportResponse> {
    let mut header = BTreeMap::new();
    header.insert(SESSION_ID_HEADER.to_owned(), info.session_id.clone());
    if let Some(host) = &info.host {
        header.insert("Host".to_owned(), host.clone());
    }

    let req = HelperRequest {
        method: "POST".to_owned(),
        url: info.url.to_string(),
        header,
        body: body.to_vec(),
        proxy: info
            .proxy_url
            .as_ref()
            .map(make_proxy_spec)
            .transpose()?,
    };
    let encoded =
        serde_json::to_vec(&req).map_err(|e| Error::helper(format!("encoding request: {e}")))?;

    let mut stream = TcpStream::connect(addr).await?;

    timeout(HELPER_WRITE_TIMEOUT, async {
        stream.write_all(&(encoded.len() as u32).to_be_bytes()).await?;
        stream.write_all(&encoded).await
    })
    .await
    .map_err(|_| Error::helper("write timeout"))??;

    let reply = timeout(HELPER_READ_TIMEOUT, async {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len);
        if len > MAX_HELPER_RESPONSE_LENGTH {
            return Err(Error::helper(format!(
                "helper's returned data is too big ({len} > {MAX_HELPER_RESPONSE_LENGTH})"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    })
    .await
    .map_err(|_| Error::helper("read timeout"))??;

    let resp: HelperResponse =
        serde_json::from_slice(&reply).map_err(|e| Error::helper(format!("decoding reply: {e}")))?;
    if !resp.error.is_empty() {
        return Err(Error::helper(format!("helper returned error: {}", resp.error)));
    }

    Ok(TransportResponse {
        status: resp.status,
        body: Bytes::from(resp.body),
        headers: HeaderMap::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::gen_session_id;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use tokio::net::TcpListener;
    use url::Url;

    fn info() -> RequestInfo {
        RequestInfo {
            session_id: gen_session_id(),
            url: Url::parse("https://covert.example/").unwrap(),
            host: Some("covert.example".into()),
            proxy_url: None,
        }
    }

    /// Run a one-shot fake helper that answers every request with `reply`
    /// (already JSON) and hands the decoded request to the test.
    async fn spawn_helper(reply: String) -> (SocketAddr, tokio::sync::oneshot::Receiver<serde_json::Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let _ = tx.send(serde_json::from_slice(&buf).unwrap());

            stream
                .write_all(&(reply.len() as u32).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(reply.as_bytes()).await.unwrap();
        });
        (addr, rx)
    }

    #[tokio::test]
    async fn test_round_trip_framing() {
        let body_b64 = STANDARD.encode(b"downlink");
        let (addr, seen) =
            spawn_helper(format!(r#"{{"status":200,"body":"{body_b64}"}}"#)).await;

        let info = info();
        let resp = round_trip_with_helper(addr, b"uplink", &info).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"downlink");

        let seen = seen.await.unwrap();
        assert_eq!(seen["method"], "POST");
        assert_eq!(seen["url"], "https://covert.example/");
        assert_eq!(seen["header"]["Host"], "covert.example");
        assert_eq!(seen["header"][SESSION_ID_HEADER], info.session_id);
        assert_eq!(seen["body"], STANDARD.encode(b"uplink"));
        assert!(seen.get("proxy").is_none());
    }

    #[tokio::test]
    async fn test_proxy_spec_included() {
        let (addr, seen) = spawn_helper(r#"{"status":200,"body":""}"#.to_owned()).await;

        let mut info = info();
        info.proxy_url = Some(Url::parse("socks5://127.0.0.1:9050").unwrap());
        round_trip_with_helper(addr, &[], &info).await.unwrap();

        let seen = seen.await.unwrap();
        assert_eq!(seen["proxy"]["type"], "socks5");
        assert_eq!(seen["proxy"]["host"], "127.0.0.1");
        assert_eq!(seen["proxy"]["port"], 9050);
    }

    #[tokio::test]
    async fn test_error_field_is_fatal() {
        let (addr, _seen) =
            spawn_helper(r#"{"error":"blocked","status":0,"body":""}"#.to_owned()).await;

        let err = round_trip_with_helper(addr, &[], &info()).await.unwrap_err();
        assert!(matches!(err, Error::Helper(_)), "got {err:?}");
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn test_oversize_reply_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len = [0u8; 4];
            stream.read_exact(&mut len).await.unwrap();
            let mut buf = vec![0u8; u32::from_be_bytes(len) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            // Declare an absurd reply length and keep the socket open.
            stream
                .write_all(&(MAX_HELPER_RESPONSE_LENGTH + 1).to_be_bytes())
                .await
                .unwrap();
        });

        let err = round_trip_with_helper(addr, &[], &info()).await.unwrap_err();
        assert!(err.to_string().contains("too big"), "got {err}");
    }

    #[tokio::test]
    async fn test_non_200_status_passes_through() {
        let (addr, _seen) = spawn_helper(r#"{"status":503,"body":""}"#.to_owned()).await;
        let resp = round_trip_with_helper(addr, &[], &info()).await.unwrap();
        assert_eq!(resp.status, 503);
    }

    #[test]
    fn test_request_omits_empty_fields() {
        let req = HelperRequest {
            method: "POST".into(),
            url: "https://example.com/".into(),
            header: BTreeMap::new(),
            body: Vec::new(),
            proxy: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("header").is_none());
        assert!(json.get("body").is_none());
        assert!(json.get("proxy").is_none());
    }
}
