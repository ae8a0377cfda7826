//! The per-session stream pump.
//!
//! HTTP is strictly request-driven: the server cannot push. The copy loop
//! synthesizes a bidirectional channel by polling — each iteration sends
//! whatever the local side produced (possibly nothing) and writes back
//! whatever the reply carried. The poll interval collapses to zero while
//! traffic flows and grows geometrically toward a ceiling while idle.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::trace;

use crate::client::dispatch::Dispatcher;
use crate::client::RequestInfo;
use crate::error::Result;
use crate::{INIT_POLL_INTERVAL, MAX_PAYLOAD_LENGTH, MAX_POLL_INTERVAL, POLL_INTERVAL_MULTIPLIER};

/// Compute the poll interval to use after a transaction that sent `sent`
/// bytes upstream and received `received` bytes back.
pub(crate) fn next_interval(interval: Duration, sent: usize, received: usize) -> Duration {
    if sent > 0 || received > 0 {
        // If we sent or received anything, poll again immediately.
        Duration::ZERO
    } else if interval.is_zero() {
        // The first time we don't send or receive anything, wait a while.
        INIT_POLL_INTERVAL
    } else {
        // After that, wait a little longer.
        interval
            .mul_f64(POLL_INTERVAL_MULTIPLIER)
            .min(MAX_POLL_INTERVAL)
    }
}

/// Repeatedly read from `conn`, issue HTTP transactions, and write the
/// responses back to `conn`, until either side closes or a transaction
/// fails for good.
pub async fn copy_loop<C>(conn: C, info: RequestInfo, dispatcher: &Dispatcher) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(conn);

    // Local reads are decoupled from the HTTP roundtrips; a dropped sender
    // signals end-of-stream.
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(1);
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut interval = INIT_POLL_INTERVAL;
    let mut result = Ok(());
    loop {
        let chunk = tokio::select! {
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                // Local side closed; the session ends with it.
                None => break,
            },
            _ = sleep(interval) => Vec::new(),
        };

        let resp = match dispatcher.round_trip(&chunk, &info).await {
            Ok(resp) => resp,
            Err(e) => {
                result = Err(e);
                break;
            }
        };

        let body = &resp.body[..resp.body.len().min(MAX_PAYLOAD_LENGTH)];
        if !body.is_empty() {
            if let Err(e) = write_half.write_all(body).await {
                result = Err(e.into());
                break;
            }
        }

        trace!(sent = chunk.len(), received = body.len(), "roundtrip");
        interval = next_interval(interval, chunk.len(), body.len());
    }

    // Tear down both halves so the local peer sees the close.
    reader.abort();
    let _ = write_half.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_collapses_on_traffic() {
        assert_eq!(next_interval(MAX_POLL_INTERVAL, 1, 0), Duration::ZERO);
        assert_eq!(next_interval(MAX_POLL_INTERVAL, 0, 1), Duration::ZERO);
        assert_eq!(next_interval(Duration::ZERO, 10, 10), Duration::ZERO);
    }

    #[test]
    fn test_interval_resets_after_collapse() {
        assert_eq!(next_interval(Duration::ZERO, 0, 0), INIT_POLL_INTERVAL);
    }

    #[test]
    fn test_interval_grows_geometrically() {
        let next = next_interval(INIT_POLL_INTERVAL, 0, 0);
        assert_eq!(next, INIT_POLL_INTERVAL.mul_f64(POLL_INTERVAL_MULTIPLIER));
    }

    #[test]
    fn test_interval_saturates_at_ceiling() {
        // Idle long enough and the interval is pinned to the ceiling.
        let mut interval = INIT_POLL_INTERVAL;
        let mut previous = Duration::ZERO;
        for _ in 0..32 {
            interval = next_interval(interval, 0, 0);
            assert!(interval >= previous, "interval must be non-decreasing");
            assert!(interval <= MAX_POLL_INTERVAL);
            previous = interval;
        }
        assert_eq!(interval, MAX_POLL_INTERVAL);
        assert_eq!(next_interval(interval, 0, 0), MAX_POLL_INTERVAL);
    }
}
