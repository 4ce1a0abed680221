//! Pass-through proxying of tile requests to a peer node.

use std::future::Future as _;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use futures::Stream;
use log::{error, warn};

use crate::cluster::PeerEntry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_ATTEMPTS: usize = 3;
/// Extra time granted to a response that already started streaming.
const STREAM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ProxyError {
    /// The peer was unreachable; the caller falls back to local generation.
    Connect,
    /// The peer answered but the exchange failed; surfaces as 500.
    Protocol,
}

/// Forwards the request to the peer's internal port and streams the response
/// through unmodified. The stream aborts `grace` past `deadline`.
pub async fn forward(
    client: &reqwest::Client,
    peer: &PeerEntry,
    path_and_query: &str,
    deadline: tokio::time::Instant,
) -> Result<HttpResponse, ProxyError> {
    let url = format!("http://{}{}", peer.addr_str, path_and_query);
    let mut last_connect_error = None;
    for attempt in 1..=CONNECT_ATTEMPTS {
        match client.get(&url).send().await {
            Ok(response) => {
                let status = StatusCode::from_u16(response.status().as_u16())
                    .map_err(|_| ProxyError::Protocol)?;
                let mut builder = HttpResponse::build(status);
                for (name, value) in response.headers() {
                    if name == reqwest::header::TRANSFER_ENCODING
                        || name == reqwest::header::CONNECTION
                    {
                        continue;
                    }
                    builder.insert_header((name.as_str(), value.as_bytes()));
                }
                let body = DeadlineStream {
                    inner: Box::pin(response.bytes_stream()),
                    sleep: Box::pin(tokio::time::sleep_until(deadline + STREAM_GRACE)),
                };
                return Ok(builder.streaming(body));
            }
            Err(e) if e.is_connect() || e.is_timeout() => {
                warn!(
                    "peer {} connect attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}",
                    peer.addr_str
                );
                last_connect_error = Some(e);
            }
            Err(e) => {
                error!("peer {} exchange failed: {e}", peer.addr_str);
                return Err(ProxyError::Protocol);
            }
        }
    }
    if let Some(e) = last_connect_error {
        error!("peer {} unreachable: {e}", peer.addr_str);
    }
    Err(ProxyError::Connect)
}

pub fn make_client() -> Option<reqwest::Client> {
    match reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
    {
        Ok(client) => Some(client),
        Err(e) => {
            error!("failed to build proxy client: {e}");
            None
        }
    }
}

/// Streams the upstream body until it ends or the deadline fires; expiry
/// surfaces as a stream error, aborting the downstream connection.
struct DeadlineStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>>>>,
    sleep: Pin<Box<tokio::time::Sleep>>,
}

impl Stream for DeadlineStream {
    type Item = Result<Bytes, Box<dyn std::error::Error>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err("peer response deadline expired".into())));
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(Box::new(e)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
