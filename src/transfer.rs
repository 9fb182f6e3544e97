//! Data plane.
//!
//! File content never passes through the gateway RPCs. The initiate
//! calls hand out an endpoint and a transfer token, and the bytes are
//! then moved with plain HTTP requests through a [`DataClient`].
use std::error::Error;
use std::fmt::Debug;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use dyn_clone::DynClone;
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{Stream, TryStreamExt};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use pin_project_lite::pin_project;

use crate::body::Body;
use crate::davheaders::X_REVA_TRANSFER;
use crate::gateway::{Protocol, select_protocol};

/// Errors moving bytes to or from a data endpoint.
#[derive(Debug)]
pub enum TransferError {
    /// The data endpoint could not be reached, or the exchange broke off.
    Transport(String),
    /// None of the protocols we can speak was offered.
    NoProtocol(String),
    /// The request to the data endpoint could not be built.
    Request(String),
}

impl TransferError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl Error for TransferError {}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransferError::Transport(e) => write!(f, "data transfer failed: {}", e),
            TransferError::NoProtocol(p) => write!(f, "no {} protocol offered", p),
            TransferError::Request(e) => write!(f, "bad data request: {}", e),
        }
    }
}

impl From<http::Error> for TransferError {
    fn from(e: http::Error) -> Self {
        TransferError::Request(e.to_string())
    }
}

/// Executes requests against data endpoints.
pub trait DataClient: Debug + Send + Sync + DynClone {
    fn execute<'a>(
        &'a self,
        req: Request<Body>,
    ) -> BoxFuture<'a, Result<Response<Body>, TransferError>>;
}

dyn_clone::clone_trait_object!(DataClient);

/// [`DataClient`] that talks HTTP, using `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpDataClient {
    client: reqwest::Client,
}

impl HttpDataClient {
    pub fn new() -> HttpDataClient {
        HttpDataClient::default()
    }

    /// Use a preconfigured client (timeouts, TLS roots).
    pub fn with_client(client: reqwest::Client) -> HttpDataClient {
        HttpDataClient { client }
    }

    async fn do_execute(&self, req: Request<Body>) -> Result<Response<Body>, TransferError> {
        let (parts, body) = req.into_parts();
        let mut rb = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers);
        if !body.is_empty_body() {
            rb = rb.body(reqwest::Body::wrap_stream(body));
        }
        let resp = rb.send().await.map_err(|e| {
            error!("data endpoint request failed: {}", e);
            TransferError::Transport(e.to_string())
        })?;

        let mut builder = Response::builder().status(resp.status());
        if let Some(h) = builder.headers_mut() {
            h.extend(resp.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let strm = resp.bytes_stream().map_err(io::Error::other);
        Ok(builder.body(Body::from_stream(strm))?)
    }
}

impl DataClient for HttpDataClient {
    fn execute<'a>(
        &'a self,
        req: Request<Body>,
    ) -> BoxFuture<'a, Result<Response<Body>, TransferError>> {
        self.do_execute(req).boxed()
    }
}

/// Pick `preferred`, or else `fallback`.
pub(crate) fn pick_protocol<'a>(
    protocols: &'a [Protocol],
    preferred: &str,
    fallback: Option<&str>,
) -> Result<&'a Protocol, TransferError> {
    select_protocol(protocols, preferred)
        .or_else(|| fallback.and_then(|f| select_protocol(protocols, f)))
        .ok_or_else(|| TransferError::NoProtocol(preferred.to_string()))
}

/// Request to a data endpoint. The transfer token travels in a header,
/// never in the url.
pub(crate) fn data_request(
    method: Method,
    p: &Protocol,
) -> Result<http::request::Builder, TransferError> {
    let token =
        HeaderValue::from_str(&p.token).map_err(|e| TransferError::Request(e.to_string()))?;
    Ok(Request::builder()
        .method(method)
        .uri(p.endpoint.as_str())
        .header(X_REVA_TRANSFER, token))
}

pin_project! {
    /// Counts the bytes flowing through a stream.
    pub(crate) struct CountingStream<S> {
        #[pin]
        inner: S,
        count: Arc<AtomicU64>,
    }
}

impl<S> CountingStream<S> {
    pub(crate) fn new(inner: S, count: Arc<AtomicU64>) -> CountingStream<S> {
        CountingStream { inner, count }
    }
}

impl<S> Stream for CountingStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = this.inner.poll_next(cx);
        if let Poll::Ready(Some(Ok(ref b))) = item {
            this.count.fetch_add(b.len() as u64, Ordering::Relaxed);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use futures_util::stream;

    fn proto(name: &str) -> Protocol {
        Protocol {
            protocol: name.to_string(),
            endpoint: format!("http://data/{}", name),
            token: "tkn".to_string(),
            expose: false,
        }
    }

    #[test]
    fn protocol_selection() {
        let ps = vec![proto("simple"), proto("tus")];
        assert_eq!(pick_protocol(&ps, "spaces", Some("simple")).unwrap().protocol, "simple");
        assert_eq!(pick_protocol(&ps, "tus", None).unwrap().protocol, "tus");
        assert!(pick_protocol(&ps, "spaces", None).is_err());
    }

    #[test]
    fn token_in_header() {
        let p = proto("simple");
        let req = data_request(Method::PUT, &p)
            .unwrap()
            .body(Body::empty())
            .unwrap();
        assert_eq!(req.uri(), "http://data/simple");
        assert_eq!(req.headers().get(X_REVA_TRANSFER).unwrap(), "tkn");
    }

    #[tokio::test]
    async fn counting() {
        let count = Arc::new(AtomicU64::new(0));
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from("abc")), Ok(Bytes::from("de"))];
        let mut s = CountingStream::new(stream::iter(chunks), count.clone());
        while let Some(c) = s.next().await {
            c.unwrap();
        }
        assert_eq!(count.load(Ordering::Relaxed), 5);
    }
}
