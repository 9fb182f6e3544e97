//! Definitions for the Request and Response bodies.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use http_body::{Body as HttpBody, Frame};
use http_body_util::BodyStream;

/// Body is returned by the webdav handler, and implements both `Stream`
/// and `http_body::Body`.
pub struct Body {
    pub(crate) inner: BodyType,
}

pub(crate) enum BodyType {
    Bytes(Option<Bytes>),
    Stream(BoxStream<'static, io::Result<Bytes>>),
    Empty,
}

impl Body {
    /// Return an empty body.
    pub fn empty() -> Body {
        Body {
            inner: BodyType::Empty,
        }
    }

    /// Body from a stream of byte chunks.
    pub fn from_stream<S>(strm: S) -> Body
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body {
            inner: BodyType::Stream(strm.boxed()),
        }
    }

    // Adapt an incoming request body.
    pub(crate) fn from_http_body<ReqBody, ReqData, ReqError>(body: ReqBody) -> Body
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let strm = BodyStream::new(body)
            .map_err(io::Error::other)
            .try_filter_map(|frame| async move {
                Ok(frame.into_data().ok().map(|mut d| {
                    let len = d.remaining();
                    d.copy_to_bytes(len)
                }))
            });
        Body::from_stream(strm)
    }

    pub(crate) fn is_empty_body(&self) -> bool {
        match self.inner {
            BodyType::Empty => true,
            BodyType::Bytes(ref b) => b.as_ref().map(|b| b.is_empty()).unwrap_or(true),
            BodyType::Stream(_) => false,
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.inner {
            BodyType::Bytes(ref b) => write!(f, "Body::Bytes({:?})", b.as_ref().map(|b| b.len())),
            BodyType::Stream(_) => write!(f, "Body::Stream"),
            BodyType::Empty => write!(f, "Body::Empty"),
        }
    }
}

impl Stream for Body {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match self.inner {
            BodyType::Bytes(ref mut strm) => Poll::Ready(strm.take().map(Ok)),
            BodyType::Stream(ref mut strm) => strm.as_mut().poll_next(cx),
            BodyType::Empty => Poll::Ready(None),
        }
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.poll_next(cx).map_ok(Frame::data)
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            BodyType::Bytes(ref b) => b.is_none(),
            BodyType::Stream(_) => false,
            BodyType::Empty => true,
        }
    }
}

impl From<String> for Body {
    fn from(t: String) -> Body {
        Body {
            inner: BodyType::Bytes(Some(Bytes::from(t))),
        }
    }
}

impl From<&str> for Body {
    fn from(t: &str) -> Body {
        Body {
            inner: BodyType::Bytes(Some(Bytes::from(t.to_string()))),
        }
    }
}

impl From<Bytes> for Body {
    fn from(t: Bytes) -> Body {
        Body {
            inner: BodyType::Bytes(Some(t)),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(t: Vec<u8>) -> Body {
        Body {
            inner: BodyType::Bytes(Some(Bytes::from(t))),
        }
    }
}
