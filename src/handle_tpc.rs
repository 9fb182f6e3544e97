//
// HTTP third-party copy.
//
// The transfer runs on its own task. The client gets a 202 at once,
// and a body that reports progress until the copy is done.
//
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::future::{self, Either};
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Method, Request, Response};

use crate::body::Body;
use crate::davheaders::{self, DESTINATION, TRANSFER_HEADER_AUTHORIZATION};
use crate::errors::DavError;
use crate::gateway::{Code, Opaque, UploadRequest};
use crate::router::RouteContext;
use crate::transfer::{CountingStream, DataClient, TransferError, data_request, pick_protocol};
use crate::util::systemtime_to_unix;
use crate::DavResult;

fn perf_marker(bytes: u64) -> String {
    format!(
        "Perf Marker\nTimestamp: {}\nStripe Bytes Transferred: {}\nStrip Index: 0\nTotal Stripe Count: 1\nEnd\n",
        systemtime_to_unix(SystemTime::now()),
        bytes
    )
}

fn overwrite(req: &Request<()>) -> DavResult<bool> {
    match req.headers().typed_try_get::<davheaders::Overwrite>() {
        Ok(o) => Ok(o.map(|o| o.0).unwrap_or(true)),
        Err(_) => Err(DavError::msg(
            SC::BAD_REQUEST,
            "Overwrite header is set to incorrect value",
        )),
    }
}

fn transfer_auth(req: &Request<()>) -> Option<http::HeaderValue> {
    req.headers().get(TRANSFER_HEADER_AUTHORIZATION).cloned()
}

// Move `download` into the request built by `upload` on a separate
// task, reporting progress on the returned body.
fn spawn_transfer(
    data: Box<dyn DataClient>,
    download: Body,
    upload: http::request::Builder,
    interval: Duration,
) -> DavResult<Response<Body>> {
    let count = Arc::new(AtomicU64::new(0));
    let counted = CountingStream::new(download, count.clone());
    let ureq = upload
        .body(Body::from_stream(counted))
        .map_err(TransferError::from)?;
    let (tx, rx) = mpsc::unbounded::<io::Result<Bytes>>();
    let interval = interval.max(Duration::from_millis(10));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        let mut transfer = data.execute(ureq);
        let mut reported = 0;
        let result = loop {
            let tick = Box::pin(ticker.tick());
            match future::select(transfer, tick).await {
                Either::Left((res, _)) => break res,
                Either::Right((_, t)) => {
                    transfer = t;
                    // only while bytes flow.
                    let n = count.load(Ordering::Relaxed);
                    if n != reported {
                        reported = n;
                        let _ = tx.unbounded_send(Ok(Bytes::from(perf_marker(n))));
                    }
                }
            }
        };
        let last = match result {
            Ok(res) if res.status().is_success() => "success: Created".to_string(),
            Ok(res) => {
                error!("tpc: transfer answered {}", res.status());
                format!("failure: {}", res.status())
            }
            Err(e) => {
                error!("tpc: transfer failed: {}", e);
                format!("failure: {}", e)
            }
        };
        debug!("tpc: done after {} bytes: {}", count.load(Ordering::Relaxed), last);
        let _ = tx.unbounded_send(Ok(Bytes::from(last)));
    });

    let mut res = Response::new(Body::from_stream(rx));
    *res.status_mut() = SC::ACCEPTED;
    Ok(res)
}

impl crate::DavInner {
    // COPY with a Source header: pull from a remote server into the target.
    pub(crate) async fn handle_tpc_pull(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
    ) -> DavResult<Response<Body>> {
        let overwrite = overwrite(req)?;
        let source = req
            .headers()
            .typed_get::<davheaders::Source>()
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "invalid Source header"))?;
        debug!("tpc pull: {} -> {}", source.0, ctx.path);

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;
        match gw.stat(s, &target).await {
            Ok(_) if !overwrite => {
                warn!("tpc pull: destination {} already exists", target);
                return Err(DavError::msg(SC::PRECONDITION_FAILED, "Destination already exists"));
            }
            Ok(_) => {}
            Err(e) if e.is(Code::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut dreq = Request::builder().method(Method::GET).uri(source.0.as_str());
        if let Some(auth) = transfer_auth(req) {
            dreq = dreq.header(http::header::AUTHORIZATION, auth);
        }
        let dreq = dreq.body(Body::empty()).map_err(TransferError::from)?;
        let dres = self.data.execute(dreq).await?;
        if dres.status() == SC::NOT_IMPLEMENTED {
            return Err(DavError::msg(
                SC::BAD_REQUEST,
                "Third-Party copy not supported, source might be a folder",
            ));
        }
        if dres.status() != SC::OK {
            return Err(DavError::msg(
                dres.status(),
                format!("Remote GET returned status code {}", dres.status().as_u16()),
            ));
        }

        let mut opaque = Opaque::new();
        opaque.insert("sizedeferred".to_string(), "true".to_string());
        let ureq = UploadRequest {
            reference: target.clone(),
            opaque,
            ..UploadRequest::default()
        };
        let upload = match gw.initiate_file_upload(s, &ureq).await {
            Ok(u) => u,
            Err(e) => return Err(self.upload_error(gw, ctx, &target, e).await),
        };
        let p = pick_protocol(&upload.protocols, "simple", None)?;
        let builder = data_request(Method::PUT, p)?;
        spawn_transfer(self.data.clone(), dres.into_body(), builder, self.perf_marker_interval)
    }

    // COPY to a Destination on another server: push the source there.
    pub(crate) async fn handle_tpc_push(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
    ) -> DavResult<Response<Body>> {
        overwrite(req)?;
        let dst = req
            .headers()
            .get(&DESTINATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "failed to extract destination"))?;
        debug!("tpc push: {} -> {}", ctx.path, dst);

        let gw = self.gw()?;
        let s = &ctx.session;
        let src = ctx.target(gw).await?;
        let info = match gw.stat(s, &src).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
            }
            Err(e) => return Err(e.into()),
        };
        if info.is_dir() {
            return Err(DavError::msg(
                SC::BAD_REQUEST,
                "Third-Party copy of a folder is not supported",
            ));
        }

        let protocols = gw.initiate_file_download(s, &src).await?;
        let p = pick_protocol(&protocols, "simple", None)?;
        let dreq = data_request(Method::GET, p)?
            .body(Body::empty())
            .map_err(TransferError::from)?;
        let dres = self.data.execute(dreq).await?;
        if dres.status() != SC::OK {
            return Err(DavError::Status(dres.status()));
        }

        let mut builder = Request::builder()
            .method(Method::PUT)
            .uri(dst.as_str())
            .header(http::header::CONTENT_LENGTH, info.size);
        if let Some(auth) = transfer_auth(req) {
            builder = builder.header(http::header::AUTHORIZATION, auth);
        }
        spawn_transfer(self.data.clone(), dres.into_body(), builder, self.perf_marker_interval)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use futures_util::future::{BoxFuture, FutureExt};

    use super::*;

    // Reads the whole upload and answers 201.
    #[derive(Debug, Clone)]
    struct Drain;

    impl DataClient for Drain {
        fn execute<'a>(
            &'a self,
            req: Request<Body>,
        ) -> BoxFuture<'a, Result<Response<Body>, TransferError>> {
            async move {
                let mut body = req.into_body();
                while let Some(chunk) = body.next().await {
                    chunk.map_err(|e| TransferError::Transport(e.to_string()))?;
                }
                let mut res = Response::new(Body::empty());
                *res.status_mut() = SC::CREATED;
                Ok(res)
            }
            .boxed()
        }
    }

    async fn collect(mut body: Body) -> String {
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(data).unwrap()
    }

    #[tokio::test]
    async fn markers_while_bytes_flow() {
        let slow = futures_util::stream::unfold(0, |i| async move {
            if i == 5 {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            Some((Ok(Bytes::from(vec![1u8; 100])), i + 1))
        });
        let upload = Request::builder().method(Method::PUT).uri("http://remote.example/x");
        let res = spawn_transfer(
            Box::new(Drain),
            Body::from_stream(slow),
            upload,
            Duration::from_millis(10),
        )
        .unwrap();
        assert_eq!(res.status(), SC::ACCEPTED);

        let body = collect(res.into_body()).await;
        assert!(body.starts_with("Perf Marker\n"), "{}", body);
        assert!(body.contains("Stripe Bytes Transferred: "));
        assert!(body.ends_with("success: Created"), "{}", body);
        // counts only grow.
        let counts: Vec<u64> = body
            .lines()
            .filter_map(|l| l.strip_prefix("Stripe Bytes Transferred: "))
            .map(|n| n.parse().unwrap())
            .collect();
        assert!(!counts.is_empty());
        assert!(counts.windows(2).all(|w| w[0] < w[1]));
        assert!(counts.iter().all(|&n| n <= 500));
    }

    #[tokio::test]
    async fn failed_upload_is_reported() {
        #[derive(Debug, Clone)]
        struct Refuse;
        impl DataClient for Refuse {
            fn execute<'a>(
                &'a self,
                _req: Request<Body>,
            ) -> BoxFuture<'a, Result<Response<Body>, TransferError>> {
                async move {
                    let mut res = Response::new(Body::empty());
                    *res.status_mut() = SC::FORBIDDEN;
                    Ok(res)
                }
                .boxed()
            }
        }

        let upload = Request::builder().method(Method::PUT).uri("http://remote.example/x");
        let res = spawn_transfer(
            Box::new(Refuse),
            Body::from("abc"),
            upload,
            Duration::from_millis(10),
        )
        .unwrap();
        let body = collect(res.into_body()).await;
        assert!(body.ends_with("failure: 403 Forbidden"), "{}", body);
    }

    #[test]
    fn marker_format() {
        let m = perf_marker(42);
        assert!(m.starts_with("Perf Marker\nTimestamp: "));
        assert!(m.contains("\nStripe Bytes Transferred: 42\n"));
        assert!(m.ends_with("Strip Index: 0\nTotal Stripe Count: 1\nEnd\n"));
    }
}
