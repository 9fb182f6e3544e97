use futures_util::future::{BoxFuture, FutureExt};
use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{HeaderValue, Method, Request, Response};

use crate::body::Body;
use crate::davheaders::{self, Depth};
use crate::davpath::{self, normalize_path};
use crate::errors::DavError;
use crate::gateway::{Code, GatewayClient, GwError, Opaque, Reference, ResourceInfo, UploadRequest};
use crate::router::RouteContext;
use crate::spacelookup::reference_is_child_of;
use crate::transfer::{data_request, pick_protocol};
use crate::util::DavMethod;
use crate::{DavResult, TransferError};

// What a COPY or MOVE is about to do, after all checks passed.
struct CopyMove {
    src: Reference,
    src_info: ResourceInfo,
    dst: Reference,
    depth_infinity: bool,
    success: SC,
}

// "https://host:port/path" -> "host:port"
fn authority(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or("");
    rest.split('/').next().unwrap_or("")
}

impl crate::DavInner {
    pub(crate) async fn handle_copy(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        if self.enable_http_tpc {
            if req.headers().contains_key(&davheaders::SOURCE) {
                return self.handle_tpc_pull(ctx, req).await;
            }
            if self.is_tpc_push(req) {
                return self.handle_tpc_push(ctx, req).await;
            }
        }
        self.handle_copymove(ctx, req, body, DavMethod::Copy).await
    }

    pub(crate) async fn handle_move(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        self.handle_copymove(ctx, req, body, DavMethod::Move).await
    }

    // A Destination on another host, with credentials for it.
    fn is_tpc_push(&self, req: &Request<()>) -> bool {
        let h = req.headers();
        if !h.contains_key(davheaders::TRANSFER_HEADER_AUTHORIZATION) {
            return false;
        }
        let origin = match h.typed_get::<davheaders::Destination>() {
            Some(davheaders::Destination {
                origin: Some(o), ..
            }) => o,
            _ => return false,
        };
        let dest_host = authority(&origin);
        // our own authority: the Host header, the request uri, or the public url.
        let own = h
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_else(|| authority(&self.public_url).to_string());
        if own.is_empty() {
            debug!("is_tpc_push: no authority to compare {} against", origin);
            return false;
        }
        !dest_host.eq_ignore_ascii_case(&own)
    }

    async fn handle_copymove(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
        method: DavMethod,
    ) -> DavResult<Response<Body>> {
        self.require_empty_body(body).await?;

        let gw = self.gw()?;
        let s = &ctx.session;

        // decode and validate destination.
        let dest = match req.headers().typed_try_get::<davheaders::Destination>() {
            Ok(Some(d)) => d,
            _ => {
                return Err(DavError::with_header(
                    SC::BAD_REQUEST,
                    "failed to extract destination",
                    "Destination",
                ));
            }
        };
        let dest_rel = normalize_path(&dest.path)
            .ok()
            .and_then(|p| ctx.relative_to_base(&p))
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "failed to extract destination"))?;
        if let Err(e) = self.name_validation.check(davpath::basename(&dest_rel)) {
            return Err(DavError::msg(SC::BAD_REQUEST, format!("invalid destination: {}", e)));
        }

        let src = ctx.target(gw).await?;
        let dst = ctx.resolve(gw, &dest_rel).await?;

        let cm = self.prepare_copymove(gw, ctx, req, method, src, dst).await?;
        debug!(
            "handle_copymove: {} {} -> {} infinity {}",
            method.as_str(),
            cm.src,
            cm.dst,
            cm.depth_infinity
        );

        let mut res = Response::new(Body::empty());
        if method == DavMethod::Copy {
            self.copy_tree(gw, ctx, cm.src.clone(), cm.src_info.clone(), cm.dst.clone(), cm.depth_infinity)
                .await?;
            if let Ok(info) = gw.stat(s, &cm.dst).await {
                davheaders::insert_info_headers(res.headers_mut(), &info);
            }
        } else {
            let lock_id = req
                .headers()
                .typed_get::<davheaders::If>()
                .and_then(|i| i.lock_token());
            if let Err(e) = gw.move_resource(s, &cm.src, &cm.dst, lock_id.as_deref()).await {
                return Err(match e.code() {
                    Some(Code::Aborted) => DavError::msg(SC::PRECONDITION_FAILED, "precondition failed"),
                    Some(Code::Unimplemented) => {
                        DavError::msg(SC::BAD_GATEWAY, "move between storages is not supported")
                    }
                    Some(Code::PermissionDenied) => {
                        self.denied(gw, s, &cm.src, "permission denied to move").await
                    }
                    Some(Code::Locked) => DavError::msg(SC::LOCKED, "Resource is locked"),
                    _ => e.into(),
                });
            }
            let info = gw.stat(s, &cm.dst).await?;
            let h = res.headers_mut();
            if !info.mime_type.is_empty() {
                if let Ok(v) = HeaderValue::from_str(&info.mime_type) {
                    h.insert(http::header::CONTENT_TYPE, v);
                }
            }
            davheaders::insert_info_headers(h, &info);
        }

        *res.status_mut() = cm.success;
        Ok(res)
    }

    // All checks that come before the first mutation.
    async fn prepare_copymove(
        &self,
        gw: &dyn GatewayClient,
        ctx: &RouteContext,
        req: &Request<()>,
        method: DavMethod,
        src: Reference,
        dst: Reference,
    ) -> DavResult<CopyMove> {
        let s = &ctx.session;

        // COPY /a/b /a/b/c would never end, and overwriting /a with
        // /a/b deletes the source first.
        let checks = [
            (&dst, &src, "can not copy a folder into one of its children"),
            (&src, &dst, "can not overwrite a parent of the source"),
        ];
        for (child, parent, msg) in checks {
            match reference_is_child_of(gw, s, &self.machine_auth_api_key, child, parent).await {
                Ok(false) => {}
                Ok(true) => return Err(DavError::msg(SC::CONFLICT, msg)),
                Err(GwError::NotSupported(e)) => {
                    error!("can not detect recursive copy operation: {}", e);
                    return Err(DavError::msg(SC::FORBIDDEN, e));
                }
                Err(e) => {
                    error!("error while detecting recursive copy operation: {}", e);
                    return Err(DavError::msg(SC::INTERNAL_SERVER_ERROR, e.to_string()));
                }
            }
        }

        let overwrite = match req.headers().typed_try_get::<davheaders::Overwrite>() {
            Ok(o) => o.map(|o| o.0).unwrap_or(true),
            Err(_) => {
                return Err(DavError::with_header(
                    SC::BAD_REQUEST,
                    "Overwrite header is set to incorrect value",
                    "Overwrite",
                ));
            }
        };
        let depth_infinity = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Infinity)) | Ok(None) => true,
            Ok(Some(Depth::Zero)) if method == DavMethod::Copy => false,
            _ => {
                return Err(DavError::with_header(
                    SC::BAD_REQUEST,
                    "Depth header is set to incorrect value",
                    "Depth",
                ));
            }
        };

        let src_info = match gw.stat(s, &src).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(
                    SC::NOT_FOUND,
                    format!("Resource {} not found", ctx.client_path(&ctx.path)),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let success = match gw.stat(s, &dst).await {
            Ok(dst_info) => {
                if !overwrite {
                    warn!("{} destination {} already exists", method.as_str(), dst);
                    return Err(DavError::msg(SC::PRECONDITION_FAILED, "Could not overwrite Resource"));
                }
                // delete the existing tree when overwriting a folder, or
                // replacing a file with a folder. MOVE always replaces.
                let delete =
                    method == DavMethod::Move || dst_info.is_dir() || src_info.is_dir();
                if delete {
                    debug!("deleting destination {} before {}", dst, method.as_str());
                    match gw.delete(s, &dst, None).await {
                        Ok(()) => {}
                        Err(e) if e.is(Code::NotFound) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                SC::NO_CONTENT
            }
            Err(e) if e.is(Code::NotFound) => {
                // 409 if an intermediate folder is missing.
                match gw.stat(s, &dst.parent()).await {
                    Ok(_) => {}
                    Err(e) if e.is(Code::NotFound) => {
                        return Err(DavError::msg(SC::CONFLICT, "parent does not exist"));
                    }
                    Err(e) => return Err(e.into()),
                }
                SC::CREATED
            }
            Err(e) => return Err(e.into()),
        };

        Ok(CopyMove {
            src,
            src_info,
            dst,
            depth_infinity,
            success,
        })
    }

    // Copy a file or a tree. Stops between steps once the request is
    // cancelled; what was copied up to then stays.
    fn copy_tree<'a>(
        &'a self,
        gw: &'a dyn GatewayClient,
        ctx: &'a RouteContext,
        src: Reference,
        info: ResourceInfo,
        dst: Reference,
        depth_infinity: bool,
    ) -> BoxFuture<'a, DavResult<()>> {
        async move {
            if ctx.cancel.is_cancelled() {
                warn!("copy of {} to {} cancelled", src, dst);
                return Err(DavError::Cancelled);
            }
            let s = &ctx.session;
            if !info.is_dir() {
                return self.copy_file(gw, ctx, &src, &info, &dst).await;
            }

            match gw.create_container(s, &dst).await {
                Ok(()) => {}
                Err(e) if e.is(Code::PermissionDenied) => {
                    return Err(DavError::msg(SC::FORBIDDEN, "Permission denied to create"));
                }
                Err(e) => return Err(e.into()),
            }
            if !depth_infinity {
                return Ok(());
            }

            let children = gw.list_container(s, &src).await?;
            for child in children {
                let name = if child.name.is_empty() {
                    davpath::basename(&child.path).to_string()
                } else {
                    child.name.clone()
                };
                let csrc = src.child(&name);
                let cdst = dst.child(&name);
                self.copy_tree(gw, ctx, csrc, child, cdst, true).await?;
            }
            Ok(())
        }
        .boxed()
    }

    // Download from the source, stream straight into an upload.
    async fn copy_file(
        &self,
        gw: &dyn GatewayClient,
        ctx: &RouteContext,
        src: &Reference,
        info: &ResourceInfo,
        dst: &Reference,
    ) -> DavResult<()> {
        let s = &ctx.session;
        let protocols = gw.initiate_file_download(s, src).await?;
        let p = pick_protocol(&protocols, "spaces", Some("simple"))?;
        let dreq = data_request(Method::GET, p)?
            .body(Body::empty())
            .map_err(TransferError::from)?;
        let dres = self.data.execute(dreq).await?;
        if !dres.status().is_success() {
            error!("copy: download of {} answered {}", src, dres.status());
            return Err(DavError::Status(dres.status()));
        }

        let mut opaque = Opaque::new();
        opaque.insert("Upload-Length".to_string(), info.size.to_string());
        let ureq = UploadRequest {
            reference: dst.clone(),
            opaque,
            ..UploadRequest::default()
        };
        let upload = match gw.initiate_file_upload(s, &ureq).await {
            Ok(u) => u,
            Err(e) => return Err(self.upload_error(gw, ctx, dst, e).await),
        };
        let p = pick_protocol(&upload.protocols, "simple", None)?;
        let ureq = data_request(Method::PUT, p)?
            .header(http::header::CONTENT_LENGTH, info.size)
            .body(dres.into_body())
            .map_err(TransferError::from)?;
        let ures = self.data.execute(ureq).await?;
        if !ures.status().is_success() {
            error!("copy: upload to {} answered {}", dst, ures.status());
            return Err(DavError::Status(ures.status()));
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "memgw"))]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::DavConfig;
    use crate::memgw::MemGateway;
    use crate::pool::GatewayPool;
    use crate::router::{NamespaceKind, Root};

    #[tokio::test]
    async fn cancelled_copy_stops() {
        let gw = MemGateway::new();
        let session = gw.session("alice");
        gw.put_file("/users/alice/src/a.txt", b"a");
        let inner = crate::DavInner::new(
            DavConfig::new()
                .gateway(GatewayPool::single(Box::new(gw.clone())))
                .data_client(Box::new(gw.clone())),
        );
        let ctx = RouteContext {
            base_uri: "/remote.php/dav/files/alice".to_string(),
            root: Root::Path("/users/alice".to_string()),
            kind: NamespaceKind::Files,
            path: "/src".to_string(),
            session: session.clone(),
            cancel: CancellationToken::new(),
        };
        let src = Reference::from_path("/users/alice/src");
        let info = gw.stat(&session, &src).await.unwrap();
        gw.clear_calls();

        ctx.cancel.cancel();
        let dst = Reference::from_path("/users/alice/dst");
        let res = inner.copy_tree(&gw, &ctx, src, info, dst, true).await;
        let err = res.unwrap_err();
        assert!(matches!(err, DavError::Cancelled));
        assert_eq!(err.statuscode(), SC::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "copy cancelled after partial completion");
        assert!(!gw.calls().iter().any(|c| c == "create_container"));
        assert!(!gw.exists("/users/alice/dst"));
    }

    #[test]
    fn push_detection() {
        let inner = crate::DavInner::new(DavConfig::new().public_url("https://cloud.example.org"));
        let copy = |dest: &str, host: Option<&str>| {
            let mut b = Request::builder()
                .method("COPY")
                .uri("/remote.php/dav/files/alice/a.txt")
                .header("Destination", dest)
                .header("TransferHeaderAuthorization", "Bearer abc");
            if let Some(h) = host {
                b = b.header("Host", h);
            }
            b.body(()).unwrap()
        };

        assert!(inner.is_tpc_push(&copy("https://remote.example/a.txt", Some("localhost"))));
        assert!(!inner.is_tpc_push(&copy("http://localhost/remote.php/dav/files/alice/b.txt", Some("localhost"))));
        // without a Host header the public url decides.
        assert!(!inner.is_tpc_push(&copy("https://cloud.example.org/remote.php/dav/files/alice/b.txt", None)));
        assert!(inner.is_tpc_push(&copy("https://remote.example/a.txt", None)));
        assert!(!inner.is_tpc_push(&copy("/remote.php/dav/files/alice/b.txt", Some("remote.example"))));

        // nothing to compare against.
        let bare = crate::DavInner::new(DavConfig::new());
        assert!(!bare.is_tpc_push(&copy("https://remote.example/a.txt", None)));
    }
}
