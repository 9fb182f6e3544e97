use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{HeaderValue, Method, Request, Response};

use crate::body::Body;
use crate::davheaders::{self, ClientChecksum, OC_MTIME};
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::{Code, Opaque, Reference, UploadRequest};
use crate::router::RouteContext;
use crate::transfer::{data_request, pick_protocol};
use crate::{DavResult, TransferError};

// Status the data endpoint uses for a checksum mismatch.
const CHECKSUM_MISMATCH: u16 = 419;

/// Length of the upload as announced by the client.
fn upload_length(req: &Request<()>) -> DavResult<u64> {
    let h = req.headers();
    let bad = |_| DavError::msg(SC::BAD_REQUEST, "invalid length header");
    if h.contains_key(&davheaders::X_EXPECTED_ENTITY_LENGTH) {
        let l = h
            .typed_try_get::<davheaders::XExpectedEntityLength>()
            .map_err(bad)?;
        return Ok(l.map(|l| l.0).unwrap_or(0));
    }
    if let Some(cl) = h.get(http::header::CONTENT_LENGTH) {
        return cl
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "invalid Content-Length"));
    }
    match h.typed_try_get::<davheaders::UploadLength>().map_err(bad)? {
        Some(l) => Ok(l.0),
        None => Err(DavError::msg(SC::BAD_REQUEST, "missing Content-Length header")),
    }
}

/// Client checksum. `Upload-Checksum` wins over `OC-Checksum`.
pub(crate) fn client_checksum(req: &Request<()>) -> DavResult<Option<ClientChecksum>> {
    let h = req.headers();
    let bad = |_| DavError::msg(SC::BAD_REQUEST, "invalid checksum header");
    if let Some(c) = h.typed_try_get::<davheaders::UploadChecksum>().map_err(bad)? {
        return Ok(Some(c.0));
    }
    Ok(h.typed_try_get::<davheaders::OcChecksum>().map_err(bad)?.map(|c| c.0))
}

impl crate::DavInner {
    pub(crate) async fn handle_put(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        // no partial PUT.
        if req.headers().contains_key(http::header::CONTENT_RANGE) {
            return Err(DavError::msg(
                SC::NOT_IMPLEMENTED,
                "Content-Range header is not accepted on PUT",
            ));
        }

        let name = davpath::basename(&ctx.path);
        if let Err(e) = self.name_validation.check(name) {
            return Err(DavError::msg(SC::BAD_REQUEST, format!("invalid name: {}", e)));
        }
        let length = upload_length(req)?;

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;

        let mut opaque = Opaque::new();
        opaque.insert("Upload-Length".to_string(), length.to_string());
        let mtime = req.headers().typed_get::<davheaders::OcMtime>();
        if let Some(ref m) = mtime {
            opaque.insert("X-OC-Mtime".to_string(), m.0.clone());
        }
        if let Some(c) = client_checksum(req)? {
            opaque.insert("Upload-Checksum".to_string(), c.normalized());
        }
        let lock_id = req
            .headers()
            .typed_get::<davheaders::If>()
            .and_then(|i| i.lock_token());

        let mut res = Response::new(Body::empty());
        if mtime.is_some() {
            res.headers_mut()
                .insert(OC_MTIME, HeaderValue::from_static("accepted"));
        }

        if length == 0 {
            match gw.touch_file(s, &target, &opaque).await {
                Ok(()) => {}
                Err(e) if e.is(Code::PermissionDenied) => {
                    return Err(self.denied(gw, s, &target.parent(), "permission denied").await);
                }
                Err(e) => return Err(e.into()),
            }
            let info = gw.stat(s, &target).await?;
            davheaders::insert_info_headers(res.headers_mut(), &info);
            *res.status_mut() = SC::CREATED;
            return Ok(res);
        }

        let ureq = UploadRequest {
            reference: target.clone(),
            opaque,
            if_match: req
                .headers()
                .typed_get::<davheaders::IfMatch>()
                .map(|m| m.0),
            lock_id,
        };
        let upload = match gw.initiate_file_upload(s, &ureq).await {
            Ok(u) => u,
            Err(e) => return Err(self.upload_error(gw, ctx, &target, e).await),
        };
        let p = pick_protocol(&upload.protocols, "simple", None)?;

        let dreq = data_request(Method::PUT, p)?
            .header(http::header::CONTENT_LENGTH, length)
            .body(body)
            .map_err(TransferError::from)?;
        let dres = self.data.execute(dreq).await?;
        let status = dres.status();
        if status == SC::PARTIAL_CONTENT {
            *res.status_mut() = SC::PARTIAL_CONTENT;
            return Ok(res);
        }
        if status.as_u16() == CHECKSUM_MISMATCH {
            return Err(DavError::msg(
                SC::BAD_REQUEST,
                "The computed checksum does not match the one received from the client.",
            ));
        }
        if !status.is_success() {
            error!("handle_put: data endpoint answered {}", status);
            return Err(DavError::Status(status));
        }

        // the data endpoint knows the new metadata.
        let dh = dres.headers();
        let h = res.headers_mut();
        for name in ["etag", davheaders::OC_ETAG, davheaders::OC_FILEID, "last-modified"] {
            if let Some(v) = dh.get(name) {
                h.insert(name, v.clone());
            }
        }
        if !h.contains_key(davheaders::OC_FILEID) {
            if let Ok(info) = gw.stat(s, &target).await {
                davheaders::insert_info_headers(h, &info);
            }
        }
        *res.status_mut() = if upload.created() {
            SC::CREATED
        } else {
            SC::NO_CONTENT
        };
        Ok(res)
    }

    // Map an initiate upload failure.
    pub(crate) async fn upload_error(
        &self,
        gw: &dyn crate::gateway::GatewayClient,
        ctx: &RouteContext,
        target: &Reference,
        e: crate::gateway::GwError,
    ) -> DavError {
        match e.code() {
            Some(Code::PermissionDenied) => {
                self.denied(gw, &ctx.session, &target.parent(), "permission denied").await
            }
            Some(Code::Aborted) => DavError::msg(SC::PRECONDITION_FAILED, "precondition failed"),
            Some(Code::FailedPrecondition) => DavError::msg(SC::CONFLICT, "conflict"),
            Some(Code::NotFound) => DavError::msg(SC::NOT_FOUND, "Resource not found"),
            _ => e.into(),
        }
    }
}
