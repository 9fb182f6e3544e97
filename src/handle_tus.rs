use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{HeaderMap, HeaderValue, Method, Request, Response};

use crate::body::Body;
use crate::davheaders::{self, OC_MTIME, OC_PERM, TUS_EXTENSION, TUS_RESUMABLE, UPLOAD_EXPIRES};
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::{Code, Opaque, UploadRequest};
use crate::handle_options::TUS_EXTENSIONS;
use crate::handle_put::client_checksum;
use crate::router::RouteContext;
use crate::transfer::{data_request, pick_protocol};
use crate::{DavResult, TransferError};

const TUS_VERSION: &str = "1.0.0";
const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

fn tus_headers(h: &mut HeaderMap) {
    h.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Tus-Resumable, Upload-Length, Upload-Metadata, If-Match"),
    );
    h.insert(
        "Access-Control-Expose-Headers",
        HeaderValue::from_static("Tus-Resumable, Upload-Offset, Location"),
    );
    h.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    h.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
}

fn precondition(msg: &str) -> DavError {
    DavError::msg(SC::PRECONDITION_FAILED, msg)
}

impl crate::DavInner {
    pub(crate) async fn handle_tus(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        tus_headers(res.headers_mut());
        match self.tus_create(ctx, req, body, &mut res).await {
            Ok(()) => Ok(res),
            Err(e) => {
                // the error response still tells the client about tus.
                let mut eres =
                    crate::davhandler::error_response(e.statuscode(), &e.message(), e.header());
                tus_headers(eres.headers_mut());
                Ok(eres)
            }
        }
    }

    async fn tus_create(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
        res: &mut Response<Body>,
    ) -> DavResult<()> {
        let h = req.headers();
        match h.typed_get::<davheaders::TusResumable>() {
            Some(v) if v.0 == TUS_VERSION => {}
            _ => return Err(precondition("unsupported Tus-Resumable version")),
        }
        let length = match h.typed_try_get::<davheaders::UploadLength>() {
            Ok(Some(l)) => l.0,
            _ => return Err(precondition("missing or invalid Upload-Length")),
        };

        // the file name comes from the metadata, the url is the folder.
        let meta = h.typed_get::<davheaders::UploadMetadata>().unwrap_or_default();
        let filename = meta.get("filename").unwrap_or("");
        if let Err(e) = self.name_validation.check(filename) {
            return Err(precondition(&format!("invalid filename: {}", e)));
        }
        let rel = davpath::join(&ctx.path, filename);

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.resolve(gw, &rel).await?;

        match gw.stat(s, &target).await {
            Ok(info) => {
                if info.is_dir() {
                    return Err(DavError::msg(SC::CONFLICT, "a folder with that name exists"));
                }
                if let Some(m) = h.typed_get::<davheaders::IfMatch>() {
                    if m.0.trim_matches('"') != info.etag.trim_matches('"') {
                        return Err(precondition("etag mismatch"));
                    }
                }
            }
            Err(e) if e.is(Code::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut opaque = Opaque::new();
        opaque.insert("Upload-Length".to_string(), length.to_string());
        if let Some(mtime) = meta.get("mtime") {
            opaque.insert("X-OC-Mtime".to_string(), mtime.to_string());
        }
        if let Some(c) = client_checksum(req)? {
            opaque.insert("Upload-Checksum".to_string(), c.normalized());
        }

        if length == 0 {
            match gw.touch_file(s, &target, &opaque).await {
                Ok(()) => {
                    let info = gw.stat(s, &target).await?;
                    davheaders::insert_info_headers(res.headers_mut(), &info);
                    *res.status_mut() = SC::CREATED;
                    return Ok(());
                }
                // fall through to a normal upload.
                Err(e) if e.is(Code::AlreadyExists) => {}
                Err(e) => {
                    error!("tus: touch file failed: {}", e);
                    return Err(DavError::msg(SC::INTERNAL_SERVER_ERROR, e.to_string()));
                }
            }
        }

        let ureq = UploadRequest {
            reference: target.clone(),
            opaque,
            if_match: h.typed_get::<davheaders::IfMatch>().map(|m| m.0),
            lock_id: h.typed_get::<davheaders::If>().and_then(|i| i.lock_token()),
        };
        let upload = match gw.initiate_file_upload(s, &ureq).await {
            Ok(u) => u,
            Err(e) if e.is(Code::NotFound) => return Err(precondition("parent does not exist")),
            Err(e) => return Err(self.upload_error(gw, ctx, &target, e).await),
        };
        let p = pick_protocol(&upload.protocols, "tus", None)?;
        let location = format!("{}/{}", p.endpoint.trim_end_matches('/'), p.token);
        if let Ok(v) = HeaderValue::from_str(&location) {
            res.headers_mut().insert(http::header::LOCATION, v);
        }

        let with_upload = h
            .typed_get::<davheaders::ContentType>()
            .map(|ct| ct.0.starts_with(OFFSET_CONTENT_TYPE))
            .unwrap_or(false);
        if with_upload {
            let offset = h
                .typed_get::<davheaders::UploadOffset>()
                .map(|o| o.0)
                .unwrap_or(0);
            let mut preq = data_request(Method::PATCH, p)?
                .uri(location.as_str())
                .header(davheaders::UPLOAD_OFFSET.clone(), offset)
                .header(TUS_RESUMABLE, TUS_VERSION)
                .header(http::header::CONTENT_TYPE, OFFSET_CONTENT_TYPE);
            if let Some(cl) = h.get(http::header::CONTENT_LENGTH) {
                preq = preq.header(http::header::CONTENT_LENGTH, cl.clone());
            }
            let preq = preq.body(body).map_err(TransferError::from)?;
            let pres = self.data.execute(preq).await?;
            if pres.status() != SC::NO_CONTENT {
                error!("tus: data endpoint answered {} to PATCH", pres.status());
                return Err(DavError::Status(pres.status()));
            }

            let ph = pres.headers();
            let new_offset = ph
                .typed_get::<davheaders::UploadOffset>()
                .map(|o| o.0)
                .unwrap_or(offset);
            for name in [davheaders::UPLOAD_OFFSET.as_str(), UPLOAD_EXPIRES, OC_MTIME] {
                if let Some(v) = ph.get(name) {
                    res.headers_mut().insert(name, v.clone());
                }
            }

            // upload finished, tell the client about the new file.
            if new_offset == length {
                let info = match gw.stat(s, &target).await {
                    Ok(info) => info,
                    Err(e) if e.is(Code::PermissionDenied) => {
                        *res.status_mut() = SC::OK;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                let rh = res.headers_mut();
                let ct = if info.mime_type.is_empty() {
                    davpath::mime_type(&info.name).to_string()
                } else {
                    info.mime_type.clone()
                };
                if let Ok(v) = HeaderValue::from_str(&ct) {
                    rh.insert(http::header::CONTENT_TYPE, v);
                }
                davheaders::insert_info_headers(rh, &info);
                let is_shared = info.opaque.contains_key("share-types");
                let perm = info.permissions.webdav_flags(false, is_shared, false);
                if let Ok(v) = HeaderValue::from_str(&perm) {
                    rh.insert(OC_PERM, v);
                }
            }
        }

        *res.status_mut() = SC::CREATED;
        Ok(())
    }
}
