use http::StatusCode as SC;
use http::{HeaderValue, Method, Request, Response};

use crate::body::Body;
use crate::davheaders::{self, OC_PERM};
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::{Code, ResourceInfo};
use crate::router::RouteContext;
use crate::transfer::{data_request, pick_protocol};
use crate::DavResult;

// headers copied from the data endpoint.
const PASS_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-range",
    "content-disposition",
    "accept-ranges",
];

fn content_type(info: &ResourceInfo) -> String {
    if info.mime_type.is_empty() {
        davpath::mime_type(&info.name).to_string()
    } else {
        info.mime_type.clone()
    }
}

impl crate::DavInner {
    pub(crate) async fn handle_get(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        let head = req.method() == Method::HEAD;
        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;

        let info = match gw.stat(s, &target).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(
                    SC::NOT_FOUND,
                    format!("Resource {} not found", ctx.client_path(&ctx.path)),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        if info.is_dir() {
            if head {
                let mut res = Response::new(Body::empty());
                davheaders::insert_info_headers(res.headers_mut(), &info);
                return Ok(res);
            }
            return Err(DavError::msg(SC::NOT_IMPLEMENTED, "GET on collections is not supported"));
        }

        let mut res = Response::new(Body::empty());
        if head {
            let h = res.headers_mut();
            davheaders::insert_info_headers(h, &info);
            if let Ok(v) = HeaderValue::from_str(&content_type(&info)) {
                h.insert("content-type", v);
            }
            h.insert("content-length", HeaderValue::from(info.size));
            let perm = info.permissions.webdav_flags(false, false, false);
            if let Ok(v) = HeaderValue::from_str(&perm) {
                h.insert(OC_PERM, v);
            }
            return Ok(res);
        }

        let protocols = match gw.initiate_file_download(s, &target).await {
            Ok(p) => p,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let p = pick_protocol(&protocols, "spaces", Some("simple"))?;

        let mut dreq = data_request(Method::GET, p)?;
        if let Some(range) = req.headers().get(http::header::RANGE) {
            dreq = dreq.header(http::header::RANGE, range.clone());
        }
        let dreq = dreq.body(Body::empty()).map_err(crate::TransferError::from)?;
        let dres = self.data.execute(dreq).await?;
        let (parts, body) = dres.into_parts();
        if !parts.status.is_success() {
            error!("handle_get: data endpoint answered {}", parts.status);
            return Err(DavError::Status(parts.status));
        }

        let h = res.headers_mut();
        for name in PASS_HEADERS {
            if let Some(v) = parts.headers.get(*name) {
                h.insert(*name, v.clone());
            }
        }
        if !h.contains_key("content-type") {
            if let Ok(v) = HeaderValue::from_str(&content_type(&info)) {
                h.insert("content-type", v);
            }
        }
        davheaders::insert_info_headers(h, &info);
        *res.status_mut() = parts.status;
        *res.body_mut() = body;
        Ok(res)
    }
}
