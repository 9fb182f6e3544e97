use http::StatusCode as SC;
use http::{HeaderValue, Request, Response};

use crate::body::Body;
use crate::davheaders::{TUS_CHECKSUM_ALGORITHM, TUS_EXTENSION, TUS_RESUMABLE, TUS_VERSION};
use crate::router::RouteContext;
use crate::DavResult;

pub(crate) const TUS_EXTENSIONS: &str = "creation,creation-with-upload,checksum,expiration";

impl crate::DavInner {
    pub(crate) async fn handle_options(
        &self,
        ctx: &RouteContext,
        _req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        let allow = self.allowed_methods(ctx.kind);
        let h = res.headers_mut();
        if let Ok(v) = HeaderValue::from_str(&allow) {
            h.insert("Allow", v.clone());
            h.insert("Access-Control-Allow-Methods", v);
        }
        h.insert("DAV", HeaderValue::from_static("1, 2"));
        h.insert("MS-Author-Via", HeaderValue::from_static("DAV"));
        h.insert(TUS_RESUMABLE, HeaderValue::from_static("1.0.0"));
        h.insert(TUS_VERSION, HeaderValue::from_static("1.0.0"));
        h.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
        h.insert(TUS_CHECKSUM_ALGORITHM, HeaderValue::from_static("md5,sha1,adler32"));
        h.insert("Content-Length", HeaderValue::from_static("0"));
        *res.status_mut() = SC::OK;
        Ok(res)
    }
}
