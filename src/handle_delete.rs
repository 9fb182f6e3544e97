use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davheaders;
use crate::errors::DavError;
use crate::gateway::Code;
use crate::router::RouteContext;
use crate::DavResult;

impl crate::DavInner {
    pub(crate) async fn handle_delete(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        self.require_empty_body(body).await?;

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;
        let lock_id = req
            .headers()
            .typed_get::<davheaders::If>()
            .and_then(|i| i.lock_token());

        debug!("handle_delete: {} lock {:?}", target, lock_id);
        if let Err(e) = gw.delete(s, &target, lock_id.as_deref()).await {
            return Err(match e.code() {
                Some(Code::NotFound) => DavError::msg(
                    SC::NOT_FOUND,
                    format!("Resource {} not found", ctx.client_path(&ctx.path)),
                ),
                Some(Code::PermissionDenied) => {
                    self.denied(gw, s, &target, "permission denied to delete").await
                }
                Some(Code::FailedPrecondition) => DavError::msg(SC::LOCKED, "Resource is locked"),
                _ => e.into(),
            });
        }

        let mut res = Response::new(Body::empty());
        *res.status_mut() = SC::NO_CONTENT;
        Ok(res)
    }
}
