use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::Code;
use crate::router::RouteContext;
use crate::DavResult;

impl crate::DavInner {
    pub(crate) async fn handle_mkcol(
        &self,
        ctx: &RouteContext,
        _req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        // extended mkcol is not supported.
        self.require_empty_body(body).await?;

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;
        match gw.stat(s, &target).await {
            Ok(_) => {
                return Err(DavError::msg(
                    SC::METHOD_NOT_ALLOWED,
                    "The resource you tried to create already exists",
                ));
            }
            Err(e) if e.is(Code::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let name = davpath::basename(&ctx.path);
        if let Err(e) = self.name_validation.check(name) {
            return Err(DavError::msg(SC::BAD_REQUEST, format!("invalid name: {}", e)));
        }

        // RFC 4918 9.3.1 MKCOL Status Codes.
        let parent = target.parent();
        match gw.stat(s, &parent).await {
            Ok(_) => {}
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::CONFLICT, "parent does not exist"));
            }
            Err(e) => return Err(e.into()),
        }

        match gw.create_container(s, &target).await {
            Ok(()) => {}
            Err(e) => {
                return Err(match e.code() {
                    Some(Code::NotFound) => DavError::msg(SC::CONFLICT, "parent does not exist"),
                    Some(Code::AlreadyExists) => DavError::msg(
                        SC::METHOD_NOT_ALLOWED,
                        "The resource you tried to create already exists",
                    ),
                    Some(Code::PermissionDenied) => {
                        self.denied(gw, s, &parent, "permission denied to create").await
                    }
                    _ => e.into(),
                });
            }
        }
        debug!("handle_mkcol: created {}", target);

        let mut res = Response::new(Body::empty());
        *res.status_mut() = SC::CREATED;
        Ok(res)
    }
}
