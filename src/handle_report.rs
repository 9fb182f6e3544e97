use std::time::SystemTime;

use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::{Code, GatewayClient, Reference, ResourceInfo};
use crate::handle_props::{PropRenderer, entry_name};
use crate::propfind::{MultiStatus, Report, multistatus_response, parse_report};
use crate::router::{Root, RouteContext};
use crate::DavResult;

impl crate::DavInner {
    pub(crate) async fn handle_report(
        &self,
        ctx: &RouteContext,
        _req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let xmldata = self.read_request(body, 65536).await?;
        let report = match parse_report(&xmldata) {
            Ok(r) => r,
            Err(e @ DavError::Message { .. }) => return Err(e),
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "error reading xml body")),
        };

        let (props, favorites) = match report {
            Report::SearchFiles => {
                return Err(DavError::msg(SC::NOT_IMPLEMENTED, "search is not supported"));
            }
            Report::FilterFiles { props, favorites } => (props, favorites),
        };

        let gw = self.gw()?;
        let s = &ctx.session;
        let mut ms = MultiStatus::new(false)?;
        if favorites {
            let renderer = PropRenderer {
                req: &props,
                favorites: self.user_favorites(s).await,
                now: SystemTime::now(),
            };
            let mut ids: Vec<_> = renderer.favorites.iter().cloned().collect();
            ids.sort();
            for id in ids {
                let info = match gw.stat(s, &Reference::from_id(id, ".")).await {
                    Ok(info) => info,
                    // gone, or no longer shared with us.
                    Err(e) if e.is(Code::NotFound) || e.is(Code::PermissionDenied) => continue,
                    Err(e) => return Err(e.into()),
                };
                let rel = self.favorite_rel(gw, ctx, &info).await;
                let propstats = self.propstats(gw, ctx, &renderer, &info).await;
                ms.response(&ctx.href(&rel, info.is_dir()), propstats)?;
            }
        }
        multistatus_response(ms.close()?, false)
    }

    // Path of a favorite below the base of the request.
    async fn favorite_rel(
        &self,
        gw: &dyn GatewayClient,
        ctx: &RouteContext,
        info: &ResourceInfo,
    ) -> String {
        let fallback = format!("/{}", entry_name(info));
        let Root::Path(ref ns) = ctx.root else {
            return fallback;
        };
        let path = if info.path.starts_with('/') {
            info.path.clone()
        } else {
            match gw.get_path(&ctx.session, &info.id).await {
                Ok(p) => p,
                Err(e) => {
                    debug!("report: no path for {}: {}", info.id, e);
                    return fallback;
                }
            }
        };
        if davpath::is_subpath(ns, &path) {
            let rest = &path[ns.trim_end_matches('/').len()..];
            davpath::clean(&format!("/{}", rest))
        } else {
            fallback
        }
    }
}
