use std::time::SystemTime;

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davheaders::Depth;
use crate::davpath::{self, shift_path};
use crate::errors::DavError;
use crate::gateway::{Code, FileVersion, Reference, ResourceId, ResourceInfo, ResourceType};
use crate::handle_props::PropRenderer;
use crate::propfind::{MultiStatus, multistatus_response, parse_propfind};
use crate::router::{Root, RouteContext};
use crate::DavResult;

// The file the versions belong to.
fn file_id(ctx: &RouteContext) -> DavResult<ResourceId> {
    match ctx.root {
        Root::Space(ref id) => Ok(id.clone()),
        Root::Path(_) => Err(DavError::Status(SC::INTERNAL_SERVER_ERROR)),
    }
}

// `/v/{key}` -> key.
fn version_key(ctx: &RouteContext) -> String {
    let (_, rest) = shift_path(&ctx.path);
    rest.trim_matches('/').to_string()
}

// A version looks like a file with id `{fileid}@{key}`.
fn version_info(file: &ResourceInfo, v: &FileVersion) -> ResourceInfo {
    let mut id = file.id.clone();
    id.opaque_id = format!("{}@{}", id.opaque_id, v.key);
    ResourceInfo {
        resource_type: ResourceType::File,
        id,
        parent_id: Some(file.id.clone()),
        name: v.key.clone(),
        size: v.size,
        etag: v.etag.clone(),
        mime_type: file.mime_type.clone(),
        mtime: Some(v.mtime),
        owner: file.owner.clone(),
        permissions: file.permissions,
        ..ResourceInfo::default()
    }
}

impl crate::DavInner {
    pub(crate) async fn handle_versions_propfind(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let depth = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(d)) => d,
            Ok(None) => Depth::One,
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "Invalid Depth header value")),
        };
        let xmldata = self.read_request(body, 65536).await?;
        let pf = match parse_propfind(&xmldata) {
            Ok(pf) => pf,
            Err(e @ DavError::Message { .. }) => return Err(e),
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "error reading xml body")),
        };

        let gw = self.gw()?;
        let s = &ctx.session;
        let r = Reference::from_id(file_id(ctx)?, ".");
        let file = match gw.stat(s, &r).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let key = version_key(ctx);
        let wants_list = key.is_empty() && depth != Depth::Zero;
        let versions = if wants_list || !key.is_empty() {
            gw.list_file_versions(s, &r).await?
        } else {
            Vec::new()
        };

        let renderer = PropRenderer {
            req: &pf,
            favorites: Default::default(),
            now: SystemTime::now(),
        };
        let mut ms = MultiStatus::new(false)?;

        if key.is_empty() {
            let coll = ResourceInfo {
                resource_type: ResourceType::Container,
                id: file.id.clone(),
                name: "v".to_string(),
                etag: file.etag.clone(),
                mtime: file.mtime,
                permissions: file.permissions,
                ..ResourceInfo::default()
            };
            let propstats = self.propstats(gw, ctx, &renderer, &coll).await;
            ms.response(&ctx.href("/v", true), propstats)?;
            for v in &versions {
                let info = version_info(&file, v);
                let propstats = self.propstats(gw, ctx, &renderer, &info).await;
                let rel = davpath::join("/v", &v.key);
                ms.response(&ctx.href(&rel, false), propstats)?;
            }
        } else {
            let v = versions
                .iter()
                .find(|v| v.key == key)
                .ok_or_else(|| DavError::msg(SC::NOT_FOUND, "Version not found"))?;
            let info = version_info(&file, v);
            let propstats = self.propstats(gw, ctx, &renderer, &info).await;
            ms.response(&ctx.href(&ctx.path, false), propstats)?;
        }
        multistatus_response(ms.close()?, false)
    }

    // COPY of a version restores it.
    pub(crate) async fn handle_versions_restore(
        &self,
        ctx: &RouteContext,
        _req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        let key = version_key(ctx);
        if key.is_empty() {
            return Err(DavError::msg(SC::BAD_REQUEST, "missing version key"));
        }
        let gw = self.gw()?;
        let r = Reference::from_id(file_id(ctx)?, ".");
        match gw.restore_file_version(&ctx.session, &r, &key).await {
            Ok(()) => {}
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Version not found"));
            }
            Err(e) if e.is(Code::PermissionDenied) => {
                return Err(self.denied(gw, &ctx.session, &r, "permission denied").await);
            }
            Err(e) => return Err(e.into()),
        }
        debug!("versions: restored {} of {}", key, r);
        let mut res = Response::new(Body::empty());
        *res.status_mut() = SC::NO_CONTENT;
        Ok(res)
    }
}
