//
// The trash bin of the caller, below /dav/trash-bin/{username}.
//
// Items are addressed by their recycle key. Nested items of a deleted
// folder have keys of the form `{key}/{path below the folder}`.
//

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davheaders::{self, Depth};
use crate::davpath::{self, normalize_path};
use crate::errors::DavError;
use crate::gateway::{Code, RecycleItem, Reference, ResourceType};
use crate::propfind::*;
use crate::router::RouteContext;
use crate::util::{systemtime_to_httpdate, systemtime_to_unix};
use crate::DavResult;

// Properties a trash root cannot have.
const ROOT_MISSING: &[(&str, &str)] = &[
    ("oc", "trashbin-original-filename"),
    ("oc", "trashbin-original-location"),
    ("oc", "trashbin-delete-datetime"),
    ("d", "getcontentlength"),
];

fn name(pfx: &str, local: &str) -> PropName {
    if pfx == "d" {
        PropName::dav(local)
    } else {
        PropName::oc(local)
    }
}

fn recycle_key(ctx: &RouteContext) -> String {
    ctx.path.trim_matches('/').to_string()
}

// All properties of a trashed item.
fn item_props(item: &RecycleItem, space_id: &str) -> Vec<PropValue> {
    let is_dir = item.resource_type == ResourceType::Container;
    let location = item.original_path.trim_start_matches('/');
    let mut v = vec![
        PropValue::text(
            PropName::oc("trashbin-original-filename"),
            davpath::basename(location),
        ),
        PropValue::text(PropName::oc("trashbin-original-location"), location),
        PropValue::text(
            PropName::oc("trashbin-delete-timestamp"),
            systemtime_to_unix(item.deletion_time).to_string(),
        ),
        PropValue::text(
            PropName::oc("trashbin-delete-datetime"),
            systemtime_to_httpdate(item.deletion_time),
        ),
        PropValue::text(PropName::oc("spaceid"), space_id),
    ];
    if is_dir {
        v.push(PropValue::children(
            PropName::dav("resourcetype"),
            vec![PropValue::empty(PropName::dav("collection"))],
        ));
        v.push(PropValue::text(PropName::oc("size"), item.size.to_string()));
    } else {
        v.push(PropValue::empty(PropName::dav("resourcetype")));
        v.push(PropValue::text(
            PropName::dav("getcontentlength"),
            item.size.to_string(),
        ));
        v.push(PropValue::text(
            PropName::dav("getcontenttype"),
            davpath::mime_type(location),
        ));
    }
    v
}

// Keep what was asked for, the rest of the request is a 404.
fn select(req: &PropfindRequest, all: Vec<PropValue>) -> Vec<PropStat> {
    let mut set = PropStatSet::default();
    match req {
        PropfindRequest::Prop(names) => {
            for n in names {
                match all.iter().find(|p| p.name == *n) {
                    Some(p) => set.found(p.clone()),
                    None => set.missing(n.clone()),
                }
            }
        }
        PropfindRequest::Propname => {
            all.into_iter()
                .for_each(|p| set.found(PropValue::empty(p.name)));
        }
        PropfindRequest::Allprop(_) => all.into_iter().for_each(|p| set.found(p)),
    }
    set.into_propstats()
}

impl crate::DavInner {
    pub(crate) async fn handle_trashbin_propfind(
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
        let home = ctx.resolve(gw, "/").await?;
        let space_id = home
            .resource_id
            .as_ref()
            .map(|id| id.storage_space_id())
            .unwrap_or_default();

        // a depth first walk, with the siblings in reverse order.
        let key = recycle_key(ctx);
        let mut items = Vec::new();
        if depth != Depth::Zero {
            let mut stack = vec![key.clone()];
            while let Some(k) = stack.pop() {
                let level = match gw.list_recycle(s, &home, &k).await {
                    Ok(level) => level,
                    Err(e) if e.is(Code::NotFound) && k == key => {
                        return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
                    }
                    Err(e) => return Err(e.into()),
                };
                if depth == Depth::Infinity {
                    for item in level.iter().rev() {
                        if item.resource_type == ResourceType::Container {
                            stack.push(item.key.clone());
                        }
                    }
                }
                items.extend(level);
            }
        }
        debug!("trashbin: {} items below '{}'", items.len(), key);

        let mut ms = MultiStatus::new(false)?;

        // the trash root itself.
        let mut root = PropStatSet::default();
        root.found(PropValue::children(
            PropName::dav("resourcetype"),
            vec![PropValue::empty(PropName::dav("collection"))],
        ));
        for (pfx, local) in ROOT_MISSING {
            root.missing(name(pfx, local));
        }
        ms.response(&ctx.href(&ctx.path, true), root.into_propstats())?;

        for item in &items {
            let is_dir = item.resource_type == ResourceType::Container;
            let href = ctx.href(&format!("/{}", item.key), is_dir);
            ms.response(&href, select(&pf, item_props(item, &space_id)))?;
        }
        multistatus_response(ms.close()?, false)
    }

    // MOVE out of the trash.
    pub(crate) async fn handle_trashbin_restore(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        let key = recycle_key(ctx);
        if key.is_empty() {
            return Err(DavError::msg(
                SC::NOT_IMPLEMENTED,
                "restoring the whole trash bin is not supported",
            ));
        }

        // the destination lives in the files namespace of the same user.
        let username = davpath::basename(&ctx.base_uri);
        let dav_base = davpath::dirname(&davpath::dirname(&ctx.base_uri));
        let files_base = davpath::join(&dav_base, &format!("files/{}", username));
        let dest = req
            .headers()
            .typed_try_get::<davheaders::Destination>()
            .ok()
            .flatten()
            .ok_or_else(|| DavError::msg(SC::BAD_REQUEST, "failed to extract destination"))?;
        let dest_path = normalize_path(&dest.path)
            .map_err(|_| DavError::msg(SC::BAD_REQUEST, "failed to extract destination"))?;
        let rel = match dest_path.strip_prefix(&files_base) {
            Some("") => "/".to_string(),
            Some(r) if r.starts_with('/') => r.to_string(),
            _ => {
                return Err(DavError::msg(
                    SC::BAD_REQUEST,
                    "destination must be in the files namespace",
                ));
            }
        };
        let overwrite = match req.headers().typed_try_get::<davheaders::Overwrite>() {
            Ok(o) => o.map(|o| o.0).unwrap_or(true),
            Err(_) => {
                return Err(DavError::msg(SC::BAD_REQUEST, "Overwrite header is set to incorrect value"));
            }
        };

        let gw = self.gw()?;
        let s = &ctx.session;
        let home = ctx.resolve(gw, "/").await?;
        let dst = ctx.resolve(gw, &rel).await?;

        let success = match gw.stat(s, &dst).await {
            Ok(_) => {
                if !overwrite {
                    warn!("trashbin: restore target {} exists", rel);
                    return Err(DavError::msg(SC::PRECONDITION_FAILED, "Destination already exists"));
                }
                match gw.delete(s, &dst, None).await {
                    Ok(()) => {}
                    Err(e) if e.is(Code::PermissionDenied) => {
                        return Err(DavError::msg(SC::FORBIDDEN, "Permission denied to delete"));
                    }
                    Err(e) => return Err(e.into()),
                }
                SC::NO_CONTENT
            }
            Err(e) if e.is(Code::NotFound) => {
                if davpath::dirname(&rel) != "/" {
                    match gw.stat(s, &dst.parent()).await {
                        Ok(_) => {}
                        Err(e) if e.is(Code::NotFound) => {
                            return Err(DavError::msg(SC::CONFLICT, "parent does not exist"));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                SC::CREATED
            }
            Err(e) => return Err(e.into()),
        };

        match gw.restore_recycle_item(s, &home, &key, &dst).await {
            Ok(()) => {}
            Err(e) if e.is(Code::PermissionDenied) => {
                return Err(DavError::msg(SC::FORBIDDEN, "Permission denied to restore"));
            }
            Err(e) => return Err(e.into()),
        }
        debug!("trashbin: restored {} to {}", key, dst);

        let mut res = Response::new(Body::empty());
        if let Ok(info) = gw.stat(s, &dst).await {
            davheaders::insert_info_headers(res.headers_mut(), &info);
        }
        *res.status_mut() = success;
        Ok(res)
    }

    // DELETE in the trash purges.
    pub(crate) async fn handle_trashbin_delete(
        &self,
        ctx: &RouteContext,
        _req: &Request<()>,
        _body: Body,
    ) -> DavResult<Response<Body>> {
        let key = recycle_key(ctx);
        let gw = self.gw()?;
        let home: Reference = ctx.resolve(gw, "/").await?;
        match gw.purge_recycle(&ctx.session, &home, &key).await {
            Ok(()) => {
                let mut res = Response::new(Body::empty());
                *res.status_mut() = SC::NO_CONTENT;
                Ok(res)
            }
            Err(e) if e.is(Code::NotFound) => {
                Err(DavError::msg(SC::CONFLICT, format!("path {} not found", key)))
            }
            Err(e) if e.is(Code::PermissionDenied) => {
                let msg = if key.is_empty() {
                    "Permission denied to purge recycle"
                } else {
                    "Permission denied to delete"
                };
                Err(DavError::msg(SC::FORBIDDEN, msg))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::unix_to_systemtime;

    fn item(key: &str, dir: bool) -> RecycleItem {
        RecycleItem {
            key: key.to_string(),
            original_path: "/docs/report.pdf".to_string(),
            deletion_time: unix_to_systemtime(1_600_000_000),
            size: 7,
            resource_type: if dir {
                ResourceType::Container
            } else {
                ResourceType::File
            },
        }
    }

    #[test]
    fn props_of_items() {
        let props = item_props(&item("k1", false), "sp");
        let get = |n: &str| props.iter().find(|p| p.name.name == n).map(|p| p.value());
        assert_eq!(get("trashbin-original-filename").as_deref(), Some("report.pdf"));
        assert_eq!(get("trashbin-original-location").as_deref(), Some("docs/report.pdf"));
        assert_eq!(get("trashbin-delete-timestamp").as_deref(), Some("1600000000"));
        assert_eq!(get("getcontenttype").as_deref(), Some("application/pdf"));
        assert!(get("size").is_none());

        let props = item_props(&item("k2", true), "sp");
        assert!(props.iter().any(|p| p.name.is(crate::xmltree_ext::NS_OWNCLOUD_URI, "size")));
    }

    #[test]
    fn selection() {
        let req = PropfindRequest::Prop(vec![
            PropName::oc("trashbin-original-location"),
            PropName::oc("nope"),
        ]);
        let ps = select(&req, item_props(&item("k1", false), "sp"));
        assert_eq!(ps[0].props.len(), 1);
        assert_eq!(ps[1].props, vec![PropValue::empty(PropName::oc("nope"))]);
    }
}
