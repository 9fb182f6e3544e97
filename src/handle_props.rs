use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::SystemTime;

use headers::HeaderMapExt;
use http::StatusCode as SC;
use http::{Request, Response};

use crate::body::Body;
use crate::davheaders::{self, Depth};
use crate::davpath;
use crate::errors::DavError;
use crate::gateway::{Code, GatewayClient, ResourceId, ResourceInfo, Session, User, UserId};
use crate::propfind::*;
use crate::router::{NamespaceKind, RouteContext};
use crate::util::systemtime_to_httpdate;
use crate::xmltree_ext::{NS_DAV_URI, NS_OWNCLOUD_URI};
use crate::DavResult;

// Largest PROPFIND or PROPPATCH body we accept.
const MAX_XML_BODY: usize = 1024 * 1024;

// Quota we cannot determine.
const QUOTA_UNKNOWN: &str = "-2";

const DIR_CONTENT_TYPE: &str = "httpd/unix-directory";

const FAVORITE_KEY: &str = "http://owncloud.org/ns/favorite";

// properties returned by PROPFIND <allprop/> or an empty body.
const ALLPROP_OC: &[&str] = &["id", "fileid", "spaceid", "file-parent", "name", "permissions"];

// list returned by PROPFIND <propname/>.
const PROPNAME_DAV: &[&str] = &[
    "getetag",
    "resourcetype",
    "getcontentlength",
    "getcontenttype",
    "getlastmodified",
    "displayname",
    "lockdiscovery",
    "quota-used-bytes",
    "quota-available-bytes",
];
const PROPNAME_OC: &[&str] = &[
    "id",
    "fileid",
    "spaceid",
    "file-parent",
    "name",
    "permissions",
    "size",
    "checksums",
    "favorite",
    "owner-id",
    "owner-display-name",
    "share-types",
    "privatelink",
];

/// Name of a listing entry.
pub(crate) fn entry_name(info: &ResourceInfo) -> String {
    if info.name.is_empty() {
        davpath::basename(&info.path).to_string()
    } else {
        info.name.clone()
    }
}

// oc:favorite and friends.
fn truthy(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn content_type(info: &ResourceInfo) -> String {
    if info.is_dir() {
        DIR_CONTENT_TYPE.to_string()
    } else if info.mime_type.is_empty() {
        davpath::mime_type(&entry_name(info)).to_string()
    } else {
        info.mime_type.clone()
    }
}

/// Flag string for `oc:permissions` and `OC-Perm`.
pub(crate) fn perm_flags(info: &ResourceInfo) -> String {
    let is_shared = info.opaque.contains_key("share-types");
    let is_mountpoint = info
        .space
        .as_ref()
        .map(|sp| sp.space_type == "mountpoint")
        .unwrap_or(false);
    info.permissions.webdav_flags(info.is_dir(), is_shared, is_mountpoint)
}

// Per-request state for rendering properties.
pub(crate) struct PropRenderer<'a> {
    pub req: &'a PropfindRequest,
    pub favorites: HashSet<ResourceId>,
    pub now: SystemTime,
}

impl PropRenderer<'_> {
    fn wants(&self, ns: &str, name: &str) -> bool {
        match self.req {
            PropfindRequest::Prop(names) => names.iter().any(|n| n.is(ns, name)),
            _ => false,
        }
    }

    fn is_favorite(&self, info: &ResourceInfo) -> bool {
        self.favorites.contains(&info.id)
            || info
                .arbitrary_metadata
                .get(FAVORITE_KEY)
                .map(|v| truthy(v))
                .unwrap_or(false)
    }
}

impl crate::DavInner {
    pub(crate) async fn handle_propfind(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let depth = match req.headers().typed_try_get::<Depth>() {
            Ok(Some(Depth::Infinity)) if !self.allow_propfind_depth_infinity => {
                return Err(DavError::msg(
                    SC::BAD_REQUEST,
                    "Depth: infinity is not supported",
                ));
            }
            Ok(Some(d)) => d,
            Ok(None) => Depth::One,
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "Invalid Depth header value")),
        };

        let xmldata = self.read_request(body, MAX_XML_BODY).await?;
        let pf = match parse_propfind(&xmldata) {
            Ok(pf) => pf,
            Err(e @ DavError::Message { .. }) => return Err(e),
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "error reading xml body")),
        };
        debug!("propfind: {:?} depth {:?} on {}", pf, depth, ctx.path);

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;
        let root = match gw.stat(s, &target).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
            }
            Err(e) => return Err(e.into()),
        };

        // collect the entries first, breadth first.
        let mut entries = vec![(ctx.path.clone(), root)];
        let mut queue = VecDeque::new();
        if entries[0].1.is_dir() && depth != Depth::Zero {
            queue.push_back((ctx.path.clone(), target));
        }
        while let Some((rel, r)) = queue.pop_front() {
            let children = match gw.list_container(s, &r).await {
                Ok(c) => c,
                Err(e) if rel != ctx.path => {
                    // a subtree we cannot read is left out.
                    warn!("propfind: skipping {}: {}", rel, e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            for child in children {
                let name = entry_name(&child);
                let crel = davpath::join(&rel, &name);
                if child.is_dir() && depth == Depth::Infinity {
                    queue.push_back((crel.clone(), r.child(&name)));
                }
                entries.push((crel, child));
            }
        }

        let minimal = req
            .headers()
            .typed_get::<davheaders::Prefer>()
            .map(|p| p.return_minimal())
            .unwrap_or(false);
        let renderer = PropRenderer {
            req: &pf,
            favorites: self.user_favorites(s).await,
            now: SystemTime::now(),
        };
        let mut ms = MultiStatus::new(minimal)?;
        for (rel, info) in &entries {
            let propstats = self.propstats(gw, ctx, &renderer, info).await;
            ms.response(&ctx.href(rel, info.is_dir()), propstats)?;
        }
        multistatus_response(ms.close()?, minimal)
    }

    // Ids the caller marked as favorite.
    pub(crate) async fn user_favorites(&self, s: &Session) -> HashSet<ResourceId> {
        let Some(user) = s.user_id() else {
            return HashSet::new();
        };
        match self.favorites.list_favorites(user).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!("could not list favorites: {}", e);
                HashSet::new()
            }
        }
    }

    // The owner of a resource, from the session, the cache or the gateway.
    async fn lookup_user(&self, gw: &dyn GatewayClient, s: &Session, id: &UserId) -> Option<User> {
        if let Some(ref u) = s.user {
            if u.id == *id {
                return Some(u.clone());
            }
        }
        if let Some(u) = self.users.get(id) {
            return Some(u);
        }
        match gw.get_user(s, id).await {
            Ok(u) => {
                self.users.insert(u.clone());
                Some(u)
            }
            Err(e) => {
                debug!("could not look up user {}: {}", id.opaque_id, e);
                None
            }
        }
    }

    /// Propstats of one entry.
    pub(crate) async fn propstats(
        &self,
        gw: &dyn GatewayClient,
        ctx: &RouteContext,
        r: &PropRenderer<'_>,
        info: &ResourceInfo,
    ) -> Vec<PropStat> {
        let names: Vec<PropName> = match r.req {
            PropfindRequest::Propname => {
                let props = PROPNAME_DAV
                    .iter()
                    .map(|n| PropName::dav(n))
                    .chain(PROPNAME_OC.iter().map(|n| PropName::oc(n)))
                    .map(PropValue::empty)
                    .collect();
                return vec![PropStat {
                    status: SC::OK,
                    props,
                }];
            }
            PropfindRequest::Allprop(include) => {
                let mut v = self.allprop_names(info);
                v.extend(include.iter().cloned());
                v
            }
            PropfindRequest::Prop(names) => names.clone(),
        };

        let owner = match info.owner {
            Some(ref id) if r.wants(NS_OWNCLOUD_URI, "owner-display-name") => {
                self.lookup_user(gw, &ctx.session, id).await
            }
            _ => None,
        };

        let mut set = PropStatSet::default();
        for name in names {
            match self.prop_value(ctx, r, info, owner.as_ref(), &name) {
                Some(v) => set.found(v),
                None => set.missing(name),
            }
        }
        set.into_propstats()
    }

    fn allprop_names(&self, info: &ResourceInfo) -> Vec<PropName> {
        let mut v: Vec<PropName> = ALLPROP_OC.iter().map(|n| PropName::oc(n)).collect();
        v.push(PropName::dav("getetag"));
        v.push(PropName::dav("resourcetype"));
        if info.is_dir() {
            v.push(PropName::oc("size"));
        } else {
            v.push(PropName::dav("getcontentlength"));
            v.push(PropName::dav("getcontenttype"));
        }
        if info.mtime.is_some() {
            v.push(PropName::dav("getlastmodified"));
        }
        if info.checksum.is_some() {
            v.push(PropName::oc("checksums"));
        }
        v.push(PropName::oc("favorite"));
        if info.lock.is_some() {
            v.push(PropName::dav("lockdiscovery"));
        }
        // dead properties.
        for key in info.arbitrary_metadata.keys() {
            if key == FAVORITE_KEY {
                continue;
            }
            if let Some((ns, name)) = key.rsplit_once('/') {
                v.push(PropName::new(ns, name));
            }
        }
        v
    }

    // None ends up in the 404 propstat.
    fn prop_value(
        &self,
        ctx: &RouteContext,
        r: &PropRenderer<'_>,
        info: &ResourceInfo,
        owner: Option<&User>,
        name: &PropName,
    ) -> Option<PropValue> {
        let is_dir = info.is_dir();
        let text = |v: String| Some(PropValue::text(name.clone(), v));

        if name.ns == NS_DAV_URI {
            return match name.name.as_str() {
                "getetag" => text(info.quoted_etag()),
                "resourcetype" if is_dir => Some(PropValue::children(
                    name.clone(),
                    vec![PropValue::empty(PropName::dav("collection"))],
                )),
                "resourcetype" => Some(PropValue::empty(name.clone())),
                "getcontentlength" if !is_dir => text(info.size.to_string()),
                "getcontenttype" => text(content_type(info)),
                "getlastmodified" => info.mtime.and_then(|t| text(systemtime_to_httpdate(t))),
                "displayname" => text(entry_name(info)),
                "quota-used-bytes" if is_dir => text(info.size.to_string()),
                "quota-available-bytes" if is_dir => text(QUOTA_UNKNOWN.to_string()),
                "lockdiscovery" => match info.lock {
                    Some(ref lock) => Some(lockdiscovery(lock, r.now)),
                    None => Some(PropValue::empty(name.clone())),
                },
                _ => self.dead_prop(info, name),
            };
        }

        if name.ns == NS_OWNCLOUD_URI {
            return match name.name.as_str() {
                "id" | "fileid" => text(info.id.to_string()),
                "spaceid" => text(info.id.storage_space_id()),
                "file-parent" => info.parent_id.as_ref().and_then(|p| text(p.to_string())),
                "name" => text(entry_name(info)),
                "permissions" => text(perm_flags(info)),
                "size" => text(info.size.to_string()),
                "checksums" => info.checksum.as_ref().map(|c| {
                    PropValue::children(
                        name.clone(),
                        vec![PropValue::text(
                            PropName::oc("checksum"),
                            format!("{}:{}", c.kind.to_uppercase(), c.sum),
                        )],
                    )
                }),
                "favorite" => {
                    let fav = if r.is_favorite(info) { "1" } else { "0" };
                    text(fav.to_string())
                }
                "owner-id" => match owner {
                    Some(u) => text(u.username.clone()),
                    None => info.owner.as_ref().and_then(|o| text(o.opaque_id.clone())),
                },
                "owner-display-name" => owner.and_then(|u| text(u.display_name.clone())),
                "share-types" => info.opaque.get("share-types").map(|st| {
                    let types = st
                        .split(',')
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| PropValue::text(PropName::oc("share-type"), t.trim()))
                        .collect();
                    PropValue::children(name.clone(), types)
                }),
                "privatelink" => text(format!("{}/f/{}", self.public_url, info.id)),
                "downloadURL" if !is_dir && is_public(ctx.kind) => {
                    let rel = if ctx.kind == NamespaceKind::PublicFile {
                        ctx.path.clone()
                    } else {
                        davpath::join(&ctx.path, &entry_name(info))
                    };
                    text(format!("{}{}", self.public_url, ctx.href(&rel, false)))
                }
                _ => self.dead_prop(info, name),
            };
        }

        self.dead_prop(info, name)
    }

    fn dead_prop(&self, info: &ResourceInfo, name: &PropName) -> Option<PropValue> {
        info.arbitrary_metadata
            .get(&name.metadata_key())
            .map(|v| PropValue::text(name.clone(), v.clone()))
    }

    pub(crate) async fn handle_proppatch(
        &self,
        ctx: &RouteContext,
        req: &Request<()>,
        body: Body,
    ) -> DavResult<Response<Body>> {
        let xmldata = self.read_request(body, MAX_XML_BODY).await?;
        let patches = match parse_proppatch(&xmldata) {
            Ok(p) => p,
            Err(e @ DavError::Message { .. }) => return Err(e),
            Err(_) => return Err(DavError::msg(SC::BAD_REQUEST, "error reading xml body")),
        };

        let gw = self.gw()?;
        let s = &ctx.session;
        let target = ctx.target(gw).await?;
        let info = match gw.stat(s, &target).await {
            Ok(info) => info,
            Err(e) if e.is(Code::NotFound) => {
                return Err(DavError::msg(SC::NOT_FOUND, "Resource not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let lock_id = req
            .headers()
            .typed_get::<davheaders::If>()
            .and_then(|i| i.lock_token());
        let lock_id = lock_id.as_deref();

        let mut accepted = Vec::new();
        let mut removed = Vec::new();
        for patch in patches {
            for prop in patch.props {
                let key = prop.name.metadata_key();
                let is_favorite = prop.name.is(NS_OWNCLOUD_URI, "favorite");
                // a favorite set to a falsy value is an unset.
                let remove = patch.remove || (is_favorite && !truthy(&prop.value()));
                trace!("proppatch: {} {}", if remove { "remove" } else { "set" }, key);

                let res = if remove {
                    gw.unset_arbitrary_metadata(s, &target, std::slice::from_ref(&key), lock_id)
                        .await
                } else {
                    let value = if is_favorite { "1".to_string() } else { prop.value() };
                    let md = BTreeMap::from([(key, value)]);
                    gw.set_arbitrary_metadata(s, &target, &md, lock_id).await
                };
                if let Err(e) = res {
                    return Err(match e.code() {
                        Some(Code::Aborted) => {
                            DavError::msg(SC::PRECONDITION_FAILED, "precondition failed")
                        }
                        Some(Code::PermissionDenied) => {
                            self.denied(gw, s, &target, "permission denied").await
                        }
                        _ => e.into(),
                    });
                }

                if is_favorite {
                    if let Some(user) = s.user_id() {
                        let r = if remove {
                            self.favorites.unset_favorite(user, &info).await
                        } else {
                            self.favorites.set_favorite(user, &info).await
                        };
                        if let Err(e) = r {
                            error!("proppatch: updating favorite failed: {}", e);
                            return Err(e.into());
                        }
                    }
                }

                let pv = PropValue::empty(prop.name);
                if patch.remove {
                    removed.push(pv);
                } else {
                    accepted.push(pv);
                }
            }
        }

        let mut ms = MultiStatus::new(false)?;
        let propstats = vec![
            PropStat {
                status: SC::OK,
                props: accepted,
            },
            PropStat {
                status: SC::NO_CONTENT,
                props: removed,
            },
        ];
        ms.response(&ctx.href(&ctx.path, info.is_dir()), propstats)?;
        multistatus_response(ms.close()?, false)
    }
}

fn is_public(kind: NamespaceKind) -> bool {
    matches!(kind, NamespaceKind::PublicFile | NamespaceKind::PublicFolder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Checksum, ResourceType};

    fn file() -> ResourceInfo {
        ResourceInfo {
            resource_type: ResourceType::File,
            id: ResourceId::new("st", "sp", "f1"),
            path: "/users/alice/notes.txt".to_string(),
            size: 12,
            etag: "abc".to_string(),
            checksum: Some(Checksum {
                kind: "sha1".to_string(),
                sum: "0a0b".to_string(),
            }),
            ..ResourceInfo::default()
        }
    }

    #[test]
    fn favorites_are_truthy() {
        for v in ["1", "true", "YES", " on "] {
            assert!(truthy(v), "{}", v);
        }
        for v in ["0", "false", "", "nope"] {
            assert!(!truthy(v), "{}", v);
        }
    }

    #[test]
    fn names_and_types() {
        let f = file();
        assert_eq!(entry_name(&f), "notes.txt");
        assert_eq!(content_type(&f), "text/plain");

        let dir = ResourceInfo {
            resource_type: ResourceType::Container,
            ..ResourceInfo::default()
        };
        assert_eq!(content_type(&dir), DIR_CONTENT_TYPE);
    }

    #[test]
    fn renderer_favorites() {
        let req = PropfindRequest::Prop(vec![PropName::oc("favorite")]);
        let mut f = file();
        let r = PropRenderer {
            req: &req,
            favorites: HashSet::new(),
            now: SystemTime::now(),
        };
        assert!(!r.is_favorite(&f));
        assert!(r.wants(NS_OWNCLOUD_URI, "favorite"));
        assert!(!r.wants(NS_OWNCLOUD_URI, "owner-display-name"));

        f.arbitrary_metadata
            .insert(FAVORITE_KEY.to_string(), "1".to_string());
        assert!(r.is_favorite(&f));
    }
}
