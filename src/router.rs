//
// Namespace routing.
//
// The request path is shifted segment by segment until we know which
// namespace it addresses. The result is a RouteContext that the
// method handlers work from.
//
use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::future::BoxFuture;
use http::{Request, Response, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::body::Body;
use crate::davpath::{self, encode_path, shift_path};
use crate::gateway::{
    Code, GatewayClient, PUBLIC_STORAGE_PROVIDER_ID, PUBLIC_STORAGE_SPACE_ID, Reference,
    ResourceId, Session,
};
use crate::spacelookup;
use crate::util::{DavMethod, DavMethodSet};
use crate::{DavError, DavInner, DavResult};

/// The kinds of namespace, each with its own set of handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum NamespaceKind {
    Files,
    Spaces,
    PublicFolder,
    PublicFile,
    TrashBin,
    Versions,
}

/// Where the paths of a namespace are rooted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Root {
    /// A prefix in the global path namespace.
    Path(String),
    /// A resource, usually a space root.
    Space(ResourceId),
}

/// Everything a handler needs to know about the request target.
#[derive(Debug, Clone)]
pub(crate) struct RouteContext {
    /// Url path that `path` is relative to, not encoded.
    pub base_uri: String,
    pub root: Root,
    pub kind: NamespaceKind,
    /// Path below the base, always starts with `/`.
    pub path: String,
    pub session: Session,
    pub cancel: CancellationToken,
}

impl RouteContext {
    /// Gateway reference for a path below the base.
    pub(crate) async fn resolve(&self, gw: &dyn GatewayClient, rel: &str) -> DavResult<Reference> {
        let rel = davpath::clean(&format!("/{}", rel));
        match self.root {
            Root::Path(ref ns) => {
                let p = davpath::join(ns, &rel);
                Ok(spacelookup::lookup_reference_for_path(gw, &self.session, &p).await?)
            }
            Root::Space(ref id) if self.kind == NamespaceKind::PublicFile => {
                // a file link only has the file itself.
                if rel.matches('/').count() > 1 {
                    return Err(DavError::msg(StatusCode::NOT_FOUND, "File not found"));
                }
                Ok(Reference::from_id(id.clone(), "."))
            }
            Root::Space(ref id) => Ok(space_reference(id, &rel)),
        }
    }

    /// Reference for the request target.
    pub(crate) async fn target(&self, gw: &dyn GatewayClient) -> DavResult<Reference> {
        self.resolve(gw, &self.path).await
    }

    /// Path as the client sees it, for messages.
    pub(crate) fn client_path(&self, rel: &str) -> String {
        davpath::join(&self.base_uri, rel)
    }

    /// Encoded href for a path below the base.
    pub(crate) fn href(&self, rel: &str, is_dir: bool) -> String {
        let mut h = encode_path(&davpath::join(&self.base_uri, rel));
        if is_dir && !h.ends_with('/') {
            h.push('/');
        }
        h
    }

    /// Path below the base for a url path from a `Destination` header.
    pub(crate) fn relative_to_base(&self, url_path: &str) -> Option<String> {
        let base = self.base_uri.trim_end_matches('/');
        let p = davpath::clean(url_path);
        if p == base {
            return Some("/".to_string());
        }
        p.strip_prefix(base)
            .filter(|rest| rest.starts_with('/'))
            .map(|rest| rest.to_string())
    }
}

pub(crate) fn space_reference(id: &ResourceId, rel: &str) -> Reference {
    let rel = davpath::clean(&format!("/{}", rel));
    if rel == "/" {
        Reference::from_id(id.clone(), ".")
    } else {
        Reference::from_id(id.clone(), format!(".{}", rel))
    }
}

/// Outcome of routing.
pub(crate) enum Routed {
    /// Answered by the router itself.
    Response(Response<Body>),
    Context(RouteContext),
}

/// Uniform handler signature.
pub(crate) type HandlerFn = for<'a> fn(
    &'a DavInner,
    &'a RouteContext,
    &'a Request<()>,
    Body,
) -> BoxFuture<'a, DavResult<Response<Body>>>;

pub(crate) struct HandlerTable {
    handlers: HashMap<(NamespaceKind, DavMethod), HandlerFn>,
}

macro_rules! handler {
    ($method:ident) => {{
        fn h<'a>(
            d: &'a DavInner,
            c: &'a RouteContext,
            r: &'a Request<()>,
            b: Body,
        ) -> BoxFuture<'a, DavResult<Response<Body>>> {
            Box::pin(d.$method(c, r, b))
        }
        h as HandlerFn
    }};
}

impl HandlerTable {
    pub(crate) fn new() -> HandlerTable {
        use DavMethod::*;
        use NamespaceKind::*;

        let mut t = HandlerTable {
            handlers: HashMap::new(),
        };
        for kind in [Files, Spaces, PublicFolder] {
            t.add(kind, Options, handler!(handle_options));
            t.add(kind, Get, handler!(handle_get));
            t.add(kind, Head, handler!(handle_get));
            t.add(kind, Put, handler!(handle_put));
            t.add(kind, Post, handler!(handle_tus));
            t.add(kind, Delete, handler!(handle_delete));
            t.add(kind, PropFind, handler!(handle_propfind));
            t.add(kind, PropPatch, handler!(handle_proppatch));
            t.add(kind, MkCol, handler!(handle_mkcol));
            t.add(kind, Copy, handler!(handle_copy));
            t.add(kind, Move, handler!(handle_move));
        }
        for kind in [Files, Spaces] {
            t.add(kind, Lock, handler!(handle_lock));
            t.add(kind, Unlock, handler!(handle_unlock));
            t.add(kind, Report, handler!(handle_report));
        }

        t.add(PublicFile, Options, handler!(handle_options));
        t.add(PublicFile, Get, handler!(handle_get));
        t.add(PublicFile, Head, handler!(handle_get));
        t.add(PublicFile, PropFind, handler!(handle_propfind));
        t.add(PublicFile, Put, handler!(handle_put));

        t.add(TrashBin, Options, handler!(handle_options));
        t.add(TrashBin, PropFind, handler!(handle_trashbin_propfind));
        t.add(TrashBin, Move, handler!(handle_trashbin_restore));
        t.add(TrashBin, Delete, handler!(handle_trashbin_delete));

        t.add(Versions, Options, handler!(handle_options));
        t.add(Versions, PropFind, handler!(handle_versions_propfind));
        t.add(Versions, Copy, handler!(handle_versions_restore));
        t
    }

    fn add(&mut self, kind: NamespaceKind, method: DavMethod, h: HandlerFn) {
        self.handlers.insert((kind, method), h);
    }

    pub(crate) fn get(&self, kind: NamespaceKind, method: DavMethod) -> Option<HandlerFn> {
        self.handlers.get(&(kind, method)).copied()
    }

    /// Methods a namespace kind answers to.
    pub(crate) fn allowed(&self, kind: NamespaceKind) -> DavMethodSet {
        self.handlers
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, m)| *m)
            .collect()
    }
}

/// The `status.php` document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusInfo {
    pub installed: bool,
    pub maintenance: bool,
    #[serde(rename = "needsDbUpgrade")]
    pub needs_db_upgrade: bool,
    pub version: String,
    pub versionstring: String,
    pub edition: String,
    pub productname: String,
    pub product: String,
    pub productversion: String,
}

impl Default for StatusInfo {
    fn default() -> Self {
        StatusInfo {
            installed: true,
            maintenance: false,
            needs_db_upgrade: false,
            version: "10.0.11.5".to_string(),
            versionstring: "10.0.11".to_string(),
            edition: "community".to_string(),
            productname: "reva".to_string(),
            product: "reva".to_string(),
            productversion: "10.0.11".to_string(),
        }
    }
}

fn redirect(location: &str) -> DavResult<Response<Body>> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("Location", location)
        .body(Body::empty())
        .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn query_param(req: &Request<()>, key: &str) -> Option<String> {
    let q = req.uri().query()?;
    url::form_urlencoded::parse(q.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// password from "Authorization: Basic ...".
fn basic_auth_password(req: &Request<()>) -> Option<String> {
    let h = req.headers().get(http::header::AUTHORIZATION)?.to_str().ok()?;
    let enc = h.strip_prefix("Basic ").or_else(|| h.strip_prefix("basic "))?;
    let dec = STANDARD.decode(enc.trim()).ok()?;
    let dec = String::from_utf8(dec).ok()?;
    dec.split_once(':').map(|(_, pw)| pw.to_string())
}

impl DavInner {
    fn expand_namespace(&self, template: &str, s: &Session) -> String {
        let (username, id) = match s.user {
            Some(ref u) => (u.username.as_str(), u.id.opaque_id.as_str()),
            None => ("", ""),
        };
        davpath::clean(
            &template
                .replace("{username}", username)
                .replace("{id}", id)
                .replace("{{.Username}}", username),
        )
    }

    pub(crate) async fn route(
        &self,
        req: &Request<()>,
        method: DavMethod,
        path: &str,
        session: Session,
        cancel: CancellationToken,
    ) -> DavResult<Routed> {
        let mut base = davpath::clean(&format!("/{}", self.prefix));
        let (mut head, mut tail) = shift_path(path);
        debug!("routing head {} tail {}", head, tail);

        match head.as_str() {
            "status.php" | "status" => return self.status_response().map(Routed::Response),
            "remote.php" => {
                (head, tail) = shift_path(&tail);
                base = davpath::join(&base, "remote.php");
            }
            "apps" => {
                let (h, _) = shift_path(&tail);
                if h == "files" {
                    let dir = query_param(req, "dir").unwrap_or_else(|| "/".to_string());
                    let loc = format!("{}/#/files/list/all{}", self.public_url, dir);
                    return redirect(&loc).map(Routed::Response);
                }
                return Err(DavError::Status(StatusCode::NOT_FOUND));
            }
            "index.php" => {
                let (h, token) = shift_path(&tail);
                if h == "s" {
                    let loc = format!("{}{}", self.public_url, davpath::join("/s", &token));
                    return redirect(&loc).map(Routed::Response);
                }
                return Err(DavError::Status(StatusCode::NOT_FOUND));
            }
            _ => {}
        }

        let ctx = |base_uri: String, root: Root, kind: NamespaceKind, path: String, session: Session| {
            RouteContext {
                base_uri,
                root,
                kind,
                path,
                session,
                cancel: cancel.clone(),
            }
        };

        match head.as_str() {
            "webdav" => {
                self.require_user(&session, method)?;
                let ns = self.expand_namespace(&self.webdav_namespace, &session);
                let base = davpath::join(&base, "webdav");
                Ok(Routed::Context(ctx(base, Root::Path(ns), NamespaceKind::Files, tail, session)))
            }
            "dav" => {
                let base = davpath::join(&base, "dav");
                self.route_dav(req, method, base, &tail, session, &ctx)
                    .await
            }
            _ => {
                warn!("resource not found: {}", path);
                Err(DavError::Status(StatusCode::NOT_FOUND))
            }
        }
    }

    async fn route_dav<F>(
        &self,
        req: &Request<()>,
        method: DavMethod,
        base: String,
        path: &str,
        session: Session,
        ctx: &F,
    ) -> DavResult<Routed>
    where
        F: Fn(String, Root, NamespaceKind, String, Session) -> RouteContext,
    {
        let (head, tail) = shift_path(path);
        match head.as_str() {
            "files" => {
                if tail == "/" && !req.headers().contains_key(&crate::davheaders::DEPTH) {
                    return Err(DavError::msg(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "Listing members of this collection is disabled",
                    ));
                }
                self.require_user(&session, method)?;
                let base = davpath::join(&base, "files");
                let (segment, rest) = shift_path(&tail);
                let is_owner = match session.user {
                    Some(ref u) => {
                        !segment.is_empty()
                            && (segment == u.id.opaque_id
                                || segment.to_lowercase() == u.username.to_lowercase())
                    }
                    None => false,
                };
                if is_owner {
                    let ns = self.expand_namespace(&self.files_namespace, &session);
                    let base = davpath::join(&base, &segment);
                    Ok(Routed::Context(ctx(base, Root::Path(ns), NamespaceKind::Files, rest, session)))
                } else {
                    let root = Root::Path("/".to_string());
                    Ok(Routed::Context(ctx(base, root, NamespaceKind::Files, tail, session)))
                }
            }
            "meta" => {
                self.require_user(&session, method)?;
                let (file_id, rest) = shift_path(&tail);
                let id = ResourceId::parse(&file_id)
                    .filter(|id| !id.opaque_id.is_empty())
                    .ok_or_else(|| DavError::msg(StatusCode::BAD_REQUEST, "invalid resource id"))?;
                let (v, _) = shift_path(&rest);
                if v != "v" {
                    return Err(DavError::msg(StatusCode::NOT_FOUND, "File not found in root"));
                }
                let base = davpath::join(&base, &format!("meta/{}", file_id));
                Ok(Routed::Context(ctx(base, Root::Space(id), NamespaceKind::Versions, rest, session)))
            }
            "trash-bin" => {
                let (username, rest) = shift_path(&tail);
                if username.is_empty() {
                    return Err(DavError::Status(StatusCode::METHOD_NOT_ALLOWED));
                }
                self.require_user(&session, method)?;
                if username != session.username() {
                    return Err(DavError::msg(StatusCode::NOT_FOUND, "not found"));
                }
                let ns = self.expand_namespace(&self.files_namespace, &session);
                let base = davpath::join(&base, &format!("trash-bin/{}", username));
                Ok(Routed::Context(ctx(base, Root::Path(ns), NamespaceKind::TrashBin, rest, session)))
            }
            "spaces" => {
                self.require_user(&session, method)?;
                let (space_id, rest) = shift_path(&tail);
                let mut id = ResourceId::parse(&space_id)
                    .ok_or_else(|| DavError::msg(StatusCode::BAD_REQUEST, "invalid space id"))?;
                if id.opaque_id.is_empty() {
                    id.opaque_id = id.space_id.clone();
                }
                let base = davpath::join(&base, &format!("spaces/{}", space_id));
                Ok(Routed::Context(ctx(base, Root::Space(id), NamespaceKind::Spaces, rest, session)))
            }
            "public-files" => {
                let (token, rest) = shift_path(&tail);
                if token.is_empty() {
                    return Err(DavError::msg(StatusCode::NOT_FOUND, "File not found in root"));
                }
                let session = self.public_auth(req, method, &token).await?;
                let gw = self.gw()?;
                let root = ResourceId::new(PUBLIC_STORAGE_PROVIDER_ID, PUBLIC_STORAGE_SPACE_ID, &token);
                let info = match gw.stat(&session, &Reference::from_id(root.clone(), ".")).await {
                    Ok(info) => info,
                    Err(e) => {
                        return Err(match e.code() {
                            Some(Code::PermissionDenied) | Some(Code::NotFound) => {
                                DavError::msg(StatusCode::NOT_FOUND, "link target not found")
                            }
                            Some(Code::Unauthenticated) => DavError::Status(StatusCode::UNAUTHORIZED),
                            _ => DavError::msg(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        });
                    }
                };
                let kind = if info.is_dir() {
                    NamespaceKind::PublicFolder
                } else {
                    NamespaceKind::PublicFile
                };
                let base = davpath::join(&base, &format!("public-files/{}", token));
                Ok(Routed::Context(ctx(base, Root::Space(root), kind, rest, session)))
            }
            _ => Err(DavError::msg(StatusCode::NOT_FOUND, "File not found in root")),
        }
    }

    // Anonymous callers only get OPTIONS outside of public links.
    fn require_user(&self, s: &Session, method: DavMethod) -> DavResult<()> {
        if s.user.is_none() && method != DavMethod::Options {
            debug!("refusing anonymous {} request", method.as_str());
            return Err(DavError::msg(StatusCode::UNAUTHORIZED, "Unauthenticated"));
        }
        Ok(())
    }

    // Authenticate against a public link. The resulting session replaces
    // the one of the caller.
    async fn public_auth(
        &self,
        req: &Request<()>,
        method: DavMethod,
        token: &str,
    ) -> DavResult<Session> {
        let password = basic_auth_password(req);
        let signature = query_param(req, "signature");
        let expiration = query_param(req, "expiration");

        let (secret, basic) = match (password, signature, expiration) {
            (Some(pw), _, _) => (format!("password|{}", pw), true),
            (None, Some(sig), Some(exp)) => {
                if method != DavMethod::Get && method != DavMethod::Head {
                    return Err(DavError::msg(
                        StatusCode::UNAUTHORIZED,
                        "signed urls are only valid for GET and HEAD",
                    ));
                }
                (format!("signature|{}|{}", sig, exp), false)
            }
            _ => ("password|".to_string(), false),
        };

        let gw = self.gw()?;
        match gw.authenticate("publicshares", token, &secret).await {
            Ok(res) => Ok(Session::new(res.user, res.token)),
            Err(e) => Err(match e.code() {
                None => {
                    error!("public link authentication failed: {}", e);
                    DavError::msg(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                }
                Some(Code::PermissionDenied) | Some(Code::Unauthenticated) => {
                    let msg = if basic {
                        "Username or password was incorrect"
                    } else {
                        "No 'Authorization: Basic' header found"
                    };
                    DavError::msg(StatusCode::UNAUTHORIZED, msg)
                }
                Some(Code::NotFound) => DavError::msg(StatusCode::NOT_FOUND, "link not found"),
                Some(_) => DavError::msg(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }),
        }
    }

    fn status_response(&self) -> DavResult<Response<Body>> {
        let body = serde_json::to_vec(&self.status)
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))?;
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .map_err(|_| DavError::Status(StatusCode::INTERNAL_SERVER_ERROR))
    }
}
