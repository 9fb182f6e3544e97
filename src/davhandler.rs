//
// This module contains the main entry point of the library,
// DavHandler.
//
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use futures_util::StreamExt;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body::Body as HttpBody;
use tokio_util::sync::CancellationToken;

use crate::body::Body;
use crate::cache::{DEFAULT_TTL, IdentifierCache};
use crate::davpath::normalize_path;
use crate::errors::{DavError, error_body};
use crate::favorites::{FavoritesManager, MemFavorites};
use crate::gateway::{GatewayClient, Reference, Session};
use crate::pool::{ClientSelector, GatewayPool};
use crate::router::{HandlerTable, Routed, StatusInfo};
use crate::transfer::{DataClient, HttpDataClient};
use crate::util::{NameValidation, dav_method};
use crate::DavResult;

const DEFAULT_NAMESPACE: &str = "/users/{username}";

/// WebDAV request handler.
///
/// The [`new`](Self::new) and [`builder`](Self::builder) methods are used to instantiate a handler.
///
/// The [`handle`](Self::handle) and [`handle_as`](Self::handle_as) methods do the actual work.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) inner: Arc<DavInner>,
}

/// Configuration of the handler.
#[derive(Clone, Default)]
pub struct DavConfig {
    // Prefix to be stripped off when handling request.
    pub(crate) prefix: Option<String>,
    // Gateway clients.
    pub(crate) gateway: Option<Arc<dyn ClientSelector>>,
    // Moves bytes to and from data endpoints.
    pub(crate) data_client: Option<Box<dyn DataClient>>,
    pub(crate) favorites: Option<Box<dyn FavoritesManager>>,
    // Namespace template for /dav/files/{user}.
    pub(crate) files_namespace: Option<String>,
    // Namespace template for /webdav.
    pub(crate) webdav_namespace: Option<String>,
    pub(crate) public_url: Option<String>,
    pub(crate) machine_auth_api_key: Option<String>,
    pub(crate) enable_http_tpc: Option<bool>,
    pub(crate) perf_marker_interval: Option<Duration>,
    pub(crate) allow_propfind_depth_infinity: Option<bool>,
    pub(crate) name_validation: Option<NameValidation>,
    pub(crate) status: Option<StatusInfo>,
    pub(crate) user_cache_ttl: Option<Duration>,
}

impl std::fmt::Debug for DavConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DavConfig")
            .field("prefix", &self.prefix)
            .field("files_namespace", &self.files_namespace)
            .field("webdav_namespace", &self.webdav_namespace)
            .field("public_url", &self.public_url)
            .field("enable_http_tpc", &self.enable_http_tpc)
            .finish_non_exhaustive()
    }
}

impl DavConfig {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the configuration that was built to generate a [`DavHandler`].
    pub fn build_handler(self) -> DavHandler {
        DavHandler {
            inner: Arc::new(DavInner::new(self)),
        }
    }

    /// Prefix to be stripped off before routing.
    pub fn strip_prefix(self, prefix: impl Into<String>) -> Self {
        let mut this = self;
        this.prefix = Some(prefix.into());
        this
    }

    /// Set the gateway clients to use.
    pub fn gateway(self, pool: GatewayPool) -> Self {
        let mut this = self;
        this.gateway = Some(Arc::new(pool));
        this
    }

    /// Use a custom client selector instead of a [`GatewayPool`].
    pub fn gateway_selector(self, selector: Arc<dyn ClientSelector>) -> Self {
        let mut this = self;
        this.gateway = Some(selector);
        this
    }

    /// Set the data plane client (default is [`HttpDataClient`]).
    pub fn data_client(self, client: Box<dyn DataClient>) -> Self {
        let mut this = self;
        this.data_client = Some(client);
        this
    }

    /// Set the favorites backend (default is in-memory).
    pub fn favorites(self, favorites: Box<dyn FavoritesManager>) -> Self {
        let mut this = self;
        this.favorites = Some(favorites);
        this
    }

    /// Namespace for `/dav/files/{user}`. `{username}` and `{id}` are
    /// replaced with the caller's username and user id.
    pub fn files_namespace(self, ns: impl Into<String>) -> Self {
        let mut this = self;
        this.files_namespace = Some(ns.into());
        this
    }

    /// Namespace for the legacy `/webdav` endpoint.
    pub fn webdav_namespace(self, ns: impl Into<String>) -> Self {
        let mut this = self;
        this.webdav_namespace = Some(ns.into());
        this
    }

    /// Public url of the service, used for links and redirects.
    pub fn public_url(self, url: impl Into<String>) -> Self {
        let mut this = self;
        this.public_url = Some(url.into().trim_end_matches('/').to_string());
        this
    }

    /// Api key for machine authentication, used to look at shared
    /// resources as their owner.
    pub fn machine_auth_api_key(self, key: impl Into<String>) -> Self {
        let mut this = self;
        this.machine_auth_api_key = Some(key.into());
        this
    }

    /// Enable HTTP third-party copy.
    pub fn enable_http_tpc(self, enable: bool) -> Self {
        let mut this = self;
        this.enable_http_tpc = Some(enable);
        this
    }

    /// How often a third-party copy reports progress (default 5 s).
    pub fn perf_marker_interval(self, interval: Duration) -> Self {
        let mut this = self;
        this.perf_marker_interval = Some(interval);
        this
    }

    /// Allow `Depth: infinity` on PROPFIND (default false).
    pub fn allow_propfind_depth_infinity(self, allow: bool) -> Self {
        let mut this = self;
        this.allow_propfind_depth_infinity = Some(allow);
        this
    }

    pub fn name_validation(self, nv: NameValidation) -> Self {
        let mut this = self;
        this.name_validation = Some(nv);
        this
    }

    /// Contents of `status.php`.
    pub fn status(self, status: StatusInfo) -> Self {
        let mut this = self;
        this.status = Some(status);
        this
    }

    /// How long user lookups are cached (default 60 s).
    pub fn user_cache_ttl(self, ttl: Duration) -> Self {
        let mut this = self;
        this.user_cache_ttl = Some(ttl);
        this
    }
}

// The actual inner struct.
//
// DavConfig is resolved once into a DavInner when the handler is built.
pub(crate) struct DavInner {
    pub prefix: String,
    pub gateway: Arc<dyn ClientSelector>,
    pub data: Box<dyn DataClient>,
    pub favorites: Box<dyn FavoritesManager>,
    pub files_namespace: String,
    pub webdav_namespace: String,
    pub public_url: String,
    pub machine_auth_api_key: String,
    pub enable_http_tpc: bool,
    pub perf_marker_interval: Duration,
    pub allow_propfind_depth_infinity: bool,
    pub name_validation: NameValidation,
    pub status: StatusInfo,
    pub users: IdentifierCache,
    table: HandlerTable,
}

impl DavHandler {
    /// Create a new `DavHandler`.
    ///
    /// This returns a DavHandler with an empty configuration. It has no
    /// gateway, so every request that needs one fails. Normally you should
    /// create a new `DavHandler` using `DavHandler::builder`.
    pub fn new() -> Self {
        DavConfig::new().build_handler()
    }

    /// Return a configuration builder.
    pub fn builder() -> DavConfig {
        DavConfig::new()
    }

    /// Process a WebDAV request without an authenticated user.
    ///
    /// Only public links, `status.php` and OPTIONS work this way.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        self.inner.handle(Session::anonymous(), req).await
    }

    /// Process a WebDAV request for a user that was authenticated by an
    /// outer layer.
    pub async fn handle_as<ReqBody, ReqData, ReqError>(
        &self,
        session: Session,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
    {
        self.inner.handle(session, req).await
    }
}

impl Default for DavHandler {
    fn default() -> Self {
        DavHandler::new()
    }
}

// Headers on every response.
const ACCESS_HEADERS: &[(&str, &str)] = &[
    ("Access-Control-Allow-Origin", "*"),
    ("Content-Security-Policy", "default-src 'none';"),
    ("X-Content-Type-Options", "nosniff"),
    ("X-Download-Options", "noopen"),
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-Permitted-Cross-Domain-Policies", "none"),
    ("X-Robots-Tag", "none"),
    ("X-XSS-Protection", "1; mode=block"),
];

/// XML error response.
pub(crate) fn error_response(
    status: StatusCode,
    message: &str,
    header: Option<&str>,
) -> Response<Body> {
    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = status;
    if status != StatusCode::NO_CONTENT && status != StatusCode::NOT_MODIFIED {
        let body = error_body(status, message, header);
        resp.headers_mut().insert(
            "Content-Type",
            HeaderValue::from_static("application/xml; charset=utf-8"),
        );
        *resp.body_mut() = Body::from(body);
    }
    resp
}

impl DavInner {
    pub(crate) fn new(cfg: DavConfig) -> Self {
        let DavConfig {
            prefix,
            gateway,
            data_client,
            favorites,
            files_namespace,
            webdav_namespace,
            public_url,
            machine_auth_api_key,
            enable_http_tpc,
            perf_marker_interval,
            allow_propfind_depth_infinity,
            name_validation,
            status,
            user_cache_ttl,
        } = cfg;
        Self {
            prefix: prefix.unwrap_or_default(),
            gateway: gateway.unwrap_or_else(|| Arc::new(GatewayPool::new(Vec::new()))),
            data: data_client.unwrap_or_else(|| Box::new(HttpDataClient::new())),
            favorites: favorites.unwrap_or_else(|| MemFavorites::new()),
            files_namespace: files_namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            webdav_namespace: webdav_namespace.unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            public_url: public_url.unwrap_or_default(),
            machine_auth_api_key: machine_auth_api_key.unwrap_or_default(),
            enable_http_tpc: enable_http_tpc.unwrap_or(false),
            perf_marker_interval: perf_marker_interval.unwrap_or(Duration::from_secs(5)),
            allow_propfind_depth_infinity: allow_propfind_depth_infinity.unwrap_or(false),
            name_validation: name_validation.unwrap_or_default(),
            status: status.unwrap_or_default(),
            users: IdentifierCache::new(user_cache_ttl.unwrap_or(DEFAULT_TTL)),
            table: HandlerTable::new(),
        }
    }

    // helper.
    pub(crate) fn gw(&self) -> DavResult<&(dyn GatewayClient + 'static)> {
        Ok(self.gateway.next()?)
    }

    // drain request body, with a maximum size.
    pub(crate) async fn read_request(&self, body: Body, max_size: usize) -> DavResult<Vec<u8>> {
        let mut data = Vec::new();
        let mut body = body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if data.len() + chunk.len() > max_size {
                return Err(StatusCode::PAYLOAD_TOO_LARGE.into());
            }
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    // methods that take no body.
    pub(crate) async fn require_empty_body(&self, body: Body) -> DavResult<()> {
        if body.is_empty_body() {
            return Ok(());
        }
        let data = self.read_request(body, 65536).await?;
        if !data.is_empty() {
            return Err(DavError::msg(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "body must be empty",
            ));
        }
        Ok(())
    }

    // A write was refused. Callers that cannot even see `visible` get a
    // 404, so that the existence of resources does not leak.
    pub(crate) async fn denied(
        &self,
        gw: &dyn GatewayClient,
        s: &Session,
        visible: &Reference,
        msg: &str,
    ) -> DavError {
        match gw.stat(s, visible).await {
            Ok(_) => DavError::msg(StatusCode::FORBIDDEN, msg),
            Err(_) => DavError::msg(StatusCode::NOT_FOUND, "Resource not found"),
        }
    }

    // internal dispatcher.
    async fn handle<ReqBody, ReqData, ReqError>(
        &self,
        session: Session,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        // cancelled when the request future is dropped.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let mut resp = match self.handle2(session, req, cancel).await {
            Ok(resp) => {
                debug!("== END REQUEST result OK");
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = error_response(err.statuscode(), &err.message(), err.header());
                if err.must_close() {
                    resp.headers_mut()
                        .insert("connection", HeaderValue::from_static("close"));
                }
                resp
            }
        };
        let h = resp.headers_mut();
        for (name, value) in ACCESS_HEADERS {
            h.insert(*name, HeaderValue::from_static(value));
        }
        resp
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        session: Session,
        req: Request<ReqBody>,
        cancel: CancellationToken,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError> + Send + 'static,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), Body::from_http_body(body))
        };

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        // make sure the request path is valid, and strip the prefix.
        let path = normalize_path(req.uri().path())?;
        let prefix = self.prefix.trim_end_matches('/');
        let path = if prefix.is_empty() {
            path
        } else {
            match path.strip_prefix(prefix) {
                Some("") => "/".to_string(),
                Some(p) if p.starts_with('/') => p.to_string(),
                _ => return Err(DavError::Status(StatusCode::NOT_FOUND)),
            }
        };

        debug!("== START REQUEST {:?} {}", method, path);

        let ctx = match self.route(&req, method, &path, session, cancel).await? {
            Routed::Response(resp) => return Ok(resp),
            Routed::Context(ctx) => ctx,
        };

        match self.table.get(ctx.kind, method) {
            Some(h) => h(self, &ctx, &req, body).await,
            None => {
                debug!("method {} not allowed on {:?}", method.as_str(), ctx.kind);
                let allow = self.allowed_methods(ctx.kind);
                let mut resp = error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    &format!("{} is not allowed here", method.as_str()),
                    None,
                );
                if let Ok(v) = HeaderValue::from_str(&allow) {
                    resp.headers_mut().insert("Allow", v);
                }
                Ok(resp)
            }
        }
    }

    /// `Allow` header value for a namespace kind.
    pub(crate) fn allowed_methods(&self, kind: crate::router::NamespaceKind) -> String {
        self.table.allowed(kind).to_header_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let inner = DavInner::new(DavConfig::new().public_url("https://cloud.example.com/"));
        assert_eq!(inner.files_namespace, "/users/{username}");
        assert_eq!(inner.public_url, "https://cloud.example.com");
        assert_eq!(inner.perf_marker_interval, Duration::from_secs(5));
        assert!(!inner.enable_http_tpc);
        assert!(inner.gw().is_err());
    }

    #[test]
    fn error_responses() {
        let resp = error_response(StatusCode::CONFLICT, "no parent", None);
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/xml; charset=utf-8"
        );
        let resp = error_response(StatusCode::NO_CONTENT, "", None);
        assert!(resp.headers().get("content-type").is_none());
    }
}
