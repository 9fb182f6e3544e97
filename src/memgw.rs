//! Simple in-memory storage gateway.
//!
//! `MemGateway` implements both [`GatewayClient`] and [`DataClient`],
//! so a handler can be wired up without any backend:
//!
//! ```no_run
//! use dav_gateway::{DavHandler, memgw::MemGateway, pool::GatewayPool};
//!
//! let gw = MemGateway::new();
//! gw.add_user("alice");
//! let dav = DavHandler::builder()
//!     .gateway(GatewayPool::single(Box::new(gw.clone())))
//!     .data_client(Box::new(gw))
//!     .build_handler();
//! ```
//!
//! This implementation has state. It is a handle, all clones share
//! the same storage. Every gateway call is recorded by name, see
//! [`MemGateway::calls`], which makes it useful in tests.
//!
//! Homes live at `/users/{username}`, each is its own space. Users can
//! write below their home and read its ancestors. Checksums are only
//! verified for `adler32`.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::future::{self, BoxFuture, FutureExt};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use parking_lot::Mutex;

use crate::body::Body;
use crate::davheaders::{OC_ETAG, OC_FILEID, X_REVA_TRANSFER};
use crate::davpath;
use crate::gateway::*;
use crate::transfer::{DataClient, TransferError};
use crate::util::{systemtime_to_httpdate, unix_to_systemtime};

/// Storage id of everything in a `MemGateway`.
pub const STORAGE_ID: &str = "memgw";
/// Host of the simple and spaces data endpoint.
pub const DATA_ENDPOINT: &str = "memgw://data/";
/// Host of the tus data endpoint.
pub const TUS_ENDPOINT: &str = "memgw://tus";

const USERS_ROOT: &str = "/users";

/// Ephemeral in-memory gateway.
#[derive(Debug, Clone)]
pub struct MemGateway {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    dir: bool,
    data: Vec<u8>,
    etag: String,
    mtime: SystemTime,
    owner: Option<UserId>,
    metadata: BTreeMap<String, String>,
    lock: Option<Lock>,
}

#[derive(Debug, Clone)]
struct Trashed {
    key: String,
    home: String,
    // relative to the home.
    original_path: String,
    deletion_time: SystemTime,
    // relative to the deleted node, "" is the node itself.
    nodes: BTreeMap<String, Node>,
}

#[derive(Debug, Clone)]
struct Version {
    info: FileVersion,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
enum Transfer {
    Download {
        path: String,
    },
    Upload {
        path: String,
        length: Option<u64>,
        offset: u64,
        buf: Vec<u8>,
        mtime: Option<SystemTime>,
        checksum: Option<String>,
    },
}

#[derive(Debug, Clone)]
struct PublicLink {
    path: String,
    password: Option<String>,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<String, Node>,
    users: Vec<User>,
    trash: Vec<Trashed>,
    versions: HashMap<String, Vec<Version>>,
    transfers: HashMap<String, Transfer>,
    links: HashMap<String, PublicLink>,
    // session token -> root a public link session may see.
    public_sessions: HashMap<String, String>,
    readonly: HashSet<String>,
    remote: HashMap<String, Vec<u8>>,
    uploads: Vec<Opaque>,
    calls: Vec<String>,
    healthy: bool,
    next_id: u64,
}

fn status(code: Code, msg: impl Into<String>) -> GwError {
    GwError::new(code, msg)
}

fn not_found(path: &str) -> GwError {
    status(Code::NotFound, format!("{} not found", path))
}

fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

// adler32 of `data`, as hex.
fn adler32(data: &[u8]) -> String {
    let (mut a, mut b) = (1u32, 0u32);
    for &c in data {
        a = (a + c as u32) % 65521;
        b = (b + a) % 65521;
    }
    format!("{:08x}", (b << 16) | a)
}

// "bytes=a-b" or "bytes=a-".
fn parse_range(h: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let v = h.get(http::header::RANGE)?.to_str().ok()?;
    let (start, end) = v.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => len.checked_sub(1)?,
        e => e.parse::<usize>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

fn empty(status: StatusCode) -> Result<Response<Body>, http::Error> {
    Response::builder().status(status).body(Body::empty())
}

impl Node {
    fn new(id: String, dir: bool, owner: Option<UserId>) -> Node {
        Node {
            id,
            dir,
            data: Vec::new(),
            etag: new_etag(),
            mtime: SystemTime::now(),
            owner,
            metadata: BTreeMap::new(),
            lock: None,
        }
    }

    fn active_lock(&self) -> Option<&Lock> {
        self.lock
            .as_ref()
            .filter(|l| l.expiration.map(|e| e > SystemTime::now()).unwrap_or(true))
    }

    // A lock held by someone else blocks writes.
    fn check_lock(&self, lock_id: Option<&str>, code: Code) -> GwResult<()> {
        match self.active_lock() {
            Some(l) if Some(l.lock_id.as_str()) != lock_id => Err(status(code, "resource is locked")),
            _ => Ok(()),
        }
    }
}

impl State {
    fn new() -> State {
        let mut st = State {
            nodes: BTreeMap::new(),
            users: Vec::new(),
            trash: Vec::new(),
            versions: HashMap::new(),
            transfers: HashMap::new(),
            links: HashMap::new(),
            public_sessions: HashMap::new(),
            readonly: HashSet::new(),
            remote: HashMap::new(),
            uploads: Vec::new(),
            calls: Vec::new(),
            healthy: true,
            next_id: 0,
        };
        let root = st.new_node(true, None);
        st.nodes.insert("/".to_string(), root);
        let users = st.new_node(true, None);
        st.nodes.insert(USERS_ROOT.to_string(), users);
        st
    }

    fn new_node(&mut self, dir: bool, owner: Option<UserId>) -> Node {
        self.next_id += 1;
        Node::new(format!("n{}", self.next_id), dir, owner)
    }

    fn path_of(&self, opaque_id: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, n)| n.id == opaque_id)
            .map(|(p, _)| p.clone())
    }

    fn resolve(&self, r: &Reference) -> GwResult<String> {
        let Some(ref id) = r.resource_id else {
            return Ok(davpath::clean(&r.path));
        };
        let base = if id.storage_id == PUBLIC_STORAGE_PROVIDER_ID {
            self.links.get(&id.opaque_id).map(|l| l.path.clone())
        } else {
            self.path_of(&id.opaque_id)
        };
        let base = base.ok_or_else(|| not_found(&id.to_string()))?;
        Ok(davpath::join(&base, &r.path))
    }

    // `/users/{name}` for paths below a home.
    fn home_of(&self, path: &str) -> Option<String> {
        let rest = path.strip_prefix(USERS_ROOT)?.strip_prefix('/')?;
        let name = rest.split('/').next().filter(|n| !n.is_empty())?;
        let home = format!("{}/{}", USERS_ROOT, name);
        self.nodes.contains_key(&home).then_some(home)
    }

    fn space_of(&self, path: &str) -> Option<StorageSpace> {
        let (mount, space_type) = match self.home_of(path) {
            Some(h) => (h, "personal"),
            None => ("/".to_string(), "project"),
        };
        let node = self.nodes.get(&mount)?;
        Some(StorageSpace {
            root: ResourceId::new(STORAGE_ID, &node.id, &node.id),
            mount_path: mount,
            space_type: space_type.to_string(),
            owner: node.owner.clone(),
        })
    }

    fn resource_id(&self, path: &str) -> Option<ResourceId> {
        let node = self.nodes.get(path)?;
        let space = self.space_of(path)?;
        Some(ResourceId::new(STORAGE_ID, &space.root.opaque_id, &node.id))
    }

    fn is_readonly(&self, path: &str) -> bool {
        self.readonly.iter().any(|ro| davpath::is_subpath(ro, path))
    }

    fn check_access(&self, s: &Session, path: &str, write: bool) -> GwResult<()> {
        let allowed = if let Some(root) = self.public_sessions.get(&s.token) {
            davpath::is_subpath(root, path)
        } else if let Some(ref u) = s.user {
            let home = format!("{}/{}", USERS_ROOT, u.username);
            davpath::is_subpath(&home, path) || (!write && davpath::is_subpath(path, &home))
        } else {
            return Err(status(Code::Unauthenticated, "no session"));
        };
        if !allowed {
            return Err(if self.nodes.contains_key(path) {
                status(Code::PermissionDenied, format!("no access to {}", path))
            } else {
                not_found(path)
            });
        }
        if write && self.is_readonly(path) {
            return Err(status(Code::PermissionDenied, format!("{} is read only", path)));
        }
        Ok(())
    }

    fn tree_size(&self, path: &str) -> u64 {
        self.nodes
            .iter()
            .filter(|(p, _)| davpath::is_subpath(path, p))
            .map(|(_, n)| n.data.len() as u64)
            .sum()
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|p| davpath::is_subpath(path, p))
            .cloned()
            .collect()
    }

    fn info(&self, path: &str) -> GwResult<ResourceInfo> {
        let node = self.nodes.get(path).ok_or_else(|| not_found(path))?;
        let space = self.space_of(path);
        let space_id = space
            .as_ref()
            .map(|s| s.root.opaque_id.clone())
            .unwrap_or_default();
        let parent_id = if path == "/" {
            None
        } else {
            self.resource_id(&davpath::dirname(path))
        };
        let name = if path == "/" {
            String::new()
        } else {
            davpath::basename(path).to_string()
        };
        let (resource_type, size, mime_type) = if node.dir {
            (ResourceType::Container, self.tree_size(path), String::new())
        } else {
            let mime = davpath::mime_type(&name).to_string();
            (ResourceType::File, node.data.len() as u64, mime)
        };
        let permissions = if self.is_readonly(path) {
            Permissions::viewer()
        } else {
            Permissions::all()
        };
        let checksum = (!node.dir).then(|| Checksum {
            kind: "adler32".to_string(),
            sum: adler32(&node.data),
        });
        Ok(ResourceInfo {
            resource_type,
            id: ResourceId::new(STORAGE_ID, &space_id, &node.id),
            parent_id,
            path: path.to_string(),
            name,
            size,
            etag: node.etag.clone(),
            mime_type,
            checksum,
            mtime: Some(node.mtime),
            owner: node.owner.clone(),
            permissions,
            opaque: Opaque::new(),
            arbitrary_metadata: node.metadata.clone(),
            lock: node.active_lock().cloned(),
            space,
        })
    }

    fn require_parent(&self, path: &str) -> GwResult<()> {
        match self.nodes.get(&davpath::dirname(path)) {
            Some(n) if n.dir => Ok(()),
            Some(_) => Err(status(Code::FailedPrecondition, "parent is not a folder")),
            None => Err(not_found(&davpath::dirname(path))),
        }
    }

    fn owner_for(&self, path: &str) -> Option<UserId> {
        self.home_of(path)
            .and_then(|h| self.nodes.get(&h))
            .and_then(|n| n.owner.clone())
    }

    // Store a finished upload. Old content becomes a version.
    fn write_file(&mut self, path: &str, data: Vec<u8>, mtime: Option<SystemTime>) -> GwResult<()> {
        let mtime = mtime.unwrap_or_else(SystemTime::now);
        if let Some(node) = self.nodes.get_mut(path) {
            if node.dir {
                return Err(status(Code::FailedPrecondition, "is a folder"));
            }
            let old = std::mem::replace(&mut node.data, data);
            let versions = self.versions.entry(node.id.clone()).or_default();
            let mut key = crate::util::systemtime_to_unix(node.mtime).to_string();
            while versions.iter().any(|v| v.info.key == key) {
                key.push('0');
            }
            versions.push(Version {
                info: FileVersion {
                    key,
                    size: old.len() as u64,
                    mtime: node.mtime,
                    etag: node.etag.clone(),
                },
                data: old,
            });
            node.etag = new_etag();
            node.mtime = mtime;
            return Ok(());
        }
        self.require_parent(path)?;
        let owner = self.owner_for(path);
        let mut node = self.new_node(false, owner);
        node.data = data;
        node.mtime = mtime;
        self.nodes.insert(path.to_string(), node);
        self.touch_parents(path);
        Ok(())
    }

    // Folder etags change with their content.
    fn touch_parents(&mut self, path: &str) {
        let mut p = davpath::dirname(path);
        loop {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.etag = new_etag();
            }
            if p == "/" {
                break;
            }
            p = davpath::dirname(&p);
        }
    }

    fn move_tree(&mut self, src: &str, dst: &str) {
        for p in self.subtree(src) {
            if let Some(node) = self.nodes.remove(&p) {
                let np = format!("{}{}", dst, &p[src.len()..]);
                self.nodes.insert(np, node);
            }
        }
        self.touch_parents(src);
        self.touch_parents(dst);
    }

    fn trashed(&self, home: &str, key: &str) -> GwResult<(usize, String)> {
        let (k, sub) = match key.split_once('/') {
            Some((k, sub)) => (k, sub.to_string()),
            None => (key, String::new()),
        };
        self.trash
            .iter()
            .position(|t| t.home == home && t.key == k)
            .map(|i| (i, sub))
            .ok_or_else(|| not_found(key))
    }

    fn upload_response(&self, token: String, created: bool) -> UploadResponse {
        let proto = |name: &str, endpoint: &str| Protocol {
            protocol: name.to_string(),
            endpoint: endpoint.to_string(),
            token: token.clone(),
            expose: false,
        };
        let mut opaque = Opaque::new();
        if created {
            opaque.insert("created".to_string(), "true".to_string());
        }
        UploadResponse {
            protocols: vec![proto("simple", DATA_ENDPOINT), proto("tus", TUS_ENDPOINT)],
            opaque,
        }
    }
}

impl Default for MemGateway {
    fn default() -> Self {
        MemGateway::new()
    }
}

impl MemGateway {
    /// Create a new, empty gateway.
    pub fn new() -> MemGateway {
        MemGateway {
            state: Arc::new(Mutex::new(State::new())),
        }
    }

    /// Add a user with a home at `/users/{name}`.
    pub fn add_user(&self, name: &str) -> User {
        let mut st = self.state.lock();
        if let Some(u) = st.users.iter().find(|u| u.username == name) {
            return u.clone();
        }
        let user = User {
            id: UserId::new(STORAGE_ID, format!("{}-id", name)),
            username: name.to_string(),
            display_name: name.to_string(),
            mail: format!("{}@example.org", name),
        };
        let home = st.new_node(true, Some(user.id.clone()));
        st.nodes.insert(format!("{}/{}", USERS_ROOT, name), home);
        st.users.push(user.clone());
        user
    }

    /// Session for a user added with [`add_user`](Self::add_user).
    pub fn session(&self, name: &str) -> Session {
        let user = self.add_user(name);
        Session::new(user, format!("token-{}", name))
    }

    /// Create a file, and any missing folders above it.
    pub fn put_file(&self, path: &str, data: &[u8]) {
        let path = davpath::clean(path);
        self.mkdir_all(&davpath::dirname(&path));
        let mut st = self.state.lock();
        if let Err(e) = st.write_file(&path, data.to_vec(), None) {
            error!("memgw: put_file {}: {}", path, e);
        }
    }

    /// Create a folder and its parents.
    pub fn mkdir_all(&self, path: &str) {
        let path = davpath::clean(path);
        let mut st = self.state.lock();
        let mut p = String::new();
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            p = format!("{}/{}", p, seg);
            if !st.nodes.contains_key(&p) {
                let owner = st.owner_for(&p);
                let node = st.new_node(true, owner);
                st.nodes.insert(p.clone(), node);
            }
        }
    }

    /// Content of a file.
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let st = self.state.lock();
        st.nodes
            .get(&davpath::clean(path))
            .filter(|n| !n.dir)
            .map(|n| n.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(&davpath::clean(path))
    }

    /// Writes below `path` are refused.
    pub fn set_readonly(&self, path: &str) {
        self.state.lock().readonly.insert(davpath::clean(path));
    }

    /// Share `path` as a public link.
    pub fn add_public_link(&self, token: &str, path: &str, password: Option<&str>) {
        self.state.lock().links.insert(
            token.to_string(),
            PublicLink {
                path: davpath::clean(path),
                password: password.map(|p| p.to_string()),
            },
        );
    }

    /// Content served for a url that is not one of our data endpoints.
    pub fn add_remote(&self, url: &str, data: &[u8]) {
        self.state.lock().remote.insert(url.to_string(), data.to_vec());
    }

    /// Content that was PUT to a remote url.
    pub fn remote(&self, url: &str) -> Option<Vec<u8>> {
        self.state.lock().remote.get(url).cloned()
    }

    /// Names of all gateway calls so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Opaque maps of all upload initiations so far.
    pub fn upload_requests(&self) -> Vec<Opaque> {
        self.state.lock().uploads.clone()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    // Run `f` on the locked state, and record the call.
    fn with<'a, T, F>(&'a self, name: &str, f: F) -> GwFuture<'a, T>
    where
        T: Send + 'a,
        F: FnOnce(&mut State) -> GwResult<T>,
    {
        let mut st = self.state.lock();
        st.calls.push(name.to_string());
        let res = f(&mut *st);
        if let Err(ref e) = res {
            trace!("memgw: {} failed: {}", name, e);
        }
        future::ready(res).boxed()
    }
}

impl GatewayClient for MemGateway {
    fn stat<'a>(&'a self, s: &'a Session, r: &'a Reference) -> GwFuture<'a, ResourceInfo> {
        self.with("stat", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, false)?;
            st.info(&path)
        })
    }

    fn create_container<'a>(&'a self, s: &'a Session, r: &'a Reference) -> GwFuture<'a, ()> {
        self.with("create_container", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            if st.nodes.contains_key(&path) {
                return Err(status(Code::AlreadyExists, format!("{} exists", path)));
            }
            st.require_parent(&path)?;
            let owner = st.owner_for(&path);
            let node = st.new_node(true, owner);
            st.nodes.insert(path.clone(), node);
            st.touch_parents(&path);
            Ok(())
        })
    }

    fn list_container<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<ResourceInfo>> {
        self.with("list_container", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, false)?;
            match st.nodes.get(&path) {
                Some(n) if n.dir => {}
                Some(_) => return Err(status(Code::FailedPrecondition, "not a folder")),
                None => return Err(not_found(&path)),
            }
            let children: Vec<String> = st
                .subtree(&path)
                .into_iter()
                .filter(|p| *p != path && davpath::dirname(p) == path)
                .collect();
            children.iter().map(|p| st.info(p)).collect()
        })
    }

    fn delete<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        self.with("delete", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let node = st.nodes.get(&path).ok_or_else(|| not_found(&path))?;
            node.check_lock(lock_id, Code::FailedPrecondition)?;
            let home = st
                .home_of(&path)
                .filter(|h| *h != path)
                .ok_or_else(|| status(Code::PermissionDenied, "can not delete a space root"))?;
            let key = node.id.clone();
            let mut nodes = BTreeMap::new();
            for p in st.subtree(&path) {
                if let Some(n) = st.nodes.remove(&p) {
                    nodes.insert(p[path.len()..].to_string(), n);
                }
            }
            st.trash.push(Trashed {
                key,
                original_path: path[home.len()..].to_string(),
                home,
                deletion_time: SystemTime::now(),
                nodes,
            });
            st.touch_parents(&path);
            Ok(())
        })
    }

    fn move_resource<'a>(
        &'a self,
        s: &'a Session,
        src: &'a Reference,
        dst: &'a Reference,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        self.with("move", |st| {
            let from = st.resolve(src)?;
            let to = st.resolve(dst)?;
            st.check_access(s, &from, true)?;
            st.check_access(s, &to, true)?;
            let node = st.nodes.get(&from).ok_or_else(|| not_found(&from))?;
            node.check_lock(lock_id, Code::Locked)?;
            if st.nodes.contains_key(&to) {
                return Err(status(Code::AlreadyExists, format!("{} exists", to)));
            }
            if davpath::is_subpath(&from, &to) {
                return Err(status(Code::FailedPrecondition, "can not move into itself"));
            }
            st.require_parent(&to)?;
            st.move_tree(&from, &to);
            Ok(())
        })
    }

    fn initiate_file_upload<'a>(
        &'a self,
        s: &'a Session,
        req: &'a UploadRequest,
    ) -> GwFuture<'a, UploadResponse> {
        self.with("initiate_file_upload", |st| {
            let path = st.resolve(&req.reference)?;
            st.check_access(s, &path, true)?;
            let created = match st.nodes.get(&path) {
                Some(n) if n.dir => {
                    return Err(status(Code::FailedPrecondition, "a folder exists with that name"));
                }
                Some(n) => {
                    n.check_lock(req.lock_id.as_deref(), Code::Locked)?;
                    if let Some(ref m) = req.if_match {
                        if m.trim_matches('"') != n.etag {
                            return Err(status(Code::Aborted, "etag mismatch"));
                        }
                    }
                    false
                }
                None => {
                    st.require_parent(&path)?;
                    true
                }
            };
            let length = match req.opaque.get("sizedeferred") {
                Some(v) if v == "true" => None,
                _ => req
                    .opaque
                    .get("Upload-Length")
                    .and_then(|l| l.parse::<u64>().ok()),
            };
            let mtime = req
                .opaque
                .get("X-OC-Mtime")
                .and_then(|m| m.split('.').next()?.parse::<u64>().ok())
                .map(unix_to_systemtime);
            let token = uuid::Uuid::new_v4().to_string();
            st.transfers.insert(
                token.clone(),
                Transfer::Upload {
                    path,
                    length,
                    offset: 0,
                    buf: Vec::new(),
                    mtime,
                    checksum: req.opaque.get("Upload-Checksum").cloned(),
                },
            );
            st.uploads.push(req.opaque.clone());
            Ok(st.upload_response(token, created))
        })
    }

    fn initiate_file_download<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<Protocol>> {
        self.with("initiate_file_download", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, false)?;
            match st.nodes.get(&path) {
                Some(n) if n.dir => return Err(status(Code::FailedPrecondition, "is a folder")),
                Some(_) => {}
                None => return Err(not_found(&path)),
            }
            let token = uuid::Uuid::new_v4().to_string();
            st.transfers
                .insert(token.clone(), Transfer::Download { path });
            Ok(["simple", "spaces"]
                .iter()
                .map(|p| Protocol {
                    protocol: p.to_string(),
                    endpoint: DATA_ENDPOINT.to_string(),
                    token: token.clone(),
                    expose: false,
                })
                .collect())
        })
    }

    fn touch_file<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        opaque: &'a Opaque,
    ) -> GwFuture<'a, ()> {
        self.with("touch_file", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            if st.nodes.contains_key(&path) {
                return Err(status(Code::AlreadyExists, format!("{} exists", path)));
            }
            let mtime = opaque
                .get("X-OC-Mtime")
                .and_then(|m| m.split('.').next()?.parse::<u64>().ok())
                .map(unix_to_systemtime);
            st.write_file(&path, Vec::new(), mtime)
        })
    }

    fn set_lock<'a>(&'a self, s: &'a Session, r: &'a Reference, lock: &'a Lock) -> GwFuture<'a, ()> {
        self.with("set_lock", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let node = st.nodes.get_mut(&path).ok_or_else(|| not_found(&path))?;
            if node.active_lock().is_some() {
                return Err(status(Code::FailedPrecondition, "already locked"));
            }
            node.lock = Some(lock.clone());
            Ok(())
        })
    }

    fn unlock<'a>(&'a self, s: &'a Session, r: &'a Reference, lock: &'a Lock) -> GwFuture<'a, ()> {
        self.with("unlock", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let node = st.nodes.get_mut(&path).ok_or_else(|| not_found(&path))?;
            let held = node.active_lock().map(|l| l.lock_id == lock.lock_id);
            match held {
                Some(true) => {
                    node.lock = None;
                    Ok(())
                }
                Some(false) => Err(status(Code::FailedPrecondition, "lock token mismatch")),
                None => Err(status(Code::FailedPrecondition, "not locked")),
            }
        })
    }

    fn get_path<'a>(&'a self, _s: &'a Session, id: &'a ResourceId) -> GwFuture<'a, String> {
        self.with("get_path", |st| {
            st.path_of(&id.opaque_id)
                .ok_or_else(|| not_found(&id.to_string()))
        })
    }

    fn authenticate<'a>(
        &'a self,
        kind: &'a str,
        client_id: &'a str,
        secret: &'a str,
    ) -> GwFuture<'a, AuthResponse> {
        self.with("authenticate", |st| match kind {
            "publicshares" => {
                let link = st
                    .links
                    .get(client_id)
                    .cloned()
                    .ok_or_else(|| not_found(client_id))?;
                let ok = match (secret.split_once('|'), link.password.as_deref()) {
                    (Some(("password", pw)), Some(want)) => pw == want,
                    (Some(("password", _)), None) => true,
                    // signed urls carry "signature|sig-{token}|{expiration}".
                    (Some(("signature", rest)), _) => {
                        rest.split('|').next() == Some(format!("sig-{}", client_id).as_str())
                    }
                    _ => false,
                };
                if !ok {
                    return Err(status(Code::PermissionDenied, "wrong password"));
                }
                let token = format!("public-{}-{}", client_id, uuid::Uuid::new_v4());
                st.public_sessions.insert(token.clone(), link.path);
                let user = User {
                    id: UserId::new(STORAGE_ID, format!("public-{}", client_id)),
                    ..User::default()
                };
                Ok(AuthResponse { user, token })
            }
            "machine" => {
                let id = client_id.strip_prefix("userid:").unwrap_or(client_id);
                let user = st
                    .users
                    .iter()
                    .find(|u| u.id.opaque_id == id)
                    .cloned()
                    .ok_or_else(|| status(Code::Unauthenticated, "unknown user"))?;
                if secret.is_empty() {
                    return Err(status(Code::Unauthenticated, "missing api key"));
                }
                let token = format!("token-{}", user.username);
                Ok(AuthResponse { user, token })
            }
            _ => {
                let user = st
                    .users
                    .iter()
                    .find(|u| u.username == client_id)
                    .cloned()
                    .ok_or_else(|| status(Code::Unauthenticated, "unknown user"))?;
                let token = format!("token-{}", user.username);
                Ok(AuthResponse { user, token })
            }
        })
    }

    fn set_arbitrary_metadata<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        md: &'a BTreeMap<String, String>,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        self.with("set_arbitrary_metadata", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let node = st.nodes.get_mut(&path).ok_or_else(|| not_found(&path))?;
            node.check_lock(lock_id, Code::Aborted)?;
            node.metadata
                .extend(md.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    fn unset_arbitrary_metadata<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        keys: &'a [String],
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        self.with("unset_arbitrary_metadata", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let node = st.nodes.get_mut(&path).ok_or_else(|| not_found(&path))?;
            node.check_lock(lock_id, Code::Aborted)?;
            for k in keys {
                node.metadata.remove(k);
            }
            Ok(())
        })
    }

    fn list_recycle<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, Vec<RecycleItem>> {
        self.with("list_recycle", |st| {
            let home = st.resolve(r)?;
            st.check_access(s, &home, false)?;
            if key.is_empty() {
                return Ok(st
                    .trash
                    .iter()
                    .filter(|t| t.home == home)
                    .filter_map(|t| {
                        let node = t.nodes.get("")?;
                        Some(RecycleItem {
                            key: t.key.clone(),
                            original_path: t.original_path.clone(),
                            deletion_time: t.deletion_time,
                            size: t.nodes.values().map(|n| n.data.len() as u64).sum(),
                            resource_type: if node.dir {
                                ResourceType::Container
                            } else {
                                ResourceType::File
                            },
                        })
                    })
                    .collect());
            }
            let (i, sub) = st.trashed(&home, key)?;
            let t = &st.trash[i];
            let dir = if sub.is_empty() { String::new() } else { format!("/{}", sub) };
            match t.nodes.get(&dir) {
                Some(n) if n.dir => {}
                _ => return Err(not_found(key)),
            }
            let parent = if dir.is_empty() { "/" } else { dir.as_str() };
            Ok(t.nodes
                .iter()
                .filter(|(p, _)| !p.is_empty() && davpath::dirname(p) == parent)
                .map(|(p, n)| RecycleItem {
                    key: format!("{}{}", t.key, p),
                    original_path: format!("{}{}", t.original_path, p),
                    deletion_time: t.deletion_time,
                    size: n.data.len() as u64,
                    resource_type: if n.dir {
                        ResourceType::Container
                    } else {
                        ResourceType::File
                    },
                })
                .collect())
        })
    }

    fn restore_recycle_item<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
        restore_ref: &'a Reference,
    ) -> GwFuture<'a, ()> {
        self.with("restore_recycle_item", |st| {
            let home = st.resolve(r)?;
            let dst = st.resolve(restore_ref)?;
            st.check_access(s, &dst, true)?;
            let (i, sub) = st.trashed(&home, key)?;
            let prefix = if sub.is_empty() { String::new() } else { format!("/{}", sub) };
            if !st.trash[i].nodes.contains_key(&prefix) {
                return Err(not_found(key));
            }
            if st.nodes.contains_key(&dst) {
                return Err(status(Code::AlreadyExists, format!("{} exists", dst)));
            }
            st.require_parent(&dst)?;
            let moved: Vec<String> = st.trash[i]
                .nodes
                .keys()
                .filter(|p| prefix.is_empty() || davpath::is_subpath(&prefix, p))
                .cloned()
                .collect();
            for p in moved {
                if let Some(node) = st.trash[i].nodes.remove(&p) {
                    st.nodes.insert(format!("{}{}", dst, &p[prefix.len()..]), node);
                }
            }
            if st.trash[i].nodes.is_empty() || prefix.is_empty() {
                st.trash.remove(i);
            }
            st.touch_parents(&dst);
            Ok(())
        })
    }

    fn purge_recycle<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, ()> {
        self.with("purge_recycle", |st| {
            let home = st.resolve(r)?;
            st.check_access(s, &home, true)?;
            if key.is_empty() {
                st.trash.retain(|t| t.home != home);
                return Ok(());
            }
            let (i, sub) = st.trashed(&home, key)?;
            if sub.is_empty() {
                st.trash.remove(i);
                return Ok(());
            }
            let prefix = format!("/{}", sub);
            let before = st.trash[i].nodes.len();
            st.trash[i]
                .nodes
                .retain(|p, _| !davpath::is_subpath(&prefix, p));
            if st.trash[i].nodes.len() == before {
                return Err(not_found(key));
            }
            Ok(())
        })
    }

    fn list_file_versions<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<FileVersion>> {
        self.with("list_file_versions", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, false)?;
            let node = st.nodes.get(&path).ok_or_else(|| not_found(&path))?;
            Ok(st
                .versions
                .get(&node.id)
                .map(|v| v.iter().map(|v| v.info.clone()).collect())
                .unwrap_or_default())
        })
    }

    fn restore_file_version<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, ()> {
        self.with("restore_file_version", |st| {
            let path = st.resolve(r)?;
            st.check_access(s, &path, true)?;
            let id = st
                .nodes
                .get(&path)
                .map(|n| n.id.clone())
                .ok_or_else(|| not_found(&path))?;
            let versions = st.versions.entry(id).or_default();
            let i = versions
                .iter()
                .position(|v| v.info.key == key)
                .ok_or_else(|| not_found(key))?;
            let v = versions.remove(i);
            st.write_file(&path, v.data, None)
        })
    }

    fn get_user<'a>(&'a self, _s: &'a Session, id: &'a UserId) -> GwFuture<'a, User> {
        self.with("get_user", |st| {
            st.users
                .iter()
                .find(|u| u.id == *id)
                .cloned()
                .ok_or_else(|| not_found(&id.opaque_id))
        })
    }

    fn healthy(&self) -> bool {
        self.state.lock().healthy
    }
}

async fn read_body(mut body: Body) -> Result<Vec<u8>, TransferError> {
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| TransferError::Transport(e.to_string()))?;
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

impl MemGateway {
    async fn do_execute(&self, req: Request<Body>) -> Result<Response<Body>, TransferError> {
        let (parts, body) = req.into_parts();
        let data = read_body(body).await?;
        let uri = parts.uri.to_string();
        trace!("memgw: data {} {} ({} bytes)", parts.method, uri, data.len());

        let res = if uri.starts_with(DATA_ENDPOINT) {
            let token = parts
                .headers
                .get(X_REVA_TRANSFER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            self.data_simple(&parts.method, token, &parts.headers, data)
        } else if let Some(token) = uri.strip_prefix(TUS_ENDPOINT) {
            self.data_tus(&parts.method, token.trim_matches('/'), &parts.headers, data)
        } else {
            self.data_remote(&parts.method, &uri, data)
        };
        Ok(res?)
    }

    fn data_simple(
        &self,
        method: &Method,
        token: &str,
        headers: &HeaderMap,
        data: Vec<u8>,
    ) -> Result<Response<Body>, http::Error> {
        let mut st = self.state.lock();
        let transfer = match st.transfers.get(token) {
            Some(t) => t.clone(),
            None => return empty(StatusCode::FORBIDDEN),
        };
        match transfer {
            Transfer::Download { path } if *method == Method::GET => {
                let (content, etag, mtime) = match st.nodes.get(&path) {
                    Some(n) => (n.data.clone(), n.etag.clone(), n.mtime),
                    None => return empty(StatusCode::NOT_FOUND),
                };
                let len = content.len();
                let mut b = Response::builder()
                    .header(http::header::CONTENT_TYPE, davpath::mime_type(&path))
                    .header(http::header::ETAG, format!("\"{}\"", etag))
                    .header(http::header::LAST_MODIFIED, systemtime_to_httpdate(mtime))
                    .header(http::header::ACCEPT_RANGES, "bytes");
                let body = match parse_range(headers, len) {
                    Some((start, end)) => {
                        b = b
                            .status(StatusCode::PARTIAL_CONTENT)
                            .header(http::header::CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, len));
                        content[start..=end].to_vec()
                    }
                    None => content,
                };
                b.header(http::header::CONTENT_LENGTH, body.len())
                    .body(Body::from(Bytes::from(body)))
            }
            Transfer::Upload { path, length, mtime, checksum, .. } if *method == Method::PUT => {
                st.transfers.remove(token);
                if let Some(l) = length {
                    if l != data.len() as u64 {
                        return empty(StatusCode::BAD_REQUEST);
                    }
                }
                if let Some(c) = checksum {
                    if let Some(("adler32", sum)) = c.split_once(' ') {
                        if !sum.eq_ignore_ascii_case(&adler32(&data)) {
                            let mismatch = StatusCode::from_u16(419).unwrap_or(StatusCode::BAD_REQUEST);
                            return empty(mismatch);
                        }
                    }
                }
                if let Err(e) = st.write_file(&path, data, mtime) {
                    error!("memgw: upload to {} failed: {}", path, e);
                    return empty(StatusCode::CONFLICT);
                }
                let info = match st.info(&path) {
                    Ok(info) => info,
                    Err(_) => return empty(StatusCode::INTERNAL_SERVER_ERROR),
                };
                let mut b = Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::ETAG, info.quoted_etag())
                    .header(OC_ETAG, info.quoted_etag())
                    .header(OC_FILEID, info.id.to_string());
                if let Some(t) = info.mtime {
                    b = b.header(http::header::LAST_MODIFIED, systemtime_to_httpdate(t));
                }
                b.body(Body::empty())
            }
            _ => empty(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    fn data_tus(
        &self,
        method: &Method,
        token: &str,
        headers: &HeaderMap,
        data: Vec<u8>,
    ) -> Result<Response<Body>, http::Error> {
        if *method != Method::PATCH {
            return empty(StatusCode::METHOD_NOT_ALLOWED);
        }
        let mut st = self.state.lock();
        let claimed = headers
            .get(&crate::davheaders::UPLOAD_OFFSET)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let (path, done, new_offset, mtime) = match st.transfers.get_mut(token) {
            Some(Transfer::Upload { path, length, offset, buf, mtime, .. }) => {
                if claimed != Some(*offset) {
                    return empty(StatusCode::CONFLICT);
                }
                buf.extend_from_slice(&data);
                *offset += data.len() as u64;
                if length.map(|l| *offset > l).unwrap_or(false) {
                    return empty(StatusCode::BAD_REQUEST);
                }
                let done = length.map(|l| *offset == l).unwrap_or(false);
                (path.clone(), done, *offset, *mtime)
            }
            _ => return empty(StatusCode::NOT_FOUND),
        };
        if done {
            if let Some(Transfer::Upload { buf, .. }) = st.transfers.remove(token) {
                if let Err(e) = st.write_file(&path, buf, mtime) {
                    error!("memgw: tus upload to {} failed: {}", path, e);
                    return empty(StatusCode::CONFLICT);
                }
            }
        }
        let expires = SystemTime::now() + Duration::from_secs(24 * 3600);
        Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(&crate::davheaders::UPLOAD_OFFSET, new_offset)
            .header(crate::davheaders::UPLOAD_EXPIRES, systemtime_to_httpdate(expires))
            .body(Body::empty())
    }

    // Anything else is a "remote" server, for third-party copies.
    fn data_remote(&self, method: &Method, url: &str, data: Vec<u8>) -> Result<Response<Body>, http::Error> {
        let mut st = self.state.lock();
        if *method == Method::GET {
            match st.remote.get(url) {
                Some(d) => Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_LENGTH, d.len())
                    .body(Body::from(Bytes::from(d.clone()))),
                None => empty(StatusCode::NOT_FOUND),
            }
        } else if *method == Method::PUT {
            st.remote.insert(url.to_string(), data);
            empty(StatusCode::CREATED)
        } else {
            empty(StatusCode::METHOD_NOT_ALLOWED)
        }
    }
}

impl DataClient for MemGateway {
    fn execute<'a>(
        &'a self,
        req: Request<Body>,
    ) -> BoxFuture<'a, Result<Response<Body>, TransferError>> {
        self.do_execute(req).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksums() {
        assert_eq!(adler32(b"Wikipedia"), "11e60398");
        assert_eq!(adler32(b""), "00000001");
    }

    #[test]
    fn ranges() {
        let mut h = HeaderMap::new();
        assert_eq!(parse_range(&h, 10), None);
        h.insert(http::header::RANGE, "bytes=2-4".parse().unwrap());
        assert_eq!(parse_range(&h, 10), Some((2, 4)));
        h.insert(http::header::RANGE, "bytes=8-".parse().unwrap());
        assert_eq!(parse_range(&h, 10), Some((8, 9)));
        h.insert(http::header::RANGE, "bytes=5-1".parse().unwrap());
        assert_eq!(parse_range(&h, 10), None);
    }

    #[tokio::test]
    async fn homes_and_access() {
        let gw = MemGateway::new();
        let alice = gw.session("alice");
        gw.session("bob");
        gw.put_file("/users/bob/secret.txt", b"x");

        let info = gw
            .stat(&alice, &Reference::from_path("/users/alice"))
            .await
            .unwrap();
        assert!(info.is_dir());
        let space = info.space.unwrap();
        assert_eq!(space.mount_path, "/users/alice");
        assert_eq!(space.root.opaque_id, info.id.opaque_id);

        let e = gw
            .stat(&alice, &Reference::from_path("/users/bob/secret.txt"))
            .await
            .unwrap_err();
        assert!(e.is(Code::PermissionDenied));
        let e = gw
            .stat(&alice, &Reference::from_path("/users/bob/nope"))
            .await
            .unwrap_err();
        assert!(e.is(Code::NotFound));
    }

    #[tokio::test]
    async fn delete_and_restore() {
        let gw = MemGateway::new();
        let s = gw.session("alice");
        gw.put_file("/users/alice/d/f.txt", b"hello");
        let d = Reference::from_path("/users/alice/d");
        gw.delete(&s, &d, None).await.unwrap();
        assert!(!gw.exists("/users/alice/d/f.txt"));

        let home = Reference::from_path("/users/alice");
        let items = gw.list_recycle(&s, &home, "").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].original_path, "/d");
        assert_eq!(items[0].resource_type, ResourceType::Container);
        let inner = gw.list_recycle(&s, &home, &items[0].key).await.unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].key, format!("{}/f.txt", items[0].key));

        let dst = Reference::from_path("/users/alice/back");
        gw.restore_recycle_item(&s, &home, &items[0].key, &dst)
            .await
            .unwrap();
        assert_eq!(gw.read_file("/users/alice/back/f.txt").unwrap(), b"hello");
        assert!(gw.list_recycle(&s, &home, "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn uploads_make_versions() {
        let gw = MemGateway::new();
        let s = gw.session("alice");
        gw.put_file("/users/alice/a.txt", b"one");
        let r = Reference::from_path("/users/alice/a.txt");
        let mut opaque = Opaque::new();
        opaque.insert("Upload-Length".to_string(), "3".to_string());
        let up = gw
            .initiate_file_upload(
                &s,
                &UploadRequest {
                    reference: r.clone(),
                    opaque,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!up.created());
        let p = select_protocol(&up.protocols, "simple").unwrap();
        let req = Request::builder()
            .method(Method::PUT)
            .uri(p.endpoint.as_str())
            .header(X_REVA_TRANSFER, p.token.as_str())
            .body(Body::from("two"))
            .unwrap();
        let res = gw.execute(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(gw.read_file("/users/alice/a.txt").unwrap(), b"two");

        let versions = gw.list_file_versions(&s, &r).await.unwrap();
        assert_eq!(versions.len(), 1);
        gw.restore_file_version(&s, &r, &versions[0].key).await.unwrap();
        assert_eq!(gw.read_file("/users/alice/a.txt").unwrap(), b"one");
    }
}
