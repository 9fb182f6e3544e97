//! Data model and the outbound gateway interface.
//!
//! Every storage operation the WebDAV handlers perform is a call on
//! a [`GatewayClient`]. The client is the RPC edge to the storage
//! gateway; the crate never touches storage itself.
//!
//! All calls carry the caller's [`Session`], which is the gateway
//! equivalent of the credentials a guarded filesystem gets.
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use dyn_clone::DynClone;
use futures_util::future::{self, BoxFuture, FutureExt};

/// Result of a gateway call.
pub type GwResult<T> = Result<T, GwError>;

/// Future returned by the methods of [`GatewayClient`].
pub type GwFuture<'a, T> = BoxFuture<'a, GwResult<T>>;

/// Opaque key/value map attached to requests and resources.
pub type Opaque = BTreeMap<String, String>;

/// Storage provider id under which public links are mounted.
pub const PUBLIC_STORAGE_PROVIDER_ID: &str = "7993447f-687f-490d-875c-ac95e89a62a4";
/// Space id under which public links are mounted.
pub const PUBLIC_STORAGE_SPACE_ID: &str = "7993447f-687f-490d-875c-ac95e89a62a4";
/// Storage and space id of the virtual "shares" space.
pub const SHARE_JAIL_ID: &str = "a0ca6a90-a365-4782-871e-d44447bbc668";

/// Closed set of status codes a gateway call can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok,
    NotFound,
    PermissionDenied,
    Aborted,
    FailedPrecondition,
    AlreadyExists,
    Unimplemented,
    Internal,
    Unauthenticated,
    InvalidArgument,
    Locked,
    InsufficientStorage,
}

/// Status returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcStatus {
    pub code: Code,
    pub message: String,
}

/// Error returned by a gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum GwError {
    /// The gateway answered with a non-OK status.
    Status(RpcStatus),
    /// The gateway could not be reached.
    Transport(String),
    /// The operation cannot be expressed with the current configuration.
    NotSupported(String),
}

impl GwError {
    pub fn new(code: Code, message: impl Into<String>) -> GwError {
        GwError::Status(RpcStatus {
            code,
            message: message.into(),
        })
    }

    /// The status code, if the gateway answered at all.
    pub fn code(&self) -> Option<Code> {
        match self {
            GwError::Status(s) => Some(s.code),
            _ => None,
        }
    }

    pub fn is(&self, code: Code) -> bool {
        self.code() == Some(code)
    }
}

impl std::error::Error for GwError {}

impl fmt::Display for GwError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GwError::Status(s) => write!(f, "gateway status {:?}: {}", s.code, s.message),
            GwError::Transport(e) => write!(f, "gateway transport error: {}", e),
            GwError::NotSupported(e) => write!(f, "not supported: {}", e),
        }
    }
}

/// Identifier of a resource inside a storage space.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
}

impl ResourceId {
    pub fn new(
        storage_id: impl Into<String>,
        space_id: impl Into<String>,
        opaque_id: impl Into<String>,
    ) -> ResourceId {
        ResourceId {
            storage_id: storage_id.into(),
            space_id: space_id.into(),
            opaque_id: opaque_id.into(),
        }
    }

    /// Parse `storage$space!opaque`. The `$storage` part is optional.
    pub fn parse(s: &str) -> Option<ResourceId> {
        let (storage, opaque) = match s.split_once('!') {
            Some((st, op)) => (st, op),
            None => (s, ""),
        };
        if storage.is_empty() {
            return None;
        }
        let (storage_id, space_id) = match storage.split_once('$') {
            Some((st, sp)) => (st, sp),
            None => ("", storage),
        };
        Some(ResourceId::new(storage_id, space_id, opaque))
    }

    /// `storage$space`, the value of `oc:spaceid`.
    pub fn storage_space_id(&self) -> String {
        if self.storage_id.is_empty() {
            self.space_id.clone()
        } else {
            format!("{}${}", self.storage_id, self.space_id)
        }
    }

    /// Same space as `other`.
    pub fn same_space(&self, other: &ResourceId) -> bool {
        self.storage_id == other.storage_id && self.space_id == other.space_id
    }

    pub fn is_share_jail(&self) -> bool {
        self.storage_id == SHARE_JAIL_ID && self.space_id == SHARE_JAIL_ID
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}!{}", self.storage_space_id(), self.opaque_id)
    }
}

/// A reference to a resource.
///
/// Without a resource id, `path` is an absolute path in the global
/// namespace. With a resource id, `path` is relative to that resource
/// and starts with `.`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reference {
    pub resource_id: Option<ResourceId>,
    pub path: String,
}

impl Reference {
    pub fn from_path(path: impl Into<String>) -> Reference {
        Reference {
            resource_id: None,
            path: path.into(),
        }
    }

    pub fn from_id(id: ResourceId, path: impl Into<String>) -> Reference {
        Reference {
            resource_id: Some(id),
            path: path.into(),
        }
    }

    /// Reference to a direct child by name.
    pub fn child(&self, name: &str) -> Reference {
        let path = if self.path.ends_with('/') {
            format!("{}{}", self.path, name)
        } else {
            format!("{}/{}", self.path, name)
        };
        Reference {
            resource_id: self.resource_id.clone(),
            path,
        }
    }

    /// Reference to the parent. The root of a space is its own parent.
    pub fn parent(&self) -> Reference {
        let path = match self.path.rfind('/') {
            Some(0) => "/".to_string(),
            Some(idx) => self.path[..idx].to_string(),
            None => self.path.clone(),
        };
        Reference {
            resource_id: self.resource_id.clone(),
            path,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.resource_id {
            Some(ref id) => write!(f, "{}:{}", id, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    #[default]
    File,
    Container,
}

/// A content checksum, e.g. `sha1` / `da39a3ee...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    pub kind: String,
    pub sum: String,
}

/// Permission set of a resource for the current caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Permissions {
    pub stat: bool,
    pub list_container: bool,
    pub initiate_file_download: bool,
    pub initiate_file_upload: bool,
    pub create_container: bool,
    pub delete: bool,
    pub move_: bool,
    pub add_grant: bool,
    pub list_recycle: bool,
    pub restore_recycle_item: bool,
    pub purge_recycle: bool,
    pub list_file_versions: bool,
    pub restore_file_version: bool,
}

impl Permissions {
    /// Everything allowed; what an owner gets.
    pub fn all() -> Permissions {
        Permissions {
            stat: true,
            list_container: true,
            initiate_file_download: true,
            initiate_file_upload: true,
            create_container: true,
            delete: true,
            move_: true,
            add_grant: true,
            list_recycle: true,
            restore_recycle_item: true,
            purge_recycle: true,
            list_file_versions: true,
            restore_file_version: true,
        }
    }

    /// Read only.
    pub fn viewer() -> Permissions {
        Permissions {
            stat: true,
            list_container: true,
            initiate_file_download: true,
            list_file_versions: true,
            ..Default::default()
        }
    }

    /// The ownCloud `oc:permissions` / `OC-Perm` flag string.
    pub fn webdav_flags(&self, is_dir: bool, is_shared: bool, is_mountpoint: bool) -> String {
        let mut s = String::new();
        if is_shared {
            s.push('S');
        }
        if self.add_grant {
            s.push('R');
        }
        if is_mountpoint {
            s.push('M');
        }
        if self.delete {
            s.push('D');
        }
        if self.move_ {
            s.push_str("NV");
        }
        if is_dir {
            if self.initiate_file_upload {
                s.push('C');
            }
            if self.create_container {
                s.push('K');
            }
        } else if self.initiate_file_upload {
            s.push('W');
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
    Write,
}

/// A lock as the backend sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub lock_id: String,
    pub lock_type: LockType,
    pub user: Option<UserId>,
    pub app_name: String,
    pub expiration: Option<SystemTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UserId {
    pub idp: String,
    pub opaque_id: String,
}

impl UserId {
    pub fn new(idp: impl Into<String>, opaque_id: impl Into<String>) -> UserId {
        UserId {
            idp: idp.into(),
            opaque_id: opaque_id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub display_name: String,
    pub mail: String,
}

/// The authenticated caller. Passed to every gateway call.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub user: Option<User>,
    pub token: String,
}

impl Session {
    pub fn anonymous() -> Session {
        Session::default()
    }

    pub fn new(user: User, token: impl Into<String>) -> Session {
        Session {
            user: Some(user),
            token: token.into(),
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user.as_ref().map(|u| &u.id)
    }

    pub fn username(&self) -> &str {
        self.user.as_ref().map(|u| u.username.as_str()).unwrap_or("")
    }
}

/// Handle to the storage space a resource lives in.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSpace {
    pub root: ResourceId,
    pub mount_path: String,
    pub space_type: String,
    pub owner: Option<UserId>,
}

/// Metadata snapshot of a resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceInfo {
    pub resource_type: ResourceType,
    pub id: ResourceId,
    pub parent_id: Option<ResourceId>,
    pub path: String,
    pub name: String,
    pub size: u64,
    pub etag: String,
    pub mime_type: String,
    pub checksum: Option<Checksum>,
    pub mtime: Option<SystemTime>,
    pub owner: Option<UserId>,
    pub permissions: Permissions,
    pub opaque: Opaque,
    pub arbitrary_metadata: BTreeMap<String, String>,
    pub lock: Option<Lock>,
    pub space: Option<StorageSpace>,
}

impl ResourceInfo {
    pub fn is_dir(&self) -> bool {
        self.resource_type == ResourceType::Container
    }

    /// Quoted etag as sent in headers.
    pub fn quoted_etag(&self) -> String {
        if self.etag.starts_with('"') {
            self.etag.clone()
        } else {
            format!("\"{}\"", self.etag)
        }
    }
}

/// Data-plane endpoint handed out by the initiate calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Protocol {
    pub protocol: String,
    pub endpoint: String,
    pub token: String,
    pub expose: bool,
}

/// Select a protocol by name.
pub fn select_protocol<'a>(protocols: &'a [Protocol], name: &str) -> Option<&'a Protocol> {
    protocols.iter().find(|p| p.protocol == name)
}

/// Answer to an upload initiation.
#[derive(Debug, Clone, Default)]
pub struct UploadResponse {
    pub protocols: Vec<Protocol>,
    /// Carries `created = "true"` when the upload creates a new file.
    pub opaque: Opaque,
}

impl UploadResponse {
    pub fn created(&self) -> bool {
        self.opaque.get("created").map(|v| v == "true").unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub reference: Reference,
    pub opaque: Opaque,
    pub if_match: Option<String>,
    pub lock_id: Option<String>,
}

/// An entry of the trash bin.
#[derive(Debug, Clone, PartialEq)]
pub struct RecycleItem {
    pub key: String,
    pub original_path: String,
    pub deletion_time: SystemTime,
    pub size: u64,
    pub resource_type: ResourceType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileVersion {
    pub key: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

// Default implementation of optional calls.
macro_rules! unimplemented_rpc {
    ($method:expr) => {{
        let msg = format!("{} is not implemented", $method);
        future::ready(Err(GwError::new(Code::Unimplemented, msg))).boxed()
    }};
}

/// The storage gateway.
///
/// The core calls must be implemented; trash, versions, metadata and
/// user lookups default to `Unimplemented`.
pub trait GatewayClient: fmt::Debug + Send + Sync + DynClone {
    /// Metadata of a resource.
    fn stat<'a>(&'a self, s: &'a Session, r: &'a Reference) -> GwFuture<'a, ResourceInfo>;

    fn create_container<'a>(&'a self, s: &'a Session, r: &'a Reference) -> GwFuture<'a, ()>;

    fn list_container<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<ResourceInfo>>;

    fn delete<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()>;

    fn move_resource<'a>(
        &'a self,
        s: &'a Session,
        src: &'a Reference,
        dst: &'a Reference,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()>;

    fn initiate_file_upload<'a>(
        &'a self,
        s: &'a Session,
        req: &'a UploadRequest,
    ) -> GwFuture<'a, UploadResponse>;

    fn initiate_file_download<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<Protocol>>;

    /// Create an empty file.
    fn touch_file<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        opaque: &'a Opaque,
    ) -> GwFuture<'a, ()>;

    fn set_lock<'a>(&'a self, s: &'a Session, r: &'a Reference, lock: &'a Lock)
        -> GwFuture<'a, ()>;

    fn unlock<'a>(&'a self, s: &'a Session, r: &'a Reference, lock: &'a Lock) -> GwFuture<'a, ()>;

    /// Resolve a resource id to an absolute path.
    fn get_path<'a>(&'a self, s: &'a Session, id: &'a ResourceId) -> GwFuture<'a, String>;

    /// Authenticate. Does not need a session.
    fn authenticate<'a>(
        &'a self,
        kind: &'a str,
        client_id: &'a str,
        secret: &'a str,
    ) -> GwFuture<'a, AuthResponse>;

    #[allow(unused_variables)]
    fn set_arbitrary_metadata<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        md: &'a BTreeMap<String, String>,
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        unimplemented_rpc!("set_arbitrary_metadata")
    }

    #[allow(unused_variables)]
    fn unset_arbitrary_metadata<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        keys: &'a [String],
        lock_id: Option<&'a str>,
    ) -> GwFuture<'a, ()> {
        unimplemented_rpc!("unset_arbitrary_metadata")
    }

    /// List the trash of the space `r` points at. An empty key lists
    /// the top level, otherwise the contents of a deleted folder.
    #[allow(unused_variables)]
    fn list_recycle<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, Vec<RecycleItem>> {
        unimplemented_rpc!("list_recycle")
    }

    #[allow(unused_variables)]
    fn restore_recycle_item<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
        restore_ref: &'a Reference,
    ) -> GwFuture<'a, ()> {
        unimplemented_rpc!("restore_recycle_item")
    }

    /// Purge one item, or the whole trash if `key` is empty.
    #[allow(unused_variables)]
    fn purge_recycle<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, ()> {
        unimplemented_rpc!("purge_recycle")
    }

    #[allow(unused_variables)]
    fn list_file_versions<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
    ) -> GwFuture<'a, Vec<FileVersion>> {
        unimplemented_rpc!("list_file_versions")
    }

    #[allow(unused_variables)]
    fn restore_file_version<'a>(
        &'a self,
        s: &'a Session,
        r: &'a Reference,
        key: &'a str,
    ) -> GwFuture<'a, ()> {
        unimplemented_rpc!("restore_file_version")
    }

    #[allow(unused_variables)]
    fn get_user<'a>(&'a self, s: &'a Session, id: &'a UserId) -> GwFuture<'a, User> {
        unimplemented_rpc!("get_user")
    }

    /// Health probe used by the client pool.
    fn healthy(&self) -> bool {
        true
    }
}

dyn_clone::clone_trait_object!(GatewayClient);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_format() {
        let id = ResourceId::new("st", "sp", "op");
        assert_eq!(id.to_string(), "st$sp!op");
        assert_eq!(id.storage_space_id(), "st$sp");
        assert_eq!(ResourceId::parse("st$sp!op"), Some(id));

        let id = ResourceId::parse("sp!op").unwrap();
        assert_eq!(id.storage_id, "");
        assert_eq!(id.space_id, "sp");
        assert_eq!(id.to_string(), "sp!op");

        assert!(ResourceId::parse("").is_none());
        assert!(ResourceId::parse("!op").is_none());
    }

    #[test]
    fn reference_navigation() {
        let r = Reference::from_path("/users/alice/a");
        assert_eq!(r.child("b").path, "/users/alice/a/b");
        assert_eq!(r.parent().path, "/users/alice");
        assert_eq!(Reference::from_path("/a").parent().path, "/");

        let r = Reference::from_id(ResourceId::new("s", "s", "s"), ".");
        assert_eq!(r.child("x").path, "./x");
        assert_eq!(r.child("x").parent().path, ".");
    }

    #[test]
    fn permission_flags() {
        let p = Permissions::all();
        assert_eq!(p.webdav_flags(true, false, false), "RDNVCK");
        assert_eq!(p.webdav_flags(false, true, false), "SRDNVW");
        assert_eq!(Permissions::viewer().webdav_flags(false, false, true), "M");
    }
}
