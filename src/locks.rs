//! Locks, as kept by the gateway.
//!
//! There is no local lock state. A WebDAV lock is a gateway lock with
//! a `urn:uuid:` id; the [`LockManager`] translates between the two
//! views.
use std::error::Error;
use std::time::{Duration, SystemTime};

use http::StatusCode;

use crate::gateway::{Code, GatewayClient, GwError, Lock, LockType, Reference, Session, UserId};

pub(crate) const LOCK_TOKEN_PREFIX: &str = "urn:uuid:";

/// Lock failures, as seen by the WebDAV handlers.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LockError {
    /// The resource is locked by someone else.
    Locked(String),
    /// The token does not match any lock on the resource.
    NoSuchLock(String),
    Forbidden,
    /// Lock refresh.
    NotImplemented,
    Gateway(GwError),
}

impl LockError {
    pub(crate) fn statuscode(&self) -> StatusCode {
        match self {
            LockError::Locked(_) => StatusCode::LOCKED,
            LockError::NoSuchLock(_) => StatusCode::CONFLICT,
            LockError::Forbidden => StatusCode::FORBIDDEN,
            LockError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            LockError::Gateway(GwError::Status(s)) => crate::errors::code_to_status(s.code),
            LockError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error for LockError {}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LockError::Locked(m) | LockError::NoSuchLock(m) => write!(f, "{}", m),
            LockError::Forbidden => write!(f, "forbidden"),
            LockError::NotImplemented => write!(f, "lock refresh is not implemented"),
            LockError::Gateway(e) => write!(f, "{}", e),
        }
    }
}

impl From<GwError> for LockError {
    fn from(e: GwError) -> Self {
        LockError::Gateway(e)
    }
}

/// The WebDAV view of a lock.
#[derive(Debug, Clone, Default)]
pub(crate) struct LockDetails {
    pub token: String,
    /// Serialized content of the `owner` element, if any.
    pub owner_xml: String,
    pub user: Option<UserId>,
    /// Href of the locked resource.
    pub root: String,
    pub depth_zero: bool,
    /// `None` is infinite.
    pub timeout: Option<Duration>,
}

/// Creates and removes locks on the gateway on behalf of one caller.
pub(crate) struct LockManager<'a> {
    gw: &'a (dyn GatewayClient + 'static),
    session: &'a Session,
}

impl<'a> LockManager<'a> {
    pub(crate) fn new(gw: &'a (dyn GatewayClient + 'static), session: &'a Session) -> LockManager<'a> {
        LockManager { gw, session }
    }

    /// Take an exclusive lock. On success `details.token` is set, and the
    /// returned guard releases the lock again unless it is committed.
    pub(crate) async fn create(
        &self,
        r: &Reference,
        details: &mut LockDetails,
    ) -> Result<LockGuard, LockError> {
        let token = format!("{}{}", LOCK_TOKEN_PREFIX, uuid::Uuid::new_v4());
        let lock = Lock {
            lock_id: token.clone(),
            lock_type: LockType::Exclusive,
            user: details.user.clone(),
            app_name: String::new(),
            expiration: details
                .timeout
                .filter(|d| !d.is_zero())
                .map(|d| SystemTime::now() + d),
        };
        match self.gw.set_lock(self.session, r, &lock).await {
            Ok(()) => {}
            Err(e) if e.is(Code::FailedPrecondition) => {
                return Err(LockError::Locked("file is already locked".to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        details.token = token;
        Ok(LockGuard {
            gw: dyn_clone::clone_box(self.gw),
            session: self.session.clone(),
            reference: r.clone(),
            lock: Some(lock),
        })
    }

    /// Extend a lock. The gateway has no refresh call.
    pub(crate) async fn refresh(
        &self,
        _r: &Reference,
        token: &str,
        _timeout: Option<Duration>,
    ) -> Result<LockDetails, LockError> {
        debug!("lock refresh for {} refused", token);
        Err(LockError::NotImplemented)
    }

    pub(crate) async fn unlock(&self, r: &Reference, token: &str) -> Result<(), LockError> {
        let lock = Lock {
            lock_id: token.to_string(),
            lock_type: LockType::Exclusive,
            user: self.session.user_id().cloned(),
            app_name: String::new(),
            expiration: None,
        };
        match self.gw.unlock(self.session, r, &lock).await {
            Ok(()) => Ok(()),
            Err(e) => match e.code() {
                Some(Code::FailedPrecondition) => {
                    Err(LockError::NoSuchLock("file is not locked".to_string()))
                }
                Some(Code::PermissionDenied) => Err(LockError::Forbidden),
                Some(Code::Locked) => Err(LockError::Locked(e.to_string())),
                _ => Err(e.into()),
            },
        }
    }
}

/// Releases a freshly taken lock when the request that took it fails.
#[derive(Debug)]
pub(crate) struct LockGuard {
    gw: Box<dyn GatewayClient>,
    session: Session,
    reference: Reference,
    lock: Option<Lock>,
}

impl LockGuard {
    /// Keep the lock.
    pub(crate) fn commit(mut self) {
        self.lock.take();
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let gw = self.gw.clone();
        let session = self.session.clone();
        let reference = self.reference.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gw.unlock(&session, &reference, &lock).await {
                        error!("could not unlock {} after failed lock: {}", reference, e);
                    }
                });
            }
            Err(_) => error!("no runtime, lock {} on {} stays", lock.lock_id, reference),
        }
    }
}

#[cfg(all(test, feature = "memgw"))]
mod tests {
    use super::*;
    use crate::gateway::User;
    use crate::memgw::MemGateway;

    fn alice(gw: &MemGateway) -> Session {
        let user: User = gw.add_user("alice");
        Session::new(user, "token-alice")
    }

    #[tokio::test]
    async fn create_and_unlock() {
        let gw = MemGateway::new();
        let s = alice(&gw);
        gw.put_file("/users/alice/a.txt", b"hello");
        let r = Reference::from_path("/users/alice/a.txt");
        let lm = LockManager::new(&gw, &s);

        let mut details = LockDetails {
            user: s.user_id().cloned(),
            ..Default::default()
        };
        let guard = lm.create(&r, &mut details).await.unwrap();
        guard.commit();
        assert!(details.token.starts_with(LOCK_TOKEN_PREFIX));

        let mut other = LockDetails::default();
        let e = lm.create(&r, &mut other).await.unwrap_err();
        assert_eq!(e.statuscode(), StatusCode::LOCKED);

        let e = lm.unlock(&r, "urn:uuid:nope").await.unwrap_err();
        assert_eq!(e.statuscode(), StatusCode::CONFLICT);
        lm.unlock(&r, &details.token).await.unwrap();
    }

    #[tokio::test]
    async fn guard_releases() {
        let gw = MemGateway::new();
        let s = alice(&gw);
        gw.put_file("/users/alice/a.txt", b"hello");
        let r = Reference::from_path("/users/alice/a.txt");
        let lm = LockManager::new(&gw, &s);

        let mut details = LockDetails::default();
        let guard = lm.create(&r, &mut details).await.unwrap();
        drop(guard);
        // the unlock runs on a spawned task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(gw.calls().iter().any(|c| c == "unlock"));
        let mut again = LockDetails::default();
        assert!(lm.create(&r, &mut again).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_refused() {
        let gw = MemGateway::new();
        let s = alice(&gw);
        let lm = LockManager::new(&gw, &s);
        let r = Reference::from_path("/users/alice");
        let e = lm.refresh(&r, "urn:uuid:x", None).await.unwrap_err();
        assert_eq!(e, LockError::NotImplemented);
    }
}
