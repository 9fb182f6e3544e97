//! Short-lived cache of user lookups.
//!
//! Owner columns in PROPFIND answers need the display name of the
//! owner of every listed resource, which would otherwise be one
//! `get_user` call per entry.
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::gateway::{User, UserId};

const DEFAULT_CAPACITY: usize = 1024;

/// Default time to live of a cached user.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// TTL cache of users keyed by `idp/opaque_id`.
#[derive(Debug, Clone)]
pub struct IdentifierCache {
    inner: Arc<Mutex<LruCache<String, (Instant, User)>>>,
    ttl: Duration,
}

fn key(id: &UserId) -> String {
    format!("{}/{}", id.idp, id.opaque_id)
}

impl IdentifierCache {
    pub fn new(ttl: Duration) -> IdentifierCache {
        let cap = NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        IdentifierCache {
            inner: Arc::new(Mutex::new(LruCache::new(cap))),
            ttl,
        }
    }

    pub fn get(&self, id: &UserId) -> Option<User> {
        self.get_at(id, Instant::now())
    }

    pub fn insert(&self, user: User) {
        self.insert_at(user, Instant::now())
    }

    fn get_at(&self, id: &UserId, now: Instant) -> Option<User> {
        let k = key(id);
        let mut cache = self.inner.lock();
        let expired = match cache.get(&k) {
            Some((at, user)) if now.duration_since(*at) < self.ttl => return Some(user.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            trace!("identifier cache: {} expired", k);
            cache.pop(&k);
        }
        None
    }

    fn insert_at(&self, user: User, now: Instant) {
        self.inner.lock().put(key(&user.id), (now, user));
    }
}

impl Default for IdentifierCache {
    fn default() -> Self {
        IdentifierCache::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str) -> User {
        User {
            id: UserId::new("idp", name),
            username: name.to_string(),
            display_name: name.to_uppercase(),
            mail: String::new(),
        }
    }

    #[test]
    fn entries_expire() {
        let cache = IdentifierCache::new(Duration::from_secs(60));
        let t0 = Instant::now();
        cache.insert_at(user("bob"), t0);

        let id = UserId::new("idp", "bob");
        let hit = cache.get_at(&id, t0 + Duration::from_secs(59));
        assert_eq!(hit.map(|u| u.display_name), Some("BOB".to_string()));
        assert!(cache.get_at(&id, t0 + Duration::from_secs(60)).is_none());
        // evicted, stays gone.
        assert!(cache.get_at(&id, t0).is_none());
    }

    #[test]
    fn miss() {
        let cache = IdentifierCache::default();
        assert!(cache.get(&UserId::new("idp", "nobody")).is_none());
    }
}
