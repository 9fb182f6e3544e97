//! Favorites subsystem.
//!
//! Favorites are kept outside the storage gateway. The handlers only
//! need to flag, unflag and list them per user.
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use dyn_clone::DynClone;
use futures_util::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::gateway::{GwResult, ResourceId, ResourceInfo, UserId};

/// Per-user favorite flags.
pub trait FavoritesManager: Debug + Send + Sync + DynClone {
    fn set_favorite<'a>(
        &'a self,
        user: &'a UserId,
        info: &'a ResourceInfo,
    ) -> BoxFuture<'a, GwResult<()>>;

    fn unset_favorite<'a>(
        &'a self,
        user: &'a UserId,
        info: &'a ResourceInfo,
    ) -> BoxFuture<'a, GwResult<()>>;

    /// Ids of all resources the user flagged.
    fn list_favorites<'a>(&'a self, user: &'a UserId) -> BoxFuture<'a, GwResult<Vec<ResourceId>>>;
}

dyn_clone::clone_trait_object!(FavoritesManager);

/// In-memory favorites.
#[derive(Debug, Clone, Default)]
pub struct MemFavorites {
    favs: Arc<Mutex<HashMap<UserId, HashSet<ResourceId>>>>,
}

impl MemFavorites {
    pub fn new() -> Box<MemFavorites> {
        Box::new(MemFavorites::default())
    }

    pub fn is_favorite(&self, user: &UserId, id: &ResourceId) -> bool {
        self.favs
            .lock()
            .get(user)
            .map(|set| set.contains(id))
            .unwrap_or(false)
    }
}

impl FavoritesManager for MemFavorites {
    fn set_favorite<'a>(
        &'a self,
        user: &'a UserId,
        info: &'a ResourceInfo,
    ) -> BoxFuture<'a, GwResult<()>> {
        trace!("favorites: set {} for {:?}", info.id, user);
        self.favs
            .lock()
            .entry(user.clone())
            .or_default()
            .insert(info.id.clone());
        future::ready(Ok(())).boxed()
    }

    fn unset_favorite<'a>(
        &'a self,
        user: &'a UserId,
        info: &'a ResourceInfo,
    ) -> BoxFuture<'a, GwResult<()>> {
        trace!("favorites: unset {} for {:?}", info.id, user);
        if let Some(set) = self.favs.lock().get_mut(user) {
            set.remove(&info.id);
        }
        future::ready(Ok(())).boxed()
    }

    fn list_favorites<'a>(&'a self, user: &'a UserId) -> BoxFuture<'a, GwResult<Vec<ResourceId>>> {
        let mut ids = self
            .favs
            .lock()
            .get(user)
            .map(|set| set.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        future::ready(Ok(ids)).boxed()
    }
}
