//
// Resolution of global paths to space relative references.
//
use crate::davpath;
use crate::gateway::{
    Code, GatewayClient, GwError, GwResult, Reference, ResourceInfo, Session, StorageSpace, UserId,
};

/// Find the space a path lives in. The path itself does not have to
/// exist: on `NotFound` we walk up until an ancestor can be stat'ed.
pub(crate) async fn lookup_space_for_path(
    gw: &dyn GatewayClient,
    s: &Session,
    path: &str,
) -> GwResult<Option<StorageSpace>> {
    let mut p = davpath::clean(path);
    loop {
        match gw.stat(s, &Reference::from_path(p.as_str())).await {
            Ok(info) => return Ok(info.space),
            Err(e) if e.is(Code::NotFound) && p != "/" => {
                trace!("lookup_space_for_path: {} not found, trying parent", p);
                p = davpath::dirname(&p);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Reference for a global path, relative to its space when the gateway
/// told us the space.
pub(crate) async fn lookup_reference_for_path(
    gw: &dyn GatewayClient,
    s: &Session,
    path: &str,
) -> GwResult<Reference> {
    Ok(match lookup_space_for_path(gw, s, path).await? {
        Some(space) => make_relative_reference(&space, path),
        None => Reference::from_path(davpath::clean(path)),
    })
}

/// `{root id, "./<path below the mount point>"}`.
pub(crate) fn make_relative_reference(space: &StorageSpace, path: &str) -> Reference {
    let path = davpath::clean(path);
    let mount = space.mount_path.trim_end_matches('/');
    let rel = if mount.is_empty() {
        path.as_str()
    } else {
        match path.strip_prefix(mount) {
            Some(rel) if rel.is_empty() || rel.starts_with('/') => rel,
            _ => return Reference::from_path(path),
        }
    };
    Reference::from_id(space.root.clone(), format!(".{}", rel))
}

// Get a session for the owner of a resource.
async fn impersonate(
    gw: &dyn GatewayClient,
    owner: Option<&UserId>,
    machine_auth_api_key: &str,
) -> GwResult<Session> {
    if machine_auth_api_key.is_empty() {
        return Err(GwError::NotSupported(
            "machine auth api key is not configured".to_string(),
        ));
    }
    let owner = owner.ok_or_else(|| GwError::new(Code::Internal, "resource has no owner"))?;
    let client_id = format!("userid:{}", owner.opaque_id);
    let res = gw
        .authenticate("machine", &client_id, machine_auth_api_key)
        .await?;
    Ok(Session::new(res.user, res.token))
}

async fn path_as_owner(
    gw: &dyn GatewayClient,
    info: &ResourceInfo,
    machine_auth_api_key: &str,
) -> GwResult<String> {
    let owner_session = impersonate(gw, info.owner.as_ref(), machine_auth_api_key).await?;
    gw.get_path(&owner_session, &info.id).await
}

fn with_slash(p: &str) -> String {
    format!("{}/", p.trim_end_matches('/'))
}

/// Does `child` point at `parent` or something below it.
pub(crate) async fn reference_is_child_of(
    gw: &dyn GatewayClient,
    s: &Session,
    machine_auth_api_key: &str,
    child: &Reference,
    parent: &Reference,
) -> GwResult<bool> {
    let (cid, pid) = match (&child.resource_id, &parent.resource_id) {
        (Some(c), Some(p)) => (c, p),
        (None, None) => return Ok(with_slash(&child.path).starts_with(&with_slash(&parent.path))),
        // mixed modes never happen after resolution.
        _ => return Ok(false),
    };
    if cid.space_id != pid.space_id {
        return Ok(false);
    }
    if cid == pid {
        return Ok(with_slash(&child.path).starts_with(&with_slash(&parent.path)));
    }

    if cid.is_share_jail() || pid.is_share_jail() {
        let parent_info = gw.stat(s, parent).await?;
        let parent_path = path_as_owner(gw, &parent_info, machine_auth_api_key).await?;

        let child_info = match gw.stat(s, child).await {
            Err(e) if e.is(Code::NotFound) && child.path != "." => {
                gw.stat(s, &child.parent()).await?
            }
            res => res?,
        };
        let child_path = path_as_owner(gw, &child_info, machine_auth_api_key).await?;
        return Ok(with_slash(&child_path).starts_with(&with_slash(&parent_path)));
    }

    let child_root = match gw.get_path(s, cid).await {
        Ok(p) => p,
        Err(e) if e.is(Code::Unimplemented) => return Ok(false),
        Err(e) => return Err(e),
    };
    let parent_root = gw.get_path(s, pid).await?;
    let cp = davpath::join(&child_root, &child.path);
    let pp = davpath::join(&parent_root, &parent.path);
    Ok(with_slash(&cp).starts_with(&with_slash(&pp)))
}
