#![doc(html_root_url = "https://docs.rs/dav-gateway/0.1.0")]
//! ## WebDAV and TUS gateway in front of a CS3-style storage gateway.
//!
//! This crate translates the ownCloud flavour of WebDAV (plus TUS
//! resumable uploads and HTTP third-party copy) into calls on a
//! storage gateway. It keeps no storage state of its own: every
//! operation ends up as one or more calls on a [`GatewayClient`],
//! and file content moves through the data endpoints that the
//! gateway hands out, via a [`DataClient`].
//!
//! The entry point is [`DavHandler`]. It takes an `http::Request`
//! with any `http_body::Body` and returns an `http::Response<Body>`,
//! so it plugs into hyper or any other server built on the `http`
//! crate.
//!
//! ## Namespaces.
//!
//! - `/webdav/...` and `/dav/files/{user}/...`: the home of the caller.
//! - `/dav/spaces/{spaceid}/...`: a storage space, addressed by id.
//! - `/dav/public-files/{token}/...`: a public link.
//! - `/dav/trash-bin/{user}/...`: the trash bin of the caller.
//! - `/dav/meta/{fileid}/v/...`: the versions of a file.
//!
//! Everything can be prefixed with `remote.php`, and the handler
//! itself can live under a prefix (see [`DavConfig::strip_prefix`]).
//!
//! ## Backends.
//!
//! - [`MemGateway`](memgw::MemGateway): an in-memory gateway that
//!   implements both [`GatewayClient`] and [`DataClient`]. It is meant
//!   for tests and demos.
//! - [`HttpDataClient`]: moves bytes to and from real data endpoints
//!   using `reqwest`.
//!
//! The RPC client for a real gateway is supplied by the user of
//! this crate by implementing [`GatewayClient`].
//!
//! ## Example.
//!
//! ```no_run
//! use dav_gateway::{DavHandler, memgw::MemGateway, pool::GatewayPool};
//!
//! let gw = MemGateway::new();
//! let server = DavHandler::builder()
//!     .gateway(GatewayPool::single(Box::new(gw.clone())))
//!     .data_client(Box::new(gw))
//!     .build_handler();
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use]
extern crate log;

mod davhandler;
mod davheaders;
mod errors;
mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_lock;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod handle_report;
mod handle_tpc;
mod handle_trashbin;
mod handle_tus;
mod handle_versions;
mod locks;
mod propfind;
mod router;
mod spacelookup;
mod xmltree_ext;

pub mod body;
pub mod cache;
pub mod davpath;
pub mod favorites;
pub mod gateway;
#[cfg(any(docsrs, feature = "memgw"))]
#[cfg_attr(docsrs, doc(cfg(feature = "memgw")))]
pub mod memgw;
pub mod pool;
pub mod settings;
pub mod transfer;
pub mod util;

pub(crate) use crate::davhandler::DavInner;
pub(crate) use crate::errors::{DavError, DavResult};

pub use crate::davhandler::{DavConfig, DavHandler};
pub use crate::router::StatusInfo;
pub use crate::gateway::GatewayClient;
pub use crate::transfer::{DataClient, HttpDataClient, TransferError};
pub use crate::util::{DavMethod, DavMethodSet, NameValidation};
