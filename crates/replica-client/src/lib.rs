//! Tokio runtime for list-and-watch replicas.
//!
//! [`Synchronizer`] lists a collection through a [`ResourceClient`], watches
//! it from the listed resource version, and keeps a replica current until it
//! is stopped. [`ResourceStores`] groups several synchronizers over one
//! transport.

/// Typed collection client and request building.
pub mod client;
/// Bearer token sources.
pub mod credentials;
/// Synchronizer registry.
pub mod stores;
/// List-then-watch synchronizer task.
pub mod sync;
/// HTTP transport seam and the reqwest implementation.
pub mod transport;
/// Streaming watch channel.
pub mod watch;

#[cfg(test)]
mod testing;

pub use client::{ClientError, CollectionRef, DEFAULT_LIST_TIMEOUT_SECONDS, ResourceClient};
pub use credentials::{Anonymous, CredentialSource, SharedToken, StaticToken};
pub use stores::{ResourceStores, StoreError};
pub use sync::{SyncOptions, Synchronizer};
pub use transport::{
    ByteStream, HttpRequest, HttpResponse, ReqwestTransport, StreamResponse, Transport,
    TransportError,
};
pub use watch::{WatchChannel, WatchEnd, WatchError, decode_events};
