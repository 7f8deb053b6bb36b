//! # Meridian Discovery
//!
//! Workers announce themselves under leased keys in a coordination store;
//! gateways watch those keys and keep a live instance table for routing.
//!
//! ## Components
//!
//! * [`ServiceDescriptor`] - one instance record plus key formatting
//! * [`CoordinationStore`] - the store boundary (grant, keep-alive, put,
//!   prefix get, delete, watch); [`MemoryStore`] implements it in-process,
//!   `EtcdStore` (feature `etcd`) against an etcd cluster
//! * [`Registrar`] - registers an instance, keeps its lease alive and
//!   re-registers when the keep-alive channel dies
//! * [`Resolver`] - full resync plus incremental watch of one service name,
//!   publishing address sets to an [`AddressSink`]
//! * [`InstanceTable`] - atomically swapped per-service snapshot read by routers
//!
//! ## Failure Model
//!
//! Initial registration and the first resolve are fatal on failure. Once
//! running, keep-alive and watch failures are logged and retried until close.

pub mod descriptor;
pub mod error;
pub mod registrar;
pub mod resolver;
pub mod store;
pub mod table;

pub use descriptor::{service_prefix, AddressEntry, ServiceDescriptor};
pub use error::{DiscoveryError, StoreError};
pub use registrar::{Registrar, RegistrarConfig};
pub use resolver::{AddressSet, AddressSink, Resolver, ResolverConfig};
#[cfg(feature = "etcd")]
pub use store::etcd::EtcdStore;
pub use store::memory::MemoryStore;
pub use store::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, WatchEvent,
    WatchResponse, WatchStream,
};
pub use table::InstanceTable;
