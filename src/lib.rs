//! # cascadht - HTTP gateway cascading content lookups into the IPFS DHT
//!
//! cascadht bridges two ecosystems: clients speaking the IPNI content-index
//! lookup protocol (or the closely related delegated-routing protocol) on one
//! side, and the Kademlia content-routing overlay on the other. Each lookup
//! fans out into an asynchronous DHT provider query, enriches and filters the
//! discovered peer addresses, and fans the results back into a buffered JSON
//! or streaming NDJSON response.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `server` | HTTP dispatcher, lookup handlers, gateway lifecycle |
//! | `engine` | Concurrent provider-discovery pipeline |
//! | `response` | Accept negotiation and the two response writer families |
//! | `routing` | `ContentRouting` contract and standard/accelerated selection |
//! | `kad` | libp2p swarm actor implementing `ContentRouting` |
//! | `peerstore` | TTL-bounded peer address book |
//! | `attempt_cache` | LRU gate on repeated per-peer address resolution |
//! | `addr_filter` | Public-dialability predicate for multiaddrs |
//! | `config` | Runtime options |

pub mod addr_filter;
pub mod attempt_cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod kad;
pub mod peerstore;
pub mod response;
pub mod routing;
pub mod server;

pub use addr_filter::is_publicly_dialable_addr;
pub use attempt_cache::PeerRoutingAttemptCache;
pub use config::GatewayConfig;
pub use engine::{DiscoveryEngine, ProviderStream};
pub use error::HttpError;
pub use kad::{KadRouter, RouterMode};
pub use peerstore::Peerstore;
pub use response::{LookupKey, LookupResponseWriter, ResponseMode};
pub use routing::{ContentRouting, PeerRecord, RoutingSelector};
pub use server::{router, Gateway, GatewayHandle};
