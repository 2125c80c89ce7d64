//! Fault-injection proxies.
//!
//! Proxied services are reached through toxiproxy. [`topology`] decides which services are proxied and renders the
//! proxy configuration file, [`toxics`] maps slider values onto toxic attributes, and [`control`] drives a running
//! toxiproxy through [`client`].

pub mod client;
pub mod control;
pub mod topology;
pub mod toxics;

pub use self::client::{ToxiproxyClient, DEFAULT_TOXIPROXY_URL};
pub use self::control::{AppStatus, ProxyController, ProxySummary, ToxiproxyApi};
pub use self::topology::{ProxyDef, ProxyTopology};
pub use self::toxics::RangeTable;
