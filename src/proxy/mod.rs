//! Rotating proxy pool
//!
//! ## Architecture
//!
//! - [`ProxyEndpoint`]: immutable identity of a proxy
//! - [`ProxyPool`]: health records and the selection rules, with no I/O
//! - [`HealthProbe`]: test transfer through a proxy ([`HttpHealthProbe`],
//!   [`FetchHealthProbe`])
//! - [`ProxyListSource`]: where candidates come from ([`HttpProxyListSource`],
//!   [`StaticProxyListSource`])
//! - [`ProxySupervisor`]: owns the pool, refreshes and probes it, and hands
//!   out leases through `acquire`/`release`
//!
//! A proxy is leased only while it is healthy, at or above the speed floor,
//! and below its concurrent-use limit. It dies once its consecutive failures
//! exceed the threshold and comes back only through a successful probe.

mod endpoint;
mod pool;
mod probe;
mod source;
mod supervisor;

pub use endpoint::{ProxyEndpoint, ProxyScheme};
pub use pool::{
    HealthState, MergeReport, PoolPolicy, PoolSnapshot, PoolStats, ProxyHealth, ProxyPool,
    ReleaseOutcome, SnapshotEntry,
};
pub use probe::{FetchHealthProbe, HealthProbe, HttpHealthProbe, ProbeResult};
pub use source::{HttpProxyListSource, ProxyListSource, StaticProxyListSource, parse_proxy_list};
pub use supervisor::ProxySupervisor;
