//! Endpoint resolution: from a `ServerDescriptor` to a live base URL.
//!
//! # Design
//! A fixed descriptor resolves to `scheme://host:port/` with no I/O. A
//! descriptor in service-record mode looks up DNS SRV records under its host,
//! walks priority tiers from the lowest value up, and within a tier draws
//! candidates by weight without replacement. Each drawn candidate gets one
//! liveness probe; the first to answer wins. Probe failures are logged and
//! only drive failover. Exhaustion is reported as a single `Resolution` error.
//!
//! Nothing is cached: every call resolves afresh, since weights and liveness
//! change between calls.
//!
//! DNS and the probe sit behind the [`SrvLookup`] and [`Probe`] traits so the
//! selection loop can run against fixed answers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;

/// Where the server lives. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptor")]
pub struct ServerDescriptor {
    host: String,
    port: u16,
    ssl: bool,
    srv: bool,
}

#[derive(Deserialize)]
struct RawDescriptor {
    host: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    ssl: bool,
    #[serde(default)]
    srv: bool,
}

impl TryFrom<RawDescriptor> for ServerDescriptor {
    type Error = Error;

    fn try_from(raw: RawDescriptor) -> Result<Self, Self::Error> {
        ServerDescriptor::new(raw.host, raw.port, raw.ssl, raw.srv)
    }
}

impl ServerDescriptor {
    /// `port` may only be 0 in service-record mode, where it is ignored.
    pub fn new(host: impl Into<String>, port: u16, ssl: bool, srv: bool) -> Result<Self, Error> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::InvalidDescriptor("host must not be empty".to_string()));
        }
        if port == 0 && !srv {
            return Err(Error::InvalidDescriptor(
                "port may only be undefined when using SRV records".to_string(),
            ));
        }
        Ok(Self {
            host,
            port: if srv { 0 } else { port },
            ssl,
            srv,
        })
    }

    /// Plain HTTP to a fixed host and port.
    pub fn fixed(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        Self::new(host, port, false, false)
    }

    /// Discover endpoints through SRV records published under `host`.
    pub fn service_record(host: impl Into<String>, ssl: bool) -> Result<Self, Error> {
        Self::new(host, 0, ssl, true)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ssl(&self) -> bool {
        self.ssl
    }

    pub fn uses_service_record(&self) -> bool {
        self.srv
    }
}

/// A schema-complete base URL ending in `/`. Short-lived: re-resolve rather
/// than keep one around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(host: &str, port: u16, ssl: bool) -> Self {
        let scheme = if ssl { "https" } else { "http" };
        Endpoint(format!("{scheme}://{host}:{port}/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Absolute URL of a protocol path such as `get` or `list/families`.
    pub fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.0, path.trim_start_matches('/'))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvCandidate {
    pub target: String,
    pub port: u16,
    pub priority: u32,
    pub weight: u32,
}

/// Source of SRV answers.
pub trait SrvLookup {
    fn lookup(&self, name: &str) -> Result<Vec<SrvCandidate>, Error>;
}

/// Liveness check against a candidate endpoint.
pub trait Probe {
    fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<(), Error>;
}

/// SRV lookups through the system's DNS configuration.
#[derive(Debug, Clone)]
pub struct DnsSrvLookup {
    timeout: Duration,
}

impl DnsSrvLookup {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DnsSrvLookup {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl SrvLookup for DnsSrvLookup {
    fn lookup(&self, name: &str) -> Result<Vec<SrvCandidate>, Error> {
        let (config, mut opts) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|e| Error::Resolution(format!("unable to read DNS configuration: {e}")))?;
        opts.timeout = self.timeout;
        let resolver = hickory_resolver::Resolver::new(config, opts)
            .map_err(|e| Error::Resolution(format!("unable to build DNS resolver: {e}")))?;
        let answers = resolver
            .srv_lookup(name)
            .map_err(|e| Error::Resolution(format!("unable to resolve SRV record {name}: {e}")))?;
        Ok(answers
            .iter()
            .map(|srv| SrvCandidate {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
                priority: u32::from(srv.priority()),
                weight: u32::from(srv.weight()),
            })
            .collect())
    }
}

/// Resolves descriptors to live endpoints.
pub struct Resolver<L, P> {
    lookup: L,
    probe: P,
    probe_timeout: Duration,
}

impl<L: SrvLookup, P: Probe> Resolver<L, P> {
    pub fn new(lookup: L, probe: P, probe_timeout: Duration) -> Self {
        Self {
            lookup,
            probe,
            probe_timeout,
        }
    }

    pub fn set_probe_timeout(&mut self, timeout: Duration) {
        self.probe_timeout = timeout;
    }

    pub fn resolve(&self, descriptor: &ServerDescriptor) -> Result<Endpoint, Error> {
        self.resolve_with(descriptor, &mut rand::thread_rng())
    }

    /// As [`resolve`](Self::resolve), drawing weighted choices from `rng`.
    pub fn resolve_with<R: Rng + ?Sized>(
        &self,
        descriptor: &ServerDescriptor,
        rng: &mut R,
    ) -> Result<Endpoint, Error> {
        if !descriptor.uses_service_record() {
            return Ok(Endpoint::new(descriptor.host(), descriptor.port(), descriptor.ssl()));
        }

        let answers = self.lookup.lookup(descriptor.host())?;
        if answers.is_empty() {
            return Err(Error::Resolution(format!(
                "no SRV records published under {}",
                descriptor.host()
            )));
        }

        for (priority, mut tier) in group_by_priority(answers) {
            while !tier.is_empty() {
                let weights: Vec<u32> = tier.iter().map(|c| c.weight).collect();
                let choice = tier.remove(select_weighted(&weights, rng));
                let endpoint = Endpoint::new(&choice.target, choice.port, descriptor.ssl());
                debug!(%endpoint, priority, weight = choice.weight, "probing SRV candidate");
                match self.probe.probe(&endpoint, self.probe_timeout) {
                    Ok(()) => return Ok(endpoint),
                    Err(e) => warn!(%endpoint, error = %e, "SRV candidate failed liveness probe"),
                }
            }
        }

        Err(Error::Resolution(format!(
            "no viable endpoint among SRV records for {}",
            descriptor.host()
        )))
    }
}

/// Candidates grouped by priority, lowest value first.
fn group_by_priority(answers: Vec<SrvCandidate>) -> BTreeMap<u32, Vec<SrvCandidate>> {
    let mut tiers: BTreeMap<u32, Vec<SrvCandidate>> = BTreeMap::new();
    for candidate in answers {
        tiers.entry(candidate.priority).or_default().push(candidate);
    }
    tiers
}

/// Index of the next candidate, chosen with probability proportional to its
/// weight. `weights` must not be empty.
///
/// A draw `d` in `[0, total)` becomes a running remainder of `d + 1`; walking
/// the list subtracts each weight and stops at the first candidate that brings
/// the remainder to zero or below. A zero-weight entry is only chosen once the
/// whole tier weighs nothing, and then the first remaining entry is taken.
pub fn select_weighted<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> usize {
    let total: u64 = weights.iter().map(|&w| u64::from(w)).sum();
    if total == 0 {
        return 0;
    }
    pick(weights, rng.gen_range(0..total))
}

fn pick(weights: &[u32], draw: u64) -> usize {
    let mut remainder = draw as i128 + 1;
    for (index, &weight) in weights.iter().enumerate() {
        remainder -= i128::from(weight);
        if remainder <= 0 {
            return index;
        }
    }
    weights.len() - 1
}
