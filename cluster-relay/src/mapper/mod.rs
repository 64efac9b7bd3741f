//! Channel → site resolution.
//!
//! Every engine answers the same two questions: which sites are active
//! (`set_sites`) and which one owns a channel (`find_site`). The relay picks
//! an engine at construction through [`MappingStrategy`].

mod rendezvous;
mod simple;

pub use rendezvous::{RendezvousMapper, RendezvousOptions};
pub use simple::SimpleMapper;

use crate::{Error, Site};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Deterministic channel → site resolver.
///
/// `find_site` must be a pure function of the channel name and the current
/// site set, so that independent workers agree on routing without talking
/// to each other.
pub trait MappingEngine: Send + Sync {
    /// Replace the active site set. Idempotent.
    fn set_sites(&mut self, sites: Vec<Site>);

    fn find_site(&self, channel: &str) -> Option<&Site>;

    fn sites(&self) -> &[Site];
}

/// A mapping engine selected at construction.
pub enum Mapper {
    Simple(SimpleMapper),
    Rendezvous(RendezvousMapper),
    Custom(Box<dyn MappingEngine>),
}

impl Mapper {
    pub fn set_sites(&mut self, sites: Vec<Site>) {
        match self {
            Self::Simple(m) => m.set_sites(sites),
            Self::Rendezvous(m) => m.set_sites(sites),
            Self::Custom(m) => m.set_sites(sites),
        }
    }

    pub fn find_site(&self, channel: &str) -> Option<&Site> {
        match self {
            Self::Simple(m) => m.find_site(channel),
            Self::Rendezvous(m) => m.find_site(channel),
            Self::Custom(m) => m.find_site(channel),
        }
    }

    pub fn sites(&self) -> &[Site] {
        match self {
            Self::Simple(m) => m.sites(),
            Self::Rendezvous(m) => m.sites(),
            Self::Custom(m) => m.sites(),
        }
    }

    /// Structural comparison of the active site list.
    ///
    /// Order matters: the simple engine routes by list position.
    pub fn has_same_sites(&self, sites: &[Site]) -> bool {
        self.sites() == sites
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Simple(_) => "simple",
            Self::Rendezvous(_) => "rendezvous",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("kind", &self.kind())
            .field("sites", &self.sites())
            .finish()
    }
}

/// Builds a fresh custom engine for every mapping context.
pub type MapperFactory = Arc<dyn Fn() -> Box<dyn MappingEngine> + Send + Sync>;

/// Which mapping engine the relay builds for each mapping context.
#[derive(Clone, Default)]
pub enum MappingStrategy {
    /// Uniform hash over the site list. Remaps nearly every channel when the
    /// site count changes; only suitable for static clusters.
    Simple,
    /// Weighted rendezvous hashing (minimal disruption on membership change).
    #[default]
    Rendezvous,
    /// Rendezvous hashing with per-site weights.
    WeightedRendezvous(RendezvousOptions),
    Custom(MapperFactory),
}

impl MappingStrategy {
    pub fn custom<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn MappingEngine> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(factory))
    }

    /// Build an empty engine (no sites yet).
    pub fn build(&self) -> Mapper {
        match self {
            Self::Simple => Mapper::Simple(SimpleMapper::new()),
            Self::Rendezvous => Mapper::Rendezvous(RendezvousMapper::new()),
            Self::WeightedRendezvous(options) => {
                Mapper::Rendezvous(RendezvousMapper::with_options(options.clone()))
            }
            Self::Custom(factory) => Mapper::Custom(factory()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Rendezvous | Self::WeightedRendezvous(_) => "rendezvous",
            Self::Custom(_) => "custom",
        }
    }
}

impl FromStr for MappingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "simple" => Ok(Self::Simple),
            "rendezvous" | "skeletonRendezvous" => Ok(Self::Rendezvous),
            other => Err(Error::config(format!(
                "The specified mapping engine '{other}' is not a valid engine - It must be either 'simple', 'rendezvous' or a custom mapping engine"
            ))),
        }
    }
}

impl fmt::Debug for MappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeightedRendezvous(options) => f
                .debug_tuple("WeightedRendezvous")
                .field(options)
                .finish(),
            other => f.write_str(other.as_str()),
        }
    }
}

impl fmt::Display for MappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
pub(crate) fn sites(uris: &[&str]) -> Vec<Site> {
    uris.iter().map(|uri| Site::parse(uri).unwrap()).collect()
}
