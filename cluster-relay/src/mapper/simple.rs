use super::MappingEngine;
use crate::hasher::hash_to_index;
use crate::Site;

/// Uniform hash over the ordered site list.
#[derive(Debug, Clone, Default)]
pub struct SimpleMapper {
    sites: Vec<Site>,
}

impl SimpleMapper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MappingEngine for SimpleMapper {
    fn set_sites(&mut self, sites: Vec<Site>) {
        self.sites = sites;
    }

    fn find_site(&self, channel: &str) -> Option<&Site> {
        let index = hash_to_index(channel, self.sites.len())?;
        self.sites.get(index)
    }

    fn sites(&self) -> &[Site] {
        &self.sites
    }
}
