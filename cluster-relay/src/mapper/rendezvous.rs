//! Weighted rendezvous hashing (highest random weight).
//!
//! Every (channel, site) pair gets a pseudo-random score and the channel
//! belongs to the highest-scoring site. Adding a site only moves the
//! channels the new site now wins; removing one only moves the channels it
//! owned. O(n) lookup, fine for broker clusters of a few hundred nodes.

use super::MappingEngine;
use crate::Site;
use std::collections::HashMap;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Per-site weights keyed by site URI. Unlisted sites weigh 1.0.
#[derive(Debug, Clone, Default)]
pub struct RendezvousOptions {
    pub weights: HashMap<String, f64>,
}

impl RendezvousOptions {
    pub fn with_weight(mut self, uri: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(uri.into(), weight);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RendezvousMapper {
    sites: Vec<Site>,
    weights: Vec<f64>,
    options: RendezvousOptions,
}

impl RendezvousMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RendezvousOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    fn weight_for(&self, site: &Site) -> f64 {
        match self.options.weights.get(site.uri()) {
            Some(&w) if w.is_finite() && w > 0.0 => w,
            Some(&w) => {
                tracing::warn!(site = %site, weight = w, "Ignoring invalid rendezvous weight");
                1.0
            }
            None => 1.0,
        }
    }

    /// Score for a (channel, site) pair; higher wins.
    fn score(channel: &str, site: &Site, weight: f64) -> f64 {
        let hash = mix(fnv1a(channel.as_bytes(), site.uri().as_bytes()));
        // 53 random bits mapped into the open interval (0, 1).
        let unit = ((hash >> 11) as f64 + 0.5) / (1u64 << 53) as f64;
        -weight / unit.ln()
    }
}

impl MappingEngine for RendezvousMapper {
    fn set_sites(&mut self, sites: Vec<Site>) {
        self.weights = sites.iter().map(|site| self.weight_for(site)).collect();
        self.sites = sites;
    }

    fn find_site(&self, channel: &str) -> Option<&Site> {
        self.sites
            .iter()
            .zip(&self.weights)
            .map(|(site, &weight)| (site, Self::score(channel, site, weight)))
            .max_by(|(a, score_a), (b, score_b)| {
                score_a
                    .total_cmp(score_b)
                    .then_with(|| a.uri().cmp(b.uri()))
            })
            .map(|(site, _)| site)
    }

    fn sites(&self) -> &[Site] {
        &self.sites
    }
}

#[inline]
fn fnv1a(channel: &[u8], site: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    // The zero separator keeps ("ab", "c") and ("a", "bc") apart.
    for &byte in channel.iter().chain(&[0u8]).chain(site) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// splitmix64 finaliser; FNV alone has weak high bits for short keys.
#[inline]
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::sites;

    fn mapper_for(uris: &[&str]) -> RendezvousMapper {
        let mut mapper = RendezvousMapper::new();
        mapper.set_sites(sites(uris));
        mapper
    }

    fn owner(mapper: &RendezvousMapper, channel: &str) -> String {
        mapper.find_site(channel).unwrap().uri().to_string()
    }

    #[test]
    fn test_empty_returns_none() {
        let mapper = RendezvousMapper::new();
        assert!(mapper.find_site("any-channel").is_none());
    }

    #[test]
    fn test_single_site_owns_all() {
        let mapper = mapper_for(&["wss://b1:8888"]);
        for i in 0..100 {
            assert_eq!(owner(&mapper, &format!("channel-{}", i)), "wss://b1:8888");
        }
    }

    #[test]
    fn test_site_order_does_not_matter() {
        let a = mapper_for(&["ws://b1:1", "ws://b2:1", "ws://b3:1"]);
        let b = mapper_for(&["ws://b3:1", "ws://b1:1", "ws://b2:1"]);
        for i in 0..1000 {
            let channel = format!("channel-{}", i);
            assert_eq!(owner(&a, &channel), owner(&b, &channel));
        }
    }

    #[test]
    fn test_even_distribution() {
        let uris = ["ws://b1:1", "ws://b2:1", "ws://b3:1", "ws://b4:1"];
        let mapper = mapper_for(&uris);

        let num_keys = 10_000;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..num_keys {
            *counts.entry(owner(&mapper, &format!("channel-{}", i))).or_default() += 1;
        }

        let expected = num_keys / 4;
        let tolerance = expected / 10;
        for uri in uris {
            let count = counts.get(uri).copied().unwrap_or_default();
            let diff = (count as i64 - expected as i64).unsigned_abs() as usize;
            assert!(
                diff < tolerance,
                "{uri}: got {count}, expected ~{expected} (±{tolerance})"
            );
        }
    }

    #[test]
    fn test_adding_a_site_only_moves_channels_to_it() {
        let before = mapper_for(&["ws://b1:1", "ws://b2:1", "ws://b3:1", "ws://b4:1"]);
        let after = mapper_for(&["ws://b1:1", "ws://b2:1", "ws://b3:1", "ws://b4:1", "ws://b5:1"]);

        let total = 10_000;
        let mut moved = 0;
        for i in 0..total {
            let channel = format!("channel-{}", i);
            let (old, new) = (owner(&before, &channel), owner(&after, &channel));
            if old != new {
                assert_eq!(new, "ws://b5:1", "{channel} moved between surviving sites");
                moved += 1;
            }
        }

        // Expect ~1/5 of channels to move.
        assert!(moved > total / 10 && moved < total * 3 / 10, "moved {}", moved);
    }

    #[test]
    fn test_removing_a_site_only_moves_its_channels() {
        let before = mapper_for(&["ws://b1:1", "ws://b2:1", "ws://b3:1"]);
        let after = mapper_for(&["ws://b1:1", "ws://b3:1"]);

        for i in 0..5_000 {
            let channel = format!("channel-{}", i);
            let old = owner(&before, &channel);
            if old != "ws://b2:1" {
                assert_eq!(owner(&after, &channel), old);
            }
        }
    }

    #[test]
    fn test_weights_skew_ownership() {
        let options = RendezvousOptions::default().with_weight("ws://heavy:1", 3.0);
        let mut mapper = RendezvousMapper::with_options(options);
        mapper.set_sites(sites(&["ws://heavy:1", "ws://light:1"]));

        let heavy = (0..10_000)
            .filter(|i| owner(&mapper, &format!("channel-{}", i)) == "ws://heavy:1")
            .count();

        // Weight 3 vs 1 should own ~75% of channels.
        assert!(heavy > 7_000 && heavy < 8_000, "heavy owns {}", heavy);
    }

    #[test]
    fn test_invalid_weight_falls_back_to_one() {
        let options = RendezvousOptions::default()
            .with_weight("ws://b1:1", f64::NAN)
            .with_weight("ws://b2:1", -2.0);
        let mut weighted = RendezvousMapper::with_options(options);
        weighted.set_sites(sites(&["ws://b1:1", "ws://b2:1"]));
        let plain = mapper_for(&["ws://b1:1", "ws://b2:1"]);

        for i in 0..500 {
            let channel = format!("channel-{}", i);
            assert_eq!(owner(&weighted, &channel), owner(&plain, &channel));
        }
    }
}
