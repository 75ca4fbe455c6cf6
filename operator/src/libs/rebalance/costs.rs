//! Offering price lookups behind a TTL cache
//!
//! Prices move slowly so lookups are cached. Reads take the shared lock,
//! misses fetch outside any lock, and the insert re-checks under the
//! exclusive lock so a racing fetch never clobbers a fresher entry.

use chrono::prelude::*;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use vpsie_autoscaler::client::Offering;
use vpsie_autoscaler::models::conversions::Requests;
use vpsie_autoscaler::{Error, VpsieProvider};

/// A cached offering and when it was fetched
struct Entry {
    /// The cached offering
    offering: Offering,
    /// When this entry was fetched
    fetched: DateTime<Utc>,
}

/// A TTL cache over offering price lookups
pub struct CostCache {
    /// The provider to fetch offerings from
    provider: Arc<dyn VpsieProvider>,
    /// How long an entry stays valid
    ttl: Duration,
    /// The cached entries by offering id
    entries: RwLock<HashMap<String, Entry>>,
}

impl CostCache {
    /// Build a new cost cache
    ///
    /// # Arguments
    ///
    /// * `provider` - The provider to fetch offerings from
    /// * `ttl` - How long entries stay valid in seconds
    pub fn new(provider: Arc<dyn VpsieProvider>, ttl: u64) -> Self {
        CostCache {
            provider,
            ttl: Duration::seconds(ttl as i64),
            entries: RwLock::new(HashMap::default()),
        }
    }

    /// Get an offering, from cache when fresh
    ///
    /// # Arguments
    ///
    /// * `ctx` - The token cancelled on shutdown
    /// * `id` - The offering id to look up
    pub async fn offering(&self, ctx: &CancellationToken, id: &str) -> Result<Offering, Error> {
        let now = Utc::now();
        // fast path under the shared lock
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(id) {
                if now - entry.fetched < self.ttl {
                    return Ok(entry.offering.clone());
                }
            }
        }
        // fetch outside any lock so readers keep flowing
        let offering = self.provider.get_offering(ctx, id).await?;
        // re-check under the exclusive lock before writing
        let mut entries = self.entries.write().await;
        match entries.get(id) {
            Some(entry) if now - entry.fetched < self.ttl => Ok(entry.offering.clone()),
            _ => {
                // expired entries only ever leave under this exclusive lock
                entries.retain(|_, entry| now - entry.fetched < self.ttl);
                entries.insert(
                    id.to_owned(),
                    Entry {
                        offering: offering.clone(),
                        fetched: now,
                    },
                );
                Ok(offering)
            }
        }
    }
}

/// Split an offerings hourly price across its resources
///
/// An offering with a zero sized resource contributes zero cost for it
/// instead of dividing by zero.
///
/// # Arguments
///
/// * `offering` - The offering to split
pub fn per_resource_costs(offering: &Offering) -> (f64, f64, f64) {
    let share = offering.price_hourly / 3.0;
    let cpu = if offering.cpu > 0 {
        share / offering.cpu as f64
    } else {
        0.0
    };
    let memory = if offering.memory_mb > 0 {
        share / offering.memory_mb as f64
    } else {
        0.0
    };
    let disk = if offering.disk_gb > 0 {
        share / offering.disk_gb as f64
    } else {
        0.0
    };
    (cpu, memory, disk)
}

/// Check whether an offering can hold a workload footprint
///
/// # Arguments
///
/// * `offering` - The offering to check
/// * `footprint` - The cpu/memory footprint to fit
pub fn fits(offering: &Offering, footprint: &Requests) -> bool {
    offering.cpu as u64 * 1000 >= footprint.cpu && offering.memory_mb as u64 >= footprint.memory
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an offering
    fn offering(id: &str, price: f64, cpu: i64, memory_mb: i64, disk_gb: i64) -> Offering {
        Offering {
            id: id.to_owned(),
            price_hourly: price,
            cpu,
            memory_mb,
            disk_gb,
        }
    }

    #[test]
    fn zero_spec_offerings_cost_zero_per_resource() {
        let broken = offering("weird", 0.30, 0, 0, 0);
        assert_eq!(per_resource_costs(&broken), (0.0, 0.0, 0.0));
        let normal = offering("m2.small", 0.30, 2, 2048, 40);
        let (cpu, memory, disk) = per_resource_costs(&normal);
        assert!(cpu > 0.0 && memory > 0.0 && disk > 0.0);
    }

    #[test]
    fn fitting_compares_in_matching_units() {
        let small = offering("m2.small", 0.30, 2, 2048, 40);
        // 1500 millicpu and 1 GiB fit a 2 core 2 GiB offering
        assert!(fits(&small, &Requests { cpu: 1500, memory: 1024 }));
        assert!(!fits(&small, &Requests { cpu: 2500, memory: 1024 }));
        assert!(!fits(&small, &Requests { cpu: 1500, memory: 4096 }));
    }

    #[cfg(feature = "test-utilities")]
    mod with_mock {
        use super::*;
        use vpsie_autoscaler::test_utilities::MockVpsie;

        #[tokio::test]
        async fn lookups_are_served_from_cache_inside_the_ttl() {
            let mock = Arc::new(MockVpsie::new());
            mock.push_offering(offering("m2.small", 0.30, 2, 2048, 40))
                .await;
            let cache = CostCache::new(mock.clone(), 600);
            let ctx = CancellationToken::new();
            let first = cache.offering(&ctx, "m2.small").await.unwrap();
            assert_eq!(first.price_hourly, 0.30);
            // unknown offerings surface the provider error
            assert!(cache.offering(&ctx, "missing").await.is_err());
        }
    }
}
