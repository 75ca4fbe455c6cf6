//! Observes node utilization for the scale down engine
//!
//! A background collector samples the metrics API and feeds a cache of per
//! node series. The cache is written under an exclusive lock and read under a
//! shared lock. Expired series are only removed after re-acquiring the
//! exclusive lock, never during a shared read.

use async_trait::async_trait;
use chrono::prelude::*;
use chrono::Duration;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{event, instrument, Level};
use vpsie_autoscaler::models::{conversions, labels};
use vpsie_autoscaler::Error;

use super::super::k8s::Nodes;
use vpsie_autoscaler::conf::ScaleDown;

/// One utilization sample for a node as fractions of allocatable
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// The fraction of allocatable cpu in use
    pub cpu: f64,
    /// The fraction of allocatable memory in use
    pub memory: f64,
    /// When this sample was taken
    pub at: DateTime<Utc>,
}

/// The absolute usage the metrics API reports for a node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeUsage {
    /// The name of the node
    pub node: String,
    /// The cpu in use in millicpu
    pub cpu: u64,
    /// The memory in use in mebibytes
    pub memory: u64,
}

/// Where node usage numbers come from
#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// Take one usage sample for every node the source can see
    async fn sample(&self, ctx: &CancellationToken) -> Result<Vec<NodeUsage>, Error>;
}

/// The body the metrics API returns when listing node metrics
#[derive(Deserialize)]
struct NodeMetricsList {
    /// The per node metric items
    items: Vec<NodeMetrics>,
}

/// A single node metric item
#[derive(Deserialize)]
struct NodeMetrics {
    /// The metadata naming the node
    metadata: NodeMetricsMeta,
    /// The usage quantities
    usage: NodeMetricsUsage,
}

/// The metadata of a node metric item
#[derive(Deserialize)]
struct NodeMetricsMeta {
    /// The name of the node
    name: String,
}

/// The usage quantities of a node metric item
#[derive(Deserialize)]
struct NodeMetricsUsage {
    /// The cpu in use
    cpu: Quantity,
    /// The memory in use
    memory: Quantity,
}

/// A utilization source backed by the Kubernetes metrics API
pub struct KubeMetrics {
    /// The client to hit the metrics API with
    client: kube::Client,
}

impl KubeMetrics {
    /// Build a new metrics API backed source
    ///
    /// # Arguments
    ///
    /// * `client` - The client to hit the metrics API with
    pub fn new(client: kube::Client) -> Self {
        KubeMetrics { client }
    }
}

#[async_trait]
impl UtilizationSource for KubeMetrics {
    /// Take one usage sample for every node in the cluster
    #[instrument(name = "KubeMetrics::sample", skip_all, err(Debug))]
    async fn sample(&self, ctx: &CancellationToken) -> Result<Vec<NodeUsage>, Error> {
        // the metrics API group is not in k8s-openapi so hit it raw
        let request = http::Request::get("/apis/metrics.k8s.io/v1beta1/nodes")
            .body(Vec::new())
            .map_err(|error| Error::new(format!("Failed to build metrics request: {error}")))?;
        let listing: NodeMetricsList = tokio::select! {
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            resp = self.client.request(request) => resp?,
        };
        // convert every item into our standard units
        let mut usages = Vec::with_capacity(listing.items.len());
        for item in listing.items {
            usages.push(NodeUsage {
                node: item.metadata.name,
                cpu: conversions::millicpu(Some(&item.usage.cpu))?,
                memory: conversions::mebibytes(Some(&item.usage.memory))?,
            });
        }
        Ok(usages)
    }
}

/// A rolling window of utilization samples per node
#[derive(Default)]
pub struct UtilizationCache {
    /// The sample series by node name
    series: RwLock<HashMap<String, Vec<Sample>>>,
}

impl UtilizationCache {
    /// Record a sample for a node pruning anything outside the window
    ///
    /// # Arguments
    ///
    /// * `node` - The node this sample is for
    /// * `sample` - The sample to record
    /// * `window` - How much history to retain
    pub fn record(&self, node: &str, sample: Sample, window: Duration) {
        let mut series = self.series.write().unwrap();
        let entry = series.entry(node.to_owned()).or_default();
        // prune first so the series never grows unbounded
        let cutoff = sample.at - window;
        entry.retain(|existing| existing.at >= cutoff);
        entry.push(sample);
    }

    /// Check whether a node stayed under both thresholds for the full window
    ///
    /// A node with no samples or whose history does not yet span the window is
    /// never underutilized.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    /// * `cpu_threshold` - The cpu fraction the node must stay below
    /// * `memory_threshold` - The memory fraction the node must stay below
    /// * `window` - How long the node must have stayed below the thresholds
    /// * `now` - The current time
    pub fn underutilized(
        &self,
        node: &str,
        cpu_threshold: f64,
        memory_threshold: f64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let series = self.series.read().unwrap();
        let samples = match series.get(node) {
            Some(samples) if !samples.is_empty() => samples,
            _ => return false,
        };
        // the history must cover the whole observation window
        let oldest = match samples.iter().map(|sample| sample.at).min() {
            Some(oldest) => oldest,
            None => return false,
        };
        if oldest > now - window {
            return false;
        }
        // every sample must sit below both thresholds
        samples
            .iter()
            .all(|sample| sample.cpu < cpu_threshold && sample.memory < memory_threshold)
    }

    /// Check whether a nodes samples have gone stale
    ///
    /// A node the collector has not heard from recently is treated as
    /// unreachable and excluded from scale down.
    ///
    /// # Arguments
    ///
    /// * `node` - The node to check
    /// * `max_age` - How old the newest sample may be
    /// * `now` - The current time
    pub fn stale(&self, node: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        let series = self.series.read().unwrap();
        match series.get(node).and_then(|samples| {
            samples.iter().map(|sample| sample.at).max()
        }) {
            Some(newest) => newest < now - max_age,
            None => true,
        }
    }

    /// Get the composite utilization of a node for prioritization
    ///
    /// # Arguments
    ///
    /// * `node` - The node to read
    pub fn composite(&self, node: &str) -> f64 {
        let series = self.series.read().unwrap();
        series
            .get(node)
            .and_then(|samples| samples.last())
            .map(|sample| (sample.cpu + sample.memory) / 2.0)
            .unwrap_or(1.0)
    }

    /// Drop series that have gone completely stale
    ///
    /// Removal re-acquires the exclusive lock. Readers never delete.
    ///
    /// # Arguments
    ///
    /// * `max_age` - How old a series newest sample may be before removal
    /// * `now` - The current time
    pub fn sweep(&self, max_age: Duration, now: DateTime<Utc>) {
        let mut series = self.series.write().unwrap();
        let cutoff = now - max_age;
        series.retain(|_, samples| {
            samples
                .iter()
                .map(|sample| sample.at)
                .max()
                .map(|newest| newest >= cutoff)
                .unwrap_or(false)
        });
    }
}

/// Continuously sample node utilization into the cache
///
/// Runs until the token is cancelled. Sample failures are logged and skipped
/// so a flaky metrics server only delays scale down instead of crashing the
/// controller.
///
/// # Arguments
///
/// * `client` - A client for the Kubernetes API
/// * `source` - The source to sample usage from
/// * `cache` - The cache to record samples into
/// * `conf` - The scale down settings
/// * `ctx` - The token cancelled on shutdown
pub async fn collect(
    client: kube::Client,
    source: Arc<dyn UtilizationSource>,
    cache: Arc<UtilizationCache>,
    conf: ScaleDown,
    ctx: CancellationToken,
) {
    let nodes = Nodes::new(&client);
    let window = Duration::seconds(conf.observation_window as i64);
    let managed = format!("{}=true", labels::MANAGED);
    loop {
        // wait for the next sample tick or shutdown
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(conf.sample_interval)) => {}
        }
        // take a usage sample across the cluster
        let usages = match source.sample(&ctx).await {
            Ok(usages) => usages,
            Err(Error::Cancelled) => return,
            Err(error) => {
                event!(Level::WARN, msg = "Failed to sample node metrics", error = %error);
                continue;
            }
        };
        // we need allocatable amounts to turn usage into fractions
        let listing = match nodes.list(&[managed.as_str()]).await {
            Ok(listing) => listing,
            Err(error) => {
                event!(Level::WARN, msg = "Failed to list managed nodes", error = %error);
                continue;
            }
        };
        let now = Utc::now();
        for node in &listing {
            let name = match &node.metadata.name {
                Some(name) => name,
                None => continue,
            };
            let usage = match usages.iter().find(|usage| &usage.node == name) {
                Some(usage) => usage,
                None => continue,
            };
            // nodes without allocatable info cannot be measured
            let allocatable = match conversions::node_allocatable(node) {
                Ok(Some(allocatable)) => allocatable,
                _ => continue,
            };
            let sample = Sample {
                cpu: ratio(usage.cpu, allocatable.cpu),
                memory: ratio(usage.memory, allocatable.memory),
                at: now,
            };
            cache.record(name, sample, window);
        }
        // drop series for nodes that disappeared
        cache.sweep(window, now);
    }
}

/// Divide usage by capacity guarding zero capacity
fn ratio(used: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    used as f64 / capacity as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a sample at an offset in seconds before the given time
    fn sample(cpu: f64, memory: f64, now: DateTime<Utc>, ago: i64) -> Sample {
        Sample {
            cpu,
            memory,
            at: now - Duration::seconds(ago),
        }
    }

    #[test]
    fn nodes_need_a_full_window_of_low_samples() {
        let cache = UtilizationCache::default();
        let now = Utc::now();
        let window = Duration::seconds(600);
        // a young series is not yet underutilized
        cache.record("n1", sample(0.1, 0.1, now, 60), window);
        assert!(!cache.underutilized("n1", 0.5, 0.5, window, now));
        // once the history spans the window it is
        cache.record("n1", sample(0.1, 0.1, now, 600), window);
        cache.record("n1", sample(0.2, 0.3, now, 0), window);
        assert!(cache.underutilized("n1", 0.5, 0.5, window, now));
    }

    #[test]
    fn one_hot_sample_disqualifies_a_node() {
        let cache = UtilizationCache::default();
        let now = Utc::now();
        let window = Duration::seconds(600);
        cache.record("n1", sample(0.1, 0.1, now, 600), window);
        cache.record("n1", sample(0.8, 0.1, now, 300), window);
        cache.record("n1", sample(0.1, 0.1, now, 0), window);
        assert!(!cache.underutilized("n1", 0.5, 0.5, window, now));
    }

    #[test]
    fn both_resources_must_be_below_threshold() {
        let cache = UtilizationCache::default();
        let now = Utc::now();
        let window = Duration::seconds(600);
        cache.record("n1", sample(0.1, 0.9, now, 600), window);
        cache.record("n1", sample(0.1, 0.9, now, 0), window);
        assert!(!cache.underutilized("n1", 0.5, 0.5, window, now));
    }

    #[test]
    fn unknown_and_silent_nodes_are_stale() {
        let cache = UtilizationCache::default();
        let now = Utc::now();
        let window = Duration::seconds(600);
        assert!(cache.stale("ghost", Duration::seconds(60), now));
        cache.record("n1", sample(0.1, 0.1, now, 300), window);
        assert!(cache.stale("n1", Duration::seconds(60), now));
        assert!(!cache.stale("n1", Duration::seconds(600), now));
    }

    #[test]
    fn sweep_drops_only_fully_stale_series() {
        let cache = UtilizationCache::default();
        let now = Utc::now();
        let window = Duration::seconds(600);
        cache.record("old", sample(0.1, 0.1, now, 500), window);
        cache.record("new", sample(0.1, 0.1, now, 10), window);
        cache.sweep(Duration::seconds(60), now);
        assert!(cache.stale("old", Duration::seconds(3600), now));
        assert!(!cache.stale("new", Duration::seconds(60), now));
    }

    #[test]
    fn zero_capacity_never_divides() {
        assert_eq!(ratio(100, 0), 0.0);
        assert_eq!(ratio(500, 1000), 0.5);
    }
}
