//! The shared config for the VPSie autoscaler

use std::path::Path;

/// Helps serde default a value to false
fn default_false() -> bool {
    false
}

/// Helps serde default a value to true
fn default_true() -> bool {
    true
}

/// The log levels the autoscaler can log at
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Do not log
    Off,
    /// Log only errors
    Error,
    /// Log standard operational info
    Info,
    /// Log debug info
    Debug,
    /// Log everything
    Trace,
}

impl Default for LogLevel {
    /// Default to logging at the info level
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    /// Cast this log level to a tracing filter directive
    pub fn to_filter(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Helps serde default the namespace the autoscaler watches
fn default_namespace() -> String {
    "vpsie-autoscaler".to_owned()
}

/// Helps serde default the leader election lease name
fn default_lease_name() -> String {
    "vpsie-autoscaler-lock".to_owned()
}

/// Helps serde default the leader lease ttl to 15 seconds
fn default_lease_ttl() -> u64 {
    15
}

/// Helps serde default the leader lease renewal interval to 5 seconds
fn default_lease_renew() -> u64 {
    5
}

/// Settings for leader election between autoscaler replicas
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LeaderElection {
    /// The name of the lease to hold
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    /// How long a held lease is valid without renewal in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: u64,
    /// How often to renew our lease in seconds
    #[serde(default = "default_lease_renew")]
    pub renew_interval: u64,
}

impl Default for LeaderElection {
    fn default() -> Self {
        LeaderElection {
            lease_name: default_lease_name(),
            lease_ttl: default_lease_ttl(),
            renew_interval: default_lease_renew(),
        }
    }
}

/// Helps serde default the standard requeue interval to 30 seconds
fn default_requeue() -> u64 {
    30
}

/// Helps serde default the fast requeue interval to 5 seconds
fn default_fast_requeue() -> u64 {
    5
}

/// Helps serde default the error requeue interval to 60 seconds
fn default_error_requeue() -> u64 {
    60
}

/// Helps serde default the pool reconciler worker count to 1
fn default_group_workers() -> usize {
    1
}

/// Helps serde default the instance reconciler worker count to 3
fn default_instance_workers() -> usize {
    3
}

/// Settings for the reconcilers themselves
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Controllers {
    /// How long to wait before requeueing a settled resource in seconds
    #[serde(default = "default_requeue")]
    pub requeue: u64,
    /// How long to wait before requeueing a resource mid transition in seconds
    #[serde(default = "default_fast_requeue")]
    pub fast_requeue: u64,
    /// How long to wait before requeueing a failed reconcile in seconds
    #[serde(default = "default_error_requeue")]
    pub error_requeue: u64,
    /// How many node groups may reconcile at once
    #[serde(default = "default_group_workers")]
    pub group_workers: usize,
    /// How many instances may reconcile at once
    #[serde(default = "default_instance_workers")]
    pub instance_workers: usize,
}

impl Default for Controllers {
    fn default() -> Self {
        Controllers {
            requeue: default_requeue(),
            fast_requeue: default_fast_requeue(),
            error_requeue: default_error_requeue(),
            group_workers: default_group_workers(),
            instance_workers: default_instance_workers(),
        }
    }
}

/// Helps serde default the discovery window to 15 minutes
fn default_discovery_window() -> u64 {
    900
}

/// Helps serde default the create retry cap to 3 attempts
fn default_create_retries() -> u32 {
    3
}

/// Helps serde default the join timeout to 15 minutes
fn default_join_timeout() -> u64 {
    900
}

/// Helps serde default the provision timeout to 10 minutes
fn default_provision_timeout() -> u64 {
    600
}

/// Settings for the per instance state machine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Instances {
    /// How long to wait for an asynchronously created VM to be discovered in seconds
    #[serde(default = "default_discovery_window")]
    pub discovery_window: u64,
    /// How many times to retry a failed create before failing the instance
    #[serde(default = "default_create_retries")]
    pub create_retries: u32,
    /// How long to wait for a provisioned VM to join the cluster in seconds
    #[serde(default = "default_join_timeout")]
    pub join_timeout: u64,
    /// How long to wait for a replacement node to reach Ready in seconds
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout: u64,
    /// How long after which a Failed instance is deleted in seconds
    ///
    /// Failed instances are kept for operator inspection when this is unset.
    #[serde(default)]
    pub failed_ttl: Option<u64>,
}

impl Default for Instances {
    fn default() -> Self {
        Instances {
            discovery_window: default_discovery_window(),
            create_retries: default_create_retries(),
            join_timeout: default_join_timeout(),
            provision_timeout: default_provision_timeout(),
            failed_ttl: None,
        }
    }
}

/// Helps serde default the cpu scale down threshold to 50%
fn default_cpu_threshold() -> f64 {
    0.5
}

/// Helps serde default the memory scale down threshold to 50%
fn default_memory_threshold() -> f64 {
    0.5
}

/// Helps serde default the utilization observation window to 10 minutes
fn default_observation_window() -> u64 {
    600
}

/// Helps serde default the metric sample interval to 30 seconds
fn default_sample_interval() -> u64 {
    30
}

/// Helps serde default the drain timeout to 5 minutes
fn default_drain_timeout() -> u64 {
    300
}

/// Helps serde default the eviction retry interval to 5 seconds
fn default_eviction_retry() -> u64 {
    5
}

/// Helps serde default the scale down cooldown to 10 minutes
fn default_cooldown() -> u64 {
    600
}

/// Helps serde default the post scale up stabilization window to 10 minutes
fn default_stabilization() -> u64 {
    600
}

/// Settings for the scale down engine
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScaleDown {
    /// The cpu usage fraction below which a node counts as underutilized
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    /// The memory usage fraction below which a node counts as underutilized
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    /// How long a node must stay underutilized before becoming a candidate in seconds
    #[serde(default = "default_observation_window")]
    pub observation_window: u64,
    /// How often to sample node utilization in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
    /// How long a drain may run before aborting in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
    /// How long to wait between denied eviction attempts in seconds
    #[serde(default = "default_eviction_retry")]
    pub eviction_retry: u64,
    /// The fallback cooldown after a scale down when a group sets none in seconds
    #[serde(default = "default_cooldown")]
    pub cooldown: u64,
    /// The fallback stabilization window after a scale up in seconds
    #[serde(default = "default_stabilization")]
    pub stabilization: u64,
}

impl Default for ScaleDown {
    fn default() -> Self {
        ScaleDown {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            observation_window: default_observation_window(),
            sample_interval: default_sample_interval(),
            drain_timeout: default_drain_timeout(),
            eviction_retry: default_eviction_retry(),
            cooldown: default_cooldown(),
            stabilization: default_stabilization(),
        }
    }
}

/// The node replacement strategies the rebalancer can execute
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RebalanceStrategy {
    /// Replace nodes one batch at a time
    Rolling,
    /// Provision all replacements before draining any original
    Surge,
    /// Provision a full green set then cordon and drain the blue set
    BlueGreen,
}

impl Default for RebalanceStrategy {
    /// Rolling is the safe default
    fn default() -> Self {
        RebalanceStrategy::Rolling
    }
}

/// A day of week gate during which rebalancing may run
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MaintenanceWindow {
    /// The weekdays this window covers (Mon, Tue, ...)
    pub days: Vec<String>,
    /// The wall clock start of this window (parsed but not yet enforced)
    #[serde(default)]
    pub start: Option<String>,
    /// The wall clock end of this window (parsed but not yet enforced)
    #[serde(default)]
    pub end: Option<String>,
}

/// Helps serde default the rebalance sweep interval to 30 minutes
fn default_rebalance_interval() -> u64 {
    1800
}

/// Helps serde default the minimum relative savings to 15%
fn default_min_savings() -> f64 {
    0.15
}

/// Helps serde default the minimum healthy node percentage to 75%
fn default_min_healthy_percent() -> f64 {
    75.0
}

/// Helps serde default the rebalance cooldown to 1 hour
fn default_rebalance_cooldown() -> u64 {
    3600
}

/// Helps serde default the rolling batch size to one node
fn default_batch_size() -> usize {
    1
}

/// Helps serde default the capacity safety factor to 1.2
fn default_safety_factor() -> f64 {
    1.2
}

/// Helps serde default the offering cost cache ttl to 10 minutes
fn default_cost_ttl() -> u64 {
    600
}

/// Settings for the rebalancer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Rebalance {
    /// Whether the rebalancer sweep is enabled
    #[serde(default = "default_false")]
    pub enabled: bool,
    /// How often to sweep managed groups for rebalance candidates in seconds
    #[serde(default = "default_rebalance_interval")]
    pub interval: u64,
    /// The minimum relative savings an alternative offering must deliver
    #[serde(default = "default_min_savings")]
    pub min_savings: f64,
    /// The minimum percentage of cluster nodes that must be Ready
    #[serde(default = "default_min_healthy_percent")]
    pub min_healthy_percent: f64,
    /// How long after any scaling event a group may not be rebalanced in seconds
    #[serde(default = "default_rebalance_cooldown")]
    pub cooldown: u64,
    /// How many nodes a rolling batch replaces at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// The replacement strategy to plan with
    #[serde(default)]
    pub strategy: RebalanceStrategy,
    /// Whether a failed candidate aborts the batch and runs the rollback plan
    #[serde(default = "default_true")]
    pub rollback_on_failure: bool,
    /// The safety factor applied to displaced resource requests
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    /// How long offering prices may be cached in seconds
    #[serde(default = "default_cost_ttl")]
    pub cost_ttl: u64,
    /// The maintenance windows during which rebalancing may run
    ///
    /// An empty list means rebalancing is always allowed.
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

impl Default for Rebalance {
    fn default() -> Self {
        Rebalance {
            enabled: false,
            interval: default_rebalance_interval(),
            min_savings: default_min_savings(),
            min_healthy_percent: default_min_healthy_percent(),
            cooldown: default_rebalance_cooldown(),
            batch_size: default_batch_size(),
            strategy: RebalanceStrategy::default(),
            rollback_on_failure: true,
            safety_factor: default_safety_factor(),
            cost_ttl: default_cost_ttl(),
            maintenance_windows: Vec::default(),
        }
    }
}

/// Helps serde default the VPSie API url
fn default_vpsie_url() -> String {
    "https://api.vpsie.com/apps/v2".to_owned()
}

/// Helps serde default the VPSie request timeout to 30 seconds
fn default_vpsie_timeout() -> u64 {
    30
}

/// Helps serde default the credentials secret name
fn default_creds_secret() -> String {
    "vpsie-credentials".to_owned()
}

/// Settings for talking to the VPSie API
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VpsieApi {
    /// The base url for the VPSie API
    #[serde(default = "default_vpsie_url")]
    pub url: String,
    /// The client id to authenticate with
    #[serde(default)]
    pub client_id: String,
    /// The client secret to authenticate with
    #[serde(default)]
    pub client_secret: String,
    /// How long a single request may take in seconds
    #[serde(default = "default_vpsie_timeout")]
    pub timeout: u64,
    /// The secret holding rotated credentials
    #[serde(default = "default_creds_secret")]
    pub creds_secret: String,
}

impl Default for VpsieApi {
    fn default() -> Self {
        VpsieApi {
            url: default_vpsie_url(),
            client_id: String::default(),
            client_secret: String::default(),
            timeout: default_vpsie_timeout(),
            creds_secret: default_creds_secret(),
        }
    }
}

/// The autoscaler specific settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Autoscaler {
    /// The namespace the autoscaler operates in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// The level to log at
    #[serde(default)]
    pub log_level: LogLevel,
    /// Settings for leader election
    #[serde(default)]
    pub leader: LeaderElection,
    /// Settings for the reconcilers
    #[serde(default)]
    pub controllers: Controllers,
    /// Settings for the per instance state machine
    #[serde(default)]
    pub instances: Instances,
    /// Settings for the scale down engine
    #[serde(default)]
    pub scale_down: ScaleDown,
    /// Settings for the rebalancer
    #[serde(default)]
    pub rebalance: Rebalance,
}

impl Default for Autoscaler {
    fn default() -> Self {
        Autoscaler {
            namespace: default_namespace(),
            log_level: LogLevel::default(),
            leader: LeaderElection::default(),
            controllers: Controllers::default(),
            instances: Instances::default(),
            scale_down: ScaleDown::default(),
            rebalance: Rebalance::default(),
        }
    }
}

/// The config for the VPSie autoscaler
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Conf {
    /// The autoscaler specific settings
    #[serde(default)]
    pub autoscaler: Autoscaler,
    /// The VPSie API settings
    #[serde(default)]
    pub vpsie: VpsieApi,
}

impl Conf {
    /// Creates a new [Conf] object
    ///
    /// # Arguments
    ///
    /// * `path` - The path to use when reading the config file
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let conf: Conf = config::Config::builder()
            // load from a file first
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Yaml))
            // then overlay any environment args ontop
            .add_source(
                config::Environment::with_prefix("vpsie_autoscaler")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        Ok(conf)
    }
}
