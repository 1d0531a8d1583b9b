use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Deserializer};

use crate::common::hostlist::expand_hostlist;
use crate::server::allocation::directives::DirectivePreset;
use crate::server::allocation::limits::ResourceLimits;
use crate::{GIB, Map, Set};

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9431";

/// Options of the `coral-dws` service. Every option overrides the matching key of the
/// `[rabbit]` table in the configuration file.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct ServerOpts {
    /// Path to a TOML file with a `[rabbit]` table
    #[arg(long, env = "CORAL_DWS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to the kubeconfig used to reach the DataWorkflowServices API
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Address where the job manager connects to
    #[arg(long)]
    pub listen: Option<String>,

    /// Interval (in seconds) between forced re-polls of all watches
    #[arg(long)]
    pub watch_interval: Option<f64>,

    /// Increase verbosity of logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Minimum size of a single allocation, in bytes
    #[arg(long)]
    pub min_allocation_size: Option<u64>,

    /// Hostlist of compute nodes that may be drained
    #[arg(long)]
    pub drain_allowlist: Option<String>,

    /// Do not push storage status directly into the scheduler resource graph
    #[arg(long)]
    pub disable_fluxion: bool,

    /// Base delay (in seconds) of the retry ladder, doubled on every failure
    #[arg(long)]
    pub retry_delay: Option<f64>,

    /// JSON file describing the scheduler resource graph
    #[arg(long)]
    pub resource_graph: Option<PathBuf>,
}

/// Optional soft timeouts of the stages that hold compute resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageTimeouts {
    pub setup: Option<Duration>,
    pub prerun: Option<Duration>,
    pub postrun: Option<Duration>,
}

/// What to do when two storage nodes claim the same compute node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateClaimPolicy {
    #[default]
    Fail,
    Warn,
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct RabbitConfig {
    pub kubeconfig: Option<PathBuf>,
    pub listen: String,
    pub watch_interval: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub tc_timeout: Duration,
    pub stage_timeouts: StageTimeouts,
    pub drain_compute_nodes: bool,
    pub soft_drain: bool,
    /// `None` means that every compute node may be drained.
    pub drain_allowlist: Option<Set<String>>,
    pub restrict_persistent_creation: bool,
    pub instance_owner: u32,
    pub save_datamovements: usize,
    /// Bytes.
    pub min_allocation_size: u64,
    pub limits: ResourceLimits,
    pub presets: Map<String, DirectivePreset>,
    pub mapping: Option<PathBuf>,
    pub disable_fluxion: bool,
    pub resource_graph: Option<PathBuf>,
    pub exclude_hosts: Set<String>,
    pub duplicate_claims: DuplicateClaimPolicy,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
            watch_interval: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            tc_timeout: Duration::from_secs(10),
            stage_timeouts: StageTimeouts::default(),
            drain_compute_nodes: true,
            soft_drain: true,
            drain_allowlist: None,
            restrict_persistent_creation: true,
            instance_owner: nix::unistd::getuid().as_raw(),
            save_datamovements: 0,
            min_allocation_size: 4 * GIB,
            limits: ResourceLimits::default(),
            presets: Map::new(),
            mapping: None,
            disable_fluxion: false,
            resource_graph: None,
            exclude_hosts: Set::new(),
            duplicate_claims: DuplicateClaimPolicy::Fail,
        }
    }
}

fn deserialize_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Int(u64),
        Float(f64),
    }
    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Int(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(Seconds::Float(secs)) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize, Default, Debug)]
struct TimeoutsSection {
    #[serde(default, deserialize_with = "deserialize_seconds")]
    setup: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    prerun: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    postrun: Option<Duration>,
}

#[derive(Deserialize, Default, Debug)]
struct PolicySection {
    #[serde(default)]
    maximums: Option<toml::Table>,
    #[serde(flatten)]
    unknown: toml::Table,
}

/// The `[rabbit]` table as written in the file.
#[derive(Deserialize, Default, Debug)]
struct RabbitSection {
    kubeconfig: Option<PathBuf>,
    listen: Option<String>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    watch_interval: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    retry_delay: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    max_retry_delay: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_seconds")]
    tc_timeout: Option<Duration>,
    timeouts: Option<TimeoutsSection>,
    drain_compute_nodes: Option<bool>,
    soft_drain: Option<bool>,
    drain_allowlist: Option<String>,
    restrict_persistent_creation: Option<bool>,
    instance_owner: Option<u32>,
    save_datamovements: Option<usize>,
    min_allocation_size: Option<u64>,
    policy: Option<PolicySection>,
    presets: Option<Map<String, DirectivePreset>>,
    mapping: Option<PathBuf>,
    disable_fluxion: Option<bool>,
    resource_graph: Option<PathBuf>,
    exclude_hosts: Option<String>,
    duplicate_claims: Option<DuplicateClaimPolicy>,
    #[serde(flatten)]
    unknown: toml::Table,
}

#[derive(Deserialize, Default, Debug)]
struct ConfigFile {
    #[serde(default)]
    rabbit: RabbitSection,
}

fn parse_hostset(hostlist: &str) -> crate::Result<Set<String>> {
    expand_hostlist(hostlist)
        .map(|hosts| hosts.into_iter().collect())
        .map_err(|e| crate::Error::ConfigError(e.to_string()))
}

impl RabbitConfig {
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parses the content of a configuration file. Unknown keys are reported and ignored.
    pub fn parse(content: &str) -> crate::Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let section = file.rabbit;
        let mut config = RabbitConfig::default();

        for key in section.unknown.keys() {
            log::warn!("misconfiguration: unrecognized `rabbit.{key}` key in configuration");
        }
        if let Some(policy) = section.policy {
            for key in policy.unknown.keys() {
                log::warn!(
                    "misconfiguration: unrecognized `rabbit.policy.{key}` key, the policy table only accepts `maximums`"
                );
            }
            if let Some(maximums) = policy.maximums {
                config.limits = ResourceLimits::from_table(&maximums)?;
            }
        }

        if let Some(kubeconfig) = section.kubeconfig {
            config.kubeconfig = Some(kubeconfig);
        }
        if let Some(listen) = section.listen {
            config.listen = listen;
        }
        if let Some(interval) = section.watch_interval {
            config.watch_interval = interval;
        }
        if let Some(delay) = section.retry_delay {
            config.retry_delay = delay;
        }
        if let Some(delay) = section.max_retry_delay {
            config.max_retry_delay = delay;
        }
        if let Some(timeout) = section.tc_timeout {
            config.tc_timeout = timeout;
        }
        if let Some(timeouts) = section.timeouts {
            config.stage_timeouts = StageTimeouts {
                setup: timeouts.setup,
                prerun: timeouts.prerun,
                postrun: timeouts.postrun,
            };
        }
        if let Some(drain) = section.drain_compute_nodes {
            config.drain_compute_nodes = drain;
        }
        if let Some(soft_drain) = section.soft_drain {
            config.soft_drain = soft_drain;
        }
        if let Some(allowlist) = section.drain_allowlist {
            config.drain_allowlist = Some(parse_hostset(&allowlist)?);
        }
        if let Some(restrict) = section.restrict_persistent_creation {
            config.restrict_persistent_creation = restrict;
        }
        if let Some(owner) = section.instance_owner {
            config.instance_owner = owner;
        }
        if let Some(count) = section.save_datamovements {
            config.save_datamovements = count;
        }
        if let Some(size) = section.min_allocation_size {
            config.min_allocation_size = size;
        }
        if let Some(presets) = section.presets {
            config.presets = presets;
        }
        config.mapping = section.mapping;
        if let Some(disable) = section.disable_fluxion {
            config.disable_fluxion = disable;
        }
        config.resource_graph = section.resource_graph;
        if let Some(exclude) = section.exclude_hosts {
            config.exclude_hosts = parse_hostset(&exclude)?;
        }
        if let Some(policy) = section.duplicate_claims {
            config.duplicate_claims = policy;
        }
        config.validate()?;
        Ok(config)
    }

    /// Applies command line options on top of the file configuration.
    pub fn apply_opts(&mut self, opts: &ServerOpts) -> crate::Result<()> {
        if let Some(kubeconfig) = &opts.kubeconfig {
            self.kubeconfig = Some(kubeconfig.clone());
        }
        if let Some(listen) = &opts.listen {
            self.listen = listen.clone();
        }
        if let Some(interval) = opts.watch_interval {
            self.watch_interval = seconds_option("--watch-interval", interval)?;
        }
        if let Some(size) = opts.min_allocation_size {
            self.min_allocation_size = size;
        }
        if let Some(allowlist) = &opts.drain_allowlist {
            self.drain_allowlist = Some(parse_hostset(allowlist)?);
        }
        if opts.disable_fluxion {
            self.disable_fluxion = true;
        }
        if let Some(delay) = opts.retry_delay {
            self.retry_delay = seconds_option("--retry-delay", delay)?;
        }
        if let Some(graph) = &opts.resource_graph {
            self.resource_graph = Some(graph.clone());
        }
        self.validate()
    }

    fn validate(&self) -> crate::Result<()> {
        if self.watch_interval.is_zero() {
            return Err(crate::Error::ConfigError(
                "watch interval must be positive".to_string(),
            ));
        }
        if self.tc_timeout.is_zero() {
            return Err(crate::Error::ConfigError(
                "`rabbit.tc_timeout` must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn seconds_option(name: &str, value: f64) -> crate::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| crate::Error::ConfigError(format!("Invalid value of {name}: {e}")))
}
