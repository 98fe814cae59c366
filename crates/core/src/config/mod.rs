//! Run configuration: node parameters, congestion tuning, simulation knobs and
//! the aggregation tree.
//!
//! A [`Config`] is read from a TOML (or JSON) file and then refined by
//! command line arguments through [`ConfigArgs::build`]. Values given on the
//! command line always win over the file.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::congestion::{
    CongestionControlAlgorithm, CongestionControlConfig, PartialTimeoutPolicy, CUBIC_BETA,
    CUBIC_C, DEFAULT_CWND_GAIN, DEFAULT_MAX_WINDOW, DEFAULT_SSTHRESH,
};

/// Default number of rounds a node keeps open at once.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10;
/// Default straggler timeout.
pub const DEFAULT_CHILD_TIMEOUT: Duration = Duration::from_secs(1);
/// Default simulated run length.
pub const DEFAULT_STOP_TIME: Duration = Duration::from_secs(20);
/// Value a leaf reports when none is configured.
pub const DEFAULT_LEAF_VALUE: u64 = 1;

#[derive(clap::Parser, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Configuration file (`.toml` or `.json`).
    #[arg(long, short, env = "CFNAGG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Aggregation tree file: one `parent child...` line per inner node.
    /// Replaces the nodes listed in the configuration file.
    #[arg(long, env = "CFNAGG_AGG_TREE")]
    pub agg_tree: Option<PathBuf>,

    /// Seed for every random decision of the simulation.
    #[arg(long, env = "CFNAGG_SEED")]
    pub seed: Option<u64>,

    /// Stop issuing rounds after this many.
    #[arg(long, env = "CFNAGG_ROUNDS")]
    pub rounds: Option<u64>,

    #[arg(long, value_enum, env = "CFNAGG_CONGESTION_CONTROL")]
    pub congestion_control: Option<CongestionControlAlgorithm>,

    /// Straggler timeout in milliseconds.
    #[arg(long, env = "CFNAGG_CHILD_TIMEOUT_MS")]
    pub child_timeout_ms: Option<u64>,

    /// Maximum number of rounds a node keeps open.
    #[arg(long, env = "CFNAGG_BUFFER_CAPACITY")]
    pub buffer_capacity: Option<usize>,

    /// Virtual time at which the simulation stops, in milliseconds.
    #[arg(long, env = "CFNAGG_STOP_TIME_MS")]
    pub stop_time_ms: Option<u64>,

    #[arg(long, value_enum, env = "CFNAGG_PARTIAL_TIMEOUT_POLICY")]
    pub partial_timeout_policy: Option<PartialTimeoutPolicy>,

    /// Probability that any single message is lost.
    #[arg(long, env = "CFNAGG_LOSS_RATE")]
    pub loss_rate: Option<f64>,

    #[arg(long, env = "CFNAGG_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,
}

impl ConfigArgs {
    /// Loads the configuration file (if any), applies the tree file and the
    /// command line overrides, and validates the result.
    pub fn build(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(path) = &self.agg_tree {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading aggregation tree {}", path.display()))?;
            config.nodes = parse_tree(&text)
                .with_context(|| format!("parsing aggregation tree {}", path.display()))?;
        }

        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(&self, config: &mut Config) {
        if let Some(seed) = self.seed {
            config.simulation.seed = seed;
        }
        if let Some(rounds) = self.rounds {
            config.aggregation.rounds = Some(rounds);
        }
        if let Some(algorithm) = self.congestion_control {
            config.congestion.algorithm = algorithm;
        }
        if let Some(ms) = self.child_timeout_ms {
            config.aggregation.child_timeout_ms = ms;
        }
        if let Some(capacity) = self.buffer_capacity {
            config.aggregation.buffer_capacity = capacity;
        }
        if let Some(ms) = self.stop_time_ms {
            config.simulation.stop_time_ms = ms;
        }
        if let Some(policy) = self.partial_timeout_policy {
            config.aggregation.partial_timeout_policy = policy;
        }
        if let Some(rate) = self.loss_rate {
            config.simulation.loss_rate = rate;
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("no root node configured")]
    NoRoot,
    #[error("more than one root node: `{0}` and `{1}`")]
    MultipleRoots(String, String),
    #[error("node name `{0}` is used more than once")]
    DuplicateName(String),
    #[error("node name must not be empty or contain `/`: `{0}`")]
    InvalidName(String),
    #[error("`{parent}` lists unknown child `{child}`")]
    UnknownChild { parent: String, child: String },
    #[error("leaf `{0}` cannot have children")]
    LeafWithChildren(String),
    #[error("root `{0}` has no children")]
    ChildlessRoot(String),
    #[error("node `{0}` is reachable from the root more than once")]
    SharedChild(String),
    #[error("node `{0}` is not reachable from the root")]
    Unreachable(String),
    #[error("buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("child timeout must be greater than zero")]
    ZeroTimeout,
    #[error("loss rate must be within [0, 1], got {0}")]
    InvalidLossRate(f64),
    #[error("cubic-c must be positive, got {0}")]
    InvalidCubicC(f64),
    #[error("cubic-beta must be within (0, 1), got {0}")]
    InvalidCubicBeta(f64),
    #[error("bbr-cwnd-gain must be positive, got {0}")]
    InvalidCwndGain(f64),
    #[error("`{0}` has more children than a round can count")]
    TooManyChildren(String),
    #[error("line {line}: {reason}")]
    TreeSyntax { line: usize, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub congestion: CongestionSettings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AggregationConfig {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_child_timeout_ms")]
    pub child_timeout_ms: u64,
    /// Total number of rounds the root issues; unbounded when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u64>,
    #[serde(default)]
    pub partial_timeout_policy: PartialTimeoutPolicy,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            child_timeout_ms: default_child_timeout_ms(),
            rounds: None,
            partial_timeout_policy: PartialTimeoutPolicy::default(),
        }
    }
}

impl AggregationConfig {
    pub fn child_timeout(&self) -> Duration {
        Duration::from_millis(self.child_timeout_ms)
    }
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_child_timeout_ms() -> u64 {
    DEFAULT_CHILD_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CongestionSettings {
    #[serde(default)]
    pub algorithm: CongestionControlAlgorithm,
    #[serde(default = "default_initial_window")]
    pub initial_window: usize,
    #[serde(default = "default_ssthresh")]
    pub ssthresh: usize,
    #[serde(default = "default_max_window")]
    pub max_window: usize,
    #[serde(default = "default_cubic_c")]
    pub cubic_c: f64,
    #[serde(default = "default_cubic_beta")]
    pub cubic_beta: f64,
    #[serde(default = "default_bbr_cwnd_gain")]
    pub bbr_cwnd_gain: f64,
}

impl Default for CongestionSettings {
    fn default() -> Self {
        Self {
            algorithm: CongestionControlAlgorithm::default(),
            initial_window: default_initial_window(),
            ssthresh: DEFAULT_SSTHRESH,
            max_window: DEFAULT_MAX_WINDOW,
            cubic_c: CUBIC_C,
            cubic_beta: CUBIC_BETA,
            bbr_cwnd_gain: default_bbr_cwnd_gain(),
        }
    }
}

impl CongestionSettings {
    /// Controller configuration for the selected algorithm. Parameters of the
    /// other algorithms are ignored.
    pub fn to_congestion_config(&self) -> CongestionControlConfig {
        CongestionControlConfig::new(self.algorithm)
            .with_initial_window(self.initial_window)
            .with_ssthresh(self.ssthresh)
            .with_max_window(self.max_window)
            .with_cubic_params(self.cubic_c, self.cubic_beta)
            .with_bbr_cwnd_gain(self.bbr_cwnd_gain)
    }

    /// Rejects tuning values that would make a controller grow on timeouts
    /// or compute a NaN target.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cubic_c.is_finite() || self.cubic_c <= 0.0 {
            return Err(ConfigError::InvalidCubicC(self.cubic_c));
        }
        if self.cubic_beta.is_nan() || self.cubic_beta <= 0.0 || self.cubic_beta >= 1.0 {
            return Err(ConfigError::InvalidCubicBeta(self.cubic_beta));
        }
        if !self.bbr_cwnd_gain.is_finite() || self.bbr_cwnd_gain <= 0.0 {
            return Err(ConfigError::InvalidCwndGain(self.bbr_cwnd_gain));
        }
        Ok(())
    }
}

fn default_initial_window() -> usize {
    1
}

fn default_ssthresh() -> usize {
    DEFAULT_SSTHRESH
}

fn default_max_window() -> usize {
    DEFAULT_MAX_WINDOW
}

fn default_cubic_c() -> f64 {
    CUBIC_C
}

fn default_cubic_beta() -> f64 {
    CUBIC_BETA
}

fn default_bbr_cwnd_gain() -> f64 {
    DEFAULT_CWND_GAIN
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimulationSettings {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_stop_time_ms")]
    pub stop_time_ms: u64,
    /// One-way latency of every link.
    #[serde(default = "default_link_latency_ms")]
    pub link_latency_ms: u64,
    /// Uniform jitter added on top of the link latency.
    #[serde(default)]
    pub latency_jitter_ms: u64,
    #[serde(default)]
    pub loss_rate: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            stop_time_ms: default_stop_time_ms(),
            link_latency_ms: default_link_latency_ms(),
            latency_jitter_ms: 0,
            loss_rate: 0.0,
        }
    }
}

impl SimulationSettings {
    pub fn stop_time(&self) -> Duration {
        Duration::from_millis(self.stop_time_ms)
    }

    pub fn link_latency(&self) -> Duration {
        Duration::from_millis(self.link_latency_ms)
    }

    pub fn latency_jitter(&self) -> Duration {
        Duration::from_millis(self.latency_jitter_ms)
    }
}

fn default_seed() -> u64 {
    0xC0FFEE
}

fn default_stop_time_ms() -> u64 {
    DEFAULT_STOP_TIME.as_millis() as u64
}

fn default_link_latency_ms() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Root,
    Aggregator,
    Leaf,
}

/// One node of the aggregation tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSpec {
    pub name: String,
    pub role: RoleKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
    /// Reported by leaves; ignored for other roles.
    #[serde(default = "default_leaf_value")]
    pub value: u64,
    /// Extra delay on everything this node sends.
    #[serde(default)]
    pub extra_delay_ms: u64,
    /// Crashed nodes never start and drop everything sent to them.
    #[serde(default)]
    pub crashed: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, role: RoleKind) -> Self {
        Self {
            name: name.into(),
            role,
            children: Vec::new(),
            value: DEFAULT_LEAF_VALUE,
            extra_delay_ms: 0,
            crashed: false,
        }
    }

    pub fn root<S: Into<String>>(name: impl Into<String>, children: impl IntoIterator<Item = S>) -> Self {
        Self::new(name, RoleKind::Root).with_children(children)
    }

    pub fn aggregator<S: Into<String>>(
        name: impl Into<String>,
        children: impl IntoIterator<Item = S>,
    ) -> Self {
        Self::new(name, RoleKind::Aggregator).with_children(children)
    }

    pub fn leaf(name: impl Into<String>, value: u64) -> Self {
        Self {
            value,
            ..Self::new(name, RoleKind::Leaf)
        }
    }

    pub fn with_children<S: Into<String>>(mut self, children: impl IntoIterator<Item = S>) -> Self {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra_delay(mut self, delay: Duration) -> Self {
        self.extra_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn crashed(mut self) -> Self {
        self.crashed = true;
        self
    }

    pub fn extra_delay(&self) -> Duration {
        Duration::from_millis(self.extra_delay_ms)
    }
}

fn default_leaf_value() -> u64 {
    DEFAULT_LEAF_VALUE
}

impl Config {
    /// Reads a configuration file, picking the format from its extension.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = ?path, "Reading configuration file");
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext {
            "toml" => toml::from_str(&content)
                .with_context(|| format!("parsing configuration file {}", path.display())),
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("parsing configuration file {}", path.display())),
            ext => anyhow::bail!("invalid configuration file extension: `{ext}`"),
        }
    }

    pub fn root(&self) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.role == RoleKind::Root)
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregation.buffer_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.aggregation.child_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        let loss = self.simulation.loss_rate;
        if !(0.0..=1.0).contains(&loss) {
            return Err(ConfigError::InvalidLossRate(loss));
        }
        self.congestion.validate()?;
        self.validate_tree()
    }

    fn validate_tree(&self) -> Result<(), ConfigError> {
        let mut by_name: HashMap<&str, &NodeSpec> = HashMap::with_capacity(self.nodes.len());
        let mut root: Option<&NodeSpec> = None;
        for node in &self.nodes {
            if node.name.is_empty() || node.name.contains('/') {
                return Err(ConfigError::InvalidName(node.name.clone()));
            }
            if by_name.insert(&node.name, node).is_some() {
                return Err(ConfigError::DuplicateName(node.name.clone()));
            }
            match node.role {
                RoleKind::Root => {
                    if let Some(first) = root {
                        return Err(ConfigError::MultipleRoots(
                            first.name.clone(),
                            node.name.clone(),
                        ));
                    }
                    root = Some(node);
                }
                RoleKind::Leaf if !node.children.is_empty() => {
                    return Err(ConfigError::LeafWithChildren(node.name.clone()));
                }
                _ => {}
            }
            if u32::try_from(node.children.len()).is_err() {
                return Err(ConfigError::TooManyChildren(node.name.clone()));
            }
        }

        let root = root.ok_or(ConfigError::NoRoot)?;
        if root.children.is_empty() {
            return Err(ConfigError::ChildlessRoot(root.name.clone()));
        }

        let mut seen: HashSet<&str> = HashSet::from([root.name.as_str()]);
        let mut queue = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for child in &node.children {
                let spec = by_name
                    .get(child.as_str())
                    .copied()
                    .ok_or_else(|| ConfigError::UnknownChild {
                        parent: node.name.clone(),
                        child: child.clone(),
                    })?;
                if !seen.insert(child.as_str()) {
                    return Err(ConfigError::SharedChild(child.clone()));
                }
                queue.push_back(spec);
            }
        }

        if let Some(orphan) = self.nodes.iter().find(|n| !seen.contains(n.name.as_str())) {
            return Err(ConfigError::Unreachable(orphan.name.clone()));
        }
        Ok(())
    }
}

/// Parses an aggregation tree file.
///
/// Each non-empty line not starting with `#` names a parent followed by its
/// children. The root is the parent never listed as a child; names that
/// only appear as children become leaves with the default value.
pub fn parse_tree(text: &str) -> Result<Vec<NodeSpec>, ConfigError> {
    let mut parents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut order: Vec<String> = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace().map(str::to_owned);
        let Some(parent) = parts.next() else {
            continue;
        };
        let children: Vec<String> = parts.collect();
        if children.is_empty() {
            return Err(ConfigError::TreeSyntax {
                line: idx + 1,
                reason: format!("`{parent}` lists no children"),
            });
        }
        if parents.insert(parent.clone(), children).is_some() {
            return Err(ConfigError::DuplicateName(parent));
        }
        order.push(parent);
    }

    let listed: HashSet<&String> = parents.values().flatten().collect();
    let mut roots = parents.keys().filter(|p| !listed.contains(p));
    let root = roots.next().ok_or(ConfigError::NoRoot)?.clone();
    if let Some(second) = roots.next() {
        return Err(ConfigError::MultipleRoots(root, second.clone()));
    }

    let mut nodes = Vec::new();
    let mut emitted: HashSet<String> = HashSet::new();
    for parent in &order {
        let role = if *parent == root {
            RoleKind::Root
        } else {
            RoleKind::Aggregator
        };
        let children = parents.get(parent).cloned().unwrap_or_default();
        emitted.insert(parent.clone());
        nodes.push(NodeSpec::new(parent.clone(), role).with_children(children));
    }
    for parent in &order {
        for child in parents.get(parent).into_iter().flatten() {
            if emitted.insert(child.clone()) {
                nodes.push(NodeSpec::leaf(child.clone(), DEFAULT_LEAF_VALUE));
            }
        }
    }
    Ok(nodes)
}
