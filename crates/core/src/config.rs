use std::collections::{HashMap, VecDeque};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MantisError;
use crate::mask::{SelectionMask, REFERENCE_MASK, REFERENCE_SENSOR_COUNT};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        if let Some(v) = env_opt(&format!("{profile}_{key}")) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn override_string(target: &mut String, profile: &str, key: &str) {
    if let Some(v) = profiled_env_opt(profile, key) {
        *target = v;
    }
}

fn override_parsed<T: FromStr>(target: &mut T, profile: &str, key: &str) -> Result<(), MantisError> {
    if let Some(v) = profiled_env_opt(profile, key) {
        *target = v
            .parse()
            .map_err(|_| MantisError::Config(format!("{key}: cannot parse '{v}'")))?;
    }
    Ok(())
}

// ── Top-level config ──────────────────────────────────────────

/// Settings for every process of the pipeline.
///
/// Read once at startup from an optional TOML file, then overridden by
/// `MANTIS_<SECTION>_<KEY>` environment variables, then validated. Nothing
/// changes afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MantisConfig {
    /// Active profile name (empty = default). Not part of the file.
    #[serde(skip)]
    pub profile: String,
    pub broker: BrokerSettings,
    pub features: FeatureStageConfig,
    pub anomaly: AnomalyStageConfig,
    pub rul: RulStageConfig,
    pub runtime: RuntimeConfig,
}

/// Topic wiring of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageIo {
    pub name: &'static str,
    pub input_topic: String,
    pub output_topic: String,
    pub group_id: String,
    pub metrics_port: u16,
}

impl MantisConfig {
    /// Load `.env`, then the TOML file at `path` if it exists (defaults
    /// otherwise), then env overrides. The profile comes from `MANTIS_PROFILE`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MantisError> {
        load_dotenv();
        let profile = env_opt("MANTIS_PROFILE").unwrap_or_default().to_uppercase();
        let path = path.as_ref();
        let base = if path.exists() {
            tracing::info!(path = %path.display(), "reading config file");
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        base.finish(&profile)
    }

    /// Parse a TOML document and apply env overrides for `profile`.
    pub fn from_toml(toml_str: &str, profile: &str) -> Result<Self, MantisError> {
        let base: Self = toml::from_str(toml_str)?;
        base.finish(profile)
    }

    /// Defaults plus env overrides for `profile`.
    pub fn for_profile(profile: &str) -> Result<Self, MantisError> {
        Self::default().finish(profile)
    }

    fn finish(mut self, profile: &str) -> Result<Self, MantisError> {
        self.profile = profile.to_uppercase();
        self.apply_env_overrides()?;
        self.validate()?;
        Ok(self)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    pub fn stages(&self) -> [StageIo; 3] {
        [self.features.io(), self.anomaly.io(), self.rul.io()]
    }

    /// Stage names ordered so every producer comes before its consumers.
    pub fn stage_order(&self) -> Result<Vec<&'static str>, MantisError> {
        topological_order(&self.stages())
    }

    /// `MANTIS_<SECTION>_<KEY>` overrides `section.key`, e.g.
    /// `MANTIS_ANOMALY_BUFFER_CAPACITY` or `MANTIS_FEATURES_MASK=1,2,3`.
    fn apply_env_overrides(&mut self) -> Result<(), MantisError> {
        let p = self.profile.clone();
        let p = p.as_str();

        override_string(&mut self.broker.frontend, p, "MANTIS_BROKER_FRONTEND");
        override_string(&mut self.broker.backend, p, "MANTIS_BROKER_BACKEND");
        override_parsed(&mut self.broker.connect_attempts, p, "MANTIS_BROKER_CONNECT_ATTEMPTS")?;
        override_parsed(&mut self.broker.connect_backoff_ms, p, "MANTIS_BROKER_CONNECT_BACKOFF_MS")?;

        let f = &mut self.features;
        override_string(&mut f.input_topic, p, "MANTIS_FEATURES_INPUT_TOPIC");
        override_string(&mut f.output_topic, p, "MANTIS_FEATURES_OUTPUT_TOPIC");
        override_string(&mut f.group_id, p, "MANTIS_FEATURES_GROUP_ID");
        override_parsed(&mut f.metrics_port, p, "MANTIS_FEATURES_METRICS_PORT")?;
        override_parsed(&mut f.sensor_count, p, "MANTIS_FEATURES_SENSOR_COUNT")?;
        if let Some(raw) = profiled_env_opt(p, "MANTIS_FEATURES_MASK") {
            f.mask = parse_index_list(&raw)?;
        }

        let a = &mut self.anomaly;
        override_string(&mut a.input_topic, p, "MANTIS_ANOMALY_INPUT_TOPIC");
        override_string(&mut a.output_topic, p, "MANTIS_ANOMALY_OUTPUT_TOPIC");
        override_string(&mut a.group_id, p, "MANTIS_ANOMALY_GROUP_ID");
        override_parsed(&mut a.metrics_port, p, "MANTIS_ANOMALY_METRICS_PORT")?;
        override_parsed(&mut a.buffer_capacity, p, "MANTIS_ANOMALY_BUFFER_CAPACITY")?;
        override_parsed(&mut a.contamination, p, "MANTIS_ANOMALY_CONTAMINATION")?;
        override_parsed(&mut a.n_trees, p, "MANTIS_ANOMALY_N_TREES")?;
        override_parsed(&mut a.seed, p, "MANTIS_ANOMALY_SEED")?;
        override_parsed(&mut a.scope, p, "MANTIS_ANOMALY_SCOPE")?;

        let r = &mut self.rul;
        override_string(&mut r.input_topic, p, "MANTIS_RUL_INPUT_TOPIC");
        override_string(&mut r.output_topic, p, "MANTIS_RUL_OUTPUT_TOPIC");
        override_string(&mut r.group_id, p, "MANTIS_RUL_GROUP_ID");
        override_parsed(&mut r.metrics_port, p, "MANTIS_RUL_METRICS_PORT")?;
        if let Some(v) = profiled_env_opt(p, "MANTIS_RUL_MODEL_PATH") {
            r.model_path = PathBuf::from(v);
        }
        override_parsed(&mut r.hidden_size, p, "MANTIS_RUL_HIDDEN_SIZE")?;
        override_parsed(&mut r.num_layers, p, "MANTIS_RUL_NUM_LAYERS")?;
        if let Some(v) = profiled_env_opt(p, "MANTIS_RUL_SEED") {
            r.seed = Some(
                v.parse()
                    .map_err(|_| MantisError::Config(format!("MANTIS_RUL_SEED: cannot parse '{v}'")))?,
            );
        }

        let rt = &mut self.runtime;
        override_parsed(&mut rt.health_interval_secs, p, "MANTIS_RUNTIME_HEALTH_INTERVAL_SECS")?;
        override_parsed(&mut rt.shutdown_timeout_secs, p, "MANTIS_RUNTIME_SHUTDOWN_TIMEOUT_SECS")?;
        override_parsed(&mut rt.publish_attempts, p, "MANTIS_RUNTIME_PUBLISH_ATTEMPTS")?;
        override_parsed(&mut rt.publish_backoff_ms, p, "MANTIS_RUNTIME_PUBLISH_BACKOFF_MS")?;
        Ok(())
    }

    // ── Validation ──────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), MantisError> {
        for io in self.stages() {
            if io.input_topic.is_empty() || io.output_topic.is_empty() {
                return Err(MantisError::Config(format!("stage '{}' has an empty topic", io.name)));
            }
            if io.input_topic == io.output_topic {
                return Err(MantisError::Config(format!(
                    "stage '{}' reads and writes the same topic '{}'",
                    io.name, io.input_topic
                )));
            }
            if io.group_id.is_empty() {
                return Err(MantisError::Config(format!("stage '{}' has an empty group id", io.name)));
            }
        }
        self.features.selection_mask()?;
        self.anomaly.validate()?;
        self.rul.validate()?;
        if self.broker.connect_attempts == 0 || self.runtime.publish_attempts == 0 {
            return Err(MantisError::Config("retry attempts must be at least 1".into()));
        }
        self.stage_order()?;
        Ok(())
    }

    /// Startup summary, one line per section.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  broker:    frontend={}, backend={}", self.broker.frontend, self.broker.backend);
        tracing::info!(
            "  features:  {} -> {}, group={}, k={} of n={}",
            self.features.input_topic,
            self.features.output_topic,
            self.features.group_id,
            self.features.mask.len(),
            self.features.sensor_count
        );
        tracing::info!(
            "  anomaly:   {} -> {}, group={}, buffer={}, contamination={}, trees={}, scope={:?}",
            self.anomaly.input_topic,
            self.anomaly.output_topic,
            self.anomaly.group_id,
            self.anomaly.buffer_capacity,
            self.anomaly.contamination,
            self.anomaly.n_trees,
            self.anomaly.scope
        );
        tracing::info!(
            "  rul:       {} -> {}, group={}, model={}, hidden={}, layers={}",
            self.rul.input_topic,
            self.rul.output_topic,
            self.rul.group_id,
            self.rul.model_path.display(),
            self.rul.hidden_size,
            self.rul.num_layers
        );
    }
}

// ── Broker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Where stages publish (the broker's SUB side).
    pub frontend: String,
    /// Where stages subscribe (the broker's PUB side).
    pub backend: String,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            frontend: "ipc:///tmp/mantis/broker-frontend.sock".into(),
            backend: "ipc:///tmp/mantis/broker-backend.sock".into(),
            connect_attempts: 5,
            connect_backoff_ms: 200,
        }
    }
}

// ── Feature reducer ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureStageConfig {
    pub input_topic: String,
    pub output_topic: String,
    pub group_id: String,
    pub metrics_port: u16,
    /// 0-based sensor indices kept by the reducer.
    pub mask: Vec<usize>,
    /// Raw sensor count N the mask is checked against.
    pub sensor_count: usize,
}

impl Default for FeatureStageConfig {
    fn default() -> Self {
        Self {
            input_topic: "preprocessed-data".into(),
            output_topic: "features-data".into(),
            group_id: "feature-extraction-group".into(),
            metrics_port: 0,
            mask: REFERENCE_MASK.to_vec(),
            sensor_count: REFERENCE_SENSOR_COUNT,
        }
    }
}

impl FeatureStageConfig {
    pub fn io(&self) -> StageIo {
        StageIo {
            name: "feature-reducer",
            input_topic: self.input_topic.clone(),
            output_topic: self.output_topic.clone(),
            group_id: self.group_id.clone(),
            metrics_port: self.metrics_port,
        }
    }

    pub fn selection_mask(&self) -> Result<SelectionMask, MantisError> {
        SelectionMask::new(self.mask.clone(), self.sensor_count)
    }
}

// ── Anomaly scorer ────────────────────────────────────────────

/// Who owns a buffer-then-fit state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerScope {
    /// One scorer for the whole process.
    #[default]
    Process,
    /// One scorer per machine id.
    Machine,
}

impl FromStr for ScorerScope {
    type Err = MantisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "machine" => Ok(Self::Machine),
            other => Err(MantisError::Config(format!(
                "unknown scorer scope '{other}', expected 'process' or 'machine'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyStageConfig {
    pub input_topic: String,
    pub output_topic: String,
    pub group_id: String,
    pub metrics_port: u16,
    /// Vectors buffered before the one-shot fit (B).
    pub buffer_capacity: usize,
    /// Expected outlier share of the training buffer, in (0, 0.5].
    pub contamination: f64,
    pub n_trees: usize,
    pub seed: u64,
    pub scope: ScorerScope,
}

impl Default for AnomalyStageConfig {
    fn default() -> Self {
        Self {
            input_topic: "features-data".into(),
            output_topic: "anomaly-events".into(),
            group_id: "anomaly-detection-group".into(),
            metrics_port: 0,
            buffer_capacity: 100,
            contamination: 0.05,
            n_trees: 100,
            seed: 42,
            scope: ScorerScope::Process,
        }
    }
}

impl AnomalyStageConfig {
    pub fn io(&self) -> StageIo {
        StageIo {
            name: "anomaly-scorer",
            input_topic: self.input_topic.clone(),
            output_topic: self.output_topic.clone(),
            group_id: self.group_id.clone(),
            metrics_port: self.metrics_port,
        }
    }

    fn validate(&self) -> Result<(), MantisError> {
        if self.buffer_capacity < 2 {
            return Err(MantisError::Config(format!(
                "anomaly.buffer_capacity must be at least 2, got {}",
                self.buffer_capacity
            )));
        }
        if !(self.contamination > 0.0 && self.contamination <= 0.5) {
            return Err(MantisError::Config(format!(
                "anomaly.contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.n_trees == 0 {
            return Err(MantisError::Config("anomaly.n_trees must be at least 1".into()));
        }
        Ok(())
    }
}

// ── RUL predictor ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulStageConfig {
    pub input_topic: String,
    pub output_topic: String,
    pub group_id: String,
    pub metrics_port: u16,
    /// Persisted regressor; absent file means random weights.
    pub model_path: PathBuf,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// Seed for random initialisation; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for RulStageConfig {
    fn default() -> Self {
        Self {
            input_topic: "features-data".into(),
            output_topic: "rul-predictions".into(),
            group_id: "rul-prediction-group".into(),
            metrics_port: 0,
            model_path: PathBuf::from("model.json"),
            hidden_size: 64,
            num_layers: 2,
            seed: None,
        }
    }
}

impl RulStageConfig {
    pub fn io(&self) -> StageIo {
        StageIo {
            name: "rul-predictor",
            input_topic: self.input_topic.clone(),
            output_topic: self.output_topic.clone(),
            group_id: self.group_id.clone(),
            metrics_port: self.metrics_port,
        }
    }

    fn validate(&self) -> Result<(), MantisError> {
        if self.hidden_size == 0 || self.num_layers == 0 {
            return Err(MantisError::Config(
                "rul.hidden_size and rul.num_layers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ── Runtime ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub health_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub publish_attempts: u32,
    pub publish_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: 30,
            shutdown_timeout_secs: 5,
            publish_attempts: 3,
            publish_backoff_ms: 50,
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn parse_index_list(raw: &str) -> Result<Vec<usize>, MantisError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| MantisError::Config(format!("bad sensor index '{s}' in mask")))
        })
        .collect()
}

/// Kahn's algorithm over "A's output topic is B's input topic" edges.
fn topological_order(stages: &[StageIo]) -> Result<Vec<&'static str>, MantisError> {
    let mut in_degree: HashMap<&'static str, usize> = stages.iter().map(|s| (s.name, 0)).collect();
    let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();

    for producer in stages {
        for consumer in stages.iter().filter(|c| c.input_topic == producer.output_topic) {
            dependents.entry(producer.name).or_default().push(consumer.name);
            *in_degree.entry(consumer.name).or_insert(0) += 1;
        }
    }

    // seed in declaration order so the result is stable
    let mut queue: VecDeque<&'static str> = stages
        .iter()
        .map(|s| s.name)
        .filter(|name| in_degree.get(name) == Some(&0))
        .collect();
    let mut sorted = Vec::with_capacity(stages.len());

    while let Some(node) = queue.pop_front() {
        sorted.push(node);
        for &dep in dependents.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(deg) = in_degree.get_mut(dep) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(dep);
                }
            }
        }
    }

    if sorted.len() != stages.len() {
        let in_cycle: Vec<&str> = stages
            .iter()
            .map(|s| s.name)
            .filter(|name| !sorted.contains(name))
            .collect();
        return Err(MantisError::Config(format!(
            "stage topics form a cycle among: {}",
            in_cycle.join(", ")
        )));
    }
    Ok(sorted)
}

// ── Tests ─────────────────────────────────────────────────────
