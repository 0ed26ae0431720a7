// ABOUTME: Workload-aware timeout selection for daemon calls
// ABOUTME: Resolves exact overrides, operator patterns, built-in categories, then defaults

//! Timeout policy.
//!
//! The same logical daemon call takes wildly different times depending on
//! the workload behind a container: per-container stats on a busy game
//! server are far slower than on an idle web server. The engine classifies a
//! container by name and returns a `(stats, info)` timeout pair.
//!
//! # Resolution order
//!
//! ```text
//! 1. exact name override      (operator file: container_overrides)
//! 2. operator pattern groups  (operator file: custom_patterns, case-insensitive substring)
//! 3. built-in categories      (game / database / media / web, substring)
//! 4. global default pair
//! ```
//!
//! The rule set is built once into an ordered list of [`TimeoutRule`]s and
//! cached until [`TimeoutPolicyEngine::invalidate`] is called. A missing or
//! malformed override file is logged and ignored; resolution never fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::duration_secs;

// === Operation Kinds ===

/// Kind of daemon call a connection is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Cheap bulk listing of containers
    List,
    /// Per-container inspect
    Info,
    /// Per-container resource statistics (the expensive one)
    Stats,
    /// Start / stop / restart
    Action,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::List => "list",
            Self::Info => "info",
            Self::Stats => "stats",
            Self::Action => "action",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "list" => Ok(Self::List),
            "info" | "inspect" => Ok(Self::Info),
            "stats" => Ok(Self::Stats),
            "action" => Ok(Self::Action),
            other => Err(format!("unknown operation kind '{other}' (expected list, info, stats or action)")),
        }
    }
}

// === Rules ===

/// Stats / info timeout pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPair {
    /// Timeout for per-container statistics calls
    pub stats: Duration,
    /// Timeout for per-container inspect calls
    pub info: Duration,
}

impl TimeoutPair {
    const fn secs(stats: u64, info: u64) -> Self {
        Self {
            stats: Duration::from_secs(stats),
            info: Duration::from_secs(info),
        }
    }
}

/// Built-in workload classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadCategory {
    /// Dedicated game servers; stats calls are slow under player load
    GameServer,
    /// Relational and document stores, caches, search engines
    Database,
    /// Streaming and download services
    MediaServer,
    /// Reverse proxies and HTTP servers
    WebServer,
}

impl std::fmt::Display for WorkloadCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GameServer => "game-server",
            Self::Database => "database",
            Self::MediaServer => "media-server",
            Self::WebServer => "web-server",
        };
        f.write_str(name)
    }
}

/// How a rule decides whether it applies to a container name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// Name equals the key exactly
    Exact(String),
    /// Operator-defined group; any pattern is a case-insensitive substring
    CustomPattern {
        /// Group name from the override file
        group: String,
        /// Stored lowercased
        patterns: Vec<String>,
    },
    /// Built-in class matched by substring of the lowercased name
    BuiltinCategory {
        /// Category reported when the rule matches
        category: WorkloadCategory,
        /// Lowercase substrings
        patterns: &'static [&'static str],
    },
}

/// One entry of the ordered rule list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutRule {
    /// Which names the rule applies to
    pub matcher: RuleMatch,
    /// Timeouts handed out on a match
    pub timeouts: TimeoutPair,
}

impl TimeoutRule {
    fn matches(&self, name: &str, lowered: &str) -> bool {
        match &self.matcher {
            RuleMatch::Exact(key) => key == name,
            RuleMatch::CustomPattern { patterns, .. } => {
                patterns.iter().any(|p| lowered.contains(p.as_str()))
            }
            RuleMatch::BuiltinCategory { patterns, .. } => {
                patterns.iter().any(|p| lowered.contains(p))
            }
        }
    }

    fn source(&self) -> TimeoutSource {
        match &self.matcher {
            RuleMatch::Exact(key) => TimeoutSource::ExactOverride(key.clone()),
            RuleMatch::CustomPattern { group, .. } => TimeoutSource::CustomPattern(group.clone()),
            RuleMatch::BuiltinCategory { category, .. } => TimeoutSource::Category(*category),
        }
    }
}

lazy_static! {
    static ref BUILTIN_RULES: Vec<TimeoutRule> = vec![
        TimeoutRule {
            matcher: RuleMatch::BuiltinCategory {
                category: WorkloadCategory::GameServer,
                patterns: &[
                    "minecraft", "valheim", "satisfactory", "palworld", "terraria",
                    "factorio", "7dtd", "rust-server", "enshrouded", "ark-survival",
                ],
            },
            timeouts: TimeoutPair::secs(30, 15),
        },
        TimeoutRule {
            matcher: RuleMatch::BuiltinCategory {
                category: WorkloadCategory::Database,
                patterns: &[
                    "mysql", "mariadb", "postgres", "mongo", "redis", "elasticsearch", "influxdb",
                ],
            },
            timeouts: TimeoutPair::secs(20, 10),
        },
        TimeoutRule {
            matcher: RuleMatch::BuiltinCategory {
                category: WorkloadCategory::MediaServer,
                patterns: &[
                    "plex", "jellyfin", "emby", "sonarr", "radarr", "transmission", "qbittorrent",
                ],
            },
            timeouts: TimeoutPair::secs(20, 10),
        },
        TimeoutRule {
            matcher: RuleMatch::BuiltinCategory {
                category: WorkloadCategory::WebServer,
                patterns: &["nginx", "apache", "httpd", "caddy", "traefik", "haproxy"],
            },
            timeouts: TimeoutPair::secs(8, 5),
        },
    ];
}

// === Override File ===

/// Operator override file (JSON)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverrideFile {
    /// Exact container name → timeouts
    #[serde(default)]
    pub container_overrides: BTreeMap<String, TimeoutEntry>,

    /// Named pattern groups
    #[serde(default)]
    pub custom_patterns: BTreeMap<String, PatternGroup>,
}

/// Timeouts in seconds; a missing side falls back to the global default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEntry {
    /// Stats call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_timeout: Option<f64>,
    /// Inspect call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_timeout: Option<f64>,
}

/// Substring patterns sharing one timeout pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternGroup {
    /// Case-insensitive substrings; any one matching selects the group
    pub patterns: Vec<String>,
    /// Stats call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats_timeout: Option<f64>,
    /// Inspect call timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_timeout: Option<f64>,
}

impl OverrideFile {
    /// Read and parse an override file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read timeout overrides from {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse timeout overrides from {}", path.display()))
    }

    /// Write the file as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write timeout overrides to {}", path.display()))
    }

    fn into_rules(self, defaults: TimeoutPair) -> Vec<TimeoutRule> {
        let mut rules = Vec::new();

        for (name, entry) in self.container_overrides {
            match pair_from(entry.stats_timeout, entry.info_timeout, defaults) {
                Some(timeouts) => rules.push(TimeoutRule {
                    matcher: RuleMatch::Exact(name),
                    timeouts,
                }),
                None => warn!(container = %name, "Ignoring override with invalid timeout"),
            }
        }

        for (group, entry) in self.custom_patterns {
            let patterns: Vec<String> = entry
                .patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect();
            if patterns.is_empty() {
                warn!(group = %group, "Ignoring pattern group without patterns");
                continue;
            }
            match pair_from(entry.stats_timeout, entry.info_timeout, defaults) {
                Some(timeouts) => rules.push(TimeoutRule {
                    matcher: RuleMatch::CustomPattern { group, patterns },
                    timeouts,
                }),
                None => warn!(group = %group, "Ignoring pattern group with invalid timeout"),
            }
        }

        rules
    }
}

fn seconds(value: Option<f64>, fallback: Duration) -> Option<Duration> {
    match value {
        None => Some(fallback),
        // Rejects NaN, negatives, and values too large for a Duration
        Some(secs) if secs > 0.0 => Duration::try_from_secs_f64(secs).ok(),
        Some(_) => None,
    }
}

fn pair_from(stats: Option<f64>, info: Option<f64>, defaults: TimeoutPair) -> Option<TimeoutPair> {
    Some(TimeoutPair {
        stats: seconds(stats, defaults.stats)?,
        info: seconds(info, defaults.info)?,
    })
}

// === Settings ===

/// Timeout configuration consumed at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Operator override file (JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_file: Option<PathBuf>,

    /// Global default stats timeout
    #[serde(with = "duration_secs")]
    pub default_stats_timeout: Duration,

    /// Global default info timeout
    #[serde(with = "duration_secs")]
    pub default_info_timeout: Duration,

    /// Timeout for bulk listing calls
    #[serde(with = "duration_secs")]
    pub list_timeout: Duration,

    /// Minimum timeout for start/stop/restart calls
    #[serde(with = "duration_secs")]
    pub action_timeout: Duration,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            override_file: None,
            default_stats_timeout: Duration::from_secs(10),
            default_info_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(10),
            action_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutSettings {
    /// Override file location, defaulting to `~/.dockpool/timeouts.json`
    pub fn override_path(&self) -> Option<PathBuf> {
        self.override_file.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(".dockpool").join("timeouts.json"))
        })
    }

    const fn default_pair(&self) -> TimeoutPair {
        TimeoutPair {
            stats: self.default_stats_timeout,
            info: self.default_info_timeout,
        }
    }
}

// === Engine ===

/// Which rule produced a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutSource {
    /// Exact container name entry
    ExactOverride(String),
    /// Named operator pattern group
    CustomPattern(String),
    /// Built-in workload category
    Category(WorkloadCategory),
    /// Nothing matched
    Default,
}

impl std::fmt::Display for TimeoutSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExactOverride(name) => write!(f, "exact override '{name}'"),
            Self::CustomPattern(group) => write!(f, "custom pattern group '{group}'"),
            Self::Category(category) => write!(f, "built-in category {category}"),
            Self::Default => f.write_str("global default"),
        }
    }
}

/// Resolved timeouts for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutProfile {
    /// Stats / info pair to apply
    pub timeouts: TimeoutPair,
    /// Rule that produced the pair
    pub source: TimeoutSource,
}

/// Ordered, immutable rule list
#[derive(Debug)]
struct RuleSet {
    rules: Vec<TimeoutRule>,
}

impl RuleSet {
    fn load(path: Option<&Path>, defaults: TimeoutPair) -> Self {
        let mut rules = match path {
            Some(path) if path.exists() => match OverrideFile::load(path) {
                Ok(file) => {
                    let rules = file.into_rules(defaults);
                    info!(path = %path.display(), rules = rules.len(), "Loaded timeout overrides");
                    rules
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Ignoring timeout override file, using built-ins");
                    Vec::new()
                }
            },
            Some(path) => {
                debug!(path = %path.display(), "No timeout override file");
                Vec::new()
            }
            None => Vec::new(),
        };

        rules.extend(BUILTIN_RULES.iter().cloned());
        Self { rules }
    }
}

/// Maps `(operation, container name)` to a timeout
#[derive(Debug)]
pub struct TimeoutPolicyEngine {
    settings: TimeoutSettings,
    override_path: Option<PathBuf>,
    cache: RwLock<Option<Arc<RuleSet>>>,
}

impl TimeoutPolicyEngine {
    /// Create an engine; the override file is read on first resolution
    pub fn new(settings: TimeoutSettings) -> Self {
        let override_path = settings.override_path();
        Self {
            settings,
            override_path,
            cache: RwLock::new(None),
        }
    }

    /// Engine with built-in rules only
    pub fn builtin_only() -> Self {
        Self {
            settings: TimeoutSettings::default(),
            override_path: None,
            cache: RwLock::new(None),
        }
    }

    /// Path the engine reads operator overrides from
    pub fn override_path(&self) -> Option<&Path> {
        self.override_path.as_deref()
    }

    fn rules(&self) -> Arc<RuleSet> {
        if let Some(rules) = self.cache.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Arc::clone(rules);
        }

        // Built outside the lock; a racing loader may win, which is harmless
        let loaded = Arc::new(RuleSet::load(
            self.override_path.as_deref(),
            self.settings.default_pair(),
        ));

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(cache.get_or_insert(loaded))
    }

    /// Drop the cached rule set; the next resolution re-reads the override file
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("Timeout rule cache invalidated");
    }

    /// Resolve the timeout pair for a container name
    pub fn resolve(&self, container: Option<&str>) -> TimeoutProfile {
        let default = TimeoutProfile {
            timeouts: self.settings.default_pair(),
            source: TimeoutSource::Default,
        };
        let Some(name) = container else {
            return default;
        };

        let lowered = name.to_lowercase();
        self.rules()
            .rules
            .iter()
            .find(|rule| rule.matches(name, &lowered))
            .map_or(default, |rule| TimeoutProfile {
                timeouts: rule.timeouts,
                source: rule.source(),
            })
    }

    /// Timeout to apply to one daemon call
    pub fn timeout_for(&self, operation: OperationKind, container: Option<&str>) -> Duration {
        match operation {
            OperationKind::List => self.settings.list_timeout,
            OperationKind::Stats => self.resolve(container).timeouts.stats,
            OperationKind::Info => self.resolve(container).timeouts.info,
            OperationKind::Action => self
                .settings
                .action_timeout
                .max(self.resolve(container).timeouts.info),
        }
    }
}
