use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::CacheOptions;
use crate::DEFAULT_CACHE_DIR;
use crate::DEFAULT_MAX_AGE;
use crate::DEFAULT_MAX_CONCURRENCY;
use crate::DEFAULT_MAX_EXPANSION_DEPTH;
use crate::ExpansionOptions;
use crate::FileResolverOptions;
use crate::LintConfig;
use crate::MdckError;
use crate::MdckResult;
use crate::RuleConfig;
use crate::Severity;

/// Supported config file locations in discovery order (highest precedence
/// first).
pub const CONFIG_FILE_CANDIDATES: [&str; 3] = ["mdck.toml", ".mdck.toml", ".config/mdck.toml"];

/// Configuration loaded from an `mdck.toml` file.
///
/// ```toml
/// exclude = ["vendor/", "*.generated.md"]
///
/// [lint.rules]
/// M002 = "warn"
/// M004 = { enabled = false }
///
/// [cache]
/// dir = ".mdck/.cache"
/// max_age_secs = 86400
/// max_concurrency = 10
///
/// [resolver]
/// restrict_to_root = true
///
/// [expansion]
/// max_depth = 64
/// ```
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MdckConfig {
	/// Gitignore-style patterns excluded from project scans, relative to the
	/// project root.
	#[serde(default)]
	pub exclude: Vec<String>,
	#[serde(default)]
	pub lint: LintSection,
	#[serde(default)]
	pub cache: CacheSection,
	#[serde(default)]
	pub resolver: ResolverSection,
	#[serde(default)]
	pub expansion: ExpansionSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LintSection {
	#[serde(default)]
	pub rules: BTreeMap<String, RuleSetting>,
}

/// A rule entry: either a shorthand string or a table.
///
/// ```toml
/// [lint.rules]
/// M002 = "off"
/// M003 = { enabled = true, severity = "warn" }
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
#[non_exhaustive]
pub enum RuleSetting {
	Shorthand(String),
	Table {
		#[serde(default = "default_true")]
		enabled: bool,
		#[serde(default)]
		severity: Option<Severity>,
	},
}

impl RuleSetting {
	pub fn to_rule_config(&self) -> MdckResult<RuleConfig> {
		match self {
			Self::Shorthand(value) if value == "off" => {
				Ok(RuleConfig {
					enabled: false,
					severity: None,
				})
			}
			Self::Shorthand(value) => {
				Ok(RuleConfig {
					enabled: true,
					severity: Some(value.parse()?),
				})
			}
			Self::Table { enabled, severity } => {
				Ok(RuleConfig {
					enabled: *enabled,
					severity: *severity,
				})
			}
		}
	}
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
	#[serde(default = "default_cache_dir")]
	pub dir: PathBuf,
	#[serde(default = "default_max_age_secs")]
	pub max_age_secs: u64,
	#[serde(default = "default_max_concurrency")]
	pub max_concurrency: usize,
	/// When `false`, `lint` scans the project directly instead of reading the
	/// metadata cache.
	#[serde(default = "default_true")]
	pub enabled: bool,
}

impl Default for CacheSection {
	fn default() -> Self {
		Self {
			dir: default_cache_dir(),
			max_age_secs: default_max_age_secs(),
			max_concurrency: default_max_concurrency(),
			enabled: true,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResolverSection {
	/// Reject `src` paths that resolve outside the project root.
	#[serde(default)]
	pub restrict_to_root: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExpansionSection {
	#[serde(default = "default_max_depth")]
	pub max_depth: usize,
}

impl Default for ExpansionSection {
	fn default() -> Self {
		Self {
			max_depth: default_max_depth(),
		}
	}
}

fn default_true() -> bool {
	true
}

fn default_cache_dir() -> PathBuf {
	PathBuf::from(DEFAULT_CACHE_DIR)
}

fn default_max_age_secs() -> u64 {
	DEFAULT_MAX_AGE.as_secs()
}

fn default_max_concurrency() -> usize {
	DEFAULT_MAX_CONCURRENCY
}

fn default_max_depth() -> usize {
	DEFAULT_MAX_EXPANSION_DEPTH
}

impl MdckConfig {
	/// Resolve the config path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the config from the first discovered config file at `root`.
	/// Returns `None` if no config file exists.
	pub fn load(root: &Path) -> MdckResult<Option<Self>> {
		let Some(config_path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		Self::load_from(&config_path).map(Some)
	}

	/// Load the config from an explicit file.
	pub fn load_from(path: &Path) -> MdckResult<Self> {
		let content = std::fs::read_to_string(path).map_err(|error| MdckError::from_io(error, path.display()))?;
		let config = Self::parse(&content)?;
		tracing::debug!(path = %path.display(), "loaded config");

		Ok(config)
	}

	pub fn parse(content: &str) -> MdckResult<Self> {
		let config: Self = toml::from_str(content).map_err(|e| MdckError::ConfigParse(e.to_string()))?;
		config.lint_config()?;

		Ok(config)
	}

	pub fn lint_config(&self) -> MdckResult<LintConfig> {
		let mut config = LintConfig::default();

		for (id, setting) in &self.lint.rules {
			config.rules.insert(id.clone(), setting.to_rule_config()?);
		}

		Ok(config)
	}

	pub fn cache_options(&self) -> CacheOptions {
		CacheOptions {
			cache_dir: self.cache.dir.clone(),
			max_age: Duration::from_secs(self.cache.max_age_secs),
			max_concurrency: self.cache.max_concurrency.max(1),
			exclude: self.exclude.clone(),
		}
	}

	pub fn resolver_options(&self, root: &Path) -> FileResolverOptions {
		FileResolverOptions {
			restrict_to_base: self.resolver.restrict_to_root.then(|| root.to_path_buf()),
		}
	}

	pub fn expansion_options(&self) -> ExpansionOptions {
		ExpansionOptions {
			max_depth: self.expansion.max_depth,
		}
	}
}
