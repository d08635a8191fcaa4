use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;
use tokio::task::JoinSet;

use crate::CircularReferenceRule;
use crate::DuplicateTemplateIdRule;
use crate::FileResolver;
use crate::LintContext;
use crate::MdckError;
use crate::MdckResult;
use crate::PreprocessResult;
use crate::Preprocessor;
use crate::UndefinedTemplateReferenceRule;
use crate::parse_markdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Error,
	Warn,
	Info,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Error => write!(f, "error"),
			Self::Warn => write!(f, "warn"),
			Self::Info => write!(f, "info"),
		}
	}
}

impl FromStr for Severity {
	type Err = MdckError;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"error" => Ok(Self::Error),
			"warn" | "warning" => Ok(Self::Warn),
			"info" => Ok(Self::Info),
			_ => Err(MdckError::InvalidSeverity(value.to_string())),
		}
	}
}

/// A single lint finding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LintResult {
	pub rule_id: String,
	pub severity: Severity,
	pub message: String,
	/// 1-based line. Findings without a known position use line 1.
	pub line: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub column: Option<usize>,
	pub fixable: bool,
	#[serde(skip_serializing_if = "BTreeMap::is_empty")]
	pub details: BTreeMap<String, serde_json::Value>,
}

impl LintResult {
	pub fn new(rule: &dyn Rule, message: impl Into<String>, line: Option<usize>) -> Self {
		Self {
			rule_id: rule.id().to_string(),
			severity: rule.default_severity(),
			message: message.into(),
			line: line.unwrap_or(1),
			column: None,
			fixable: false,
			details: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn with_column(mut self, column: Option<usize>) -> Self {
		self.column = column;
		self
	}

	#[must_use]
	pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
		self.details.insert(key.into(), value.into());
		self
	}
}

/// Everything a rule may read: the linted document and the shared
/// preprocess result.
#[derive(Debug)]
pub struct RuleContext {
	pub lint: LintContext,
	pub preprocess: PreprocessResult,
}

impl RuleContext {
	pub fn file_path(&self) -> Option<&Path> {
		self.lint.file_path.as_deref()
	}
}

/// A lint rule. Rules only read from the [`RuleContext`]; they never touch
/// the filesystem or traverse the graph themselves.
pub trait Rule: Send + Sync + fmt::Debug {
	/// Stable identifier such as `M002`.
	fn id(&self) -> &'static str;
	fn description(&self) -> &'static str;
	fn default_severity(&self) -> Severity;
	fn check(&self, context: &RuleContext) -> Vec<LintResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
	pub enabled: bool,
	pub severity: Option<Severity>,
}

impl Default for RuleConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			severity: None,
		}
	}
}

/// Per-rule configuration. Rules without an entry are enabled with their
/// default severity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintConfig {
	pub rules: BTreeMap<String, RuleConfig>,
}

impl LintConfig {
	pub fn rule(&self, id: &str) -> RuleConfig {
		self.rules.get(id).copied().unwrap_or_default()
	}

	pub fn set_enabled(&mut self, id: impl Into<String>, enabled: bool) {
		self.rules.entry(id.into()).or_default().enabled = enabled;
	}

	pub fn set_severity(&mut self, id: impl Into<String>, severity: Severity) {
		self.rules.entry(id.into()).or_default().severity = Some(severity);
	}
}

/// The merged output of a lint run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LintReport {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub file_path: Option<std::path::PathBuf>,
	pub results: Vec<LintResult>,
	pub error_count: usize,
	pub warning_count: usize,
	pub info_count: usize,
	#[serde(serialize_with = "serialize_millis")]
	pub duration: Duration,
	#[serde(serialize_with = "serialize_millis")]
	pub preprocess_duration: Duration,
}

impl LintReport {
	pub fn has_errors(&self) -> bool {
		self.error_count > 0
	}
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
}

/// Holds the registered rules and runs them against one shared
/// preprocess pass.
#[derive(Debug, Clone)]
pub struct RuleEngine {
	rules: BTreeMap<&'static str, Arc<dyn Rule>>,
	config: LintConfig,
	preprocessor: Preprocessor,
}

impl RuleEngine {
	/// An engine with no rules registered.
	pub fn new(resolver: Arc<FileResolver>, config: LintConfig) -> Self {
		Self {
			rules: BTreeMap::new(),
			config,
			preprocessor: Preprocessor::new(resolver),
		}
	}

	/// An engine with `M002`, `M003` and `M004` registered.
	pub fn with_default_rules(resolver: Arc<FileResolver>, config: LintConfig) -> Self {
		let mut engine = Self::new(resolver, config);
		engine.register_rule(Arc::new(DuplicateTemplateIdRule));
		engine.register_rule(Arc::new(UndefinedTemplateReferenceRule));
		engine.register_rule(Arc::new(CircularReferenceRule));
		engine
	}

	/// Register a rule, replacing any rule with the same id.
	pub fn register_rule(&mut self, rule: Arc<dyn Rule>) {
		self.rules.insert(rule.id(), rule);
	}

	pub fn rule_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
		self.rules.keys().copied()
	}

	pub fn rule(&self, id: &str) -> Option<&Arc<dyn Rule>> {
		self.rules.get(id)
	}

	pub fn config(&self) -> &LintConfig {
		&self.config
	}

	pub fn set_config(&mut self, config: LintConfig) {
		self.config = config;
	}

	/// Preprocess once, run every enabled rule concurrently and merge their
	/// findings. A rule that panics is logged and contributes nothing.
	pub async fn lint(&self, context: LintContext) -> LintReport {
		let start = Instant::now();
		let preprocess = self.preprocessor.analyze(&context).await;
		let preprocess_duration = start.elapsed();

		let file_path = context.file_path.clone();
		let shared = Arc::new(RuleContext {
			lint: context,
			preprocess,
		});

		let mut tasks = JoinSet::new();
		for (index, (id, rule)) in self.rules.iter().enumerate() {
			let config = self.config.rule(id);
			if !config.enabled {
				continue;
			}

			let rule = Arc::clone(rule);
			let shared = Arc::clone(&shared);
			let id = *id;
			tasks.spawn(async move {
				let results = rule.check(&shared);
				(index, id, config.severity, results)
			});
		}

		let mut per_rule: BTreeMap<usize, Vec<LintResult>> = BTreeMap::new();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok((index, id, severity, mut results)) => {
					if let Some(severity) = severity {
						for result in &mut results {
							result.severity = severity;
						}
					}
					tracing::debug!(rule = id, findings = results.len(), "rule finished");
					per_rule.insert(index, results);
				}
				Err(error) => {
					tracing::error!("lint rule failed: {error}");
				}
			}
		}

		let results: Vec<LintResult> = per_rule.into_values().flatten().collect();
		let count = |severity: Severity| {
			results
				.iter()
				.filter(|result| result.severity == severity)
				.count()
		};

		LintReport {
			file_path,
			error_count: count(Severity::Error),
			warning_count: count(Severity::Warn),
			info_count: count(Severity::Info),
			results,
			duration: start.elapsed(),
			preprocess_duration,
		}
	}

	/// Read, parse and lint a single file.
	pub async fn lint_file(&self, path: impl AsRef<Path>, project_root: Option<&Path>) -> MdckResult<LintReport> {
		let path = path.as_ref();
		let content = tokio::fs::read_to_string(path)
			.await
			.map_err(|error| MdckError::from_io(error, path.display()))?;
		let document = parse_markdown(&content)?;

		let mut context = LintContext::new(document.root).with_file_path(path);
		if let Some(root) = project_root {
			context = context.with_project_root(root);
		}

		Ok(self.lint(context).await)
	}
}
