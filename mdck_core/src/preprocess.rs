use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::DefinitionOccurrence;
use crate::DependencyGraph;
use crate::FileResolver;
use crate::Node;
use crate::ResolveErrorKind;
use crate::ResolveOutcome;
use crate::TemplateError;
use crate::TemplateErrorKind;
use crate::TemplateReference;
use crate::collect_references;
use crate::definition_occurrences;
use crate::normalize_path;

/// Input of a lint run.
#[derive(Debug, Clone)]
pub struct LintContext {
	pub ast: Arc<Node>,
	pub file_path: Option<PathBuf>,
	pub project_root: Option<PathBuf>,
}

impl LintContext {
	pub fn new(ast: impl Into<Arc<Node>>) -> Self {
		Self {
			ast: ast.into(),
			file_path: None,
			project_root: None,
		}
	}

	#[must_use]
	pub fn with_file_path(mut self, file_path: impl Into<PathBuf>) -> Self {
		self.file_path = Some(file_path.into());
		self
	}

	#[must_use]
	pub fn with_project_root(mut self, project_root: impl Into<PathBuf>) -> Self {
		self.project_root = Some(project_root.into());
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionLocation {
	pub file_path: Option<PathBuf>,
	pub line: Option<usize>,
	pub column: Option<usize>,
}

impl From<&DefinitionOccurrence> for DefinitionLocation {
	fn from(occurrence: &DefinitionOccurrence) -> Self {
		Self {
			file_path: occurrence.file_path.clone(),
			line: occurrence.line,
			column: occurrence.column,
		}
	}
}

/// An id defined more than once, with every location in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateTemplate {
	pub id: String,
	pub locations: Vec<DefinitionLocation>,
}

/// A reference together with the file it appears in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocatedReference {
	pub reference: TemplateReference,
	pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircularReference {
	/// Closing path, e.g. `[a, b, c, a]`.
	pub cycle: Vec<String>,
	/// Location of the definition the cycle starts at.
	pub line: Option<usize>,
	pub file_path: Option<PathBuf>,
}

/// A `src` reference whose file could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedSource {
	pub reference: TemplateReference,
	pub kind: ResolveErrorKind,
	pub message: String,
	pub attempted_path: PathBuf,
}

/// The single shared analysis of a lint run. Read-only once built.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PreprocessResult {
	/// Structured issues that make the definition set untrustworthy
	/// (duplicates, definitions without an id). Empty on success.
	pub issues: Vec<TemplateError>,
	/// First definition of each id across the analyzed closure.
	pub definitions: BTreeMap<String, DefinitionOccurrence>,
	/// References of the linted document.
	pub references: Vec<LocatedReference>,
	pub duplicates: Vec<DuplicateTemplate>,
	pub undefined_references: Vec<LocatedReference>,
	pub circular_references: Vec<CircularReference>,
	pub unresolved_sources: Vec<UnresolvedSource>,
	/// Files pulled into the closure through `src`, in visit order.
	pub external_files: Vec<PathBuf>,
}

impl PreprocessResult {
	pub fn is_success(&self) -> bool {
		self.issues.is_empty()
	}
}

/// Computes the [`PreprocessResult`] shared by every rule.
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
	resolver: Arc<FileResolver>,
}

impl Preprocessor {
	pub fn new(resolver: Arc<FileResolver>) -> Self {
		Self { resolver }
	}

	pub async fn analyze(&self, context: &LintContext) -> PreprocessResult {
		let file_path = context.file_path.as_deref();
		let mut result = PreprocessResult::default();

		let mut occurrences = definition_occurrences(&context.ast, file_path);
		let local_references = collect_references(&context.ast);
		result.references = local_references
			.iter()
			.cloned()
			.map(|reference| {
				LocatedReference {
					reference,
					file_path: file_path.map(Path::to_path_buf),
				}
			})
			.collect();

		self.follow_sources(
			local_references,
			file_path,
			&mut occurrences,
			&mut result,
		)
		.await;

		let mut by_id: BTreeMap<&str, Vec<&DefinitionOccurrence>> = BTreeMap::new();
		for occurrence in &occurrences {
			match occurrence.id.as_deref() {
				Some(id) => by_id.entry(id).or_default().push(occurrence),
				None => {
					let mut issue = TemplateError::new(
						TemplateErrorKind::InvalidDefinition,
						"Template definition is missing an `id` attribute",
					);
					if let Some(line) = occurrence.line {
						issue = issue.with_detail("line", line);
					}
					if let Some(path) = &occurrence.file_path {
						issue = issue.with_detail("filePath", path.display());
					}
					result.issues.push(issue);
				}
			}
		}

		for (id, found) in &by_id {
			if let Some(first) = found.first() {
				result.definitions.insert((*id).to_string(), (*first).clone());
			}

			if found.len() > 1 {
				result.duplicates.push(DuplicateTemplate {
					id: (*id).to_string(),
					locations: found.iter().map(|occurrence| (*occurrence).into()).collect(),
				});
				result.issues.push(
					TemplateError::new(
						TemplateErrorKind::DuplicateDefinition,
						format!("Duplicate template definition: \"{id}\""),
					)
					.with_detail("templateId", id)
					.with_detail("count", found.len()),
				);
			}
		}

		result.undefined_references = result
			.references
			.iter()
			.filter(|located| !result.definitions.contains_key(&located.reference.id))
			.cloned()
			.collect();

		let graph = DependencyGraph::from_dependencies(
			result
				.definitions
				.iter()
				.map(|(id, occurrence)| (id.as_str(), occurrence.dependencies.as_slice())),
		);
		result.circular_references = graph
			.cycles
			.into_iter()
			.map(|cycle| {
				let start = cycle.first().and_then(|id| result.definitions.get(id));
				CircularReference {
					line: start.and_then(|occurrence| occurrence.line),
					file_path: start.and_then(|occurrence| occurrence.file_path.clone()),
					cycle,
				}
			})
			.collect();

		tracing::debug!(
			definitions = result.definitions.len(),
			references = result.references.len(),
			duplicates = result.duplicates.len(),
			undefined = result.undefined_references.len(),
			cycles = result.circular_references.len(),
			"preprocessed lint context"
		);

		result
	}

	/// Pull the definitions of every file reachable through `src` into
	/// `occurrences`. Each file is visited once.
	async fn follow_sources(
		&self,
		references: Vec<TemplateReference>,
		file_path: Option<&Path>,
		occurrences: &mut Vec<DefinitionOccurrence>,
		result: &mut PreprocessResult,
	) {
		let mut processed = HashSet::new();
		if let Some(path) = file_path {
			processed.insert(normalize_path(path));
		}

		let mut pending = VecDeque::from([(references, file_path.map(Path::to_path_buf), true)]);

		while let Some((references, base, is_local)) = pending.pop_front() {
			for reference in references {
				let Some(src) = reference.src.clone() else {
					continue;
				};

				let resolved = self.resolver.resolve_path(&src, base.as_deref());
				if processed.contains(&resolved) {
					continue;
				}
				processed.insert(resolved);

				match self.resolver.resolve_file(&src, base.as_deref()).await {
					ResolveOutcome::Success { ast, resolved_path } => {
						occurrences.extend(definition_occurrences(&ast.root, Some(&resolved_path)));
						result.external_files.push(resolved_path.clone());
						pending.push_back((collect_references(&ast.root), Some(resolved_path), false));
					}
					ResolveOutcome::Error {
						kind,
						message,
						attempted_path,
					} => {
						tracing::debug!(src = %src, "unresolved template source: {message}");
						if is_local {
							result.unresolved_sources.push(UnresolvedSource {
								reference,
								kind,
								message,
								attempted_path,
							});
						}
					}
				}
			}
		}
	}
}
