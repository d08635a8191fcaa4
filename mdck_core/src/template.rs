use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::FileResolver;
use crate::Node;
use crate::NodeType;
use crate::TemplateError;
use crate::TemplateErrorKind;
use crate::normalize_path;

/// Name of the directive used for both definitions and references.
pub const TEMPLATE_DIRECTIVE: &str = "template";

/// Default ceiling for nested expansion.
pub const DEFAULT_MAX_EXPANSION_DEPTH: usize = 64;

/// A named, content-bearing `:::template{id="..."}` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDefinition {
	pub id: String,
	pub content: Vec<Node>,
	/// Absent for definitions collected from an in-memory document.
	pub file_path: Option<PathBuf>,
	/// Ids referenced anywhere inside the content without a `src`.
	pub dependencies: Vec<String>,
	pub start_line: Option<usize>,
	pub end_line: Option<usize>,
}

/// Template definitions keyed by id.
pub type TemplateDefinitions = BTreeMap<String, TemplateDefinition>;

/// A `::template{id="..."}` usage site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReference {
	pub id: String,
	pub src: Option<String>,
	pub line: Option<usize>,
	pub column: Option<usize>,
}

impl TemplateReference {
	pub fn is_external(&self) -> bool {
		self.src.is_some()
	}
}

/// Every definition directive found in a document, including duplicates and
/// definitions without an id. Used where a failing collection is not
/// acceptable (linting, cache extraction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionOccurrence {
	pub id: Option<String>,
	pub file_path: Option<PathBuf>,
	pub line: Option<usize>,
	pub column: Option<usize>,
	pub end_line: Option<usize>,
	pub dependencies: Vec<String>,
}

fn is_definition(node: &Node) -> bool {
	node.r#type == NodeType::ContainerDirective && node.name.as_deref() == Some(TEMPLATE_DIRECTIVE)
}

fn is_reference(node: &Node) -> bool {
	node.r#type == NodeType::LeafDirective && node.name.as_deref() == Some(TEMPLATE_DIRECTIVE)
}

/// Ids of every reference without `src` nested anywhere below `node`,
/// deduplicated in first-seen order.
pub fn extract_dependencies(node: &Node) -> Vec<String> {
	let mut seen = HashSet::new();
	let mut dependencies = vec![];

	for child in &node.children {
		child.walk(&mut |descendant| {
			if !is_reference(descendant) || descendant.attribute("src").is_some() {
				return;
			}
			if let Some(id) = descendant.attribute("id") {
				if seen.insert(id.to_string()) {
					dependencies.push(id.to_string());
				}
			}
		});
	}

	dependencies
}

fn location(file_path: Option<&Path>, line: Option<usize>) -> String {
	match (file_path, line) {
		(Some(path), Some(line)) => format!("{}:{line}", path.display()),
		(Some(path), None) => path.display().to_string(),
		(None, Some(line)) => format!("line {line}"),
		(None, None) => "unknown location".to_string(),
	}
}

/// Collect every template definition occurrence without failing.
pub fn definition_occurrences(ast: &Node, file_path: Option<&Path>) -> Vec<DefinitionOccurrence> {
	let mut occurrences = vec![];

	ast.walk(&mut |node| {
		if !is_definition(node) {
			return;
		}

		occurrences.push(DefinitionOccurrence {
			id: node.attribute("id").map(ToString::to_string),
			file_path: file_path.map(Path::to_path_buf),
			line: node.line(),
			column: node.column(),
			end_line: node.position.map(|position| position.end.line),
			dependencies: extract_dependencies(node),
		});
	});

	occurrences
}

/// Collect the template definitions of a single document.
///
/// Fails on the first definition without an `id` (`invalid-definition`) and
/// on the first id defined twice (`duplicate-definition`).
pub fn collect_definitions(
	ast: &Node,
	file_path: Option<&Path>,
) -> Result<TemplateDefinitions, TemplateError> {
	let mut nodes = vec![];
	ast.walk(&mut |node| {
		if is_definition(node) {
			nodes.push(node);
		}
	});

	let mut definitions = TemplateDefinitions::new();

	for node in nodes {
		let Some(id) = node.attribute("id") else {
			let mut error = TemplateError::new(
				TemplateErrorKind::InvalidDefinition,
				format!(
					"Template definition is missing an `id` attribute at {}",
					location(file_path, node.line())
				),
			);
			if let Some(path) = file_path {
				error = error.with_detail("filePath", path.display());
			}
			if let Some(line) = node.line() {
				error = error.with_detail("line", line);
			}
			return Err(error);
		};

		if let Some(first) = definitions.get(id) {
			let first_location = location(file_path, first.start_line);
			let mut error = TemplateError::new(
				TemplateErrorKind::DuplicateDefinition,
				format!("Duplicate template definition: \"{id}\" (first defined at {first_location})"),
			)
			.with_detail("templateId", id);
			if let Some(line) = first.start_line {
				error = error.with_detail("firstLine", line);
			}
			if let Some(line) = node.line() {
				error = error.with_detail("line", line);
			}
			if let Some(path) = file_path {
				error = error.with_detail("filePath", path.display());
			}
			return Err(error);
		}

		definitions.insert(
			id.to_string(),
			TemplateDefinition {
				id: id.to_string(),
				content: node.children.clone(),
				file_path: file_path.map(Path::to_path_buf),
				dependencies: extract_dependencies(node),
				start_line: node.line(),
				end_line: node.position.map(|position| position.end.line),
			},
		);
	}

	Ok(definitions)
}

/// Collect every `::template{id="..."}` reference. Directives without an id
/// are skipped.
pub fn collect_references(ast: &Node) -> Vec<TemplateReference> {
	let mut references = vec![];

	ast.walk(&mut |node| {
		if !is_reference(node) {
			return;
		}
		let Some(id) = node.attribute("id") else {
			return;
		};

		references.push(TemplateReference {
			id: id.to_string(),
			src: node.attribute("src").map(ToString::to_string),
			line: node.line(),
			column: node.column(),
		});
	});

	references
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionOptions {
	/// Maximum nesting of references below the root template.
	pub max_depth: usize,
}

impl Default for ExpansionOptions {
	fn default() -> Self {
		Self {
			max_depth: DEFAULT_MAX_EXPANSION_DEPTH,
		}
	}
}

/// The outcome of expanding a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExpansionResult {
	Success {
		expanded: Vec<Node>,
		used_definitions: BTreeSet<String>,
	},
	Error(TemplateError),
}

impl ExpansionResult {
	pub fn is_success(&self) -> bool {
		matches!(self, Self::Success { .. })
	}

	pub fn error(&self) -> Option<&TemplateError> {
		match self {
			Self::Success { .. } => None,
			Self::Error(error) => Some(error),
		}
	}
}

/// Where `expand_template` takes its definitions from.
#[derive(Debug, Clone, Copy)]
pub enum DefinitionSource<'a> {
	/// An already collected definition set.
	Definitions(&'a TemplateDefinitions),
	/// A document whose definitions (and those of its `src` files) are
	/// collected first.
	Ast(&'a Node),
}

impl<'a> From<&'a TemplateDefinitions> for DefinitionSource<'a> {
	fn from(definitions: &'a TemplateDefinitions) -> Self {
		Self::Definitions(definitions)
	}
}

impl<'a> From<&'a Node> for DefinitionSource<'a> {
	fn from(ast: &'a Node) -> Self {
		Self::Ast(ast)
	}
}

/// Collects definitions across files and expands templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateExpander {
	resolver: Arc<FileResolver>,
	options: ExpansionOptions,
}

impl TemplateExpander {
	pub fn new(resolver: Arc<FileResolver>) -> Self {
		Self {
			resolver,
			options: ExpansionOptions::default(),
		}
	}

	#[must_use]
	pub fn with_options(mut self, options: ExpansionOptions) -> Self {
		self.options = options;
		self
	}

	pub fn resolver(&self) -> &Arc<FileResolver> {
		&self.resolver
	}

	/// Collect the definitions of `ast` and of every file reachable through
	/// `src` references. Each file is parsed at most once per call.
	pub async fn collect_all_definitions(
		&self,
		ast: &Node,
		file_path: Option<&Path>,
	) -> Result<TemplateDefinitions, TemplateError> {
		let mut processed = HashSet::new();
		if let Some(path) = file_path {
			processed.insert(normalize_path(path));
		}

		let mut definitions = collect_definitions(ast, file_path)?;
		let mut pending: VecDeque<(Vec<TemplateReference>, Option<PathBuf>)> = VecDeque::new();
		pending.push_back((collect_references(ast), file_path.map(Path::to_path_buf)));

		while let Some((references, base)) = pending.pop_front() {
			for reference in references {
				let Some(src) = reference.src.as_deref() else {
					continue;
				};

				let resolved = self.resolver.resolve_path(src, base.as_deref());
				if processed.contains(&resolved) {
					continue;
				}

				let (document, resolved_path) = self
					.resolver
					.resolve_file(src, base.as_deref())
					.await
					.into_result()
					.map_err(|error| error.with_detail("templateId", &reference.id))?;
				processed.insert(resolved_path.clone());

				let external = collect_definitions(&document.root, Some(&resolved_path))?;
				merge_definitions(&mut definitions, external)?;

				tracing::debug!(path = %resolved_path.display(), "collected external definitions");
				pending.push_back((collect_references(&document.root), Some(resolved_path)));
			}
		}

		Ok(definitions)
	}

	/// Expand `root_id` depth first, substituting every reference in the
	/// definition content with the referenced template's expanded content.
	pub async fn expand_template<'a>(
		&self,
		root_id: &str,
		source: impl Into<DefinitionSource<'a>>,
		file_path: Option<&Path>,
	) -> ExpansionResult {
		let collected;
		let definitions = match source.into() {
			DefinitionSource::Definitions(definitions) => definitions,
			DefinitionSource::Ast(ast) => {
				match self.collect_all_definitions(ast, file_path).await {
					Ok(definitions) => {
						collected = definitions;
						&collected
					}
					Err(error) => return ExpansionResult::Error(error),
				}
			}
		};

		self.expand_with_definitions(root_id, definitions)
	}

	/// Synchronous expansion against a complete definition set.
	pub fn expand_with_definitions(
		&self,
		root_id: &str,
		definitions: &TemplateDefinitions,
	) -> ExpansionResult {
		let mut used_definitions = BTreeSet::new();

		match self.expand_recursive(root_id, definitions, vec![], &mut used_definitions) {
			Ok(expanded) => {
				ExpansionResult::Success {
					expanded,
					used_definitions,
				}
			}
			Err(error) => {
				tracing::debug!(root = root_id, kind = %error.kind, "template expansion failed");
				ExpansionResult::Error(error.with_detail("rootTemplateId", root_id))
			}
		}
	}

	/// `ancestors` is owned by each call so sibling branches never observe
	/// each other's path.
	fn expand_recursive(
		&self,
		id: &str,
		definitions: &TemplateDefinitions,
		ancestors: Vec<String>,
		used_definitions: &mut BTreeSet<String>,
	) -> Result<Vec<Node>, TemplateError> {
		if ancestors.iter().any(|ancestor| ancestor == id) {
			let mut path = ancestors;
			path.push(id.to_string());
			let cycle = path.join(" → ");
			return Err(TemplateError::new(
				TemplateErrorKind::CircularReference,
				format!("Circular reference detected: {cycle}"),
			)
			.with_detail("templateId", id)
			.with_detail("path", cycle));
		}

		if ancestors.len() > self.options.max_depth {
			return Err(TemplateError::new(
				TemplateErrorKind::MaxDepthExceeded,
				format!(
					"Maximum expansion depth of {} exceeded while expanding \"{id}\"",
					self.options.max_depth
				),
			)
			.with_detail("templateId", id)
			.with_detail("maxDepth", self.options.max_depth));
		}

		let Some(definition) = definitions.get(id) else {
			let mut error = TemplateError::new(
				TemplateErrorKind::UndefinedReference,
				format!("Template not found: {id}"),
			)
			.with_detail("templateId", id);
			if let Some(parent) = ancestors.last() {
				error = error.with_detail("referencedFrom", parent);
			}
			return Err(error);
		};

		used_definitions.insert(id.to_string());

		let mut path = ancestors;
		path.push(id.to_string());

		let mut expanded = Vec::with_capacity(definition.content.len());
		for node in &definition.content {
			if !is_reference(node) {
				expanded.push(node.clone());
				continue;
			}

			if let Some(reference_id) = node.attribute("id") {
				let content =
					self.expand_recursive(reference_id, definitions, path.clone(), used_definitions)?;
				expanded.extend(content);
			}
		}

		Ok(expanded)
	}
}

/// Merge `incoming` into `definitions`, failing when an id already exists.
pub fn merge_definitions(
	definitions: &mut TemplateDefinitions,
	incoming: TemplateDefinitions,
) -> Result<(), TemplateError> {
	for (id, definition) in incoming {
		if let Some(existing) = definitions.get(&id) {
			let first = location(existing.file_path.as_deref(), existing.start_line);
			let second = location(definition.file_path.as_deref(), definition.start_line);
			let mut error = TemplateError::new(
				TemplateErrorKind::DuplicateDefinition,
				format!("Duplicate template definition: \"{id}\" defined in {first} and {second}"),
			)
			.with_detail("templateId", &id);
			if let Some(path) = &existing.file_path {
				error = error.with_detail("firstFile", path.display());
			}
			if let Some(path) = &definition.file_path {
				error = error.with_detail("secondFile", path.display());
			}
			return Err(error);
		}

		definitions.insert(id, definition);
	}

	Ok(())
}
