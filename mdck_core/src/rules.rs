use std::path::Path;

use serde_json::json;

use crate::LintResult;
use crate::Rule;
use crate::RuleContext;
use crate::Severity;
use crate::TemplateErrorKind;
use crate::format_cycle;

pub const DUPLICATE_TEMPLATE_ID: &str = "M002";
pub const UNDEFINED_TEMPLATE_REFERENCE: &str = "M003";
pub const CIRCULAR_REFERENCE: &str = "M004";

/// Ids of every built-in rule.
pub const BUILTIN_RULE_IDS: [&str; 3] = [
	DUPLICATE_TEMPLATE_ID,
	UNDEFINED_TEMPLATE_REFERENCE,
	CIRCULAR_REFERENCE,
];

fn display_path(path: &Path) -> String {
	path.to_string_lossy().replace('\\', "/")
}

/// `M002`: a template id must be defined once across the analyzed files.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicateTemplateIdRule;

impl Rule for DuplicateTemplateIdRule {
	fn id(&self) -> &'static str {
		DUPLICATE_TEMPLATE_ID
	}

	fn description(&self) -> &'static str {
		"Template id must be unique within the project"
	}

	fn default_severity(&self) -> Severity {
		Severity::Error
	}

	fn check(&self, context: &RuleContext) -> Vec<LintResult> {
		let mut results = vec![];

		for duplicate in &context.preprocess.duplicates {
			let Some((first, rest)) = duplicate.locations.split_first() else {
				continue;
			};
			let first_line = first.line.unwrap_or(1);
			let first_at = match first.file_path.as_deref() {
				Some(path) if Some(path) != context.file_path() => {
					format!("first defined in {}:{first_line}", display_path(path))
				}
				_ => format!("first defined at line {first_line}"),
			};

			for location in rest {
				let mut result = LintResult::new(
					self,
					format!("Duplicate template definition: \"{}\" ({first_at})", duplicate.id),
					location.line,
				)
				.with_column(location.column)
				.with_detail("templateId", duplicate.id.as_str())
				.with_detail("firstLine", first_line)
				.with_detail("errorType", TemplateErrorKind::DuplicateDefinition.as_str());

				if let Some(path) = &first.file_path {
					result = result.with_detail("firstFile", display_path(path));
				}
				if let Some(path) = &location.file_path {
					result = result.with_detail("filePath", display_path(path));
				}

				results.push(result);
			}
		}

		results
	}
}

/// `M003`: every reference in the document must resolve to a definition.
#[derive(Debug, Clone, Copy, Default)]
pub struct UndefinedTemplateReferenceRule;

impl Rule for UndefinedTemplateReferenceRule {
	fn id(&self) -> &'static str {
		UNDEFINED_TEMPLATE_REFERENCE
	}

	fn description(&self) -> &'static str {
		"Template references must have corresponding definitions"
	}

	fn default_severity(&self) -> Severity {
		Severity::Error
	}

	fn check(&self, context: &RuleContext) -> Vec<LintResult> {
		let preprocess = &context.preprocess;
		let mut results = vec![];

		for located in &preprocess.undefined_references {
			let reference = &located.reference;
			let mut result = LintResult::new(
				self,
				format!("Undefined template reference: \"{}\"", reference.id),
				reference.line,
			)
			.with_column(reference.column)
			.with_detail("templateId", reference.id.as_str())
			.with_detail(
				"referenceType",
				if reference.is_external() {
					"external"
				} else {
					"local"
				},
			)
			.with_detail("errorType", TemplateErrorKind::UndefinedReference.as_str());

			if let Some(src) = &reference.src {
				result = result.with_detail("src", src.as_str());
			}

			if let Some(unresolved) = preprocess
				.unresolved_sources
				.iter()
				.find(|unresolved| unresolved.reference.src == reference.src)
			{
				result.message = format!("{} ({})", result.message, unresolved.message);
				result = result
					.with_detail("reason", TemplateErrorKind::from(unresolved.kind).as_str())
					.with_detail("attemptedPath", display_path(&unresolved.attempted_path));
			}

			results.push(result);
		}

		// A source that failed to load while its id is still defined elsewhere.
		for unresolved in &preprocess.unresolved_sources {
			let reference = &unresolved.reference;
			if !preprocess.definitions.contains_key(&reference.id) {
				continue;
			}

			results.push(
				LintResult::new(
					self,
					format!(
						"Cannot load template source \"{}\": {}",
						reference.src.as_deref().unwrap_or_default(),
						unresolved.message
					),
					reference.line,
				)
				.with_column(reference.column)
				.with_detail("templateId", reference.id.as_str())
				.with_detail("referenceType", "external")
				.with_detail("reason", TemplateErrorKind::from(unresolved.kind).as_str())
				.with_detail("attemptedPath", display_path(&unresolved.attempted_path)),
			);
		}

		results
	}
}

/// `M004`: the definition graph must be acyclic.
#[derive(Debug, Clone, Copy, Default)]
pub struct CircularReferenceRule;

impl Rule for CircularReferenceRule {
	fn id(&self) -> &'static str {
		CIRCULAR_REFERENCE
	}

	fn description(&self) -> &'static str {
		"Template references must not create circular dependencies"
	}

	fn default_severity(&self) -> Severity {
		Severity::Error
	}

	fn check(&self, context: &RuleContext) -> Vec<LintResult> {
		context
			.preprocess
			.circular_references
			.iter()
			.map(|circular| {
				let mut result = LintResult::new(
					self,
					format!("Circular reference detected: {}", format_cycle(&circular.cycle)),
					circular.line,
				)
				.with_detail("cyclePath", json!(circular.cycle))
				.with_detail("errorType", TemplateErrorKind::CircularReference.as_str());

				if let Some(path) = &circular.file_path {
					result = result.with_detail("filePath", display_path(path));
				}

				result
			})
			.collect()
	}
}
