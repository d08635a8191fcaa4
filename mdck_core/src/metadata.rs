use std::collections::BTreeSet;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::TemplateError;
use crate::TemplateErrorKind;
use crate::collect_references;
use crate::definition_occurrences;
use crate::parse_markdown;

/// Cached form of a template definition. The content itself is not stored:
/// it is re-read from `file_path` when needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTemplate {
	pub id: String,
	/// Project relative path of the defining file.
	pub file_path: String,
	pub dependencies: Vec<String>,
	pub start_line: Option<usize>,
	pub end_line: Option<usize>,
}

/// Metadata tracked for a single markdown file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
	/// Project relative path with `/` separators.
	pub path: String,
	pub size: u64,
	pub modified_unix_ms: u64,
	/// SHA-256 of the file content, hex encoded.
	pub content_hash: String,
	/// Ids defined in this file, in document order.
	pub template_ids: Vec<String>,
	/// Ids referenced from this file, deduplicated in document order.
	pub reference_ids: Vec<String>,
	/// Raw `src` values of external references.
	pub external_references: Vec<String>,
	/// Definitions accepted from this file. Ids rejected as in-file
	/// duplicates are not listed.
	pub definitions: Vec<CachedTemplate>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub errors: Vec<TemplateError>,
}

impl FileMetadata {
	/// Whether the on-disk file still matches the recorded size and
	/// modification time.
	pub fn matches_fingerprint(&self, size: u64, modified_unix_ms: u64) -> bool {
		self.size == size && self.modified_unix_ms == modified_unix_ms
	}
}

/// A per-file failure recorded during a rebuild or refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
	pub path: String,
	pub message: String,
}

/// SHA-256 hex digest of `content`.
pub fn content_hash(content: impl AsRef<[u8]>) -> String {
	let mut hasher = Sha256::new();
	hasher.update(content.as_ref());
	hex::encode(hasher.finalize())
}

pub(crate) fn modified_unix_ms(metadata: &std::fs::Metadata) -> u64 {
	metadata
		.modified()
		.ok()
		.and_then(|time| time.duration_since(UNIX_EPOCH).ok())
		.and_then(|duration| duration.as_millis().try_into().ok())
		.unwrap_or(0)
}

/// Project relative key for `file` with `/` separators.
pub fn relative_file_key(root: &Path, file: &Path) -> String {
	file.strip_prefix(root)
		.unwrap_or(file)
		.to_string_lossy()
		.replace('\\', "/")
}

/// Extract metadata from already-read file content.
pub fn extract_from_content(
	key: &str,
	content: &str,
	size: u64,
	modified_unix_ms: u64,
) -> FileMetadata {
	let mut metadata = FileMetadata {
		path: key.to_string(),
		size,
		modified_unix_ms,
		content_hash: content_hash(content),
		template_ids: vec![],
		reference_ids: vec![],
		external_references: vec![],
		definitions: vec![],
		errors: vec![],
	};

	let document = match parse_markdown(content) {
		Ok(document) => document,
		Err(error) => {
			metadata.errors.push(
				TemplateError::new(
					TemplateErrorKind::ParseError,
					format!("Failed to parse {key}: {error}"),
				)
				.with_detail("filePath", key),
			);
			return metadata;
		}
	};

	let mut seen_ids = BTreeSet::new();
	for occurrence in definition_occurrences(&document.root, Some(Path::new(key))) {
		let Some(id) = occurrence.id else {
			let mut error = TemplateError::new(
				TemplateErrorKind::InvalidDefinition,
				"Template definition is missing an `id` attribute",
			)
			.with_detail("filePath", key);
			if let Some(line) = occurrence.line {
				error = error.with_detail("line", line);
			}
			metadata.errors.push(error);
			continue;
		};

		metadata.template_ids.push(id.clone());

		if !seen_ids.insert(id.clone()) {
			let first_line = metadata
				.definitions
				.iter()
				.find(|definition| definition.id == id)
				.and_then(|definition| definition.start_line);
			let mut error = TemplateError::new(
				TemplateErrorKind::DuplicateDefinition,
				format!(
					"Duplicate template definition: \"{id}\" (first defined at {key}:{})",
					first_line.unwrap_or_default()
				),
			)
			.with_detail("templateId", &id)
			.with_detail("filePath", key);
			if let Some(line) = occurrence.line {
				error = error.with_detail("line", line);
			}
			metadata.errors.push(error);
			continue;
		}

		metadata.definitions.push(CachedTemplate {
			id,
			file_path: key.to_string(),
			dependencies: occurrence.dependencies,
			start_line: occurrence.line,
			end_line: occurrence.end_line,
		});
	}

	let mut seen_references = BTreeSet::new();
	let mut seen_sources = BTreeSet::new();
	for reference in collect_references(&document.root) {
		if seen_references.insert(reference.id.clone()) {
			metadata.reference_ids.push(reference.id);
		}
		if let Some(src) = reference.src {
			if seen_sources.insert(src.clone()) {
				metadata.external_references.push(src);
			}
		}
	}

	metadata
}

/// Read `path` and extract its metadata.
pub async fn extract_file_metadata(root: &Path, path: &Path) -> Result<FileMetadata, FileError> {
	let key = relative_file_key(root, path);
	let to_error = |error: std::io::Error| {
		FileError {
			path: key.clone(),
			message: error.to_string(),
		}
	};

	let fs_metadata = tokio::fs::metadata(path).await.map_err(to_error)?;
	let content = tokio::fs::read_to_string(path).await.map_err(to_error)?;

	tracing::debug!(file = %key, "extracting metadata");
	Ok(extract_from_content(
		&key,
		&content,
		fs_metadata.len(),
		modified_unix_ms(&fs_metadata),
	))
}
