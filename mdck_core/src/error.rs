use std::collections::BTreeMap;
use std::fmt;

use miette::Diagnostic;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum MdckError {
	#[error(transparent)]
	#[diagnostic(code(mdck::io_error))]
	Io(#[from] std::io::Error),

	#[error("failure to load markdown: {0}")]
	#[diagnostic(code(mdck::markdown))]
	Markdown(String),

	#[error(transparent)]
	#[diagnostic(transparent)]
	Template(#[from] TemplateError),

	#[error("file not found: `{path}`")]
	#[diagnostic(code(mdck::file_not_found), help("check that the path exists and is spelled correctly"))]
	FileNotFound { path: String },

	#[error("permission denied: `{path}`")]
	#[diagnostic(
		code(mdck::access_denied),
		help("check the file permissions for the current user")
	)]
	AccessDenied { path: String },

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(mdck::config_parse),
		help("check that mdck.toml is valid TOML with [lint], [cache], [resolver] and [expansion] sections")
	)]
	ConfigParse(String),

	#[error("unknown lint rule: `{0}`")]
	#[diagnostic(code(mdck::unknown_rule), help("available rules: M002, M003, M004"))]
	UnknownRule(String),

	#[error("invalid severity `{0}`")]
	#[diagnostic(code(mdck::invalid_severity), help("use one of: error, warn, info, off"))]
	InvalidSeverity(String),

	#[error("cache operation failed: {0}")]
	#[diagnostic(
		code(mdck::cache),
		help("run `mdck cache --clear` to discard the cached snapshot")
	)]
	Cache(String),

	#[error("symlink cycle detected at: `{path}`")]
	#[diagnostic(
		code(mdck::symlink_cycle),
		help("remove the circular symlink or exclude this path")
	)]
	SymlinkCycle { path: String },
}

impl MdckError {
	/// Classify an io error for `path` into the not-found / access-denied
	/// taxonomy, falling back to a plain io error.
	pub fn from_io(error: std::io::Error, path: impl fmt::Display) -> Self {
		match error.kind() {
			std::io::ErrorKind::NotFound => {
				Self::FileNotFound {
					path: path.to_string(),
				}
			}
			std::io::ErrorKind::PermissionDenied => {
				Self::AccessDenied {
					path: path.to_string(),
				}
			}
			_ => Self::Io(error),
		}
	}
}

/// The business error taxonomy shared by expansion, resolution, caching and
/// linting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum TemplateErrorKind {
	DuplicateDefinition,
	UndefinedReference,
	CircularReference,
	InvalidDefinition,
	FileNotFound,
	AccessDenied,
	ParseError,
	MaxDepthExceeded,
	/// Drives automatic rebuilds. Never surfaced to callers.
	CacheInvalid,
}

impl TemplateErrorKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::DuplicateDefinition => "duplicate-definition",
			Self::UndefinedReference => "undefined-reference",
			Self::CircularReference => "circular-reference",
			Self::InvalidDefinition => "invalid-definition",
			Self::FileNotFound => "file-not-found",
			Self::AccessDenied => "access-denied",
			Self::ParseError => "parse-error",
			Self::MaxDepthExceeded => "max-depth-exceeded",
			Self::CacheInvalid => "cache-invalid",
		}
	}

	const fn help(self) -> Option<&'static str> {
		match self {
			Self::DuplicateDefinition => {
				Some("each template id must be unique across the files it is resolved with")
			}
			Self::UndefinedReference => {
				Some("define the template with `:::template{id=\"...\"}` or point `src` at the file that defines it")
			}
			Self::CircularReference => Some("break the cycle by removing one of the references"),
			Self::InvalidDefinition => Some("add an `id` attribute to the template directive"),
			Self::FileNotFound => Some("check the `src` path"),
			Self::AccessDenied => Some("check the file permissions"),
			Self::MaxDepthExceeded => Some("raise `[expansion] max_depth` in mdck.toml"),
			Self::ParseError | Self::CacheInvalid => None,
		}
	}
}

impl fmt::Display for TemplateErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A structured template error: a kind, a human message and free-form
/// details such as `templateId`, `filePath` or `line`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct TemplateError {
	pub kind: TemplateErrorKind,
	pub message: String,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub details: BTreeMap<String, String>,
}

impl TemplateError {
	pub fn new(kind: TemplateErrorKind, message: impl Into<String>) -> Self {
		Self {
			kind,
			message: message.into(),
			details: BTreeMap::new(),
		}
	}

	#[must_use]
	pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
		self.details.insert(key.into(), value.to_string());
		self
	}

	pub fn detail(&self, key: &str) -> Option<&str> {
		self.details.get(key).map(String::as_str)
	}
}

impl Diagnostic for TemplateError {
	fn code<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
		Some(Box::new(format!("mdck::{}", self.kind.as_str().replace('-', "_"))))
	}

	fn help<'a>(&'a self) -> Option<Box<dyn fmt::Display + 'a>> {
		self.kind
			.help()
			.map(|help| Box::new(help) as Box<dyn fmt::Display + 'a>)
	}
}

pub type MdckResult<T> = Result<T, MdckError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
