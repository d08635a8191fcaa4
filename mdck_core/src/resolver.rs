use std::collections::HashMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::Document;
use crate::TemplateError;
use crate::TemplateErrorKind;
use crate::parse_markdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolveErrorKind {
	NotFound,
	AccessDenied,
	ParseError,
}

impl From<ResolveErrorKind> for TemplateErrorKind {
	fn from(kind: ResolveErrorKind) -> Self {
		match kind {
			ResolveErrorKind::NotFound => Self::FileNotFound,
			ResolveErrorKind::AccessDenied => Self::AccessDenied,
			ResolveErrorKind::ParseError => Self::ParseError,
		}
	}
}

/// The outcome of resolving a `src` path.
#[derive(Debug, Clone)]
pub enum ResolveOutcome {
	Success {
		ast: Arc<Document>,
		resolved_path: PathBuf,
	},
	Error {
		kind: ResolveErrorKind,
		message: String,
		attempted_path: PathBuf,
	},
}

impl ResolveOutcome {
	pub fn is_success(&self) -> bool {
		matches!(self, Self::Success { .. })
	}

	/// Convert a failed outcome into a [`TemplateError`].
	pub fn into_result(self) -> Result<(Arc<Document>, PathBuf), TemplateError> {
		match self {
			Self::Success { ast, resolved_path } => Ok((ast, resolved_path)),
			Self::Error {
				kind,
				message,
				attempted_path,
			} => {
				Err(TemplateError::new(kind.into(), message)
					.with_detail("path", attempted_path.display()))
			}
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileResolverOptions {
	/// When set, resolved paths outside this directory are rejected with
	/// `access-denied`.
	pub restrict_to_base: Option<PathBuf>,
}

/// Resolves `src` references to parsed documents, parsing each resolved
/// path at most once per resolver.
#[derive(Debug, Default)]
pub struct FileResolver {
	options: FileResolverOptions,
	cache: Mutex<HashMap<PathBuf, Arc<Document>>>,
}

impl FileResolver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_options(options: FileResolverOptions) -> Self {
		Self {
			options,
			cache: Mutex::default(),
		}
	}

	pub fn options(&self) -> &FileResolverOptions {
		&self.options
	}

	/// Resolve `src` against the directory containing `base`, or the current
	/// working directory when no base is given. Absolute paths are returned
	/// unchanged apart from lexical normalization.
	pub fn resolve_path(&self, src: impl AsRef<Path>, base: Option<&Path>) -> PathBuf {
		let src = src.as_ref();
		if src.is_absolute() {
			return normalize_path(src);
		}

		let directory = base
			.and_then(Path::parent)
			.map(Path::to_path_buf)
			.or_else(|| std::env::current_dir().ok())
			.unwrap_or_default();

		absolute_path(&directory.join(src))
	}

	pub async fn resolve_file(&self, src: impl AsRef<Path>, base: Option<&Path>) -> ResolveOutcome {
		let resolved_path = self.resolve_path(src, base);

		if let Some(restrict) = &self.options.restrict_to_base {
			if !resolved_path.starts_with(absolute_path(restrict)) {
				return ResolveOutcome::Error {
					kind: ResolveErrorKind::AccessDenied,
					message: format!(
						"Access denied: {} is outside of {}",
						resolved_path.display(),
						restrict.display()
					),
					attempted_path: resolved_path,
				};
			}
		}

		let mut cache = self.cache.lock().await;
		if let Some(ast) = cache.get(&resolved_path) {
			tracing::trace!(path = %resolved_path.display(), "resolver cache hit");
			return ResolveOutcome::Success {
				ast: Arc::clone(ast),
				resolved_path,
			};
		}

		let content = match tokio::fs::read_to_string(&resolved_path).await {
			Ok(content) => content,
			Err(error) => return io_outcome(&error, resolved_path),
		};

		match parse_markdown(&content) {
			Ok(document) => {
				let ast = Arc::new(document);
				cache.insert(resolved_path.clone(), Arc::clone(&ast));
				tracing::debug!(path = %resolved_path.display(), "resolved external file");
				ResolveOutcome::Success { ast, resolved_path }
			}
			Err(error) => {
				ResolveOutcome::Error {
					kind: ResolveErrorKind::ParseError,
					message: format!("Failed to parse {}: {error}", resolved_path.display()),
					attempted_path: resolved_path,
				}
			}
		}
	}

	pub async fn clear_cache(&self) {
		self.cache.lock().await.clear();
	}

	pub async fn invalidate_file(&self, path: impl AsRef<Path>) {
		let path = normalize_path(path.as_ref());
		self.cache.lock().await.remove(&path);
	}

	/// The resolved paths currently memoized, sorted.
	pub async fn cached_paths(&self) -> Vec<PathBuf> {
		let mut paths: Vec<_> = self.cache.lock().await.keys().cloned().collect();
		paths.sort();
		paths
	}
}

fn io_outcome(error: &std::io::Error, attempted_path: PathBuf) -> ResolveOutcome {
	let (kind, message) = match error.kind() {
		std::io::ErrorKind::NotFound => {
			(
				ResolveErrorKind::NotFound,
				format!("File not found: {}", attempted_path.display()),
			)
		}
		std::io::ErrorKind::PermissionDenied => {
			(
				ResolveErrorKind::AccessDenied,
				format!("Permission denied: {}", attempted_path.display()),
			)
		}
		_ => {
			(
				ResolveErrorKind::ParseError,
				format!("Failed to read {}: {error}", attempted_path.display()),
			)
		}
	};

	ResolveOutcome::Error {
		kind,
		message,
		attempted_path,
	}
}

/// Lexically normalize a path, removing `.` and resolving `..` without
/// touching the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
	let mut normalized = PathBuf::new();

	for component in path.components() {
		match component {
			Component::CurDir => {}
			Component::ParentDir => {
				if !normalized.pop() {
					normalized.push(component);
				}
			}
			_ => normalized.push(component),
		}
	}

	if normalized.as_os_str().is_empty() {
		return PathBuf::from(".");
	}

	normalized
}

/// Anchor `path` at the current working directory when it is relative, then
/// normalize it.
pub fn absolute_path(path: &Path) -> PathBuf {
	let anchored = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
	normalize_path(&anchored)
}
