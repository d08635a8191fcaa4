use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use futures::StreamExt;
use futures::stream;
use ignore::gitignore::Gitignore;
use ignore::gitignore::GitignoreBuilder;
use serde::Deserialize;
use serde::Serialize;

use crate::CachedTemplate;
use crate::DependencyGraph;
use crate::FileError;
use crate::FileMetadata;
use crate::MdckError;
use crate::MdckResult;
use crate::TemplateError;
use crate::TemplateErrorKind;
use crate::absolute_path;
use crate::extract_from_content;
use crate::extract_file_metadata;
use crate::metadata::modified_unix_ms;
use crate::normalize_path;
use crate::relative_file_key;

/// Schema version of the persisted snapshot.
pub const CACHE_VERSION: &str = "1.0.0";
/// Default cache directory, relative to the project root.
pub const DEFAULT_CACHE_DIR: &str = ".mdck/.cache";
pub const CACHE_FILE_NAME: &str = "metadata.json";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
/// Extensions of the files tracked by the cache.
pub const MARKDOWN_EXTENSIONS: [&str; 2] = ["md", "markdown"];

/// Detail marking errors derived from the whole project rather than a
/// single file. These are recomputed whenever the template map is derived.
const PROJECT_SCOPE_DETAIL: &str = "scope";
const PROJECT_SCOPE: &str = "project";

/// The persisted snapshot of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheData {
	pub version: String,
	pub last_updated_unix_ms: u64,
	pub project_root: PathBuf,
	pub files: BTreeMap<String, FileMetadata>,
	pub templates: BTreeMap<String, CachedTemplate>,
	pub dependencies: DependencyGraph,
}

impl CacheData {
	pub fn empty(project_root: impl Into<PathBuf>) -> Self {
		Self {
			version: CACHE_VERSION.to_string(),
			last_updated_unix_ms: now_unix_ms(),
			project_root: project_root.into(),
			files: BTreeMap::new(),
			templates: BTreeMap::new(),
			dependencies: DependencyGraph::default(),
		}
	}

	pub fn to_json(&self) -> MdckResult<String> {
		serde_json::to_string_pretty(self).map_err(|error| MdckError::Cache(error.to_string()))
	}

	pub fn from_json(json: &str) -> MdckResult<Self> {
		serde_json::from_str(json).map_err(|error| MdckError::Cache(error.to_string()))
	}

	/// Recompute the template map and dependency graph from the per-file
	/// definitions. Files are visited in path order so the first definition
	/// of an id wins and later ones are recorded as duplicates.
	fn derive_templates(&mut self) {
		let mut templates: BTreeMap<String, CachedTemplate> = BTreeMap::new();

		for metadata in self.files.values_mut() {
			metadata.errors.retain(|error| {
				error.detail(PROJECT_SCOPE_DETAIL) != Some(PROJECT_SCOPE)
			});

			for definition in &metadata.definitions {
				if let Some(existing) = templates.get(&definition.id) {
					metadata.errors.push(
						TemplateError::new(
							TemplateErrorKind::DuplicateDefinition,
							format!(
								"Duplicate template definition: \"{}\" (first defined in {}:{})",
								definition.id,
								existing.file_path,
								existing.start_line.unwrap_or_default()
							),
						)
						.with_detail("templateId", &definition.id)
						.with_detail("firstFile", &existing.file_path)
						.with_detail("secondFile", &definition.file_path)
						.with_detail(PROJECT_SCOPE_DETAIL, PROJECT_SCOPE),
					);
					continue;
				}

				templates.insert(definition.id.clone(), definition.clone());
			}
		}

		self.dependencies = DependencyGraph::from_dependencies(
			templates
				.values()
				.map(|template| (template.id.as_str(), template.dependencies.as_slice())),
		);
		self.templates = templates;
	}
}

/// Summary of a cache snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
	pub version: String,
	pub project_root: PathBuf,
	pub last_updated_unix_ms: u64,
	pub file_count: usize,
	pub template_count: usize,
	pub edge_count: usize,
	pub cycles: Vec<Vec<String>>,
	pub files_with_errors: usize,
}

/// Changes applied by [`CacheManager::refresh_cache`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshResult {
	pub added_files: Vec<String>,
	pub updated_files: Vec<String>,
	pub removed_files: Vec<String>,
	/// Ids defined by the touched files, plus every template that depends on
	/// one of them.
	pub affected_templates: BTreeSet<String>,
	pub duration: Duration,
	pub errors: Vec<FileError>,
}

impl RefreshResult {
	pub fn has_changes(&self) -> bool {
		!(self.added_files.is_empty() && self.updated_files.is_empty() && self.removed_files.is_empty())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
	/// Cache directory relative to the project root.
	pub cache_dir: PathBuf,
	pub max_age: Duration,
	pub max_concurrency: usize,
	/// Extra gitignore-style patterns excluded from the scan.
	pub exclude: Vec<String>,
}

impl Default for CacheOptions {
	fn default() -> Self {
		Self {
			cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
			max_age: DEFAULT_MAX_AGE,
			max_concurrency: DEFAULT_MAX_CONCURRENCY,
			exclude: vec![],
		}
	}
}

/// Loads, validates, rebuilds and refreshes the metadata snapshot of one
/// project root.
#[derive(Debug)]
pub struct CacheManager {
	root: PathBuf,
	options: CacheOptions,
	data: Option<CacheData>,
}

impl CacheManager {
	pub fn new(root: impl AsRef<Path>) -> Self {
		Self::with_options(root, CacheOptions::default())
	}

	pub fn with_options(root: impl AsRef<Path>, options: CacheOptions) -> Self {
		Self {
			root: absolute_path(root.as_ref()),
			options,
			data: None,
		}
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn cache_dir(&self) -> PathBuf {
		self.root.join(&self.options.cache_dir)
	}

	pub fn cache_path(&self) -> PathBuf {
		self.cache_dir().join(CACHE_FILE_NAME)
	}

	/// Return the in-memory snapshot, loading and validating the persisted
	/// one if needed. Any validation failure triggers a rebuild.
	pub async fn get_cache_data(&mut self) -> MdckResult<&CacheData> {
		if self.data.is_none() {
			match self.load_valid(true).await {
				Ok(data) => {
					tracing::debug!(files = data.files.len(), "loaded cache snapshot");
					self.data = Some(data);
				}
				Err(reason) => {
					tracing::debug!(reason = %reason, "cache invalid, rebuilding");
					self.rebuild_cache().await?;
				}
			}
		}

		self.data
			.as_ref()
			.ok_or_else(|| MdckError::Cache("cache data unavailable after rebuild".into()))
	}

	/// Read the persisted snapshot without validating or rebuilding it.
	pub async fn read_persisted(&self) -> MdckResult<Option<CacheData>> {
		match tokio::fs::read_to_string(self.cache_path()).await {
			Ok(json) => CacheData::from_json(&json).map(Some),
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(error) => Err(MdckError::Io(error)),
		}
	}

	/// Load the persisted snapshot and validate it. `check_files` also
	/// compares every tracked file against its recorded size and mtime.
	async fn load_valid(&self, check_files: bool) -> Result<CacheData, TemplateError> {
		let invalid = |reason: String| TemplateError::new(TemplateErrorKind::CacheInvalid, reason);

		let data = match self.read_persisted().await {
			Ok(Some(data)) => data,
			Ok(None) => return Err(invalid("no snapshot on disk".into())),
			Err(error) => return Err(invalid(format!("unreadable snapshot: {error}"))),
		};

		self.validate(&data, check_files).await.map(|()| data)
	}

	/// With `check_files`, every tracked file must still match its
	/// fingerprint and the scanned file set must equal the tracked one.
	async fn validate(&self, data: &CacheData, check_files: bool) -> Result<(), TemplateError> {
		let invalid = |reason: String| TemplateError::new(TemplateErrorKind::CacheInvalid, reason);

		if data.version != CACHE_VERSION {
			return Err(invalid(format!("version mismatch: {}", data.version)));
		}

		if data.project_root != self.root {
			return Err(invalid(format!(
				"project root mismatch: {}",
				data.project_root.display()
			)));
		}

		let age = now_unix_ms().saturating_sub(data.last_updated_unix_ms);
		if u128::from(age) > self.options.max_age.as_millis() {
			return Err(invalid(format!("snapshot is {age}ms old")));
		}

		if !check_files {
			return Ok(());
		}

		for (key, metadata) in &data.files {
			let Ok(fs_metadata) = tokio::fs::metadata(self.root.join(key)).await else {
				return Err(invalid(format!("{key} no longer exists")));
			};

			if !metadata.matches_fingerprint(fs_metadata.len(), modified_unix_ms(&fs_metadata)) {
				return Err(invalid(format!("{key} changed on disk")));
			}
		}

		let discovered = self
			.discover_files()
			.await
			.map_err(|error| invalid(format!("project scan failed: {error}")))?;
		let untracked = discovered
			.iter()
			.map(|path| relative_file_key(&self.root, path))
			.find(|key| !data.files.contains_key(key));
		if let Some(key) = untracked {
			return Err(invalid(format!("{key} is not tracked")));
		}
		if discovered.len() != data.files.len() {
			return Err(invalid("tracked file set changed".into()));
		}

		Ok(())
	}

	/// Scan the whole project and replace the snapshot.
	pub async fn rebuild_cache(&mut self) -> MdckResult<&CacheData> {
		let start = Instant::now();
		let files = self.discover_files().await?;
		let concurrency = self.options.max_concurrency.max(1);
		let root = self.root.clone();

		let results: Vec<_> = stream::iter(files)
			.map(|path| {
				let root = root.clone();
				async move { extract_file_metadata(&root, &path).await }
			})
			.buffered(concurrency)
			.collect()
			.await;

		let mut data = CacheData::empty(self.root.clone());
		for result in results {
			match result {
				Ok(metadata) => {
					data.files.insert(metadata.path.clone(), metadata);
				}
				Err(error) => {
					tracing::warn!(file = %error.path, "skipping file: {}", error.message);
				}
			}
		}

		data.derive_templates();
		data.last_updated_unix_ms = now_unix_ms();
		self.save(&data).await?;

		tracing::info!(
			files = data.files.len(),
			templates = data.templates.len(),
			cycles = data.dependencies.cycles.len(),
			elapsed_ms = start.elapsed().as_millis(),
			"rebuilt cache"
		);

		self.data = Some(data);
		self.data
			.as_ref()
			.ok_or_else(|| MdckError::Cache("cache data unavailable after rebuild".into()))
	}

	/// Bring the snapshot up to date by comparing content hashes, either for
	/// `target_files` or for a fresh scan of the project. Only changed files
	/// are re-extracted.
	pub async fn refresh_cache(&mut self, target_files: Option<&[PathBuf]>) -> MdckResult<RefreshResult> {
		let start = Instant::now();
		if self.data.is_none() {
			// Stale files are reconciled below.
			match self.load_valid(false).await {
				Ok(data) => self.data = Some(data),
				Err(reason) => {
					tracing::debug!(reason = %reason, "cache invalid, rebuilding before refresh");
					self.rebuild_cache().await?;
				}
			}
		}
		let mut data = self
			.data
			.take()
			.ok_or_else(|| MdckError::Cache("cache data unavailable".into()))?;

		let candidates = match target_files {
			Some(files) => {
				files
					.iter()
					.map(|file| {
						if file.is_absolute() {
							normalize_path(file)
						} else {
							normalize_path(&self.root.join(file))
						}
					})
					.collect::<Vec<_>>()
			}
			None => self.discover_files().await?,
		};

		let mut result = RefreshResult::default();
		let mut changed_ids: BTreeSet<String> = BTreeSet::new();
		let mut existing = vec![];
		let mut seen_keys = HashSet::new();

		for path in candidates {
			let key = relative_file_key(&self.root, &path);
			if !seen_keys.insert(key.clone()) {
				continue;
			}

			if tokio::fs::try_exists(&path).await.unwrap_or(false) {
				existing.push((key, path));
			} else if let Some(removed) = data.files.remove(&key) {
				changed_ids.extend(removed.template_ids);
				result.removed_files.push(key);
			}
		}

		if target_files.is_none() {
			let stale: Vec<String> = data
				.files
				.keys()
				.filter(|key| !seen_keys.contains(*key))
				.cloned()
				.collect();
			for key in stale {
				if let Some(removed) = data.files.remove(&key) {
					changed_ids.extend(removed.template_ids);
				}
				result.removed_files.push(key);
			}
		}

		let concurrency = self.options.max_concurrency.max(1);
		let outcomes: Vec<_> = stream::iter(existing)
			.map(|(key, path)| {
				let cached_hash = data.files.get(&key).map(|metadata| metadata.content_hash.clone());
				async move { (key.clone(), check_file(&key, &path, cached_hash).await) }
			})
			.buffered(concurrency)
			.collect()
			.await;

		for (key, outcome) in outcomes {
			match outcome {
				Ok(FileCheck::Unchanged { size, modified }) => {
					if let Some(metadata) = data.files.get_mut(&key) {
						metadata.size = size;
						metadata.modified_unix_ms = modified;
					}
				}
				Ok(FileCheck::Changed(metadata)) => {
					changed_ids.extend(metadata.template_ids.iter().cloned());
					if let Some(previous) = data.files.insert(key.clone(), *metadata) {
						changed_ids.extend(previous.template_ids);
						result.updated_files.push(key);
					} else {
						result.added_files.push(key);
					}
				}
				Err(error) => {
					tracing::warn!(file = %error.path, "failed to refresh file: {}", error.message);
					result.errors.push(error);
				}
			}
		}

		data.derive_templates();
		let dependents = data
			.dependencies
			.transitive_dependents(changed_ids.iter().map(String::as_str));
		changed_ids.extend(dependents);
		result.affected_templates = changed_ids;
		data.last_updated_unix_ms = now_unix_ms();
		let saved = self.save(&data).await;
		self.data = Some(data);
		saved?;

		result.duration = start.elapsed();
		tracing::info!(
			added = result.added_files.len(),
			updated = result.updated_files.len(),
			removed = result.removed_files.len(),
			affected = result.affected_templates.len(),
			errors = result.errors.len(),
			"refreshed cache"
		);

		Ok(result)
	}

	/// Drop the in-memory snapshot and delete the persisted one.
	pub async fn clear_cache(&mut self) -> MdckResult<()> {
		self.data = None;

		match tokio::fs::remove_file(self.cache_path()).await {
			Ok(()) => {
				tracing::info!("cleared cache");
				Ok(())
			}
			Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(error) => Err(MdckError::Io(error)),
		}
	}

	pub async fn cache_info(&mut self) -> MdckResult<CacheInfo> {
		let data = self.get_cache_data().await?;

		Ok(CacheInfo {
			version: data.version.clone(),
			project_root: data.project_root.clone(),
			last_updated_unix_ms: data.last_updated_unix_ms,
			file_count: data.files.len(),
			template_count: data.templates.len(),
			edge_count: data.dependencies.edge_count(),
			cycles: data.dependencies.cycles.clone(),
			files_with_errors: data
				.files
				.values()
				.filter(|metadata| !metadata.errors.is_empty())
				.count(),
		})
	}

	/// Write the snapshot to a temporary file and rename it into place.
	async fn save(&self, data: &CacheData) -> MdckResult<()> {
		let cache_path = self.cache_path();
		let cache_dir = self.cache_dir();
		tokio::fs::create_dir_all(&cache_dir).await?;

		let payload = data.to_json()?;
		let temp_path = cache_path.with_extension(format!(
			"json.tmp-{}-{}",
			std::process::id(),
			SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map_or(0, |duration| duration.as_nanos())
		));

		tokio::fs::write(&temp_path, payload).await?;
		if let Err(error) = tokio::fs::rename(&temp_path, &cache_path).await {
			let _ = tokio::fs::remove_file(&temp_path).await;
			return Err(MdckError::Cache(format!(
				"failed to write {}: {error}",
				cache_path.display()
			)));
		}

		Ok(())
	}

	/// Every markdown file below the root, sorted. Dot directories,
	/// `node_modules`, `target`, the cache directory and gitignored paths are
	/// skipped.
	pub async fn discover_files(&self) -> MdckResult<Vec<PathBuf>> {
		discover_markdown_files(&self.root, &self.cache_dir(), &self.options.exclude).await
	}
}

enum FileCheck {
	Unchanged { size: u64, modified: u64 },
	Changed(Box<FileMetadata>),
}

async fn check_file(key: &str, path: &Path, cached_hash: Option<String>) -> Result<FileCheck, FileError> {
	let to_error = |error: std::io::Error| {
		FileError {
			path: key.to_string(),
			message: error.to_string(),
		}
	};

	let fs_metadata = tokio::fs::metadata(path).await.map_err(to_error)?;
	let content = tokio::fs::read_to_string(path).await.map_err(to_error)?;
	let size = fs_metadata.len();
	let modified = modified_unix_ms(&fs_metadata);

	if cached_hash.as_deref() == Some(crate::content_hash(&content).as_str()) {
		return Ok(FileCheck::Unchanged { size, modified });
	}

	tracing::debug!(file = %key, "file content changed");
	Ok(FileCheck::Changed(Box::new(extract_from_content(
		key, &content, size, modified,
	))))
}

/// Collect markdown files below `root`, sorted for deterministic ordering.
pub async fn discover_markdown_files(
	root: &Path,
	cache_dir: &Path,
	exclude: &[String],
) -> MdckResult<Vec<PathBuf>> {
	let gitignore = build_gitignore(root);
	let custom_exclude = build_exclude_matcher(root, exclude)?;
	let mut files = vec![];
	let mut visited_dirs = BTreeSet::new();
	let mut pending = vec![root.to_path_buf()];

	while let Some(dir) = pending.pop() {
		let canonical = tokio::fs::canonicalize(&dir).await.unwrap_or_else(|_| dir.clone());
		if !visited_dirs.insert(canonical) {
			return Err(MdckError::SymlinkCycle {
				path: dir.display().to_string(),
			});
		}

		let mut entries = tokio::fs::read_dir(&dir).await?;
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			let is_dir = tokio::fs::metadata(&path)
				.await
				.is_ok_and(|metadata| metadata.is_dir());

			if is_dir {
				let skip = path
					.file_name()
					.and_then(|name| name.to_str())
					.is_some_and(is_ignored_directory_name);
				if skip || path == cache_dir {
					continue;
				}
			}

			if gitignore.matched(&path, is_dir).is_ignore()
				|| custom_exclude.matched(&path, is_dir).is_ignore()
			{
				continue;
			}

			if is_dir {
				pending.push(path);
			} else if is_markdown_file(&path) {
				files.push(path);
			}
		}
	}

	files.sort();
	Ok(files)
}

pub fn is_markdown_file(path: &Path) -> bool {
	path.extension()
		.and_then(|extension| extension.to_str())
		.is_some_and(|extension| {
			MARKDOWN_EXTENSIONS
				.iter()
				.any(|candidate| extension.eq_ignore_ascii_case(candidate))
		})
}

fn is_ignored_directory_name(name: &str) -> bool {
	name.starts_with('.') || name == "node_modules" || name == "target"
}

fn build_exclude_matcher(root: &Path, patterns: &[String]) -> MdckResult<Gitignore> {
	let mut builder = GitignoreBuilder::new(root);
	for pattern in patterns {
		builder.add_line(None, pattern).map_err(|e| {
			MdckError::ConfigParse(format!("invalid exclude pattern `{pattern}`: {e}"))
		})?;
	}
	builder
		.build()
		.map_err(|e| MdckError::ConfigParse(format!("failed to build exclude rules: {e}")))
}

fn build_gitignore(root: &Path) -> Gitignore {
	let mut builder = GitignoreBuilder::new(root);
	let gitignore_path = root.join(".gitignore");
	if gitignore_path.exists() {
		let _ = builder.add(gitignore_path);
	}
	builder.build().unwrap_or_else(|_| Gitignore::empty())
}

fn now_unix_ms() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |duration| {
			duration.as_millis().try_into().unwrap_or(u64::MAX)
		})
}
