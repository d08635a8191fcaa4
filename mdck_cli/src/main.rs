use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use globset::Glob;
use globset::GlobSetBuilder;
use mdck_cli::CliError;
use mdck_cli::Commands;
use mdck_cli::ExitCode;
use mdck_cli::MdckCli;
use mdck_cli::OutputFormat;
use mdck_core::BUILTIN_RULE_IDS;
use mdck_core::CacheManager;
use mdck_core::ExpansionResult;
use mdck_core::FileResolver;
use mdck_core::LintConfig;
use mdck_core::LintReport;
use mdck_core::MdckConfig;
use mdck_core::MdckError;
use mdck_core::RuleEngine;
use mdck_core::Severity;
use mdck_core::TemplateDefinitions;
use mdck_core::TemplateExpander;
use mdck_core::absolute_path;
use mdck_core::discover_markdown_files;
use mdck_core::parse_markdown;
use mdck_core::relative_file_key;
use mdck_core::to_markdown;
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

type CommandResult = Result<ExitCode, Box<dyn std::error::Error>>;

static USE_COLOR: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

fn color_enabled() -> bool {
	USE_COLOR.load(std::sync::atomic::Ordering::Relaxed)
}

/// Apply ANSI color codes only when color is enabled.
macro_rules! colored {
	($text:expr,red) => {
		if color_enabled() {
			format!("{}", $text.red())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,green) => {
		if color_enabled() {
			format!("{}", $text.green())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,yellow) => {
		if color_enabled() {
			format!("{}", $text.yellow())
		} else {
			format!("{}", $text)
		}
	};
	($text:expr,bold) => {
		if color_enabled() {
			format!("{}", $text.bold())
		} else {
			format!("{}", $text)
		}
	};
}

fn main() {
	let args = MdckCli::parse();

	// Respect NO_COLOR, --no-color and terminals without color support.
	let use_color = !args.no_color
		&& std::env::var_os("NO_COLOR").is_none()
		&& supports_color::on(supports_color::Stream::Stdout).is_some();
	if !use_color {
		USE_COLOR.store(false, std::sync::atomic::Ordering::Relaxed);
	}

	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	init_tracing(&args, use_color);

	let Some(command) = &args.command else {
		eprintln!("No subcommand specified. Run `mdck --help` for usage.");
		process::exit(ExitCode::General.code());
	};

	let result = match tokio::runtime::Runtime::new() {
		Ok(runtime) => runtime.block_on(run(&args, command)),
		Err(e) => Err(e.into()),
	};

	match result {
		Ok(code) => process::exit(code.code()),
		Err(e) => process::exit(report_error(e).code()),
	}
}

/// Print `error` and return the exit status it maps to.
fn report_error(error: Box<dyn std::error::Error>) -> ExitCode {
	let error = match error.downcast::<MdckError>() {
		Ok(mdck_err) => {
			let code = ExitCode::from(&*mdck_err);
			let report: miette::Report = (*mdck_err).into();
			eprintln!("{report:?}");
			return code;
		}
		Err(error) => error,
	};

	match error.downcast::<CliError>() {
		Ok(cli_err) => {
			eprintln!("{} {}", colored!("error:", red), cli_err.message);
			cli_err.code
		}
		Err(error) => {
			eprintln!("{} {error}", colored!("error:", red));
			ExitCode::General
		}
	}
}

fn init_tracing(args: &MdckCli, use_color: bool) {
	let level = if args.verbose {
		"debug"
	} else if args.quiet {
		"error"
	} else {
		"warn"
	};
	let filter = EnvFilter::try_from_env("MDCK_LOG").unwrap_or_else(|_| EnvFilter::new(level));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.with_target(false)
		.try_init();
}

async fn run(args: &MdckCli, command: &Commands) -> CommandResult {
	let root = resolve_root(args);
	let config = load_config(args, &root)?;

	match command {
		Commands::Lint {
			files,
			format,
			rules,
			disable_rules,
			no_cache,
		} => {
			let lint_config = select_rules(config.lint_config()?, rules, disable_rules)?;
			let use_cache = config.cache.enabled && !*no_cache;
			run_lint(args, &root, &config, files, *format, lint_config, use_cache).await
		}
		Commands::Generate {
			template_id,
			file,
			output,
			force,
		} => {
			run_generate(
				args,
				&root,
				&config,
				template_id,
				file.as_deref(),
				output.as_deref(),
				*force,
			)
			.await
		}
		Commands::Cache {
			info: _,
			rebuild,
			refresh,
			clear,
		} => run_cache(args, &root, &config, *rebuild, *refresh, *clear).await,
		Commands::Validate { files } => run_validate(args, &root, &config, files).await,
	}
}

fn resolve_root(args: &MdckCli) -> PathBuf {
	let root = args
		.path
		.clone()
		.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
	absolute_path(&root)
}

fn load_config(args: &MdckCli, root: &Path) -> Result<MdckConfig, MdckError> {
	match &args.config {
		Some(path) => MdckConfig::load_from(path),
		None => Ok(MdckConfig::load(root)?.unwrap_or_default()),
	}
}

fn print_section(title: &str) {
	println!();
	println!("{}", colored!(title, bold));
}

fn print_field(label: &str, value: impl std::fmt::Display) {
	println!("{label:<28} {value}");
}

/// Apply `--rules` and `--disable-rules` on top of the configured rules.
fn select_rules(
	mut config: LintConfig,
	only: &[String],
	disabled: &[String],
) -> Result<LintConfig, MdckError> {
	for id in only.iter().chain(disabled) {
		if !BUILTIN_RULE_IDS.contains(&id.as_str()) {
			return Err(MdckError::UnknownRule(id.clone()));
		}
	}

	if !only.is_empty() {
		for id in BUILTIN_RULE_IDS {
			if !only.iter().any(|selected| selected == id) {
				config.set_enabled(id, false);
			}
		}
	}

	for id in disabled {
		config.set_enabled(id.clone(), false);
	}

	Ok(config)
}

fn is_glob_pattern(value: &str) -> bool {
	value.contains(['*', '?', '[', '{'])
}

/// Expand file arguments into paths. Plain paths must exist; glob patterns
/// are matched against the project's markdown files.
async fn resolve_file_args(
	root: &Path,
	config: &MdckConfig,
	files: &[String],
) -> Result<Vec<PathBuf>, Box<dyn std::error::Error>> {
	let mut resolved = BTreeSet::new();
	let mut globs = GlobSetBuilder::new();
	let mut has_globs = false;

	for file in files {
		if is_glob_pattern(file) {
			let glob = Glob::new(file).map_err(|e| {
				CliError::new(ExitCode::InvalidArgument, format!("invalid pattern `{file}`: {e}"))
			})?;
			globs.add(glob);
			has_globs = true;
			continue;
		}

		let path = root.join(file);
		let is_file = tokio::fs::metadata(&path)
			.await
			.is_ok_and(|metadata| metadata.is_file());
		if !is_file {
			return Err(MdckError::FileNotFound {
				path: path.display().to_string(),
			}
			.into());
		}
		resolved.insert(path);
	}

	if has_globs {
		let matcher = globs
			.build()
			.map_err(|e| CliError::new(ExitCode::InvalidArgument, e.to_string()))?;
		let cache_dir = root.join(&config.cache.dir);
		for path in discover_markdown_files(root, &cache_dir, &config.exclude).await? {
			if matcher.is_match(relative_file_key(root, &path)) {
				resolved.insert(path);
			}
		}
	}

	Ok(resolved.into_iter().collect())
}

/// Every markdown file of the project, read from the metadata cache when it
/// is enabled.
async fn project_files(
	root: &Path,
	config: &MdckConfig,
	use_cache: bool,
) -> Result<Vec<PathBuf>, MdckError> {
	if !use_cache {
		let cache_dir = root.join(&config.cache.dir);
		return discover_markdown_files(root, &cache_dir, &config.exclude).await;
	}

	let mut manager = CacheManager::with_options(root, config.cache_options());
	let data = manager.get_cache_data().await?;
	Ok(data.files.keys().map(|key| root.join(key)).collect())
}

async fn run_lint(
	args: &MdckCli,
	root: &Path,
	config: &MdckConfig,
	files: &[String],
	format: OutputFormat,
	lint_config: LintConfig,
	use_cache: bool,
) -> CommandResult {
	let paths = if files.is_empty() {
		project_files(root, config, use_cache).await?
	} else {
		resolve_file_args(root, config, files).await?
	};

	let resolver = Arc::new(FileResolver::with_options(config.resolver_options(root)));
	let engine = RuleEngine::with_default_rules(resolver, lint_config);

	let mut reports = Vec::with_capacity(paths.len());
	for path in &paths {
		reports.push(engine.lint_file(path, Some(root)).await?);
	}

	let errors: usize = reports.iter().map(|report| report.error_count).sum();
	let warnings: usize = reports.iter().map(|report| report.warning_count).sum();
	let infos: usize = reports.iter().map(|report| report.info_count).sum();

	match format {
		OutputFormat::Json => {
			let mut entries = Vec::with_capacity(reports.len());
			for report in &reports {
				let mut entry = serde_json::to_value(report)?;
				if let Some(path) = &report.file_path {
					entry["filePath"] = serde_json::Value::String(relative_file_key(root, path));
				}
				entries.push(entry);
			}
			let output = serde_json::json!({
				"files": entries,
				"fileCount": reports.len(),
				"errorCount": errors,
				"warningCount": warnings,
				"infoCount": infos,
			});
			println!("{}", serde_json::to_string_pretty(&output)?);
		}
		OutputFormat::Text => print_lint_text(args, root, &reports, errors, warnings, infos),
	}

	Ok(if errors > 0 {
		ExitCode::LintErrors
	} else {
		ExitCode::Success
	})
}

fn print_lint_text(
	args: &MdckCli,
	root: &Path,
	reports: &[LintReport],
	errors: usize,
	warnings: usize,
	infos: usize,
) {
	for report in reports.iter().filter(|report| !report.results.is_empty()) {
		let path = report
			.file_path
			.as_deref()
			.map(|path| relative_file_key(root, path))
			.unwrap_or_default();
		println!("{}", colored!(path, bold));

		for result in &report.results {
			let location = format!("{}:{}", result.line, result.column.unwrap_or(1));
			let severity = match result.severity {
				Severity::Error => colored!("error", red),
				Severity::Warn => colored!("warn", yellow),
				Severity::Info => colored!("info", bold),
			};
			println!("  {location:<8} {severity:<5}  {}  {}", result.message, result.rule_id);
		}
		println!();
	}

	let total = errors + warnings + infos;
	if total == 0 {
		if !args.quiet {
			println!(
				"{} No problems found in {} file(s).",
				colored!("✓", green),
				reports.len()
			);
		}
		return;
	}

	let summary = format!("{total} problem(s) ({errors} error(s), {warnings} warning(s), {infos} info)");
	if errors > 0 {
		println!("{} {summary}", colored!("✗", red));
	} else {
		println!("{} {summary}", colored!("!", yellow));
	}
}

async fn run_generate(
	args: &MdckCli,
	root: &Path,
	config: &MdckConfig,
	template_id: &str,
	file: Option<&Path>,
	output: Option<&Path>,
	force: bool,
) -> CommandResult {
	if let Some(output) = output {
		if !force && tokio::fs::try_exists(output).await.unwrap_or(false) {
			return Err(CliError::new(
				ExitCode::InvalidArgument,
				format!(
					"output file `{}` already exists, use --force to overwrite it",
					output.display()
				),
			)
			.into());
		}
	}

	let resolver = Arc::new(FileResolver::with_options(config.resolver_options(root)));
	let expander = TemplateExpander::new(resolver).with_options(config.expansion_options());

	let result = match file {
		Some(file) => {
			let path = root.join(file);
			let content = tokio::fs::read_to_string(&path)
				.await
				.map_err(|e| MdckError::from_io(e, path.display()))?;
			let document = parse_markdown(&content)?;
			expander
				.expand_template(template_id, &document.root, Some(&path))
				.await
		}
		None => {
			let definitions = cached_definitions(root, config, &expander, template_id).await?;
			expander.expand_with_definitions(template_id, &definitions)
		}
	};

	let expanded = match result {
		ExpansionResult::Success { expanded, .. } => expanded,
		ExpansionResult::Error(error) => return Err(MdckError::Template(error).into()),
	};
	let markdown = to_markdown(&expanded);

	match output {
		Some(output) => {
			tokio::fs::write(output, &markdown)
				.await
				.map_err(|e| MdckError::from_io(e, output.display()))?;
			if !args.quiet {
				println!(
					"{} Wrote template \"{template_id}\" to {}",
					colored!("✓", green),
					output.display()
				);
			}
		}
		None => print!("{markdown}"),
	}

	Ok(ExitCode::Success)
}

/// Load the definitions needed to expand `template_id` from the files the
/// metadata cache records for it and its transitive dependencies.
async fn cached_definitions(
	root: &Path,
	config: &MdckConfig,
	expander: &TemplateExpander,
	template_id: &str,
) -> Result<TemplateDefinitions, Box<dyn std::error::Error>> {
	let mut manager = CacheManager::with_options(root, config.cache_options());
	let data = manager.get_cache_data().await?;

	if !data.templates.contains_key(template_id) {
		return Err(CliError::new(
			ExitCode::TemplateNotFound,
			format!("template \"{template_id}\" is not defined in any project file"),
		)
		.into());
	}

	let mut needed = BTreeSet::from([template_id]);
	let mut pending = vec![template_id];
	while let Some(id) = pending.pop() {
		for dependency in data.dependencies.dependencies_of(id) {
			if needed.insert(dependency.as_str()) {
				pending.push(dependency.as_str());
			}
		}
	}

	let files: BTreeSet<&str> = needed
		.iter()
		.filter_map(|id| data.templates.get(*id))
		.map(|template| template.file_path.as_str())
		.collect();

	let mut definitions = TemplateDefinitions::new();
	for key in files {
		let path = root.join(key);
		let content = tokio::fs::read_to_string(&path)
			.await
			.map_err(|e| MdckError::from_io(e, path.display()))?;
		let document = parse_markdown(&content)?;
		let collected = expander
			.collect_all_definitions(&document.root, Some(&path))
			.await
			.map_err(MdckError::Template)?;

		// The cache already resolved cross-file duplicates: first file wins.
		for (id, definition) in collected {
			definitions.entry(id).or_insert(definition);
		}
	}

	tracing::debug!(
		template = template_id,
		definitions = definitions.len(),
		"loaded definitions from cache"
	);

	Ok(definitions)
}

async fn run_cache(
	args: &MdckCli,
	root: &Path,
	config: &MdckConfig,
	rebuild: bool,
	refresh: bool,
	clear: bool,
) -> CommandResult {
	let mut manager = CacheManager::with_options(root, config.cache_options());

	if clear {
		manager.clear_cache().await.map_err(cache_error)?;
		if !args.quiet {
			println!("{} Cleared cache at {}", colored!("✓", green), manager.cache_path().display());
		}
		return Ok(ExitCode::Success);
	}

	if rebuild {
		let data = manager.rebuild_cache().await.map_err(cache_error)?;
		if !args.quiet {
			println!(
				"{} Rebuilt cache: {} file(s), {} template(s)",
				colored!("✓", green),
				data.files.len(),
				data.templates.len()
			);
		}
		return Ok(ExitCode::Success);
	}

	if refresh {
		let result = manager.refresh_cache(None).await.map_err(cache_error)?;
		if !args.quiet {
			if result.has_changes() {
				println!(
					"{} Refreshed cache: {} added, {} updated, {} removed, {} template(s) affected",
					colored!("✓", green),
					result.added_files.len(),
					result.updated_files.len(),
					result.removed_files.len(),
					result.affected_templates.len()
				);
			} else {
				println!("{} Cache is up to date.", colored!("✓", green));
			}
		}
		for error in &result.errors {
			eprintln!("{} {}: {}", colored!("warning:", yellow), error.path, error.message);
		}
		return Ok(ExitCode::Success);
	}

	let info = manager.cache_info().await.map_err(cache_error)?;
	print_section("Cache");
	print_field("Location:", manager.cache_path().display());
	print_field("Version:", &info.version);
	print_field("Last updated (unix ms):", info.last_updated_unix_ms);
	print_section("Contents");
	print_field("Files:", info.file_count);
	print_field("Templates:", info.template_count);
	print_field("Dependencies:", info.edge_count);
	print_field("Files with errors:", info.files_with_errors);
	print_field("Cycles:", info.cycles.len());
	for cycle in &info.cycles {
		println!("  {}", colored!(mdck_core::format_cycle(cycle), yellow));
	}

	Ok(ExitCode::Success)
}

/// Report io failures while maintaining the cache as cache errors.
fn cache_error(error: MdckError) -> MdckError {
	match error {
		MdckError::Io(error) => MdckError::Cache(error.to_string()),
		error => error,
	}
}

async fn run_validate(
	args: &MdckCli,
	root: &Path,
	config: &MdckConfig,
	files: &[String],
) -> CommandResult {
	let paths = if files.is_empty() {
		project_files(root, config, false).await?
	} else {
		resolve_file_args(root, config, files).await?
	};

	let mut problems = 0;
	for path in &paths {
		let key = relative_file_key(root, path);
		let content = tokio::fs::read_to_string(path)
			.await
			.map_err(|e| MdckError::from_io(e, path.display()))?;

		match parse_markdown(&content) {
			Ok(document) => {
				for diagnostic in &document.diagnostics {
					problems += 1;
					println!(
						"{}:{} {} {}",
						key,
						diagnostic.line(),
						colored!("error:", red),
						diagnostic.message()
					);
				}
			}
			Err(error) => {
				problems += 1;
				println!("{key} {} {error}", colored!("error:", red));
			}
		}
	}

	if problems > 0 {
		println!(
			"\n{} {problems} problem(s) in {} file(s)",
			colored!("✗", red),
			paths.len()
		);
		return Ok(ExitCode::LintErrors);
	}

	if !args.quiet {
		println!(
			"{} {} file(s) validated, no problems found.",
			colored!("✓", green),
			paths.len()
		);
	}

	Ok(ExitCode::Success)
}
