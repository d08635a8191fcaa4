use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use mdck_core::MdckError;
use mdck_core::TemplateErrorKind;
use thiserror::Error;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Lint and expand reusable template directives in markdown checklists.",
	long_about = "mdck checks markdown files that define reusable blocks with \
	              `:::template{id=\"...\"}` and reference them with \
	              `::template{id=\"...\"}`, optionally from other files through a `src` \
	              attribute.\n\nQuick start:\n  mdck lint      Report duplicate, undefined and \
	              circular templates\n  mdck generate  Expand a template into plain markdown\n  \
	              mdck cache     Inspect or rebuild the project metadata cache\n  mdck validate  \
	              Report directive syntax problems"
)]
#[allow(clippy::struct_excessive_bools)]
pub struct MdckCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Path to the project root directory.
	#[arg(long, short, global = true)]
	pub path: Option<PathBuf>,

	/// Path to a config file. Defaults to the first of `mdck.toml`,
	/// `.mdck.toml` or `.config/mdck.toml` in the project root.
	#[arg(long, global = true)]
	pub config: Option<PathBuf>,

	/// Enable verbose output and debug logging.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Only print errors.
	#[arg(long, short, global = true, default_value_t = false)]
	pub quiet: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Lint markdown files for template problems.
	///
	/// Reports duplicate template ids (M002), references to templates that
	/// are never defined (M003) and circular references (M004). Without any
	/// file arguments every markdown file tracked by the metadata cache is
	/// linted. Exits with status 2 when any error-level finding is reported.
	Lint {
		/// Files or glob patterns to lint, relative to the project root.
		files: Vec<String>,

		/// Output format for lint results. Use `text` for human-readable
		/// output or `json` for programmatic consumption.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,

		/// Only run these rules (comma separated ids, e.g. `M002,M003`).
		#[arg(long, value_delimiter = ',')]
		rules: Vec<String>,

		/// Skip these rules (comma separated ids).
		#[arg(long, value_delimiter = ',')]
		disable_rules: Vec<String>,

		/// Scan the project directly instead of reading the metadata cache.
		#[arg(long, default_value_t = false)]
		no_cache: bool,
	},
	/// Expand a template into plain markdown.
	///
	/// Looks the template up in the metadata cache, or in `--file` when
	/// given, substitutes every nested reference and prints the result.
	Generate {
		/// The id of the template to expand.
		template_id: String,

		/// Read definitions from this file (and the files it references)
		/// instead of the metadata cache.
		#[arg(long)]
		file: Option<PathBuf>,

		/// Write the expanded markdown to this path instead of stdout.
		#[arg(long, short)]
		output: Option<PathBuf>,

		/// Overwrite the output file when it already exists.
		#[arg(long, default_value_t = false)]
		force: bool,
	},
	/// Inspect or maintain the project metadata cache.
	///
	/// With no flag, prints the same summary as `--info`.
	Cache {
		/// Print a summary of the cached project.
		#[arg(long, default_value_t = false)]
		info: bool,

		/// Discard the cache and rescan every file.
		#[arg(long, default_value_t = false)]
		rebuild: bool,

		/// Reconcile the cache with files that changed since it was written.
		#[arg(long, default_value_t = false)]
		refresh: bool,

		/// Delete the cache directory.
		#[arg(long, default_value_t = false)]
		clear: bool,
	},
	/// Report directive syntax problems such as unclosed containers.
	///
	/// Without any file arguments every markdown file in the project is
	/// validated. Exits with status 2 when any problem is found.
	Validate {
		/// Files or glob patterns to validate, relative to the project root.
		files: Vec<String>,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
	Text,
	Json,
}

/// Process exit status of the `mdck` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
	Success,
	General,
	LintErrors,
	Config,
	FileNotFound,
	PermissionDenied,
	InvalidArgument,
	Cache,
	TemplateNotFound,
}

impl ExitCode {
	pub const fn code(self) -> i32 {
		match self {
			Self::Success => 0,
			Self::General => 1,
			Self::LintErrors => 2,
			Self::Config => 3,
			Self::FileNotFound => 4,
			Self::PermissionDenied => 5,
			Self::InvalidArgument => 6,
			Self::Cache => 7,
			Self::TemplateNotFound => 8,
		}
	}
}

impl From<&MdckError> for ExitCode {
	fn from(error: &MdckError) -> Self {
		match error {
			MdckError::FileNotFound { .. } => Self::FileNotFound,
			MdckError::AccessDenied { .. } => Self::PermissionDenied,
			MdckError::ConfigParse(_) | MdckError::InvalidSeverity(_) => Self::Config,
			MdckError::UnknownRule(_) => Self::InvalidArgument,
			MdckError::Cache(_) => Self::Cache,
			MdckError::Template(error) => {
				match error.kind {
					TemplateErrorKind::UndefinedReference => Self::TemplateNotFound,
					TemplateErrorKind::FileNotFound => Self::FileNotFound,
					TemplateErrorKind::AccessDenied => Self::PermissionDenied,
					_ => Self::General,
				}
			}
			_ => Self::General,
		}
	}
}

/// A command failure that is not a core error, carrying its exit status.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CliError {
	pub code: ExitCode,
	pub message: String,
}

impl CliError {
	pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}
}
