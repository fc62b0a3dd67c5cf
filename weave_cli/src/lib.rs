use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use weave_core::CollisionPolicy;
use weave_core::Mode;

#[derive(Parser)]
#[command(
	author,
	version,
	about = "Weave stored code fragments into source files at comment anchors.",
	long_about = "weave finds comment anchors such as `// TC001 STEP1 open` in a source tree \
	              and inserts the matching code fragment from a YAML repository right after \
	              each one.\n\nOriginals are never modified: every run copies the files it \
	              touches into `<root>_backup_<timestamp>` and writes the woven result into \
	              `<root>_woven_<timestamp>`, next to the root.\n\nQuick start:\n  weave init     \
	              Create weave.toml and a starter stubs.yaml\n  weave run      Weave the tree\n  \
	              weave list     Show the repository and every anchor\n  weave extract  Rebuild \
	              the repository from woven source"
)]
pub struct WeaveCli {
	#[command(subcommand)]
	pub command: Option<Commands>,

	/// Path to the root directory to process.
	#[arg(long, short, global = true)]
	pub path: Option<PathBuf>,

	/// Enable verbose output and debug logging.
	#[arg(long, short, global = true, default_value_t = false)]
	pub verbose: bool,

	/// Disable colored output.
	#[arg(long, global = true, default_value_t = false)]
	pub no_color: bool,

	/// Also write the log to this file, without colors.
	#[arg(long, global = true)]
	pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
	/// Create `weave.toml` and a starter `stubs.yaml` in the root.
	///
	/// Existing files are left untouched, so running this twice is safe.
	Init,
	/// Weave fragments into every anchor below the root.
	///
	/// Discovers source files, resolves each anchor against the fragment
	/// repository and writes the woven copies into a fresh output directory
	/// next to the root, after backing up every file it changes. Unresolved
	/// anchors are reported but never fail the run.
	Run {
		/// Fragment repository document. Defaults to the `repository` entry
		/// of `weave.toml`, then `stubs.yaml` in the root.
		#[arg(long, short)]
		repository: Option<PathBuf>,

		/// Which anchor shapes to recognise.
		#[arg(long, value_enum)]
		mode: Option<ModeArg>,

		/// Number of files processed concurrently.
		#[arg(long, short)]
		jobs: Option<usize>,

		/// Compute the result without creating directories or writing files.
		#[arg(long, default_value_t = false)]
		dry_run: bool,

		/// With `--dry-run`, show a diff of every file that would change.
		#[arg(long, default_value_t = false)]
		diff: bool,

		/// Output format for the run summary.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,

		/// Re-run whenever the tree or the repository document changes. The
		/// repository is reloaded before each run.
		#[arg(long, default_value_t = false)]
		watch: bool,
	},
	/// Rebuild a repository document from already woven source.
	///
	/// Every referenced anchor followed by marked lines contributes one
	/// fragment. When the same key was woven with different text in
	/// different places the collision policy decides what happens.
	Extract {
		/// Write the document here instead of printing it.
		#[arg(long, short)]
		output: Option<PathBuf>,

		/// What to do when one key was woven with different text.
		#[arg(long, value_enum)]
		on_collision: Option<CollisionArg>,
	},
	/// Show the repository inventory and every anchor in the tree with its
	/// resolution status.
	List {
		/// Fragment repository document.
		#[arg(long, short)]
		repository: Option<PathBuf>,

		/// Output format for the listing.
		#[arg(long, value_enum, default_value_t = OutputFormat::Text)]
		format: OutputFormat,
	},
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
	/// Human-readable text output with colors and formatting.
	Text,
	/// JSON output for programmatic consumption.
	Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ModeArg {
	/// `// TC1 STEP1: description` followed by a `code:` comment.
	Embedded,
	/// `// TC1 STEP1 segment`, resolved against the repository.
	Referenced,
	/// Both shapes; embedded headers take precedence.
	Auto,
}

impl From<ModeArg> for Mode {
	fn from(value: ModeArg) -> Self {
		match value {
			ModeArg::Embedded => Self::Embedded,
			ModeArg::Referenced => Self::Referenced,
			ModeArg::Auto => Self::Auto,
		}
	}
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CollisionArg {
	/// Leave the key out, list every location and exit with an error.
	Abort,
	/// Keep the text found first in discovery order.
	KeepFirst,
	/// Keep the text found last in discovery order.
	KeepLast,
}

impl From<CollisionArg> for CollisionPolicy {
	fn from(value: CollisionArg) -> Self {
		match value {
			CollisionArg::Abort => Self::Abort,
			CollisionArg::KeepFirst => Self::KeepFirst,
			CollisionArg::KeepLast => Self::KeepLast,
		}
	}
}
