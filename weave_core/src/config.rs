use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::CollisionPolicy;
use crate::Mode;
use crate::WeaveError;
use crate::WeaveResult;
use crate::encoding::DEFAULT_DETECTION_PREFIX;
use crate::encoding::DEFAULT_ENCODING_CANDIDATES;

/// Default maximum file size in bytes (10 MB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Provenance suffix appended to every woven, non-blank line.
pub const DEFAULT_MARKER: &str = "// woven";

/// Repository document used when neither config nor flags name one.
pub const DEFAULT_REPOSITORY_FILE: &str = "stubs.yaml";

/// Source extensions discovered by default.
pub const DEFAULT_EXTENSIONS: [&str; 6] = ["c", "h", "cpp", "hpp", "cc", "cxx"];

/// Supported config file names in discovery priority order.
pub const CONFIG_FILE_CANDIDATES: [&str; 3] = ["weave.toml", ".weave.toml", ".config/weave.toml"];

/// Contents written by `weave init`.
pub const STARTER_CONFIG: &str = "# weave configuration\n\n# Fragment repository \
                                  document, relative to this directory.\nrepository = \
                                  \"stubs.yaml\"\n\n# embedded | referenced | auto\nmode = \
                                  \"auto\"\n\n# [discovery]\n# extensions = [\"c\", \"h\"]\n# \
                                  exclude = [\"build/\"]\n\n# [extract]\n# on_collision = \
                                  \"abort\"\n";

/// Configuration loaded from `weave.toml`.
///
/// ```toml
/// repository = "stubs.yaml"
/// mode = "referenced"
/// marker = "// woven"
/// jobs = 4
///
/// [discovery]
/// extensions = ["c", "h"]
/// exclude = ["build/", "third_party/"]
///
/// [encoding]
/// candidates = ["UTF-8", "GB18030", "windows-1252"]
///
/// [grammar]
/// strict = true
///
/// [extract]
/// on_collision = "keep-first"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeaveConfig {
	/// Path of the fragment repository document, relative to the root.
	pub repository: Option<PathBuf>,
	pub mode: Mode,
	/// Provenance suffix comment for woven lines.
	pub marker: String,
	/// Number of files processed concurrently. `1` processes files in order
	/// on the calling thread.
	pub jobs: usize,
	pub discovery: DiscoveryConfig,
	pub encoding: EncodingConfig,
	pub grammar: GrammarConfig,
	pub extract: ExtractConfig,
	pub output: OutputConfig,
}

impl Default for WeaveConfig {
	fn default() -> Self {
		Self {
			repository: None,
			mode: Mode::default(),
			marker: DEFAULT_MARKER.to_string(),
			jobs: 1,
			discovery: DiscoveryConfig::default(),
			encoding: EncodingConfig::default(),
			grammar: GrammarConfig::default(),
			extract: ExtractConfig::default(),
			output: OutputConfig::default(),
		}
	}
}

/// File discovery settings. Exclude patterns follow gitignore syntax and
/// are relative to the root; include patterns are globs that add files the
/// extension list would otherwise miss.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
	pub extensions: Vec<String>,
	pub include: Vec<String>,
	pub exclude: Vec<String>,
	pub max_file_size: u64,
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			extensions: DEFAULT_EXTENSIONS.iter().map(ToString::to_string).collect(),
			include: Vec::new(),
			exclude: Vec::new(),
			max_file_size: DEFAULT_MAX_FILE_SIZE,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
	/// Encoding labels (WHATWG names) tried in order after detection.
	pub candidates: Vec<String>,
	/// Number of leading bytes fed to the statistical detector.
	pub detection_prefix: usize,
	/// Accept the detector's guess when it decodes the whole file cleanly.
	pub accept_detected: bool,
}

impl Default for EncodingConfig {
	fn default() -> Self {
		Self {
			candidates: DEFAULT_ENCODING_CANDIDATES
				.iter()
				.map(ToString::to_string)
				.collect(),
			detection_prefix: DEFAULT_DETECTION_PREFIX,
			accept_detected: true,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GrammarConfig {
	/// Reject referenced anchors that carry text after the segment token.
	pub strict: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
	pub on_collision: CollisionPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
	/// Copy files without anchors into the output tree as well.
	pub mirror_untouched: bool,
	/// Write `weave-run.json` into the output tree.
	pub write_stats: bool,
}

impl Default for OutputConfig {
	fn default() -> Self {
		Self {
			mirror_untouched: false,
			write_stats: true,
		}
	}
}

impl WeaveConfig {
	/// Resolve the config path from known discovery candidates.
	#[must_use]
	pub fn resolve_path(root: &Path) -> Option<PathBuf> {
		CONFIG_FILE_CANDIDATES
			.iter()
			.map(|candidate| root.join(candidate))
			.find(|path| path.is_file())
	}

	/// Load the config from the first discovered config file at `root`.
	/// Returns `None` if the file does not exist.
	pub fn load(root: &Path) -> WeaveResult<Option<WeaveConfig>> {
		let Some(config_path) = Self::resolve_path(root) else {
			return Ok(None);
		};

		let content = std::fs::read_to_string(&config_path)?;
		let config = Self::parse(&content)?;
		tracing::debug!(path = %config_path.display(), "loaded config");

		Ok(Some(config))
	}

	/// Same as [`WeaveConfig::load`] but falls back to defaults.
	pub fn load_or_default(root: &Path) -> WeaveResult<WeaveConfig> {
		Ok(Self::load(root)?.unwrap_or_default())
	}

	pub fn parse(content: &str) -> WeaveResult<WeaveConfig> {
		let config: WeaveConfig =
			toml::from_str(content).map_err(|e| WeaveError::ConfigParse(e.to_string()))?;

		if config.marker.trim().is_empty() {
			return Err(WeaveError::ConfigParse(
				"`marker` must not be empty".to_string(),
			));
		}

		Ok(config)
	}

	/// The repository document path, joined onto `root` when relative.
	pub fn repository_path(&self, root: &Path) -> PathBuf {
		let path = self
			.repository
			.clone()
			.unwrap_or_else(|| PathBuf::from(DEFAULT_REPOSITORY_FILE));
		if path.is_absolute() {
			path
		} else {
			root.join(path)
		}
	}
}
