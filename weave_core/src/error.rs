use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum WeaveError {
	#[error(transparent)]
	#[diagnostic(code(weave::io_error))]
	Io(#[from] std::io::Error),

	#[error("no candidate encoding could decode the input (tried: {})", .tried.join(", "))]
	#[diagnostic(
		code(weave::decode_exhausted),
		help("the file is read with lossy UTF-8 substitution instead")
	)]
	DecodeExhausted { tried: Vec<String> },

	#[error("fragment repository not found: `{path}`")]
	#[diagnostic(
		code(weave::repository_not_found),
		help("run `weave init` to create a starter repository, or pass `--repository`")
	)]
	RepositoryNotFound { path: String, attempts: Vec<String> },

	#[error("fragment repository `{path}` is malformed: {reason}")]
	#[diagnostic(
		code(weave::repository_malformed),
		help("the document must map case → step → segment → literal text block")
	)]
	RepositoryMalformed { path: String, reason: String },

	#[error("permission denied: `{path}`")]
	#[diagnostic(code(weave::permission_denied))]
	PermissionDenied { path: String },

	#[error("root directory does not exist: `{path}`")]
	#[diagnostic(code(weave::root_not_found), help("pass an existing directory with `--path`"))]
	RootNotFound { path: String },

	#[error("failed to create run directory `{path}`: {reason}")]
	#[diagnostic(
		code(weave::run_directory),
		help("backup and output trees are created next to the root; check that its parent is writable")
	)]
	RunDirectory { path: String, reason: String },

	#[error("{} fragment key collision(s) refused during extraction", .0.len())]
	#[diagnostic(
		code(weave::key_collision),
		help("choose `--on-collision keep-first` or `keep-last`, or make the woven copies agree")
	)]
	KeyCollision(Vec<String>),

	#[error("failed to serialize the repository document: {0}")]
	#[diagnostic(code(weave::document_serialize))]
	DocumentSerialize(String),

	#[error("failed to parse config file: {0}")]
	#[diagnostic(
		code(weave::config_parse),
		help("check that weave.toml is valid TOML with [discovery], [encoding], [grammar], [extract] and [output] sections")
	)]
	ConfigParse(String),

	#[error("invalid pattern `{pattern}`: {reason}")]
	#[diagnostic(code(weave::invalid_pattern))]
	InvalidPattern { pattern: String, reason: String },

	#[error("symlink cycle detected at: `{path}`")]
	#[diagnostic(
		code(weave::symlink_cycle),
		help("remove the circular symlink or exclude this path")
	)]
	SymlinkCycle { path: String },

	#[error("file too large: `{path}` is {size} bytes (limit: {limit} bytes)")]
	#[diagnostic(
		code(weave::file_too_large),
		help("increase `discovery.max_file_size` in weave.toml or exclude this file")
	)]
	FileTooLarge { path: String, size: u64, limit: u64 },
}

/// Recovery class of a [`WeaveError`].
///
/// Callers decide how to degrade by matching on the kind instead of on the
/// concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
	DecodeExhausted,
	NotFound,
	Malformed,
	PermissionDenied,
	Unknown,
}

impl WeaveError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::DecodeExhausted { .. } => ErrorKind::DecodeExhausted,
			Self::RepositoryNotFound { .. } | Self::RootNotFound { .. } => ErrorKind::NotFound,
			Self::RepositoryMalformed { .. } | Self::ConfigParse(_) | Self::InvalidPattern { .. } => {
				ErrorKind::Malformed
			}
			Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
			Self::Io(error) => {
				match error.kind() {
					std::io::ErrorKind::NotFound => ErrorKind::NotFound,
					std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
					std::io::ErrorKind::InvalidData => ErrorKind::Malformed,
					_ => ErrorKind::Unknown,
				}
			}
			Self::RunDirectory { .. }
			| Self::KeyCollision(_)
			| Self::DocumentSerialize(_)
			| Self::SymlinkCycle { .. }
			| Self::FileTooLarge { .. } => ErrorKind::Unknown,
		}
	}

	/// Attach a path to a raw io error so permission failures stay
	/// distinguishable in reports.
	pub(crate) fn io_at(error: std::io::Error, path: &std::path::Path) -> Self {
		if error.kind() == std::io::ErrorKind::PermissionDenied {
			Self::PermissionDenied {
				path: path.display().to_string(),
			}
		} else {
			Self::Io(std::io::Error::new(
				error.kind(),
				format!("{}: {error}", path.display()),
			))
		}
	}
}

pub type WeaveResult<T> = Result<T, WeaveError>;
pub type AnyError = Box<dyn std::error::Error>;
pub type AnyEmptyResult = Result<(), AnyError>;
pub type AnyResult<T> = Result<T, AnyError>;
