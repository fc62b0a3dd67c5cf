use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::LazyLock;

use globset::Glob;
use globset::GlobSet;
use globset::GlobSetBuilder;
use ignore::gitignore::Gitignore;
use ignore::gitignore::GitignoreBuilder;
use regex::Regex;

use crate::DiscoveryConfig;
use crate::WeaveError;
use crate::WeaveResult;

/// Directories created by earlier runs: `<root>_backup_<ts>` and
/// `<root>_woven_<ts>`, optionally with a `-N` suffix.
static RUN_DIRECTORY: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^.+_(backup|woven)_[0-9]{8}_[0-9]{6}(-[0-9]+)?$")
		.expect("run directory pattern is valid")
});

/// Marker embedded in the names of in-flight atomic writes.
pub(crate) const TEMP_FILE_MARKER: &str = ".weave-tmp-";

/// The result of walking a root directory.
#[derive(Debug, Default)]
pub struct Discovery {
	/// Eligible files, sorted.
	pub files: Vec<PathBuf>,
	/// Directories or entries that could not be read, with the reason.
	pub skipped: Vec<(PathBuf, WeaveError)>,
}

/// Compiled discovery rules.
#[derive(Debug)]
pub struct FileFilter {
	extensions: Vec<String>,
	include: GlobSet,
	exclude: Gitignore,
}

impl FileFilter {
	pub fn new(root: &Path, config: &DiscoveryConfig) -> WeaveResult<Self> {
		Ok(Self {
			extensions: config
				.extensions
				.iter()
				.map(|extension| extension.trim_start_matches('.').to_ascii_lowercase())
				.collect(),
			include: build_include_set(&config.include)?,
			exclude: build_exclude_matcher(root, &config.exclude)?,
		})
	}

	fn accepts(&self, root: &Path, path: &Path) -> bool {
		let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
			return false;
		};
		if is_temporary_artifact(name) {
			return false;
		}

		let by_extension = path
			.extension()
			.and_then(|extension| extension.to_str())
			.is_some_and(|extension| {
				self.extensions
					.iter()
					.any(|candidate| candidate.eq_ignore_ascii_case(extension))
			});

		by_extension
			|| path
				.strip_prefix(root)
				.is_ok_and(|relative| self.include.is_match(relative))
	}
}

fn build_include_set(patterns: &[String]) -> WeaveResult<GlobSet> {
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		let glob = Glob::new(pattern).map_err(|e| {
			WeaveError::InvalidPattern {
				pattern: pattern.clone(),
				reason: e.to_string(),
			}
		})?;
		builder.add(glob);
	}
	builder.build().map_err(|e| {
		WeaveError::InvalidPattern {
			pattern: patterns.join(", "),
			reason: e.to_string(),
		}
	})
}

fn build_exclude_matcher(root: &Path, patterns: &[String]) -> WeaveResult<Gitignore> {
	let mut builder = GitignoreBuilder::new(root);
	for pattern in patterns {
		builder.add_line(None, pattern).map_err(|e| {
			WeaveError::InvalidPattern {
				pattern: pattern.clone(),
				reason: e.to_string(),
			}
		})?;
	}
	builder.build().map_err(|e| {
		WeaveError::ConfigParse(format!("failed to build exclude rules: {e}"))
	})
}

/// Hidden directories, build output, and trees written by earlier runs.
pub fn is_ignored_directory_name(name: &str) -> bool {
	name.starts_with('.') || name == "node_modules" || name == "target" || is_run_directory(name)
}

pub fn is_run_directory(name: &str) -> bool {
	RUN_DIRECTORY.is_match(name)
}

/// Editor swap files, backups, and in-flight temporary writes.
pub fn is_temporary_artifact(name: &str) -> bool {
	name.ends_with('~')
		|| name.starts_with(".#")
		|| name.contains(TEMP_FILE_MARKER)
		|| [".swp", ".swo", ".tmp", ".bak", ".orig"]
			.iter()
			.any(|suffix| name.ends_with(suffix))
}

/// Collect every eligible file below `root`, sorted for deterministic
/// ordering. Unreadable directories and symlink cycles are skipped and
/// reported rather than aborting the walk. A directory reached a second
/// time through a symlink that forms no cycle is walked only once.
pub fn discover_files(root: &Path, filter: &FileFilter) -> Discovery {
	let mut discovery = Discovery::default();
	let mut walk = Walk::default();

	walk_dir(root, root, filter, &mut discovery, &mut walk);
	discovery.files.sort();
	discovery
}

/// Canonical directories seen so far and the chain leading to the current
/// one.
#[derive(Default)]
struct Walk {
	visited: HashSet<PathBuf>,
	ancestors: Vec<PathBuf>,
}

fn walk_dir(root: &Path, dir: &Path, filter: &FileFilter, discovery: &mut Discovery, walk: &mut Walk) {
	let canonical = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
	if walk.ancestors.contains(&canonical) {
		tracing::warn!(path = %dir.display(), "symlink cycle, skipping directory");
		discovery.skipped.push((
			dir.to_path_buf(),
			WeaveError::SymlinkCycle {
				path: dir.display().to_string(),
			},
		));
		return;
	}
	if !walk.visited.insert(canonical.clone()) {
		tracing::debug!(path = %dir.display(), "directory already walked through another path");
		return;
	}

	walk.ancestors.push(canonical);
	read_entries(root, dir, filter, discovery, walk);
	walk.ancestors.pop();
}

fn read_entries(root: &Path, dir: &Path, filter: &FileFilter, discovery: &mut Discovery, walk: &mut Walk) {
	let entries = match std::fs::read_dir(dir) {
		Ok(entries) => entries,
		Err(error) => {
			tracing::warn!(path = %dir.display(), %error, "cannot read directory");
			discovery
				.skipped
				.push((dir.to_path_buf(), WeaveError::io_at(error, dir)));
			return;
		}
	};

	for entry in entries {
		let path = match entry {
			Ok(entry) => entry.path(),
			Err(error) => {
				discovery
					.skipped
					.push((dir.to_path_buf(), WeaveError::io_at(error, dir)));
				continue;
			}
		};

		let is_dir = path.is_dir();

		if is_dir {
			if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
				if is_ignored_directory_name(name) {
					continue;
				}
			}
		}

		if filter.exclude.matched(&path, is_dir).is_ignore() {
			continue;
		}

		if is_dir {
			walk_dir(root, &path, filter, discovery, walk);
		} else if path.is_file() && filter.accepts(root, &path) {
			discovery.files.push(path);
		}
	}
}
