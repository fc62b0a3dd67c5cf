use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::AnchorGrammar;
use crate::AnchorKind;
use crate::DiscoveryConfig;
use crate::EncodingConfig;
use crate::EncodingResolver;
use crate::FileError;
use crate::FragmentKey;
use crate::Mode;
use crate::RepositoryDocument;
use crate::WeaveConfig;
use crate::WeaveError;
use crate::WeaveResult;
use crate::discovery::FileFilter;
use crate::discovery::discover_files;
use crate::grammar::content_of;
use crate::inject::split_lines;
use crate::pipeline::write_atomic;

/// What to do when one key was woven with different text in different
/// places.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionPolicy {
	/// Leave the key out and report every location.
	#[default]
	Abort,
	KeepFirst,
	KeepLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollisionResolution {
	Refused,
	KeptFirst,
	KeptLast,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct FragmentLocation {
	pub file: PathBuf,
	/// 1-based line of the anchor.
	pub line: usize,
}

impl std::fmt::Display for FragmentLocation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.file.display(), self.line)
	}
}

/// One woven block recovered from a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFragment {
	pub key: FragmentKey,
	pub text: String,
	pub location: FragmentLocation,
}

/// A key found with differing text at several locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCollision {
	pub key: FragmentKey,
	pub locations: Vec<FragmentLocation>,
	pub resolution: CollisionResolution,
}

impl KeyCollision {
	pub fn describe(&self) -> String {
		let locations: Vec<String> = self.locations.iter().map(ToString::to_string).collect();
		format!("{} ({})", self.key, locations.join(", "))
	}
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
	pub marker: String,
	pub strict: bool,
	pub policy: CollisionPolicy,
	pub discovery: DiscoveryConfig,
	pub encoding: EncodingConfig,
}

impl Default for ExtractOptions {
	fn default() -> Self {
		Self::from_config(&WeaveConfig::default())
	}
}

impl ExtractOptions {
	pub fn from_config(config: &WeaveConfig) -> Self {
		Self {
			marker: config.marker.clone(),
			strict: config.grammar.strict,
			policy: config.extract.on_collision,
			discovery: config.discovery.clone(),
			encoding: config.encoding.clone(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
	pub document: RepositoryDocument,
	pub collisions: Vec<KeyCollision>,
	/// Woven blocks found, including duplicates.
	pub fragments: usize,
	pub files_scanned: usize,
	pub file_errors: Vec<FileError>,
}

impl ExtractReport {
	/// Collisions the policy declined to resolve.
	pub fn refused(&self) -> impl Iterator<Item = &KeyCollision> {
		self.collisions
			.iter()
			.filter(|collision| collision.resolution == CollisionResolution::Refused)
	}

	/// Fails with [`WeaveError::KeyCollision`] while any collision remains
	/// refused.
	pub fn check(&self) -> WeaveResult<()> {
		let refused: Vec<String> = self.refused().map(KeyCollision::describe).collect();
		if refused.is_empty() {
			Ok(())
		} else {
			Err(WeaveError::KeyCollision(refused))
		}
	}

	/// Serialize the document, failing while any collision is refused.
	pub fn to_yaml(&self) -> WeaveResult<String> {
		self.check()?;
		self.document.to_yaml()
	}

	/// Write the document with refused keys left out. The file is written
	/// either way; refused collisions are reported afterwards through
	/// [`Self::check`].
	pub fn write(&self, path: &Path) -> WeaveResult<()> {
		write_atomic(path, self.document.to_yaml()?.as_bytes())?;
		self.check()
	}
}

/// Recovers woven blocks from source lines.
#[derive(Debug, Clone)]
pub struct Extractor {
	grammar: AnchorGrammar,
	marker: String,
}

impl Extractor {
	pub fn new(marker: impl Into<String>, strict: bool) -> Self {
		let marker = marker.into();
		Self {
			grammar: AnchorGrammar::new(strict).with_marker(marker.clone()),
			marker,
		}
	}

	/// Every referenced anchor immediately followed by marked lines yields
	/// one fragment. Blank lines inside a run belong to it; blank lines after
	/// the last marked line do not.
	pub fn scan<S: AsRef<str>>(&self, file: &Path, lines: &[S]) -> Vec<ExtractedFragment> {
		let mut fragments = Vec::new();

		for anchor in self.grammar.scan_lines(lines, Mode::Referenced) {
			let AnchorKind::Referenced { segment_id } = &anchor.kind else {
				continue;
			};

			let mut run: Vec<&str> = Vec::new();
			let mut blanks: Vec<&str> = Vec::new();
			let mut marked_lines = 0;

			for line in &lines[anchor.end_line.min(lines.len())..] {
				let line = content_of(line.as_ref());
				if let Some(code) = self.unmark(line) {
					run.append(&mut blanks);
					run.push(code.strip_prefix(anchor.leading_indent.as_str()).unwrap_or(code));
					marked_lines += 1;
				} else if line.trim().is_empty() {
					blanks.push(line);
				} else {
					break;
				}
			}

			if marked_lines == 0 {
				continue;
			}

			let mut text = run.join("\n");
			text.push('\n');
			fragments.push(ExtractedFragment {
				key: FragmentKey::new(&anchor.case_id, &anchor.step_id, segment_id),
				text,
				location: FragmentLocation {
					file: file.to_path_buf(),
					line: anchor.source_line,
				},
			});
		}

		fragments
	}

	/// The code part of a marked line, without the marker and the two
	/// separating spaces.
	fn unmark<'l>(&self, line: &'l str) -> Option<&'l str> {
		let code = line.trim_end().strip_suffix(self.marker.as_str())?;
		Some(code.strip_suffix("  ").unwrap_or_else(|| code.trim_end()))
	}
}

/// Group fragments by key and apply `policy` where texts differ.
/// Fragments must be supplied in discovery order.
pub fn collect_fragments(
	fragments: Vec<ExtractedFragment>,
	policy: CollisionPolicy,
) -> (RepositoryDocument, Vec<KeyCollision>) {
	let mut grouped: BTreeMap<FragmentKey, Vec<(String, FragmentLocation)>> = BTreeMap::new();
	for fragment in fragments {
		grouped
			.entry(fragment.key)
			.or_default()
			.push((fragment.text, fragment.location));
	}

	let mut document = RepositoryDocument::new();
	let mut collisions = Vec::new();

	for (key, mut occurrences) in grouped {
		let agree = occurrences.windows(2).all(|pair| pair[0].0 == pair[1].0);
		if agree {
			let (text, _) = occurrences.swap_remove(0);
			document.insert(&key, text);
			continue;
		}

		let locations = occurrences
			.iter()
			.map(|(_, location)| location.clone())
			.collect();
		let resolution = match policy {
			CollisionPolicy::Abort => CollisionResolution::Refused,
			CollisionPolicy::KeepFirst => {
				let (text, _) = occurrences.swap_remove(0);
				document.insert(&key, text);
				CollisionResolution::KeptFirst
			}
			CollisionPolicy::KeepLast => {
				if let Some((text, _)) = occurrences.pop() {
					document.insert(&key, text);
				}
				CollisionResolution::KeptLast
			}
		};

		tracing::warn!(%key, ?resolution, "fragment key woven with different text");
		collisions.push(KeyCollision {
			key,
			locations,
			resolution,
		});
	}

	(document, collisions)
}

/// Rebuild a repository document from the woven files under `root`.
pub fn extract(root: &Path, options: &ExtractOptions) -> WeaveResult<ExtractReport> {
	let root = root.canonicalize().map_err(|_| {
		WeaveError::RootNotFound {
			path: root.display().to_string(),
		}
	})?;
	let filter = FileFilter::new(&root, &options.discovery)?;
	let discovery = discover_files(&root, &filter);

	let mut report = extract_files(&root, &discovery.files, options)?;
	for (path, error) in &discovery.skipped {
		report
			.file_errors
			.push(FileError::new(path.strip_prefix(&root).unwrap_or(path), error));
	}
	Ok(report)
}

/// Rebuild a repository document from specific files. Locations are
/// reported relative to `root`.
pub fn extract_files(root: &Path, files: &[PathBuf], options: &ExtractOptions) -> WeaveResult<ExtractReport> {
	let resolver = EncodingResolver::from_config(&options.encoding)?;
	let extractor = Extractor::new(options.marker.clone(), options.strict);
	let mut found = Vec::new();
	let mut report = ExtractReport::default();

	for path in files {
		let relative = path.strip_prefix(root).unwrap_or(path);
		let bytes = match std::fs::read(path) {
			Ok(bytes) => bytes,
			Err(error) => {
				let error = WeaveError::io_at(error, path);
				tracing::warn!(file = %relative.display(), %error, "file skipped");
				report.file_errors.push(FileError::new(relative, &error));
				continue;
			}
		};

		let decoded = resolver.resolve(&bytes);
		let lines = split_lines(&decoded.text);
		found.extend(extractor.scan(relative, &lines));
		report.files_scanned += 1;
	}

	report.fragments = found.len();
	let (document, collisions) = collect_fragments(found, options.policy);
	report.document = document;
	report.collisions = collisions;

	tracing::info!(
		files = report.files_scanned,
		fragments = report.fragments,
		keys = report.document.len(),
		collisions = report.collisions.len(),
		"extraction finished"
	);

	Ok(report)
}
