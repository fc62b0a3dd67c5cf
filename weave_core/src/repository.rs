use std::collections::HashMap;
use std::path::MAIN_SEPARATOR;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use derive_more::Deref;
use parking_lot::RwLock;
use serde::Serialize;

use crate::EncodingResolver;
use crate::ErrorKind;
use crate::RepositoryDocument;
use crate::UnresolvedReason;
use crate::WeaveError;
use crate::WeaveResult;
use crate::grammar::canonical_id;

/// Written by `weave init` when no repository document exists yet.
pub const STARTER_REPOSITORY: &str = "# Fragment repository: case -> step -> segment -> code.\n# \
                                      A source comment `// TC001 STEP1 open` weaves the block \
                                      below\n# in right after that comment.\nTC001:\n  STEP1:\n    \
                                      # open the device\n    open: |\n      int rc = \
                                      device_open(&dev);\n      if (rc != 0) {\n        return \
                                      rc;\n      }\n    # release it again\n    close: |\n      \
                                      device_close(&dev);\n\n# Anchors that carry their own code need no \
                                      entry here:\n#   // TC002 STEP1: reset the counter\n#   \
                                      // code: counter = 0;\n";

/// The triple identifying one fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FragmentKey {
	pub case_id: String,
	pub step_id: String,
	pub segment_id: String,
}

impl FragmentKey {
	/// Build a key, canonicalising the case and step identifiers and
	/// trimming the segment.
	pub fn new(case_id: &str, step_id: &str, segment_id: &str) -> Self {
		Self {
			case_id: canonical_id(case_id),
			step_id: canonical_id(step_id),
			segment_id: segment_id.trim().to_string(),
		}
	}
}

impl std::fmt::Display for FragmentKey {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}.{}.{}", self.case_id, self.step_id, self.segment_id)
	}
}

/// Opaque fragment text. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref)]
#[deref(forward)]
pub struct Fragment(Arc<str>);

impl Fragment {
	pub fn new(text: &str) -> Self {
		Self(Arc::from(text))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for Fragment {
	fn from(text: &str) -> Self {
		Self::new(text)
	}
}

type Segments = HashMap<String, Fragment>;

/// case → step → segment → fragment.
#[derive(Debug, Clone, Default)]
pub struct FragmentRepository {
	cases: HashMap<String, HashMap<String, Segments>>,
	len: usize,
}

impl FragmentRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_document(document: &RepositoryDocument) -> Self {
		let mut repository = Self::new();
		for (key, text) in document.entries() {
			repository.insert(key, Fragment::new(text));
		}
		repository
	}

	pub fn from_yaml(text: &str, origin: &str) -> WeaveResult<Self> {
		RepositoryDocument::from_yaml(text, origin).map(|document| Self::from_document(&document))
	}

	/// Resolve `path` through [`resolve_document_path`] and load it.
	/// Returns the repository together with the path that was read.
	pub fn open(path: &Path) -> WeaveResult<(Self, PathBuf)> {
		let resolved = resolve_document_path(path)?;
		let bytes = std::fs::read(&resolved).map_err(|e| WeaveError::io_at(e, &resolved))?;
		let decoded = EncodingResolver::default().resolve(&bytes);
		let origin = resolved.display().to_string();
		let repository = Self::from_yaml(&decoded.text, &origin)?;

		tracing::info!(
			path = %origin,
			fragments = repository.len(),
			encoding = decoded.encoding_name(),
			"loaded fragment repository"
		);

		Ok((repository, resolved))
	}

	/// Insert a fragment, returning the one it replaced.
	pub fn insert(&mut self, key: FragmentKey, fragment: Fragment) -> Option<Fragment> {
		let previous = self
			.cases
			.entry(key.case_id)
			.or_default()
			.entry(key.step_id)
			.or_default()
			.insert(key.segment_id, fragment);
		if previous.is_none() {
			self.len += 1;
		}
		previous
	}

	/// Point lookup. Case and step are matched case-insensitively, the
	/// segment exactly (after trimming). Absent at any level yields `None`.
	pub fn get(&self, case_id: &str, step_id: &str, segment_id: &str) -> Option<Fragment> {
		self.cases
			.get(&canonical_id(case_id))?
			.get(&canonical_id(step_id))?
			.get(segment_id.trim())
			.cloned()
	}

	pub fn get_key(&self, key: &FragmentKey) -> Option<Fragment> {
		self.cases
			.get(&key.case_id)?
			.get(&key.step_id)?
			.get(&key.segment_id)
			.cloned()
	}

	/// The first level of `key` that is absent, or `None` when the key
	/// resolves.
	pub fn missing_level(&self, key: &FragmentKey) -> Option<UnresolvedReason> {
		let Some(steps) = self.cases.get(&key.case_id) else {
			return Some(UnresolvedReason::MissingCase);
		};
		let Some(segments) = steps.get(&key.step_id) else {
			return Some(UnresolvedReason::MissingStep);
		};
		(!segments.contains_key(&key.segment_id)).then_some(UnresolvedReason::MissingSegment)
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Every entry, sorted by key.
	pub fn entries(&self) -> Vec<(FragmentKey, Fragment)> {
		let mut entries: Vec<_> = self
			.cases
			.iter()
			.flat_map(|(case_id, steps)| {
				steps.iter().flat_map(move |(step_id, segments)| {
					segments.iter().map(move |(segment_id, fragment)| {
						(
							FragmentKey {
								case_id: case_id.clone(),
								step_id: step_id.clone(),
								segment_id: segment_id.clone(),
							},
							fragment.clone(),
						)
					})
				})
			})
			.collect();
		entries.sort_by(|a, b| a.0.cmp(&b.0));
		entries
	}

	pub fn to_document(&self) -> RepositoryDocument {
		let mut document = RepositoryDocument::new();
		for (key, fragment) in self.entries() {
			document.insert(&key, fragment.as_str());
		}
		document
	}

	pub fn summary(&self) -> RepositorySummary {
		let mut cases: Vec<CaseSummary> = self
			.cases
			.iter()
			.map(|(case_id, steps)| {
				let segments: Vec<&Fragment> = steps.values().flat_map(HashMap::values).collect();
				CaseSummary {
					case_id: case_id.clone(),
					steps: steps.len(),
					segments: segments.len(),
					lines: segments.iter().map(|fragment| fragment.lines().count()).sum(),
				}
			})
			.collect();
		cases.sort_by(|a, b| a.case_id.cmp(&b.case_id));

		RepositorySummary {
			total_cases: cases.len(),
			total_steps: cases.iter().map(|case| case.steps).sum(),
			total_segments: cases.iter().map(|case| case.segments).sum(),
			total_lines: cases.iter().map(|case| case.lines).sum(),
			cases,
		}
	}
}

/// Inventory of a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepositorySummary {
	pub total_cases: usize,
	pub total_steps: usize,
	pub total_segments: usize,
	pub total_lines: usize,
	pub cases: Vec<CaseSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaseSummary {
	pub case_id: String,
	pub steps: usize,
	pub segments: usize,
	pub lines: usize,
}

/// The finite list of spellings tried for a repository document path, in
/// order, without duplicates.
pub fn document_path_variants(path: &Path) -> Vec<PathBuf> {
	let mut variants: Vec<PathBuf> = Vec::new();
	let mut push = |candidate: PathBuf| {
		if !candidate.as_os_str().is_empty() && !variants.contains(&candidate) {
			variants.push(candidate);
		}
	};

	push(path.to_path_buf());

	let text = path.to_string_lossy();
	let separated: String = text
		.chars()
		.map(|c| if c == '/' || c == '\\' { MAIN_SEPARATOR } else { c })
		.collect();
	push(PathBuf::from(&separated));

	let trimmed = separated
		.trim()
		.trim_matches(|c| c == '"' || c == '\'')
		.trim()
		.to_string();
	let trimmed = PathBuf::from(trimmed);
	push(trimmed.clone());

	if let Some(name) = trimmed.file_name().and_then(|name| name.to_str()) {
		if name.contains(' ') {
			push(trimmed.with_file_name(name.replace(' ', "-")));
		}
	}

	let swapped = match trimmed.extension().and_then(|ext| ext.to_str()) {
		Some("yaml") => Some("yml"),
		Some("yml") => Some("yaml"),
		_ => None,
	};
	if let Some(extension) = swapped {
		push(trimmed.with_extension(extension));
	}

	variants
}

/// Find the first existing spelling of `path`, logging each attempt.
pub fn resolve_document_path(path: &Path) -> WeaveResult<PathBuf> {
	let variants = document_path_variants(path);

	for candidate in &variants {
		if candidate.is_file() {
			tracing::debug!(path = %candidate.display(), "repository document found");
			return Ok(candidate.clone());
		}
		tracing::debug!(path = %candidate.display(), "repository document not at this path");
	}

	Err(WeaveError::RepositoryNotFound {
		path: path.display().to_string(),
		attempts: variants
			.iter()
			.map(|candidate| candidate.display().to_string())
			.collect(),
	})
}

/// A repository loaded with graceful degradation.
#[derive(Debug)]
pub struct LoadedRepository {
	pub repository: FragmentRepository,
	/// The document that was read, when one was.
	pub path: Option<PathBuf>,
	/// Why the repository is empty, when loading degraded.
	pub warning: Option<WeaveError>,
}

/// Load the repository at `path`, degrading to an empty one when the
/// document is missing, malformed, undecodable or unreadable.
pub fn load_or_empty(path: &Path) -> LoadedRepository {
	match FragmentRepository::open(path) {
		Ok((repository, resolved)) => {
			LoadedRepository {
				repository,
				path: Some(resolved),
				warning: None,
			}
		}
		Err(error) => {
			match error.kind() {
				ErrorKind::NotFound => {
					tracing::warn!(
						%error,
						"no fragment repository; referenced anchors will stay unresolved (run `weave init` to create one)"
					);
				}
				ErrorKind::Malformed => {
					tracing::warn!(%error, "ignoring malformed fragment repository");
				}
				ErrorKind::DecodeExhausted => {
					tracing::warn!(%error, "fragment repository could not be decoded");
				}
				ErrorKind::PermissionDenied => {
					tracing::warn!(%error, "fragment repository is not readable");
				}
				ErrorKind::Unknown => {
					tracing::warn!(%error, "failed to load fragment repository");
				}
			}
			LoadedRepository {
				repository: FragmentRepository::new(),
				path: None,
				warning: Some(error),
			}
		}
	}
}

/// A shared handle to the current repository snapshot.
///
/// Readers take an `Arc` snapshot and keep using it for as long as they
/// need; reloading builds a new repository and swaps the handle, so nobody
/// observes a partially loaded state.
#[derive(Debug, Clone, Default)]
pub struct RepositoryHandle {
	current: Arc<RwLock<Arc<FragmentRepository>>>,
}

impl RepositoryHandle {
	pub fn new(repository: FragmentRepository) -> Self {
		Self {
			current: Arc::new(RwLock::new(Arc::new(repository))),
		}
	}

	pub fn snapshot(&self) -> Arc<FragmentRepository> {
		Arc::clone(&self.current.read())
	}

	/// Swap in `repository`, returning the previous snapshot.
	pub fn replace(&self, repository: FragmentRepository) -> Arc<FragmentRepository> {
		let fresh = Arc::new(repository);
		std::mem::replace(&mut *self.current.write(), fresh)
	}

	/// Load `path` and swap it in. On failure the current snapshot stays.
	pub fn reload(&self, path: &Path) -> WeaveResult<Arc<FragmentRepository>> {
		let (repository, resolved) = FragmentRepository::open(path)?;
		tracing::info!(path = %resolved.display(), "fragment repository reloaded");
		self.replace(repository);
		Ok(self.snapshot())
	}
}
