//! The batch pipeline: discover files under a root, weave each one, and
//! write backup and output trees next to the root.
//!
//! A run moves through `Idle → Discovering → ProcessingFiles → Finalizing
//! → Done`. Per-file failures are captured in the statistics and never
//! abort the run; only a missing root or an unwritable parent directory is
//! fatal.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::AnchorGrammar;
use crate::DiscoveryConfig;
use crate::EncodingConfig;
use crate::EncodingResolver;
use crate::ErrorKind;
use crate::FragmentKey;
use crate::FragmentRepository;
use crate::Injector;
use crate::Mode;
use crate::Resolution;
use crate::UnresolvedAnchor;
use crate::UnresolvedReason;
use crate::WeaveConfig;
use crate::WeaveError;
use crate::WeaveResult;
use crate::discovery::FileFilter;
use crate::discovery::TEMP_FILE_MARKER;
use crate::discovery::discover_files;
use crate::encoding::encode;
use crate::inject::join_lines;
use crate::inject::split_lines;
use crate::repository::load_or_empty;

/// File name of the statistics artifact written into the output tree.
pub const RUN_STATS_FILE: &str = "weave-run.json";

/// `strftime` layout of the run timestamp in directory names.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
	#[default]
	Idle,
	Discovering,
	ProcessingFiles,
	Finalizing,
	Done,
}

impl std::fmt::Display for RunState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Self::Idle => "idle",
			Self::Discovering => "discovering",
			Self::ProcessingFiles => "processing files",
			Self::Finalizing => "finalizing",
			Self::Done => "done",
		};
		f.write_str(name)
	}
}

/// One progress update, sent after each file.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
	pub percent: u8,
	pub label: &'a str,
	pub current: usize,
	pub total: usize,
}

/// Receives progress updates synchronously on the thread driving the run.
/// Implementations that feed a UI do their own marshaling.
pub trait ProgressSink {
	fn report(&self, progress: Progress<'_>);
}

impl<F> ProgressSink for F
where
	F: Fn(Progress<'_>),
{
	fn report(&self, progress: Progress<'_>) {
		self(progress);
	}
}

/// Cooperative cancellation, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
	pub mode: Mode,
	pub marker: String,
	pub strict: bool,
	pub jobs: usize,
	pub discovery: DiscoveryConfig,
	pub encoding: EncodingConfig,
	pub mirror_untouched: bool,
	pub write_stats: bool,
	/// Compute everything in memory; create no directories, write nothing.
	pub dry_run: bool,
}

impl Default for RunOptions {
	fn default() -> Self {
		Self::from_config(&WeaveConfig::default())
	}
}

impl RunOptions {
	pub fn from_config(config: &WeaveConfig) -> Self {
		Self {
			mode: config.mode,
			marker: config.marker.clone(),
			strict: config.grammar.strict,
			jobs: config.jobs.max(1),
			discovery: config.discovery.clone(),
			encoding: config.encoding.clone(),
			mirror_untouched: config.output.mirror_untouched,
			write_stats: config.output.write_stats,
			dry_run: false,
		}
	}
}

/// The timestamped backup and output trees of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDirectories {
	pub backup: PathBuf,
	pub output: PathBuf,
}

impl RunDirectories {
	/// Create `<root>_backup_<ts>` and `<root>_woven_<ts>` next to `root`.
	/// An existing name gets a `-2`, `-3`, … suffix so no directory is ever
	/// reused.
	pub fn create(root: &Path, timestamp: &str) -> WeaveResult<Self> {
		let (Some(parent), Some(name)) = (root.parent(), root.file_name()) else {
			return Err(WeaveError::RunDirectory {
				path: root.display().to_string(),
				reason: "the root has no parent directory".to_string(),
			});
		};
		let name = name.to_string_lossy();

		Ok(Self {
			backup: create_unique_dir(parent, &format!("{name}_backup_{timestamp}"))?,
			output: create_unique_dir(parent, &format!("{name}_woven_{timestamp}"))?,
		})
	}
}

fn create_unique_dir(parent: &Path, base: &str) -> WeaveResult<PathBuf> {
	let mut attempt = 1;
	loop {
		let candidate = if attempt == 1 {
			parent.join(base)
		} else {
			parent.join(format!("{base}-{attempt}"))
		};

		match fs::create_dir(&candidate) {
			Ok(()) => return Ok(candidate),
			Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists && attempt < 1000 => {
				attempt += 1;
			}
			Err(error) => {
				return Err(WeaveError::RunDirectory {
					path: candidate.display().to_string(),
					reason: error.to_string(),
				});
			}
		}
	}
}

/// A failure confined to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
	pub file: PathBuf,
	pub kind: ErrorKind,
	pub message: String,
}

impl FileError {
	pub(crate) fn new(file: &Path, error: &WeaveError) -> Self {
		Self {
			file: file.to_path_buf(),
			kind: error.kind(),
			message: error.to_string(),
		}
	}
}

/// Per-case counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CaseStats {
	pub anchors: usize,
	pub injected: usize,
	pub unresolved: usize,
}

/// The aggregate result of a run. This is the run's sole externally
/// consumed result and is written as `weave-run.json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
	pub root: PathBuf,
	pub repository: Option<PathBuf>,
	/// Why the repository is empty, when loading degraded.
	pub repository_warning: Option<String>,
	pub mode: Mode,
	pub dry_run: bool,
	pub directories: Option<RunDirectories>,
	pub total_files: usize,
	pub files_with_anchors: usize,
	pub files_touched: usize,
	pub files_untouched: usize,
	pub anchors_found: usize,
	pub fragments_injected: usize,
	pub lines_injected: usize,
	pub already_woven: usize,
	pub unresolved: Vec<UnresolvedAnchor>,
	pub file_errors: Vec<FileError>,
	pub encodings: BTreeMap<String, usize>,
	pub lossy_files: usize,
	pub cases: BTreeMap<String, CaseStats>,
	pub cancelled: bool,
	pub started_at: String,
	pub finished_at: String,
}

impl RunStats {
	pub fn unresolved_count(&self) -> usize {
		self.unresolved.len()
	}
}

/// Before and after text of one file, kept for dry runs.
#[derive(Debug, Clone)]
pub struct FilePreview {
	pub file: PathBuf,
	pub before: String,
	pub after: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
	pub stats: RunStats,
	/// Files whose content would change. Only filled for dry runs.
	pub previews: Vec<FilePreview>,
}

/// What processing one file produced.
#[derive(Debug)]
struct FileReport {
	encoding: &'static str,
	lossy: bool,
	anchors: usize,
	written: bool,
	fragments: usize,
	lines: usize,
	already_woven: usize,
	unresolved: Vec<UnresolvedAnchor>,
	cases: BTreeMap<String, CaseStats>,
	preview: Option<FilePreview>,
}

type FileOutcome = Result<FileReport, FileError>;

/// Shared, read-only state for processing files.
struct FileContext<'a> {
	root: &'a Path,
	repository: &'a FragmentRepository,
	grammar: AnchorGrammar,
	injector: Injector,
	resolver: EncodingResolver,
	options: &'a RunOptions,
	directories: Option<&'a RunDirectories>,
}

pub struct Pipeline<'a> {
	root: PathBuf,
	repository: Arc<FragmentRepository>,
	repository_path: Option<PathBuf>,
	repository_warning: Option<String>,
	options: RunOptions,
	progress: Option<&'a dyn ProgressSink>,
	cancellation: CancellationToken,
	state: RunState,
}

impl<'a> Pipeline<'a> {
	/// A pipeline over `root` using one repository snapshot for the whole
	/// run.
	pub fn new(root: impl Into<PathBuf>, repository: Arc<FragmentRepository>, options: RunOptions) -> Self {
		Self {
			root: root.into(),
			repository,
			repository_path: None,
			repository_warning: None,
			options,
			progress: None,
			cancellation: CancellationToken::new(),
			state: RunState::Idle,
		}
	}

	/// Record where the repository came from, for the statistics.
	#[must_use]
	pub fn with_repository_source(mut self, path: Option<PathBuf>, warning: Option<String>) -> Self {
		self.repository_path = path;
		self.repository_warning = warning;
		self
	}

	#[must_use]
	pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
		self.progress = Some(sink);
		self
	}

	#[must_use]
	pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
		self.cancellation = token;
		self
	}

	pub fn state(&self) -> RunState {
		self.state
	}

	fn transition(&mut self, next: RunState) {
		tracing::info!(from = %self.state, to = %next, "pipeline state");
		self.state = next;
	}

	pub fn run(&mut self) -> WeaveResult<RunOutcome> {
		let started = chrono::Local::now();
		let root = self.root.canonicalize().map_err(|_| {
			WeaveError::RootNotFound {
				path: self.root.display().to_string(),
			}
		})?;
		if !root.is_dir() {
			return Err(WeaveError::RootNotFound {
				path: self.root.display().to_string(),
			});
		}

		self.transition(RunState::Discovering);
		let filter = FileFilter::new(&root, &self.options.discovery)?;
		let discovery = discover_files(&root, &filter);
		tracing::info!(files = discovery.files.len(), root = %root.display(), "discovered files");

		let directories = if self.options.dry_run {
			None
		} else {
			let timestamp = started.format(RUN_TIMESTAMP_FORMAT).to_string();
			Some(RunDirectories::create(&root, &timestamp)?)
		};

		self.transition(RunState::ProcessingFiles);
		let (outcomes, cancelled) = {
			let context = FileContext {
				root: &root,
				repository: &self.repository,
				grammar: AnchorGrammar::new(self.options.strict)
					.with_marker(self.options.marker.clone()),
				injector: Injector::new(self.options.marker.clone()),
				resolver: EncodingResolver::from_config(&self.options.encoding)?,
				options: &self.options,
				directories: directories.as_ref(),
			};
			process_all(
				&context,
				&discovery.files,
				self.options.jobs,
				&self.cancellation,
				self.progress,
			)
		};

		self.transition(RunState::Finalizing);
		let mut stats = RunStats {
			root: root.clone(),
			repository: self.repository_path.clone(),
			repository_warning: self.repository_warning.clone(),
			mode: self.options.mode,
			dry_run: self.options.dry_run,
			directories: directories.clone(),
			total_files: discovery.files.len(),
			cancelled,
			started_at: started.to_rfc3339(),
			..RunStats::default()
		};
		let mut previews = Vec::new();

		for (path, error) in &discovery.skipped {
			stats.file_errors.push(FileError::new(&relative_to(path, &root), error));
		}

		for outcome in outcomes {
			match outcome {
				Ok(report) => aggregate(&mut stats, &mut previews, report),
				Err(error) => stats.file_errors.push(error),
			}
		}

		stats
			.unresolved
			.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
		stats.file_errors.sort_by(|a, b| a.file.cmp(&b.file));
		stats.finished_at = chrono::Local::now().to_rfc3339();

		if let Some(directories) = &directories {
			if self.options.write_stats {
				let payload = serde_json::to_string_pretty(&stats)
					.map_err(|e| WeaveError::Io(std::io::Error::other(e)))?;
				write_atomic(&directories.output.join(RUN_STATS_FILE), payload.as_bytes())?;
			}
		}

		tracing::info!(
			files = stats.total_files,
			touched = stats.files_touched,
			injected = stats.fragments_injected,
			unresolved = stats.unresolved.len(),
			errors = stats.file_errors.len(),
			cancelled = stats.cancelled,
			"run finished"
		);
		self.transition(RunState::Done);

		Ok(RunOutcome { stats, previews })
	}
}

/// Load config and repository for `root` and run the pipeline once.
///
/// `repository` overrides the configured document; `mode` overrides the
/// configured mode.
pub fn weave_tree(root: &Path, repository: Option<&Path>, mode: Option<Mode>) -> WeaveResult<RunStats> {
	let config = WeaveConfig::load_or_default(root)?;
	let mut options = RunOptions::from_config(&config);
	if let Some(mode) = mode {
		options.mode = mode;
	}

	let document = repository.map_or_else(|| config.repository_path(root), Path::to_path_buf);
	let (snapshot, path, warning) = if options.mode.referenced() {
		let loaded = load_or_empty(&document);
		(
			loaded.repository,
			loaded.path,
			loaded.warning.map(|warning| warning.to_string()),
		)
	} else {
		(FragmentRepository::new(), None, None)
	};

	let mut pipeline = Pipeline::new(root, Arc::new(snapshot), options)
		.with_repository_source(path, warning);
	Ok(pipeline.run()?.stats)
}

/// One anchor found by [`survey`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorStatus {
	pub file: PathBuf,
	pub line: usize,
	pub anchor: String,
	pub key: Option<FragmentKey>,
	pub embedded: bool,
	/// Woven lines already follow the anchor.
	pub woven: bool,
	pub unresolved: Option<UnresolvedReason>,
}

/// Every anchor below `root` and how it resolves against `repository`.
/// Nothing is written. Unreadable files are logged and skipped.
pub fn survey(
	root: &Path,
	repository: &FragmentRepository,
	options: &RunOptions,
) -> WeaveResult<Vec<AnchorStatus>> {
	let root = root.canonicalize().map_err(|_| {
		WeaveError::RootNotFound {
			path: root.display().to_string(),
		}
	})?;
	let filter = FileFilter::new(&root, &options.discovery)?;
	let resolver = EncodingResolver::from_config(&options.encoding)?;
	let grammar = AnchorGrammar::new(options.strict).with_marker(options.marker.clone());
	let injector = Injector::new(options.marker.clone());
	let mut found = Vec::new();

	for path in discover_files(&root, &filter).files {
		let relative = relative_to(&path, &root);
		let bytes = match fs::read(&path) {
			Ok(bytes) => bytes,
			Err(error) => {
				tracing::warn!(file = %relative.display(), %error, "file skipped");
				continue;
			}
		};
		let lines = split_lines(&resolver.resolve(&bytes).text);

		for resolved in repository.resolve(grammar.scan_lines(&lines, options.mode)) {
			let anchor = resolved.anchor;
			found.push(AnchorStatus {
				file: relative.clone(),
				line: anchor.source_line,
				key: anchor.key(),
				embedded: anchor.is_embedded(),
				woven: injector.woven_after(&lines, anchor.end_line),
				unresolved: match resolved.resolution {
					Resolution::Found(_) => None,
					Resolution::Missing(reason) => Some(reason),
				},
				anchor: anchor.raw_text,
			});
		}
	}

	Ok(found)
}

fn aggregate(stats: &mut RunStats, previews: &mut Vec<FilePreview>, report: FileReport) {
	*stats.encodings.entry(report.encoding.to_string()).or_default() += 1;
	if report.lossy {
		stats.lossy_files += 1;
	}

	if report.anchors == 0 {
		stats.files_untouched += 1;
	} else {
		stats.files_with_anchors += 1;
		if report.written {
			stats.files_touched += 1;
		}
	}

	stats.anchors_found += report.anchors;
	stats.fragments_injected += report.fragments;
	stats.lines_injected += report.lines;
	stats.already_woven += report.already_woven;
	stats.unresolved.extend(report.unresolved);

	for (case_id, counts) in report.cases {
		let entry = stats.cases.entry(case_id).or_default();
		entry.anchors += counts.anchors;
		entry.injected += counts.injected;
		entry.unresolved += counts.unresolved;
	}

	if let Some(preview) = report.preview {
		previews.push(preview);
	}
}

/// Process every file, in order on this thread for one job, or on a
/// bounded pool of scoped workers feeding a single aggregator channel.
/// Outcomes come back in discovery order either way.
fn process_all(
	context: &FileContext<'_>,
	files: &[PathBuf],
	jobs: usize,
	cancellation: &CancellationToken,
	progress: Option<&dyn ProgressSink>,
) -> (Vec<FileOutcome>, bool) {
	let total = files.len();
	let notify = |current: usize, file: &Path| {
		if let Some(sink) = progress {
			let label = relative_to(file, context.root).display().to_string();
			sink.report(Progress {
				percent: percent(current, total),
				label: &label,
				current,
				total,
			});
		}
	};

	if jobs <= 1 || total <= 1 {
		let mut outcomes = Vec::with_capacity(total);
		for (index, file) in files.iter().enumerate() {
			if cancellation.is_cancelled() {
				tracing::warn!(processed = index, total, "run cancelled");
				return (outcomes, true);
			}
			outcomes.push(process_file(context, file));
			notify(index + 1, file);
		}
		return (outcomes, false);
	}

	let workers = jobs.min(total);
	let mut slots: Vec<Option<FileOutcome>> = Vec::with_capacity(total);
	slots.resize_with(total, || None);

	std::thread::scope(|scope| {
		let (sender, receiver) = mpsc::channel::<(usize, FileOutcome)>();

		for worker in 0..workers {
			let sender = sender.clone();
			scope.spawn(move || {
				for index in (worker..total).step_by(workers) {
					if cancellation.is_cancelled() {
						break;
					}
					let outcome = process_file(context, &files[index]);
					if sender.send((index, outcome)).is_err() {
						break;
					}
				}
			});
		}
		drop(sender);

		let mut received = 0;
		for (index, outcome) in receiver {
			received += 1;
			slots[index] = Some(outcome);
			notify(received, &files[index]);
		}
	});

	let cancelled = slots.iter().any(Option::is_none);
	if cancelled {
		tracing::warn!(
			processed = slots.iter().filter(|slot| slot.is_some()).count(),
			total,
			"run cancelled"
		);
	}
	(slots.into_iter().flatten().collect(), cancelled)
}

fn percent(current: usize, total: usize) -> u8 {
	if total == 0 {
		100
	} else {
		((current * 100) / total).min(100) as u8
	}
}

fn relative_to(path: &Path, root: &Path) -> PathBuf {
	path.strip_prefix(root).unwrap_or(path).to_path_buf()
}

fn process_file(context: &FileContext<'_>, path: &Path) -> FileOutcome {
	let relative = relative_to(path, context.root);
	let fail = |error: WeaveError| {
		tracing::warn!(file = %relative.display(), %error, "file skipped");
		FileError::new(&relative, &error)
	};

	let size = fs::metadata(path)
		.map_err(|e| fail(WeaveError::io_at(e, path)))?
		.len();
	let limit = context.options.discovery.max_file_size;
	if size > limit {
		return Err(fail(WeaveError::FileTooLarge {
			path: relative.display().to_string(),
			size,
			limit,
		}));
	}

	let bytes = fs::read(path).map_err(|e| fail(WeaveError::io_at(e, path)))?;
	let decoded = context.resolver.resolve(&bytes);
	if decoded.lossy {
		tracing::warn!(file = %relative.display(), "undecodable bytes replaced");
	}

	let lines = split_lines(&decoded.text);
	let anchors = context.grammar.scan_lines(&lines, context.options.mode);

	let mut report = FileReport {
		encoding: decoded.encoding_name(),
		lossy: decoded.lossy,
		anchors: anchors.len(),
		written: false,
		fragments: 0,
		lines: 0,
		already_woven: 0,
		unresolved: Vec::new(),
		cases: BTreeMap::new(),
		preview: None,
	};

	if anchors.is_empty() {
		tracing::debug!(file = %relative.display(), "no anchors");
		if let (Some(directories), true) = (context.directories, context.options.mirror_untouched) {
			write_atomic(&directories.output.join(&relative), &bytes)
				.map_err(&fail)?;
		}
		return Ok(report);
	}

	for anchor in &anchors {
		report.cases.entry(anchor.case_id.clone()).or_default().anchors += 1;
	}

	let resolved = context.repository.resolve(anchors);
	let injection = context.injector.inject(&relative, &lines, &resolved);

	for injected in &injection.report.injected {
		report.cases.entry(injected.case_id.clone()).or_default().injected += 1;
	}
	for unresolved in &injection.report.unresolved {
		if let Some(key) = &unresolved.key {
			report.cases.entry(key.case_id.clone()).or_default().unresolved += 1;
		}
	}

	report.fragments = injection.report.injected.len();
	report.lines = injection.report.lines_injected();
	report.already_woven = injection.report.already_woven;

	// Unchanged files keep their exact bytes.
	let woven_bytes: Cow<'_, [u8]> = if injection.changed() {
		let text = join_lines(&injection.lines);
		let encoded = encode(&text, decoded.encoding, decoded.bom).bytes;
		if context.options.dry_run {
			report.preview = Some(FilePreview {
				file: relative.clone(),
				before: decoded.text,
				after: text,
			});
		}
		Cow::Owned(encoded)
	} else {
		Cow::Borrowed(&bytes)
	};
	report.unresolved = injection.report.unresolved;

	if let Some(directories) = context.directories {
		// The pre-image must be durable before the woven copy exists.
		backup_file(path, &directories.backup.join(&relative)).map_err(&fail)?;
		write_atomic(&directories.output.join(&relative), &woven_bytes).map_err(&fail)?;
		report.written = true;
		tracing::debug!(
			file = %relative.display(),
			fragments = report.fragments,
			"file woven"
		);
	}

	Ok(report)
}

fn backup_file(source: &Path, destination: &Path) -> WeaveResult<()> {
	if let Some(parent) = destination.parent() {
		fs::create_dir_all(parent).map_err(|e| WeaveError::io_at(e, parent))?;
	}
	fs::copy(source, destination).map_err(|e| WeaveError::io_at(e, destination))?;
	fs::File::open(destination)
		.and_then(|file| file.sync_all())
		.map_err(|e| WeaveError::io_at(e, destination))
}

/// Write `bytes` to a temporary sibling of `path` and rename it into
/// place, so `path` is either absent or complete.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> WeaveResult<()> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	fs::create_dir_all(parent).map_err(|e| WeaveError::io_at(e, parent))?;

	let name = path
		.file_name()
		.map(|name| name.to_string_lossy().into_owned())
		.unwrap_or_default();
	let temp_path = parent.join(format!(
		".{name}{TEMP_FILE_MARKER}{}-{}",
		std::process::id(),
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map_or(0, |duration| duration.as_nanos())
	));

	let written = fs::File::create(&temp_path).and_then(|mut file| {
		file.write_all(bytes)?;
		file.sync_all()
	});
	if let Err(error) = written {
		let _ = fs::remove_file(&temp_path);
		return Err(WeaveError::io_at(error, path));
	}

	if let Err(error) = fs::rename(&temp_path, path) {
		let _ = fs::remove_file(&temp_path);
		return Err(WeaveError::io_at(error, path));
	}

	Ok(())
}
