use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use owo_colors::OwoColorize;
use similar::ChangeTag;
use similar::TextDiff;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use weave_cli::CollisionArg;
use weave_cli::Commands;
use weave_cli::OutputFormat;
use weave_cli::WeaveCli;
use weave_core::AnchorStatus;
use weave_core::CollisionResolution;
use weave_core::ExtractOptions;
use weave_core::FragmentRepository;
use weave_core::Mode;
use weave_core::Pipeline;
use weave_core::Progress;
use weave_core::RepositoryHandle;
use weave_core::RunOptions;
use weave_core::RunOutcome;
use weave_core::STARTER_CONFIG;
use weave_core::STARTER_REPOSITORY;
use weave_core::WeaveConfig;
use weave_core::document_path_variants;
use weave_core::extract;
use weave_core::load_or_empty;
use weave_core::survey;
use weave_core::write_atomic;

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "WEAVE_LOG";

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

struct RunRequest {
	repository: Option<PathBuf>,
	mode: Option<Mode>,
	jobs: Option<usize>,
	dry_run: bool,
	diff: bool,
	format: OutputFormat,
	watch: bool,
}

fn main() {
	let args = WeaveCli::parse();

	// Respect NO_COLOR, --no-color and terminals without color support.
	let use_color = !args.no_color
		&& std::env::var_os("NO_COLOR").is_none()
		&& supports_color::on(supports_color::Stream::Stdout).is_some();
	if !use_color {
		USE_COLOR.store(false, std::sync::atomic::Ordering::Relaxed);
	}

	// Install miette's fancy handler for rich error diagnostics.
	miette::set_hook(Box::new(move |_| {
		Box::new(
			miette::MietteHandlerOpts::new()
				.color(use_color)
				.unicode(use_color)
				.build(),
		)
	}))
	.ok();

	if let Err(e) = init_tracing(&args, use_color) {
		eprintln!("{} failed to set up logging: {e}", colored!("error:", red));
		process::exit(2);
	}

	let result = match &args.command {
		Some(Commands::Init) => run_init(&args),
		Some(Commands::Run {
			repository,
			mode,
			jobs,
			dry_run,
			diff,
			format,
			watch,
		}) => {
			let request = RunRequest {
				repository: repository.clone(),
				mode: mode.map(Mode::from),
				jobs: *jobs,
				dry_run: *dry_run,
				diff: *diff,
				format: *format,
				watch: *watch,
			};
			run_weave(&args, &request)
		}
		Some(Commands::Extract {
			output,
			on_collision,
		}) => run_extract(&args, output.as_deref(), *on_collision),
		Some(Commands::List { repository, format }) => run_list(&args, repository.as_deref(), *format),
		None => {
			eprintln!("No subcommand specified. Run `weave --help` for usage.");
			process::exit(2);
		}
	};

	if let Err(e) = result {
		// Try to render through miette for rich diagnostics with help text
		// and error codes.
		match e.downcast::<weave_core::WeaveError>() {
			Ok(weave_err) => {
				let report: miette::Report = (*weave_err).into();
				eprintln!("{report:?}");
			}
			Err(e) => {
				eprintln!("{} {e}", colored!("error:", red));
			}
		}
		process::exit(2);
	}
}

/// Log to stderr, filtered by `WEAVE_LOG` (default `warn`), and mirror the
/// stream into `--log-file` when given.
fn init_tracing(args: &WeaveCli, use_color: bool) -> Result<(), Box<dyn std::error::Error>> {
	let mut filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
	if args.verbose {
		filter = filter.add_directive("weave_core=debug".parse()?);
	}

	let stderr = fmt::layer()
		.with_writer(std::io::stderr)
		.with_ansi(use_color)
		.with_target(false);

	let file = match &args.log_file {
		Some(path) => {
			let file = std::fs::OpenOptions::new()
				.create(true)
				.append(true)
				.open(path)?;
			Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
		}
		None => None,
	};

	tracing_subscriber::registry()
		.with(filter)
		.with(stderr)
		.with(file)
		.try_init()?;

	Ok(())
}

fn resolve_root(args: &WeaveCli) -> PathBuf {
	args.path
		.clone()
		.unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn print_section(title: &str) {
	println!();
	println!("{}", colored!(title, bold));
}

fn print_field(label: &str, value: impl std::fmt::Display) {
	println!("{label:<28} {value}");
}

fn display_or_none(path: Option<&Path>) -> String {
	path.map_or_else(|| "none".to_string(), |path| path.display().to_string())
}

fn run_init(args: &WeaveCli) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let config_path = root.join("weave.toml");
	let repository_path = root.join(weave_core::DEFAULT_REPOSITORY_FILE);

	let config_exists = config_path.exists();
	let repository_exists = repository_path.exists();

	if config_exists {
		println!("Config file already exists: {}", config_path.display());
	} else {
		std::fs::write(&config_path, STARTER_CONFIG)?;
		println!("Created weave.toml");
	}

	if repository_exists {
		println!("Repository already exists: {}", repository_path.display());
	} else {
		std::fs::write(&repository_path, STARTER_REPOSITORY)?;
		println!("Created repository: {}", repository_path.display());
	}

	if !repository_exists {
		println!();
		println!("Next steps:");
		println!("  1. Add fragments to {}", repository_path.display());
		println!("  2. Add anchors to your sources:");
		println!("     // TC001 STEP1 open");
		println!("  3. Run `weave run` to weave them in");
	}

	Ok(())
}

/// Load the repository for a run. Embedded mode never reads one.
fn load_repository(document: &Path, mode: Mode) -> (RepositoryHandle, Option<PathBuf>, Option<String>) {
	if !mode.referenced() {
		return (RepositoryHandle::new(FragmentRepository::new()), None, None);
	}

	let loaded = load_or_empty(document);
	(
		RepositoryHandle::new(loaded.repository),
		loaded.path,
		loaded.warning.map(|warning| warning.to_string()),
	)
}

fn run_weave(args: &WeaveCli, request: &RunRequest) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let config = WeaveConfig::load_or_default(&root)?;

	let mut options = RunOptions::from_config(&config);
	options.dry_run = request.dry_run;
	if let Some(mode) = request.mode {
		options.mode = mode;
	}
	if let Some(jobs) = request.jobs {
		options.jobs = jobs.max(1);
	}

	let document = request
		.repository
		.clone()
		.unwrap_or_else(|| config.repository_path(&root));
	let (handle, mut source, mut warning) = load_repository(&document, options.mode);

	run_weave_once(
		args,
		&root,
		&options,
		&handle,
		source.as_deref(),
		warning.as_deref(),
		request,
	)?;

	if !request.watch || request.dry_run {
		return Ok(());
	}

	// Watch mode
	println!("\nWatching for changes... (press Ctrl+C to stop)");

	let watch_root = root.canonicalize().unwrap_or_else(|_| root.clone());
	let document_names: Vec<OsString> = document_path_variants(&document)
		.iter()
		.filter_map(|variant| variant.file_name().map(ToOwned::to_owned))
		.collect();
	let (tx, rx) = mpsc::channel::<Vec<PathBuf>>();

	let mut watcher =
		notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
			if let Ok(event) = res {
				if matches!(
					event.kind,
					notify::EventKind::Modify(_) | notify::EventKind::Create(_)
				) {
					let _ = tx.send(event.paths);
				}
			}
		})?;

	use notify::Watcher;
	watcher.watch(&watch_root, notify::RecursiveMode::Recursive)?;
	if let Some(parent) = document.parent().filter(|parent| parent.is_dir()) {
		let parent = parent.canonicalize()?;
		if !parent.starts_with(&watch_root) {
			watcher.watch(&parent, notify::RecursiveMode::NonRecursive)?;
		}
	}

	let is_document = |path: &PathBuf| {
		path.file_name()
			.is_some_and(|name| document_names.iter().any(|candidate| candidate == name))
	};

	loop {
		let mut changed = rx.recv()?;
		// Debounce: drain additional events within 200ms.
		while let Ok(more) = rx.recv_timeout(Duration::from_millis(200)) {
			changed.extend(more);
		}

		// The parent of an outside document also receives new run directories.
		let relevant = changed
			.iter()
			.any(|path| path.starts_with(&watch_root) || is_document(path));
		if !relevant {
			continue;
		}
		tracing::debug!(paths = changed.len(), "change batch received");

		if options.mode.referenced() && changed.iter().any(is_document) {
			match handle.reload(&document) {
				Ok(snapshot) => {
					println!("\nRepository changed, {} fragment(s) loaded.", snapshot.len());
					source = Some(document.clone());
					warning = None;
				}
				Err(e) => {
					eprintln!(
						"{} keeping the previous repository: {e}",
						colored!("warning:", yellow)
					);
				}
			}
		}

		println!("\nChange detected, weaving...");
		if let Err(e) = run_weave_once(
			args,
			&root,
			&options,
			&handle,
			source.as_deref(),
			warning.as_deref(),
			request,
		) {
			eprintln!("{} {e}", colored!("error:", red));
		}
	}
}

fn run_weave_once(
	args: &WeaveCli,
	root: &Path,
	options: &RunOptions,
	handle: &RepositoryHandle,
	source: Option<&Path>,
	warning: Option<&str>,
	request: &RunRequest,
) -> Result<(), Box<dyn std::error::Error>> {
	let progress = |progress: Progress<'_>| {
		eprintln!("[{:>3}%] {}", progress.percent, progress.label);
	};

	let mut pipeline = Pipeline::new(root, handle.snapshot(), options.clone())
		.with_repository_source(source.map(Path::to_path_buf), warning.map(ToOwned::to_owned));
	if args.verbose && matches!(request.format, OutputFormat::Text) {
		pipeline = pipeline.with_progress(&progress);
	}
	let outcome = pipeline.run()?;

	match request.format {
		OutputFormat::Json => {
			println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
		}
		OutputFormat::Text => print_run(&outcome, request.diff),
	}

	Ok(())
}

fn print_run(outcome: &RunOutcome, show_diff: bool) {
	let stats = &outcome.stats;

	if let Some(warning) = &stats.repository_warning {
		eprintln!("{} {warning}", colored!("warning:", yellow));
	}

	if stats.dry_run {
		println!(
			"Dry run: would weave {} fragment(s) into {} file(s).",
			stats.fragments_injected,
			outcome.previews.len()
		);
		for preview in &outcome.previews {
			println!("  {}", preview.file.display());
			if show_diff {
				print_diff(&preview.before, &preview.after);
			}
		}
	} else {
		println!(
			"Wove {} fragment(s) ({} line(s)) into {} file(s).",
			stats.fragments_injected, stats.lines_injected, stats.files_touched
		);
	}

	print_section("Run");
	print_field("Root", stats.root.display());
	print_field("Repository", display_or_none(stats.repository.as_deref()));
	print_field("Mode", stats.mode);
	if let Some(directories) = &stats.directories {
		print_field("Backup", directories.backup.display());
		print_field("Output", directories.output.display());
	}

	print_section("Files");
	print_field("Scanned", stats.total_files);
	print_field("With anchors", stats.files_with_anchors);
	print_field("Written", stats.files_touched);
	print_field("Without anchors", stats.files_untouched);
	print_field("Lossy decodes", stats.lossy_files);
	let encodings: Vec<String> = stats
		.encodings
		.iter()
		.map(|(name, count)| format!("{name} ({count})"))
		.collect();
	print_field(
		"Encodings",
		if encodings.is_empty() {
			"none".to_string()
		} else {
			encodings.join(", ")
		},
	);

	print_section("Anchors");
	print_field("Found", stats.anchors_found);
	print_field("Injected", stats.fragments_injected);
	print_field("Lines injected", stats.lines_injected);
	print_field("Already woven", stats.already_woven);
	print_field("Unresolved", stats.unresolved_count());

	if stats.cancelled {
		eprintln!();
		eprintln!("{} run cancelled before every file was processed", colored!("warning:", yellow));
	}

	if !stats.unresolved.is_empty() {
		println!();
		println!("{}", colored!("Unresolved anchors:", bold));
		for unresolved in &stats.unresolved {
			println!(
				"  {}:{} {} ({})",
				unresolved.file.display(),
				unresolved.line,
				unresolved.anchor,
				unresolved.reason
			);
		}
	}

	if !stats.file_errors.is_empty() {
		eprintln!();
		eprintln!("{}", colored!("File errors:", bold));
		for error in &stats.file_errors {
			eprintln!(
				"  {} {}: {}",
				colored!("error:", red),
				error.file.display(),
				error.message
			);
		}
	}
}

fn run_extract(
	args: &WeaveCli,
	output: Option<&Path>,
	on_collision: Option<CollisionArg>,
) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let config = WeaveConfig::load_or_default(&root)?;
	let mut options = ExtractOptions::from_config(&config);
	if let Some(policy) = on_collision {
		options.policy = policy.into();
	}

	let report = extract(&root, &options)?;

	for collision in &report.collisions {
		let (label, outcome) = match collision.resolution {
			CollisionResolution::Refused => (colored!("error:", red), "left out"),
			CollisionResolution::KeptFirst => (colored!("warning:", yellow), "kept the first"),
			CollisionResolution::KeptLast => (colored!("warning:", yellow), "kept the last"),
		};
		eprintln!(
			"{label} `{}` was woven with different text ({outcome}):",
			collision.key
		);
		for location in &collision.locations {
			eprintln!("  {location}");
		}
	}

	for error in &report.file_errors {
		eprintln!(
			"{} {}: {}",
			colored!("warning:", yellow),
			error.file.display(),
			error.message
		);
	}

	// Refused keys are absent from the document. Emit the rest, then fail.
	let yaml = report.document.to_yaml()?;
	match output {
		Some(path) => {
			write_atomic(path, yaml.as_bytes())?;
			println!(
				"Extracted {} fragment(s) from {} file(s) into {}",
				report.document.len(),
				report.files_scanned,
				path.display()
			);
		}
		None => print!("{yaml}"),
	}

	report.check()?;
	Ok(())
}

fn run_list(
	args: &WeaveCli,
	repository: Option<&Path>,
	format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
	let root = resolve_root(args);
	let config = WeaveConfig::load_or_default(&root)?;
	let options = RunOptions::from_config(&config);
	let document = repository.map_or_else(|| config.repository_path(&root), Path::to_path_buf);

	let loaded = load_or_empty(&document);
	let summary = loaded.repository.summary();
	let anchors = survey(&root, &loaded.repository, &options)?;

	if let OutputFormat::Json = format {
		let listing = serde_json::json!({
			"repository": loaded.path,
			"warning": loaded.warning.map(|warning| warning.to_string()),
			"summary": summary,
			"anchors": anchors,
		});
		println!("{}", serde_json::to_string_pretty(&listing)?);
		return Ok(());
	}

	println!("{}", colored!("Repository:", bold));
	println!("  {}", display_or_none(loaded.path.as_deref()));
	for case in &summary.cases {
		println!(
			"  {} {} step(s), {} segment(s), {} line(s)",
			case.case_id, case.steps, case.segments, case.lines
		);
	}

	println!();
	if anchors.is_empty() {
		println!("No anchors found.");
	} else {
		println!("{}", colored!("Anchors:", bold));
		for status in &anchors {
			println!(
				"  {}:{} {} [{}]",
				status.file.display(),
				status.line,
				status.anchor,
				anchor_status(status)
			);
		}
	}

	let unresolved = anchors
		.iter()
		.filter(|status| status.unresolved.is_some() && !status.woven)
		.count();
	println!(
		"\n{} case(s), {} segment(s), {} anchor(s), {} unresolved",
		summary.total_cases,
		summary.total_segments,
		anchors.len(),
		unresolved
	);

	Ok(())
}

fn anchor_status(status: &AnchorStatus) -> String {
	if status.woven {
		colored!("woven", green)
	} else if status.embedded {
		"embedded".to_string()
	} else {
		match status.unresolved {
			None => colored!("resolved", green),
			Some(reason) => colored!(reason.to_string(), yellow),
		}
	}
}

/// Print a unified diff between two strings, colorized.
fn print_diff(before: &str, after: &str) {
	let diff = TextDiff::from_lines(before, after);
	for change in diff.iter_all_changes() {
		match change.tag() {
			ChangeTag::Delete => {
				print!("  {}", colored!(format!("-{change}"), red));
			}
			ChangeTag::Insert => {
				print!("  {}", colored!(format!("+{change}"), green));
			}
			ChangeTag::Equal => {
				print!("   {change}");
			}
		}
	}
}
