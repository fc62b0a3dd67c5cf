use std::ops::Range;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;

use crate::Anchor;
use crate::AnchorKind;
use crate::Fragment;
use crate::FragmentKey;
use crate::FragmentRepository;
use crate::config::DEFAULT_MARKER;
use crate::grammar::content_of;

/// An anchor paired with the fragment it resolved to, if any.
#[derive(Debug, Clone)]
pub struct ResolvedAnchor {
	pub anchor: Anchor,
	pub resolution: Resolution,
}

#[derive(Debug, Clone)]
pub enum Resolution {
	Found(Fragment),
	Missing(UnresolvedReason),
}

/// Why an anchor did not resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedReason {
	MissingCase,
	MissingStep,
	MissingSegment,
}

impl std::fmt::Display for UnresolvedReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let text = match self {
			Self::MissingCase => "case not in repository",
			Self::MissingStep => "step not in repository",
			Self::MissingSegment => "segment not in repository",
		};
		f.write_str(text)
	}
}

impl FragmentRepository {
	/// Pair every anchor with its fragment. Embedded anchors carry their own
	/// payload and never consult the repository.
	pub fn resolve(&self, anchors: Vec<Anchor>) -> Vec<ResolvedAnchor> {
		anchors
			.into_iter()
			.map(|anchor| {
				let resolution = match &anchor.kind {
					AnchorKind::Embedded { payload, .. } => Resolution::Found(Fragment::new(payload)),
					AnchorKind::Referenced { segment_id } => {
						let key = FragmentKey::new(&anchor.case_id, &anchor.step_id, segment_id);
						match self.get_key(&key) {
							Some(fragment) => Resolution::Found(fragment),
							None => {
								Resolution::Missing(
									self.missing_level(&key)
										.unwrap_or(UnresolvedReason::MissingSegment),
								)
							}
						}
					}
				};
				ResolvedAnchor { anchor, resolution }
			})
			.collect()
	}
}

/// An anchor whose fragment was not found. Not an error: it is counted and
/// reported, and weaving of the rest of the file continues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnresolvedAnchor {
	pub file: PathBuf,
	/// 1-based line of the anchor in the source file.
	pub line: usize,
	pub anchor: String,
	pub key: Option<FragmentKey>,
	pub reason: UnresolvedReason,
}

/// A successfully woven anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedAnchor {
	pub case_id: String,
	pub step_id: String,
	pub segment_id: Option<String>,
	/// 1-based line of the anchor in the source file.
	pub source_line: usize,
	/// 1-based, end-exclusive range of the inserted lines in the output.
	pub inserted: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct InjectionReport {
	pub injected: Vec<InjectedAnchor>,
	pub unresolved: Vec<UnresolvedAnchor>,
	/// Anchors skipped because woven lines already follow them.
	pub already_woven: usize,
}

impl InjectionReport {
	pub fn lines_injected(&self) -> usize {
		self.injected
			.iter()
			.map(|anchor| anchor.inserted.len())
			.sum()
	}
}

#[derive(Debug, Clone)]
pub struct Injection {
	pub lines: Vec<String>,
	pub report: InjectionReport,
}

impl Injection {
	pub fn changed(&self) -> bool {
		!self.report.injected.is_empty()
	}
}

/// Weaves resolved fragments into line sequences.
#[derive(Debug, Clone)]
pub struct Injector {
	marker: String,
}

impl Default for Injector {
	fn default() -> Self {
		Self::new(DEFAULT_MARKER)
	}
}

impl Injector {
	pub fn new(marker: impl Into<String>) -> Self {
		Self {
			marker: marker.into(),
		}
	}

	pub fn marker(&self) -> &str {
		&self.marker
	}

	/// Insert each resolved fragment after its anchor.
	///
	/// Anchors are applied in ascending source order with a running offset
	/// for the lines already inserted, so the result depends only on `lines`
	/// and the fragments, never on the order of `anchors`.
	pub fn inject(&self, file: &Path, lines: &[String], anchors: &[ResolvedAnchor]) -> Injection {
		let mut ordered: Vec<&ResolvedAnchor> = anchors.iter().collect();
		ordered.sort_by_key(|resolved| (resolved.anchor.end_line, resolved.anchor.source_line));

		let mut output = lines.to_vec();
		let mut report = InjectionReport::default();
		let mut offset = 0;

		for resolved in ordered {
			let anchor = &resolved.anchor;

			if self.woven_after(lines, anchor.end_line) {
				tracing::debug!(
					file = %file.display(),
					line = anchor.source_line,
					"anchor already woven, skipping"
				);
				report.already_woven += 1;
				continue;
			}

			let fragment = match &resolved.resolution {
				Resolution::Found(fragment) => fragment,
				Resolution::Missing(reason) => {
					tracing::debug!(
						file = %file.display(),
						line = anchor.source_line,
						anchor = %anchor.raw_text,
						%reason,
						"unresolved anchor"
					);
					report.unresolved.push(UnresolvedAnchor {
						file: file.to_path_buf(),
						line: anchor.source_line,
						anchor: anchor.raw_text.clone(),
						key: anchor.key(),
						reason: *reason,
					});
					continue;
				}
			};

			let carriage_return = lines
				.get(anchor.end_line - 1)
				.is_some_and(|line| line.ends_with('\r'));
			let woven = self.weave(fragment, &anchor.leading_indent, carriage_return);
			let index = anchor.end_line + offset;
			let count = woven.len();
			output.splice(index..index, woven);
			offset += count;

			report.injected.push(InjectedAnchor {
				case_id: anchor.case_id.clone(),
				step_id: anchor.step_id.clone(),
				segment_id: anchor.segment_id().map(ToString::to_string),
				source_line: anchor.source_line,
				inserted: index + 1..index + 1 + count,
			});
		}

		Injection {
			lines: output,
			report,
		}
	}

	/// Render a fragment as woven lines: indented to the anchor and suffixed
	/// with the marker. Blank lines are inserted as they are.
	pub fn weave(&self, fragment: &str, indent: &str, carriage_return: bool) -> Vec<String> {
		let ending = if carriage_return { "\r" } else { "" };
		fragment
			.lines()
			.map(|line| {
				if line.trim().is_empty() {
					format!("{line}{ending}")
				} else {
					format!("{indent}{line}  {}{ending}", self.marker)
				}
			})
			.collect()
	}

	/// Whether `line` carries the provenance marker.
	pub fn is_woven(&self, line: Option<&String>) -> bool {
		line.is_some_and(|line| content_of(line).trim_end().ends_with(self.marker.as_str()))
	}

	/// Whether the first non-blank line at or after the 0-based `index`
	/// carries the marker. Fragments may open with blank lines, which are
	/// woven unmarked.
	pub fn woven_after(&self, lines: &[String], index: usize) -> bool {
		let next = lines
			.get(index..)
			.unwrap_or_default()
			.iter()
			.find(|line| !content_of(line).trim().is_empty());
		self.is_woven(next)
	}
}

/// Split decoded text into lines without losing anything: `\n` separates
/// lines and a `\r` before it stays on its line, so joining with `\n`
/// restores the text exactly.
pub fn split_lines(text: &str) -> Vec<String> {
	text.split('\n').map(ToString::to_string).collect()
}

pub fn join_lines(lines: &[String]) -> String {
	lines.join("\n")
}
