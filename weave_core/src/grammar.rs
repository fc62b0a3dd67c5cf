//! Line-oriented anchor recognition.
//!
//! Two shapes are recognised, both as `//` line comments that start the
//! line (after indentation):
//!
//! ```text
//! // TC001 STEP1: open the device        <- embedded header
//! // code: device_open(&dev);            <- single-line payload
//!
//! // TC001 STEP2: configure
//! /* code:
//! device_set(&dev, 1);                   <- multi-line payload
//! */
//!
//! // TC001 STEP3 teardown                <- referenced anchor
//! ```
//!
//! Case and step tokens are an alphabetic prefix followed by digits and are
//! matched case-insensitively. Segments are any non-whitespace token.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde::Serialize;

use crate::FragmentKey;

static REFERENCED: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(
		r"^(?P<indent>[ \t]*)//\s*(?P<case>[A-Za-z]+[0-9]+)\s+(?P<step>[A-Za-z]+[0-9]+)\s+(?P<segment>\S+)(?P<trailing>.*)$",
	)
	.expect("referenced anchor pattern is valid")
});

static HEADER: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(
		r"^(?P<indent>[ \t]*)//\s*(?P<case>[A-Za-z]+[0-9]+)\s+(?P<step>[A-Za-z]+[0-9]+)\s*:\s*(?P<description>.*)$",
	)
	.expect("embedded header pattern is valid")
});

static CODE_LINE: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)^[ \t]*//\s*code\s*:\s?(?P<payload>.*)$").expect("code line pattern is valid")
});

static BLOCK_OPEN: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"(?i)^[ \t]*/\*\s*code\s*:(?P<rest>.*)$").expect("code block pattern is valid")
});

static NEAR_MISS: LazyLock<Regex> = LazyLock::new(|| {
	Regex::new(r"^[ \t]*//\s*[A-Za-z]+[0-9]+\s+[A-Za-z]+[0-9]+\s*$")
		.expect("near miss pattern is valid")
});

/// Which anchor shapes a scan recognises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
	/// Anchors carry their own payload in a `code:` comment.
	Embedded,
	/// Anchors carry only a key; payloads come from the repository.
	Referenced,
	/// Embedded headers are tried first, then referenced anchors.
	#[default]
	Auto,
}

impl Mode {
	pub fn embedded(self) -> bool {
		matches!(self, Self::Embedded | Self::Auto)
	}

	pub fn referenced(self) -> bool {
		matches!(self, Self::Referenced | Self::Auto)
	}
}

impl std::fmt::Display for Mode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Self::Embedded => "embedded",
			Self::Referenced => "referenced",
			Self::Auto => "auto",
		};
		f.write_str(name)
	}
}

/// The result of matching a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorMatch {
	/// `// <CASE> <STEP>: <description>`; only an anchor once a `code:`
	/// comment follows.
	Header {
		case_id: String,
		step_id: String,
		description: String,
		indent: String,
	},
	/// `// <CASE> <STEP> <SEGMENT> [trailing text]`.
	Referenced {
		case_id: String,
		step_id: String,
		segment_id: String,
		trailing: String,
		indent: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorKind {
	Embedded { description: String, payload: String },
	Referenced { segment_id: String },
}

/// A located anchor. Immutable once scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchor {
	/// Canonical (upper case) case identifier.
	pub case_id: String,
	/// Canonical (upper case) step identifier.
	pub step_id: String,
	pub kind: AnchorKind,
	/// 1-based line of the anchor comment.
	pub source_line: usize,
	/// 1-based last line that belongs to the anchor. Woven lines go after
	/// it. Equal to `source_line` for referenced anchors.
	pub end_line: usize,
	/// The anchor line with surrounding whitespace removed.
	pub raw_text: String,
	pub leading_indent: String,
}

impl Anchor {
	pub fn segment_id(&self) -> Option<&str> {
		match &self.kind {
			AnchorKind::Referenced { segment_id } => Some(segment_id),
			AnchorKind::Embedded { .. } => None,
		}
	}

	/// The repository key for referenced anchors.
	pub fn key(&self) -> Option<FragmentKey> {
		self.segment_id()
			.map(|segment| FragmentKey::new(&self.case_id, &self.step_id, segment))
	}

	pub fn is_embedded(&self) -> bool {
		matches!(self.kind, AnchorKind::Embedded { .. })
	}
}

/// Normalise a case or step token for keying.
pub fn canonical_id(token: &str) -> String {
	token.trim().to_ascii_uppercase()
}

/// Strip a trailing carriage return left by splitting CRLF text on `\n`.
pub(crate) fn content_of(line: &str) -> &str {
	line.strip_suffix('\r').unwrap_or(line)
}

#[derive(Debug, Clone, Default)]
pub struct AnchorGrammar {
	strict: bool,
	marker: Option<String>,
}

impl AnchorGrammar {
	pub fn new(strict: bool) -> Self {
		Self {
			strict,
			marker: None,
		}
	}

	/// Lines ending in `marker` are woven output and never anchors.
	#[must_use]
	pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
		self.marker = Some(marker.into());
		self
	}

	pub fn is_strict(&self) -> bool {
		self.strict
	}

	/// Match a single line against the embedded header and then the
	/// referenced shape.
	pub fn scan(&self, line: &str) -> Option<AnchorMatch> {
		let line = content_of(line);

		if let Some(marker) = &self.marker {
			if line.trim_end().ends_with(marker.as_str()) {
				return None;
			}
		}

		if let Some(captures) = HEADER.captures(line) {
			return Some(AnchorMatch::Header {
				case_id: canonical_id(&captures["case"]),
				step_id: canonical_id(&captures["step"]),
				description: captures["description"].trim().to_string(),
				indent: captures["indent"].to_string(),
			});
		}

		if let Some(captures) = REFERENCED.captures(line) {
			let trailing = captures["trailing"].trim().to_string();
			if self.strict && !trailing.is_empty() {
				tracing::debug!(
					line,
					"ignoring anchor with trailing text (strict grammar)"
				);
				return None;
			}
			return Some(AnchorMatch::Referenced {
				case_id: canonical_id(&captures["case"]),
				step_id: canonical_id(&captures["step"]),
				segment_id: captures["segment"].trim().to_string(),
				trailing,
				indent: captures["indent"].to_string(),
			});
		}

		if NEAR_MISS.is_match(line) {
			tracing::debug!(line, "comment has case and step tokens but no segment");
		}

		None
	}

	/// Scan every line of a source and return its anchors in line order.
	pub fn scan_lines<S: AsRef<str>>(&self, lines: &[S], mode: Mode) -> Vec<Anchor> {
		let mut anchors = Vec::new();
		let mut index = 0;

		while index < lines.len() {
			let line = lines[index].as_ref();
			match self.scan(line) {
				Some(AnchorMatch::Header {
					case_id,
					step_id,
					description,
					indent,
				}) if mode.embedded() => {
					if let Some((payload, end)) = read_payload(lines, index + 1, &indent) {
						anchors.push(Anchor {
							case_id,
							step_id,
							kind: AnchorKind::Embedded {
								description,
								payload,
							},
							source_line: index + 1,
							end_line: end + 1,
							raw_text: content_of(line).trim().to_string(),
							leading_indent: indent,
						});
						index = end + 1;
						continue;
					}
					tracing::debug!(
						line = index + 1,
						"embedded header without a following code comment"
					);
				}
				Some(AnchorMatch::Referenced {
					case_id,
					step_id,
					segment_id,
					indent,
					..
				}) if mode.referenced() => {
					anchors.push(Anchor {
						case_id,
						step_id,
						kind: AnchorKind::Referenced { segment_id },
						source_line: index + 1,
						end_line: index + 1,
						raw_text: content_of(line).trim().to_string(),
						leading_indent: indent,
					});
				}
				_ => {}
			}
			index += 1;
		}

		anchors
	}
}

/// Read the `code:` comment that follows an embedded header, starting at
/// `start` and skipping blank lines. Returns the payload and the 0-based
/// index of the comment's last line.
fn read_payload<S: AsRef<str>>(lines: &[S], start: usize, indent: &str) -> Option<(String, usize)> {
	let offset = lines
		.get(start..)?
		.iter()
		.position(|line| !content_of(line.as_ref()).trim().is_empty())?;
	let first = start + offset;
	let line = content_of(lines[first].as_ref());

	if let Some(captures) = CODE_LINE.captures(line) {
		return Some((captures["payload"].trim_end().to_string(), first));
	}

	let captures = BLOCK_OPEN.captures(line)?;
	let rest = &captures["rest"];
	let mut payload: Vec<String> = Vec::new();

	if let Some((head, _)) = rest.split_once("*/") {
		let head = head.trim();
		return (!head.is_empty()).then(|| (head.to_string(), first));
	}
	if !rest.trim().is_empty() {
		payload.push(rest.trim().to_string());
	}

	for (index, line) in lines.iter().enumerate().skip(first + 1) {
		let line = content_of(line.as_ref());
		if let Some((head, _)) = line.split_once("*/") {
			if !head.trim().is_empty() {
				payload.push(rebase(head.trim_end(), indent).to_string());
			}
			return Some((payload.join("\n"), index));
		}
		payload.push(rebase(line.trim_end(), indent).to_string());
	}

	tracing::debug!(line = first + 1, "unterminated `/* code:` block");
	None
}

fn rebase<'a>(line: &'a str, indent: &str) -> &'a str {
	line.strip_prefix(indent).unwrap_or(line)
}
