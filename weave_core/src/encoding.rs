//! Byte stream decoding with detection, an ordered candidate list, and a
//! lossy UTF-8 last resort.
//!
//! [`EncodingResolver::resolve`] never fails. The chosen encoding travels
//! with the decoded text so [`encode`] can write the file back in the same
//! convention it was read in.

use std::borrow::Cow;

use chardetng::EncodingDetector;
use encoding_rs::Encoding;
use encoding_rs::UTF_8;
use encoding_rs::UTF_16BE;
use encoding_rs::UTF_16LE;

use crate::EncodingConfig;
use crate::WeaveError;
use crate::WeaveResult;

/// Candidate labels tried in order when detection is inconclusive.
pub const DEFAULT_ENCODING_CANDIDATES: [&str; 6] = [
	"UTF-8",
	"GB18030",
	"Big5",
	"Shift_JIS",
	"EUC-KR",
	"windows-1252",
];

/// Default number of leading bytes fed to the statistical detector.
pub const DEFAULT_DETECTION_PREFIX: usize = 1024 * 1024;

/// How the encoding of a [`Decoded`] text was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
	Bom,
	Detector,
	Candidate,
	Lossy,
}

#[derive(Debug, Clone)]
pub struct Decoded {
	pub text: String,
	pub encoding: &'static Encoding,
	/// The input started with a byte order mark for `encoding`.
	pub bom: bool,
	/// Undecodable sequences were replaced with U+FFFD.
	pub lossy: bool,
	pub source: DetectionSource,
}

impl Decoded {
	pub fn encoding_name(&self) -> &'static str {
		self.encoding.name()
	}
}

#[derive(Debug, Clone)]
pub struct EncodingResolver {
	candidates: Vec<&'static Encoding>,
	detection_prefix: usize,
	accept_detected: bool,
}

impl Default for EncodingResolver {
	fn default() -> Self {
		Self {
			candidates: DEFAULT_ENCODING_CANDIDATES
				.iter()
				.filter_map(|label| Encoding::for_label(label.as_bytes()))
				.collect(),
			detection_prefix: DEFAULT_DETECTION_PREFIX,
			accept_detected: true,
		}
	}
}

impl EncodingResolver {
	pub fn from_config(config: &EncodingConfig) -> WeaveResult<Self> {
		let mut candidates = Vec::with_capacity(config.candidates.len());
		for label in &config.candidates {
			let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
				WeaveError::ConfigParse(format!("unknown encoding label `{label}` in [encoding]"))
			})?;
			if !candidates.contains(&encoding) {
				candidates.push(encoding);
			}
		}

		Ok(Self {
			candidates,
			detection_prefix: config.detection_prefix.max(1),
			accept_detected: config.accept_detected,
		})
	}

	pub fn candidates(&self) -> &[&'static Encoding] {
		&self.candidates
	}

	/// Decode `bytes` without substitution.
	///
	/// Order: byte order mark, valid UTF-8, statistical detection over the
	/// bounded prefix (accepted only when the whole input decodes cleanly
	/// with the guess), then each candidate in turn.
	pub fn decode_strict(&self, bytes: &[u8]) -> WeaveResult<Decoded> {
		if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
			if let Some(text) = decode_clean(encoding, &bytes[bom_len..]) {
				return Ok(Decoded {
					text,
					encoding,
					bom: true,
					lossy: false,
					source: DetectionSource::Bom,
				});
			}
		}

		// The detector reports its legacy fallback for pure ASCII.
		if let Ok(text) = std::str::from_utf8(bytes) {
			return Ok(Decoded {
				text: text.to_string(),
				encoding: UTF_8,
				bom: false,
				lossy: false,
				source: DetectionSource::Detector,
			});
		}

		if self.accept_detected && !bytes.is_empty() {
			let encoding = detect(bytes, self.detection_prefix);
			if let Some(text) = decode_clean(encoding, bytes) {
				tracing::trace!(encoding = encoding.name(), "detector guess accepted");
				return Ok(Decoded {
					text,
					encoding,
					bom: false,
					lossy: false,
					source: DetectionSource::Detector,
				});
			}
			tracing::debug!(
				encoding = encoding.name(),
				"detector guess rejected, trying candidates"
			);
		}

		for &encoding in &self.candidates {
			if let Some(text) = decode_clean(encoding, bytes) {
				return Ok(Decoded {
					text,
					encoding,
					bom: false,
					lossy: false,
					source: DetectionSource::Candidate,
				});
			}
		}

		Err(WeaveError::DecodeExhausted {
			tried: self
				.candidates
				.iter()
				.map(|encoding| encoding.name().to_string())
				.collect(),
		})
	}

	/// Decode `bytes`, falling back to lossy UTF-8 when every strategy fails.
	pub fn resolve(&self, bytes: &[u8]) -> Decoded {
		match self.decode_strict(bytes) {
			Ok(decoded) => decoded,
			Err(error) => {
				tracing::warn!(%error, "decoding with lossy UTF-8 substitution");
				let (bytes, bom) = match bytes.strip_prefix(b"\xEF\xBB\xBF") {
					Some(rest) => (rest, true),
					None => (bytes, false),
				};
				Decoded {
					text: String::from_utf8_lossy(bytes).into_owned(),
					encoding: UTF_8,
					bom,
					lossy: true,
					source: DetectionSource::Lossy,
				}
			}
		}
	}
}

fn detect(bytes: &[u8], prefix: usize) -> &'static Encoding {
	let end = bytes.len().min(prefix);
	let mut detector = EncodingDetector::new();
	detector.feed(&bytes[..end], end == bytes.len());
	detector.guess(None, true)
}

fn decode_clean(encoding: &'static Encoding, bytes: &[u8]) -> Option<String> {
	encoding
		.decode_without_bom_handling_and_without_replacement(bytes)
		.map(Cow::into_owned)
}

/// Bytes produced by [`encode`].
#[derive(Debug, Clone)]
pub struct Encoded {
	pub bytes: Vec<u8>,
	/// Some characters had no mapping in the target encoding and were
	/// written as numeric character references.
	pub unmappable: bool,
}

/// Re-encode `text` with the encoding chosen when it was read.
pub fn encode(text: &str, encoding: &'static Encoding, bom: bool) -> Encoded {
	let mut bytes = Vec::with_capacity(text.len() + 3);

	if encoding == UTF_16LE || encoding == UTF_16BE {
		let little = encoding == UTF_16LE;
		if bom {
			bytes.extend_from_slice(if little { b"\xFF\xFE" } else { b"\xFE\xFF" });
		}
		for unit in text.encode_utf16() {
			let pair = if little {
				unit.to_le_bytes()
			} else {
				unit.to_be_bytes()
			};
			bytes.extend_from_slice(&pair);
		}
		return Encoded {
			bytes,
			unmappable: false,
		};
	}

	if bom && encoding == UTF_8 {
		bytes.extend_from_slice(b"\xEF\xBB\xBF");
	}

	let (encoded, _, unmappable) = encoding.encode(text);
	bytes.extend_from_slice(&encoded);

	if unmappable {
		tracing::warn!(
			encoding = encoding.name(),
			"text contains characters the original encoding cannot represent"
		);
	}

	Encoded { bytes, unmappable }
}
