//! The repository document: three nested mappings (case → step → segment)
//! whose leaves are text blocks.
//!
//! Both directions go through `serde_yaml_ng`. Loading is lenient about
//! key spelling and scalar leaves; writing serializes the nested maps as
//! they are.

use std::collections::BTreeMap;

use serde_yaml_ng::Value;

use crate::FragmentKey;
use crate::WeaveError;
use crate::WeaveResult;
use crate::grammar::canonical_id;

type Steps = BTreeMap<String, BTreeMap<String, String>>;

/// An ordered, owned repository document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryDocument {
	cases: BTreeMap<String, Steps>,
}

impl RepositoryDocument {
	pub fn new() -> Self {
		Self::default()
	}

	/// Insert a fragment, returning the text it replaced.
	pub fn insert(&mut self, key: &FragmentKey, text: impl Into<String>) -> Option<String> {
		self.cases
			.entry(key.case_id.clone())
			.or_default()
			.entry(key.step_id.clone())
			.or_default()
			.insert(key.segment_id.clone(), text.into())
	}

	pub fn get(&self, key: &FragmentKey) -> Option<&str> {
		self.cases
			.get(&key.case_id)?
			.get(&key.step_id)?
			.get(&key.segment_id)
			.map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.cases
			.values()
			.flat_map(BTreeMap::values)
			.map(BTreeMap::len)
			.sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Every entry in key order.
	pub fn entries(&self) -> impl Iterator<Item = (FragmentKey, &str)> {
		self.cases.iter().flat_map(|(case_id, steps)| {
			steps.iter().flat_map(move |(step_id, segments)| {
				segments.iter().map(move |(segment_id, text)| {
					(
						FragmentKey::new(case_id, step_id, segment_id),
						text.as_str(),
					)
				})
			})
		})
	}

	/// Parse a YAML document. `origin` names the source in errors and logs.
	///
	/// Case and step keys are canonicalised to upper case, segment keys are
	/// trimmed. Numeric and boolean keys and leaves are read as their text.
	/// When two keys collapse onto the same entry the later one wins and a
	/// warning is logged.
	pub fn from_yaml(text: &str, origin: &str) -> WeaveResult<Self> {
		let malformed = |reason: String| {
			WeaveError::RepositoryMalformed {
				path: origin.to_string(),
				reason,
			}
		};

		let value: Value = serde_yaml_ng::from_str(text).map_err(|e| malformed(e.to_string()))?;
		let mut document = Self::new();

		let cases = match value {
			Value::Null => return Ok(document),
			Value::Mapping(mapping) => mapping,
			other => {
				return Err(malformed(format!(
					"top level must be a mapping of cases, found {}",
					value_kind(&other)
				)));
			}
		};

		for (case_key, steps) in cases {
			let case_id = canonical_id(&scalar_key(&case_key).map_err(&malformed)?);
			let steps = match steps {
				Value::Mapping(steps) => steps,
				other => {
					return Err(malformed(format!(
						"case `{case_id}` must map step identifiers, found {}",
						value_kind(&other)
					)));
				}
			};

			for (step_key, segments) in steps {
				let step_id = canonical_id(&scalar_key(&step_key).map_err(&malformed)?);
				let segments = match segments {
					Value::Mapping(segments) => segments,
					other => {
						return Err(malformed(format!(
							"step `{case_id}.{step_id}` must map segment identifiers, found {}",
							value_kind(&other)
						)));
					}
				};

				for (segment_key, leaf) in segments {
					let segment_id = scalar_key(&segment_key).map_err(&malformed)?.trim().to_string();
					let key = FragmentKey::new(&case_id, &step_id, &segment_id);
					let text = match leaf {
						Value::String(text) => text,
						Value::Number(number) => number.to_string(),
						Value::Bool(flag) => flag.to_string(),
						Value::Null => {
							tracing::warn!(%key, origin, "fragment has no text, treating it as empty");
							String::new()
						}
						other => {
							return Err(malformed(format!(
								"fragment `{key}` must be a text block, found {}",
								value_kind(&other)
							)));
						}
					};

					if document.insert(&key, text).is_some() {
						tracing::warn!(
							%key,
							origin,
							"duplicate fragment key, keeping the later definition"
						);
					}
				}
			}
		}

		Ok(document)
	}

	/// Serialize as YAML. Multi-line fragments come out as literal block
	/// scalars and every text reloads byte-for-byte.
	pub fn to_yaml(&self) -> WeaveResult<String> {
		serde_yaml_ng::to_string(&self.cases).map_err(|e| WeaveError::DocumentSerialize(e.to_string()))
	}
}

fn value_kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "a boolean",
		Value::Number(_) => "a number",
		Value::String(_) => "a string",
		Value::Sequence(_) => "a sequence",
		Value::Mapping(_) => "a mapping",
		Value::Tagged(_) => "a tagged value",
	}
}

fn scalar_key(value: &Value) -> Result<String, String> {
	match value {
		Value::String(text) => Ok(text.clone()),
		Value::Number(number) => Ok(number.to_string()),
		Value::Bool(flag) => Ok(flag.to_string()),
		other => Err(format!("keys must be scalars, found {}", value_kind(other))),
	}
}
