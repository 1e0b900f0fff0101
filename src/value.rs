//! Attribute value helpers.
//!
//! Attributes are stored as `serde_json::Value`, the same dynamic payload
//! representation HTTP parameters arrive in, so blankness, boolean casts,
//! and id extraction follow parameter semantics rather than strict JSON
//! typing: `"1"`, `1`, and `true` all count as a set destroy flag, and a
//! record id may arrive as a number or a numeric string.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::RecordId;

/// Ordered attribute map shared by records, payload entries, and builders.
pub type AttributeMap = IndexMap<String, Value>;

/// Copy a JSON object into an attribute map.
pub(crate) fn object_to_attributes(map: &serde_json::Map<String, Value>) -> AttributeMap {
	map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Whether a parameter value carries no usable content.
///
/// Null, `false`, whitespace-only strings, and empty arrays/objects are
/// all blank.
pub fn is_blank(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::Bool(b) => !b,
		Value::String(s) => s.trim().is_empty(),
		Value::Array(a) => a.is_empty(),
		Value::Object(o) => o.is_empty(),
		Value::Number(_) => false,
	}
}

/// Boolean cast for flag parameters (`_destroy` and friends).
pub fn is_truthy(value: &Value) -> bool {
	match value {
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
		Value::String(s) => {
			let s = s.trim();
			!s.is_empty() && !matches!(s.to_ascii_lowercase().as_str(), "0" | "false" | "f" | "no" | "off")
		}
		_ => false,
	}
}

/// Extract a persisted record id from a number or numeric string.
///
/// Only positive ids identify persisted records; zero, negatives, and
/// non-numeric values yield `None`.
pub fn id_of(value: &Value) -> Option<RecordId> {
	let id = match value {
		Value::Number(n) => n.as_i64()?,
		Value::String(s) => s.trim().parse::<RecordId>().ok()?,
		_ => return None,
	};
	(id > 0).then_some(id)
}

/// Canonical string form of an id parameter, used when matching payload
/// ids against loaded records.
pub fn id_string(value: &Value) -> Option<String> {
	match value {
		Value::Number(n) => Some(n.to_string()),
		Value::String(s) => {
			let s = s.trim();
			(!s.is_empty()).then(|| s.to_string())
		}
		_ => None,
	}
}
