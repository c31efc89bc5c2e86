//! Dotted-path lookup into decoded JSON records.

use serde_json::Value;

/// Resolves a dotted path such as `"a.b.2"` against a record.
///
/// Mapping nodes are indexed by key and sequence nodes by a non-negative
/// integer segment. Any miss (unknown key, bad or out-of-range index, or
/// remaining segments under a scalar) yields `None`; a field that exists and
/// holds `null` yields `Some(&Value::Null)`.
pub fn get_deep<'a>(path: &str, record: &'a Value) -> Option<&'a Value> {
    path.split('.').try_fold(record, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}
