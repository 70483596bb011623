//! Claim extraction helpers.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// First non-empty string value among `names`, in order.
///
/// Identity providers spell custom claims differently (`custom:tenantId`,
/// `tenant_id`, ...); every lookup over alternative names goes through here.
#[must_use]
pub fn lookup_first(claims: &Map<String, Value>, names: &[String]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| claims.get(name))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

/// Granted scopes from `scope` (space separated) or `scp` (array or string).
#[must_use]
pub fn scopes(claims: &Map<String, Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for key in ["scope", "scp"] {
        match claims.get(key) {
            Some(Value::String(s)) => out.extend(s.split_whitespace().map(String::from)),
            Some(Value::Array(items)) => {
                out.extend(items.iter().filter_map(Value::as_str).map(String::from));
            }
            _ => {}
        }
    }
    out
}
