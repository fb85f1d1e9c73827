use std::collections::BTreeMap;

/// A heterogeneous attribute value. Attestation `attributes` are modeled as a
/// tagged variant tree rather than a fixed struct because attestation sources
/// attach arbitrary free-form data.
///
/// `Map` uses `BTreeMap` (not `HashMap`) so iteration order is the sorted key
/// order — see SPEC_FULL.md §9 for why this resolves the attribute-ordering
/// open question instead of preserving insertion order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::json!(n),
            Value::Text(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::json!({
            "b": 1,
            "a": "x",
            "nested": {"z": true, "y": null},
        });
        let v: Value = json.clone().into();
        let back: serde_json::Value = v.into();
        assert_eq!(json, back);
    }

    #[test]
    fn map_iterates_sorted_by_key() {
        let mut map = BTreeMap::new();
        map.insert("zebra".to_string(), Value::Text("z".into()));
        map.insert("apple".to_string(), Value::Text("a".into()));
        let keys: Vec<&str> = map.keys().map(|s| s.as_str()).collect();
        assert_eq!(keys, vec!["apple", "zebra"]);
    }
}
