use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One step of a mutation path: an array index or an object key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MutationKey {
    Index(u64),
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: Vec<MutationKey>,
    pub value: Value,
}

/// Decrypted body of a `chat` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    pub mutations: Vec<Mutation>,
}

/// Furthest an index step may reach past the end of its array.
pub const MAX_INDEX_GAP: usize = 1024;

/// Writes `mutation.value` at `mutation.key` inside `doc`. An empty path
/// replaces the document. Missing containers along the path are created (an
/// array when the following key is an index, an object otherwise), and arrays
/// written past their end are padded with nulls. A null or scalar found in the
/// middle of the path is treated as missing and replaced by a container.
///
/// An index more than [`MAX_INDEX_GAP`] past the end of its array is rejected
/// and leaves `doc` untouched.
pub fn apply_mutation(doc: &mut Value, mutation: Mutation) -> Result<(), String> {
    let Mutation { key, value } = mutation;
    check_indices(doc, &key)?;
    let mut target = doc;
    for step in &key {
        target = match step {
            MutationKey::Index(idx) => {
                let idx = *idx as usize;
                if !target.is_array() {
                    *target = Value::Array(Vec::new());
                }
                let Some(arr) = target.as_array_mut() else {
                    return Ok(());
                };
                if arr.len() <= idx {
                    arr.resize(idx + 1, Value::Null);
                }
                &mut arr[idx]
            }
            MutationKey::Key(name) => {
                if !target.is_object() {
                    *target = Value::Object(Map::new());
                }
                let Some(map) = target.as_object_mut() else {
                    return Ok(());
                };
                map.entry(name.clone()).or_insert(Value::Null)
            }
        };
    }
    *target = value;
    Ok(())
}

fn check_indices(doc: &Value, key: &[MutationKey]) -> Result<(), String> {
    let mut current = Some(doc);
    for step in key {
        current = match step {
            MutationKey::Index(idx) => {
                let len = current.and_then(Value::as_array).map_or(0, Vec::len);
                let in_range = usize::try_from(*idx)
                    .map(|idx| idx <= len.saturating_add(MAX_INDEX_GAP))
                    .unwrap_or(false);
                if !in_range {
                    return Err(format!(
                        "Mutation index {} is out of range for an array of {}",
                        idx, len
                    ));
                }
                current.and_then(|v| v.get(*idx as usize))
            }
            MutationKey::Key(name) => current.and_then(|v| v.get(name.as_str())),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(key: Value, value: Value) -> Mutation {
        serde_json::from_value(json!({"key": key, "value": value})).unwrap()
    }

    #[test]
    fn keys_parse_as_index_or_name() {
        let parsed = m(json!(["data", 2, "type"]), json!("chat"));
        assert_eq!(
            parsed.key,
            vec![
                MutationKey::Key("data".into()),
                MutationKey::Index(2),
                MutationKey::Key("type".into())
            ]
        );
    }

    #[test]
    fn empty_key_replaces_whole_document() {
        let mut doc = json!({"uid": "old", "stale": true, "data": [1, 2, 3]});
        apply_mutation(&mut doc, m(json!([]), json!({"uid": "new", "data": []}))).unwrap();
        assert_eq!(doc, json!({"uid": "new", "data": []}));
    }

    #[test]
    fn deep_set_creates_containers_and_pads() {
        let mut doc = json!({"data": []});
        apply_mutation(&mut doc, m(json!(["data", 2, "parts", 0]), json!("x"))).unwrap();
        assert_eq!(doc, json!({"data": [null, null, {"parts": ["x"]}]}));
    }

    #[test]
    fn deep_set_overwrites_existing_leaf_only() {
        let mut doc = json!({"data": [{"a": 1, "b": 2}], "integrity": "h1"});
        apply_mutation(&mut doc, m(json!(["data", 0, "a"]), json!(5))).unwrap();
        apply_mutation(&mut doc, m(json!(["integrity"]), json!("h2"))).unwrap();
        assert_eq!(doc, json!({"data": [{"a": 5, "b": 2}], "integrity": "h2"}));
    }

    #[test]
    fn far_index_is_rejected_without_touching_document() {
        let mut doc = json!({"data": [1, 2]});
        let err = apply_mutation(&mut doc, m(json!(["data", 0, "x", 1027]), json!("x")));
        assert!(err.is_err());
        assert_eq!(doc, json!({"data": [1, 2]}));

        let err = apply_mutation(&mut doc, m(json!(["data", 2 + MAX_INDEX_GAP + 1]), json!(0)));
        assert_eq!(
            err,
            Err("Mutation index 1027 is out of range for an array of 2".to_string())
        );
        assert_eq!(doc, json!({"data": [1, 2]}));
    }

    #[test]
    fn index_at_the_gap_limit_is_padded() {
        let mut doc = json!({"data": []});
        apply_mutation(&mut doc, m(json!(["data", MAX_INDEX_GAP]), json!(true))).unwrap();
        let data = doc["data"].as_array().unwrap();
        assert_eq!(data.len(), MAX_INDEX_GAP + 1);
        assert_eq!(data[MAX_INDEX_GAP], json!(true));
        assert!(data[..MAX_INDEX_GAP].iter().all(Value::is_null));
    }

    #[test]
    fn null_and_scalar_intermediates_become_containers() {
        let mut doc = json!({"data": null, "integrity": "h1"});
        apply_mutation(&mut doc, m(json!(["data", 0, "type"]), json!("chat"))).unwrap();
        apply_mutation(&mut doc, m(json!(["integrity", "parts"]), json!([]))).unwrap();
        assert_eq!(
            doc,
            json!({"data": [{"type": "chat"}], "integrity": {"parts": []}})
        );
    }
}
