//! Typed access to plugin parameters

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use paddock_core::graph::{ManagedObject, Properties};
use paddock_core::objects::Network;
use paddock_core::subnet::Address;
use paddock_core::{PaddockError, PaddockResult};

pub fn str_param<'a>(params: &'a Properties, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

pub fn bool_param(params: &Properties, key: &str) -> Option<bool> {
    params.get(key).and_then(Value::as_bool)
}

/// Truthy in the loose sense: present and not `false`, `null`, `0` or `""`
pub fn truthy(params: &Properties, key: &str) -> bool {
    match params.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |n| n != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

pub fn u64_param(params: &Properties, key: &str) -> PaddockResult<Option<u64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| PaddockError::bad_attr(key, value)),
    }
}

pub fn i64_param(params: &Properties, key: &str) -> PaddockResult<Option<i64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .map(Some)
            .ok_or_else(|| PaddockError::bad_attr(key, value)),
    }
}

/// A string or a list of strings
pub fn str_list(params: &Properties, key: &str) -> PaddockResult<Vec<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| PaddockError::bad_attr(key, item))
            })
            .collect(),
        Some(other) => Err(PaddockError::bad_attr(key, other)),
    }
}

/// String-valued map, e.g. extra environment variables
pub fn str_map(params: &Properties, key: &str) -> PaddockResult<BTreeMap<String, String>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(_) | Value::Bool(_) => v.to_string(),
                    _ => return Err(PaddockError::bad_attr(format!("{}.{}", key, k), v)),
                };
                Ok((k.clone(), value))
            })
            .collect(),
        Some(other) => Err(PaddockError::bad_attr(key, other)),
    }
}

/// Nested parameter object; anything that is not an object reads as empty
pub fn object_param(params: &Properties, key: &str) -> Properties {
    match params.get(key) {
        Some(Value::Object(map)) => map.clone(),
        _ => Properties::new(),
    }
}

/// A node's attachment to one of its networks
#[derive(Clone)]
pub struct NicBinding {
    pub network: Arc<Network>,
    pub address: Option<Address>,
}

impl NicBinding {
    /// Host device the NIC is linked to, if the network has one
    pub fn link(&self) -> Option<String> {
        self.network.device().map(|d| d.name)
    }
}

/// Resolve the `nics` parameter. Each entry is either a network id or an
/// object `{network, address-index}`.
pub fn nics<'a, F>(params: &Properties, lookup: F) -> PaddockResult<Vec<NicBinding>>
where
    F: Fn(&str) -> Option<&'a Arc<Network>>,
{
    let entries = match params.get("nics") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => return Err(PaddockError::bad_attr("nics", other)),
    };

    entries
        .iter()
        .map(|entry| {
            let (network_id, index) = match entry {
                Value::String(id) => (id.as_str(), None),
                Value::Object(nic) => {
                    let id = str_param(nic, "network").ok_or_else(|| PaddockError::no_attr("nics.network"))?;
                    (id, i64_param(nic, "address-index")?)
                }
                other => return Err(PaddockError::bad_attr("nics", other)),
            };

            let network = lookup(network_id).ok_or_else(|| PaddockError::RefNotFound {
                object_type: "network".to_string(),
                id: network_id.to_string(),
            })?;

            let address = match index {
                Some(index) => Some(network.address_at(index).ok_or_else(|| {
                    PaddockError::bad_attr(
                        "address-index",
                        format!("{} in {}", index, network.id()),
                    )
                })?),
                None => None,
            };

            Ok(NicBinding {
                network: Arc::clone(network),
                address,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_str_list_accepts_string_or_array() {
        let p = props(json!({ "one": "a", "many": ["a", "b"], "bad": [1] }));
        assert_eq!(str_list(&p, "one").unwrap(), vec!["a"]);
        assert_eq!(str_list(&p, "many").unwrap(), vec!["a", "b"]);
        assert!(str_list(&p, "missing").unwrap().is_empty());
        assert!(matches!(str_list(&p, "bad"), Err(PaddockError::BadAttr { .. })));
    }

    #[test]
    fn test_truthy() {
        let p = props(json!({ "t": true, "f": false, "o": {}, "z": 0, "s": "" }));
        assert!(truthy(&p, "t"));
        assert!(truthy(&p, "o"));
        assert!(!truthy(&p, "f"));
        assert!(!truthy(&p, "z"));
        assert!(!truthy(&p, "s"));
        assert!(!truthy(&p, "missing"));
    }

    #[test]
    fn test_str_map_stringifies_scalars() {
        let p = props(json!({ "env": { "A": "x", "B": 2, "C": true } }));
        let env = str_map(&p, "env").unwrap();
        assert_eq!(env["A"], "x");
        assert_eq!(env["B"], "2");
        assert_eq!(env["C"], "true");
        assert!(str_map(&props(json!({ "env": { "A": [] } })), "env").is_err());
    }
}
