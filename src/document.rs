use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Namespace for document ids; fixed so ids stay stable across runs.
const DOCUMENT_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a8e_93d4_4b57_a0e2_5c7d_19b3_e844);

/// One flat, indexable record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub index: String,
    pub doc_type: String,
    pub id: String,
    pub body: IndexMap<String, Value>,
}

impl Document {
    pub fn new(index: &str, doc_type: &str, id: String) -> Self {
        Self {
            index: index.to_string(),
            doc_type: doc_type.to_string(),
            id,
            body: IndexMap::new(),
        }
    }

    /// Inserts `value` under `key`, skipping `None`.
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(Value::Null) => {}
            Ok(v) => {
                self.body.insert(key.to_string(), v);
            }
            Err(e) => log::warn!("{}:Could not encode field {}: {}", self.id, key, e),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }
}

/// Deterministic id for the `sequence`-th document of one result.
pub fn stable_id(msm_id: u64, prb_id: u32, sequence: usize, timestamp: i64) -> String {
    let name = format!("{}:{}:{}:{}", msm_id, prb_id, sequence, timestamp);
    Uuid::new_v5(&DOCUMENT_NAMESPACE, name.as_bytes()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        let a = stable_id(1001, 42, 0, 1_700_000_000);
        assert_eq!(a, stable_id(1001, 42, 0, 1_700_000_000));
        assert_ne!(a, stable_id(1001, 42, 1, 1_700_000_000));
        assert_ne!(a, stable_id(1001, 43, 0, 1_700_000_000));
    }

    #[test]
    fn test_set_skips_none_and_keeps_order() {
        let mut doc = Document::new("idx", "dns-results", "id".to_string());
        doc.set("b", 1);
        doc.set("missing", Option::<u32>::None);
        doc.set("a", "x");
        let keys: Vec<&str> = doc.body.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
