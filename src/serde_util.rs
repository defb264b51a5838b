use serde::{Deserialize, Deserializer};

/// Treats an explicit `null` like a missing field.
///
/// The controller (and Go-encoded msgpack) send `null` for empty lists and
/// strings, which `#[serde(default)]` alone does not accept.
pub fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default, deserialize_with = "nullable")]
        names: Vec<String>,
        #[serde(default, deserialize_with = "nullable")]
        disk: String,
    }

    #[test]
    fn null_and_missing_become_default() {
        let s: Sample = serde_json::from_str(r#"{"names": null}"#).unwrap();
        assert!(s.names.is_empty());
        assert!(s.disk.is_empty());

        let s: Sample = serde_json::from_str(r#"{"names": ["a"], "disk": "C:"}"#).unwrap();
        assert_eq!(s.names, vec!["a".to_string()]);
        assert_eq!(s.disk, "C:");
    }
}
