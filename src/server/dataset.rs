//! Dataset files used to pre-populate the backend store.
//!
//! A dataset is a flat mapping of string keys to string values, written as
//! YAML or (with a `.json` extension) JSON.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};

/// Load one dataset file.
pub fn load_dataset(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let entries: BTreeMap<String, String> = if is_json {
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
    } else {
        serde_yaml::from_str(&text)?
    };

    info!("Loaded {} entries from {}", entries.len(), path.display());
    Ok(entries)
}

/// Load several dataset files; later files override earlier ones.
pub fn load_datasets<P: AsRef<Path>>(paths: &[P]) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for path in paths {
        merged.extend(load_dataset(path.as_ref())?);
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("netcache-{}-{}", uuid::Uuid::new_v4(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_yaml_and_json() {
        let yaml = temp_file("a.yaml", "alpha: one\nbeta: two\n");
        let json = temp_file("b.json", r#"{"beta": "zwei", "gamma": "drei"}"#);

        let merged = load_datasets(&[&yaml, &json]).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["alpha"], "one");
        assert_eq!(merged["beta"], "zwei");

        std::fs::remove_file(yaml).unwrap();
        std::fs::remove_file(json).unwrap();
    }

    #[test]
    fn test_bad_files() {
        let json = temp_file("bad.json", "{not json");
        assert_matches!(load_dataset(&json), Err(Error::Config(_)));
        std::fs::remove_file(json).unwrap();

        assert_matches!(
            load_dataset(Path::new("/nonexistent/data.yaml")),
            Err(Error::Io(_))
        );
    }
}
