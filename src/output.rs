use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::paths;

/// Writes the `id -> text` mapping as pretty JSON, replacing `path` atomically.
pub fn write_mapping(path: &Path, mapping: &BTreeMap<String, String>) -> Result<()> {
    let mut content =
        serde_json::to_string_pretty(mapping).with_context(|| "failed to encode output")?;
    content.push('\n');
    paths::write_atomic(path, content.as_bytes())
        .with_context(|| format!("failed to write output: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_sorted_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("translations.json");
        let mapping = BTreeMap::from([
            ("s2".to_string(), "Au revoir {i}fin{/i}".to_string()),
            ("s1".to_string(), "Bonjour [Name]".to_string()),
        ]);
        write_mapping(&path, &mapping).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        insta::assert_snapshot!(written, @r#"
        {
          "s1": "Bonjour [Name]",
          "s2": "Au revoir {i}fin{/i}"
        }
        "#);
    }
}
