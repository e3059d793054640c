use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// A resolved parcellation atlas: the template-space image plus its
/// label table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    pub name: String,
    pub parcellation: PathBuf,
    pub label_table: PathBuf,
    pub label_column: String,
}

#[derive(Debug, Deserialize)]
struct AtlasManifest {
    parcellation: PathBuf,
    label_table: PathBuf,
    label_column: String,
}

/// Resolves atlas names against a directory of atlas manifests
/// (`<root>/<name>/atlas.toml`). An unresolvable atlas is a fatal
/// build-configuration error.
#[derive(Debug, Clone)]
pub struct AtlasRepository {
    root: PathBuf,
}

impl AtlasRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, name: &str) -> Result<Atlas> {
        let atlas_dir = self.root.join(name);
        let manifest_path = atlas_dir.join("atlas.toml");
        if !manifest_path.is_file() {
            bail!(
                "could not resolve atlas '{name}': no manifest at {}",
                manifest_path.display()
            );
        }

        let raw = fs::read_to_string(&manifest_path).with_context(|| {
            format!("failed to read atlas manifest: {}", manifest_path.display())
        })?;
        let manifest: AtlasManifest = toml::from_str(&raw).with_context(|| {
            format!(
                "failed to parse atlas manifest: {}",
                manifest_path.display()
            )
        })?;

        Ok(Atlas {
            name: name.to_string(),
            parcellation: resolve_against(&atlas_dir, manifest.parcellation),
            label_table: resolve_against(&atlas_dir, manifest.label_table),
            label_column: manifest.label_column,
        })
    }
}

fn resolve_against(atlas_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        atlas_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(root: &Path, name: &str) {
        let atlas_dir = root.join(name);
        fs::create_dir_all(&atlas_dir).expect("atlas dir should be created");
        fs::write(
            atlas_dir.join("atlas.toml"),
            "parcellation = \"parcellation.nii.gz\"\n\
             label_table = \"labels.tsv\"\n\
             label_column = \"region_name\"\n",
        )
        .expect("manifest should be written");
    }

    #[test]
    fn test_resolve_returns_paths_relative_to_atlas_dir() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        write_manifest(dir.path(), "brainnetome");

        let repository = AtlasRepository::new(dir.path());
        let atlas = repository
            .resolve("brainnetome")
            .expect("atlas should resolve");

        assert_eq!(atlas.name, "brainnetome");
        assert_eq!(
            atlas.parcellation,
            dir.path().join("brainnetome/parcellation.nii.gz")
        );
        assert_eq!(atlas.label_table, dir.path().join("brainnetome/labels.tsv"));
        assert_eq!(atlas.label_column, "region_name");
    }

    #[test]
    fn test_unresolvable_atlas_is_a_fatal_error() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let repository = AtlasRepository::new(dir.path());

        let err = repository
            .resolve("schaefer400")
            .expect_err("missing atlas should error");
        assert!(err
            .to_string()
            .contains("could not resolve atlas 'schaefer400'"));
    }
}
