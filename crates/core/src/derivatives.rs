use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Output-naming policy for a derivative sink. The persisted path is a
/// pure function of the source file's `sub-`/`ses-` entities plus these
/// fields; no other state is consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivativeDescriptor {
    pub suffix: String,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconstruction: Option<String>,
}

impl DerivativeDescriptor {
    pub fn new(suffix: &str, extension: &str) -> Self {
        Self {
            suffix: suffix.to_string(),
            extension: extension.to_string(),
            desc: None,
            reconstruction: None,
        }
    }

    pub fn with_desc(mut self, desc: &str) -> Self {
        self.desc = Some(desc.to_string());
        self
    }

    pub fn with_reconstruction(mut self, reconstruction: &str) -> Self {
        self.reconstruction = Some(reconstruction.to_string());
        self
    }
}

fn entity_value(file_name: &str, key: &str) -> Option<String> {
    let prefix = format!("{key}-");
    file_name.split('_').find_map(|part| {
        part.strip_prefix(prefix.as_str())
            .map(|value| value.to_string())
    })
}

/// Computes `<output_root>/sub-<id>/[ses-<id>/]<entity-encoded name>` for
/// a source file. The subject entity is required; the session entity is
/// carried over when present.
pub fn derivative_path(
    output_root: &Path,
    source_file: &Path,
    descriptor: &DerivativeDescriptor,
) -> Result<PathBuf> {
    let file_name = source_file
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("source file has no readable name: {}", source_file.display()))?;

    let Some(subject) = entity_value(file_name, "sub") else {
        bail!("source file '{file_name}' carries no sub-<id> entity");
    };
    let session = entity_value(file_name, "ses");

    let mut directory = output_root.join(format!("sub-{subject}"));
    if let Some(session) = &session {
        directory = directory.join(format!("ses-{session}"));
    }

    let mut stem = format!("sub-{subject}");
    if let Some(session) = &session {
        stem.push_str(&format!("_ses-{session}"));
    }
    if let Some(reconstruction) = &descriptor.reconstruction {
        stem.push_str(&format!("_rec-{reconstruction}"));
    }
    if let Some(desc) = &descriptor.desc {
        stem.push_str(&format!("_desc-{desc}"));
    }

    Ok(directory.join(format!(
        "{stem}_{}.{}",
        descriptor.suffix, descriptor.extension
    )))
}

/// Sink contract: compute the output path and create its directory if
/// absent.
pub fn resolve_and_create(
    output_root: &Path,
    source_file: &Path,
    descriptor: &DerivativeDescriptor,
) -> Result<PathBuf> {
    let path = derivative_path(output_root, source_file, descriptor)?;
    let parent = path
        .parent()
        .with_context(|| format!("derivative path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create derivative directory: {}", parent.display()))?;
    Ok(path)
}
