use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

/// Per-subject anatomical file paths produced by the upstream pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectData {
    pub anatomical_reference: PathBuf,
    pub anatomical_brain_mask: PathBuf,
    pub mni_to_native_transform: PathBuf,
    pub gm_probabilistic_segmentation: PathBuf,
}

/// Per-session diffusion file paths.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub session_id: String,
    pub dwi_nifti: PathBuf,
    pub dwi_grad: PathBuf,
    pub dwi_reference: PathBuf,
    pub dwi_mask: PathBuf,
}

/// Dataset-discovery collaborator: maps a participant label to the
/// structured per-subject and per-session input records. The graph
/// builder only ever sees this boundary.
pub trait DatasetQuery {
    fn collect(&self, participant_label: &str) -> Result<(SubjectData, Vec<SessionData>)>;
}

/// Filesystem implementation over an upstream derivatives tree
/// (`sub-<id>/anat/*` and `sub-<id>/ses-<id>/dwi/*` with fixed
/// suffixes). Sessions come back sorted by id so the assembled graph
/// shape is deterministic.
#[derive(Debug, Clone)]
pub struct DerivativesLayout {
    root: PathBuf,
}

impl DerivativesLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn require(
        path: PathBuf,
        participant_label: &str,
        session_id: Option<&str>,
        role: &str,
    ) -> Result<PathBuf> {
        if path.is_file() {
            return Ok(path);
        }
        match session_id {
            Some(session_id) => bail!(
                "subject '{participant_label}' session '{session_id}': \
                 missing {role} file: {}",
                path.display()
            ),
            None => bail!(
                "subject '{participant_label}': missing {role} file: {}",
                path.display()
            ),
        }
    }

    fn collect_session(
        &self,
        participant_label: &str,
        session_id: &str,
    ) -> Result<SessionData> {
        let dwi_dir = self
            .root
            .join(format!("sub-{participant_label}"))
            .join(format!("ses-{session_id}"))
            .join("dwi");
        let prefix = format!("sub-{participant_label}_ses-{session_id}");

        Ok(SessionData {
            session_id: session_id.to_string(),
            dwi_nifti: Self::require(
                dwi_dir.join(format!("{prefix}_space-T1w_desc-preproc_dwi.nii.gz")),
                participant_label,
                Some(session_id),
                "preprocessed DWI",
            )?,
            dwi_grad: Self::require(
                dwi_dir.join(format!("{prefix}_space-T1w_desc-preproc_dwi.b")),
                participant_label,
                Some(session_id),
                "gradient table",
            )?,
            dwi_reference: Self::require(
                dwi_dir.join(format!("{prefix}_space-T1w_dwiref.nii.gz")),
                participant_label,
                Some(session_id),
                "DWI reference",
            )?,
            dwi_mask: Self::require(
                dwi_dir.join(format!("{prefix}_space-T1w_desc-brain_mask.nii.gz")),
                participant_label,
                Some(session_id),
                "DWI brain mask",
            )?,
        })
    }

    fn session_ids(&self, participant_label: &str) -> Result<Vec<String>> {
        let subject_dir = self.root.join(format!("sub-{participant_label}"));
        let entries = fs::read_dir(&subject_dir).with_context(|| {
            format!(
                "subject '{participant_label}': failed to read {}",
                subject_dir.display()
            )
        })?;

        let mut session_ids = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("subject '{participant_label}': failed to list sessions")
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(session_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("ses-"))
            {
                session_ids.push(session_id.to_string());
            }
        }
        session_ids.sort();
        Ok(session_ids)
    }
}

impl DatasetQuery for DerivativesLayout {
    fn collect(&self, participant_label: &str) -> Result<(SubjectData, Vec<SessionData>)> {
        let subject_dir = self.root.join(format!("sub-{participant_label}"));
        if !subject_dir.is_dir() {
            bail!(
                "subject '{participant_label}': no directory at {}",
                subject_dir.display()
            );
        }

        let anat_dir = subject_dir.join("anat");
        let prefix = format!("sub-{participant_label}");
        let subject_data = SubjectData {
            anatomical_reference: Self::require(
                anat_dir.join(format!("{prefix}_desc-preproc_T1w.nii.gz")),
                participant_label,
                None,
                "anatomical reference",
            )?,
            anatomical_brain_mask: Self::require(
                anat_dir.join(format!("{prefix}_desc-brain_mask.nii.gz")),
                participant_label,
                None,
                "anatomical brain mask",
            )?,
            mni_to_native_transform: Self::require(
                anat_dir.join(format!(
                    "{prefix}_from-MNI152NLin2009cAsym_to-T1w_mode-image_xfm.h5"
                )),
                participant_label,
                None,
                "template-to-native transform",
            )?,
            gm_probabilistic_segmentation: Self::require(
                anat_dir.join(format!("{prefix}_label-GM_probseg.nii.gz")),
                participant_label,
                None,
                "gray-matter probability map",
            )?,
        };

        let sessions = self
            .session_ids(participant_label)?
            .iter()
            .map(|session_id| self.collect_session(participant_label, session_id))
            .collect::<Result<Vec<_>>>()?;

        Ok((subject_data, sessions))
    }
}
