use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved, immutable build-time configuration. Passed explicitly into
/// every procedure builder; there is no ambient global equivalent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ParameterSet {
    pub participant_label: Vec<String>,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub atlas: String,
    pub anat_only: bool,
    pub write_graph: bool,
    pub stop_on_first_crash: bool,
    pub omp_nthreads: usize,
    pub run_id: String,
    pub tractography: TractographyParams,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TractographyParams {
    pub algorithm: String,
    pub n_tracts: u64,
    pub angle: f64,
    pub stepscale: f64,
    pub lenscale_min: f64,
    pub lenscale_max: f64,
    pub sift_filtering: bool,
    pub sift_term_number: Option<u64>,
    pub sift_term_ratio: Option<f64>,
}

/// Termination criterion for SIFT streamline filtering; exactly one of
/// the two mutually exclusive settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiftTermination {
    Number(u64),
    Ratio(f64),
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            participant_label: Vec::new(),
            output_dir: PathBuf::from("dwiflow"),
            work_dir: PathBuf::from("dwiflow_work"),
            atlas: "brainnetome".to_string(),
            anat_only: false,
            write_graph: false,
            stop_on_first_crash: false,
            omp_nthreads: 1,
            run_id: default_run_id(),
            tractography: TractographyParams::default(),
        }
    }
}

impl Default for TractographyParams {
    fn default() -> Self {
        Self {
            algorithm: "SD_Stream".to_string(),
            n_tracts: 1000,
            angle: 45.0,
            stepscale: 0.5,
            lenscale_min: 30.0,
            lenscale_max: 500.0,
            sift_filtering: false,
            sift_term_number: None,
            sift_term_ratio: None,
        }
    }
}

impl TractographyParams {
    /// Resolves the filtering termination criterion. Only meaningful when
    /// `sift_filtering` is enabled; the two settings are mutually
    /// exclusive and one of them is required.
    pub fn sift_criterion(&self) -> Result<SiftTermination> {
        match (self.sift_term_number, self.sift_term_ratio) {
            (Some(number), None) => Ok(SiftTermination::Number(number)),
            (None, Some(ratio)) => Ok(SiftTermination::Ratio(ratio)),
            (Some(_), Some(_)) => {
                bail!("sift_term_number and sift_term_ratio are mutually exclusive")
            }
            (None, None) => bail!(
                "either sift_term_number or sift_term_ratio must be set \
                 when sift_filtering is enabled"
            ),
        }
    }
}

impl ParameterSet {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read parameter file: {}", path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse parameter TOML: {}", path.display()))
    }

    /// Persists the resolved parameters; also used as the per-subject
    /// provenance record written next to the run's log directory.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("parameter path does not have a parent directory")?;
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create parameter directory: {}", parent.display())
        })?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize parameter TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write parameter file: {}", path.display()))?;
        Ok(())
    }

    /// Build-configuration check run before any subgraph is built.
    pub fn validate(&self) -> Result<()> {
        if self.participant_label.is_empty() {
            bail!("participant list is empty");
        }
        for label in &self.participant_label {
            let stripped = label.strip_prefix("sub-").unwrap_or(label);
            if stripped.is_empty()
                || stripped
                    .chars()
                    .any(|c| c.is_whitespace() || c == '/' || c == '\\')
            {
                bail!("malformed participant label '{label}'");
            }
        }
        if self.tractography.sift_filtering && !self.anat_only {
            self.tractography.sift_criterion()?;
        }
        Ok(())
    }

    /// Participant labels with any `sub-` prefix stripped.
    pub fn normalized_participants(&self) -> Vec<String> {
        self.participant_label
            .iter()
            .map(|label| label.strip_prefix("sub-").unwrap_or(label).to_string())
            .collect()
    }
}

/// Run identifier in the `YYYYMMDD-HHMMSS_<uuid>` shape, unique per
/// invocation and sortable by start time.
pub fn default_run_id() -> String {
    format!("{}_{}", Local::now().format("%Y%m%d-%H%M%S"), Uuid::new_v4())
}
