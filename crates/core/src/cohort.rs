use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::atlas::{Atlas, AtlasRepository};
use crate::config::ParameterSet;
use crate::discovery::{DatasetQuery, SessionData, SubjectData};
use crate::graph::{ExecutionContext, Link, Workflow};
use crate::node::{path_value, Node};
use crate::procedures::anatomical::init_anatomical_wf;
use crate::procedures::tractography::init_diffusion_wf;

/// Outcome of building one subject's subgraph. With fault isolation
/// enabled, a failed subject is recorded here instead of aborting the
/// cohort.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubjectOutcome {
    Built {
        subject_id: String,
        sessions: usize,
        log_dir: PathBuf,
    },
    Skipped {
        subject_id: String,
        reason: String,
    },
}

impl SubjectOutcome {
    pub fn subject_id(&self) -> &str {
        match self {
            SubjectOutcome::Built { subject_id, .. } => subject_id,
            SubjectOutcome::Skipped { subject_id, .. } => subject_id,
        }
    }

    pub fn is_built(&self) -> bool {
        matches!(self, SubjectOutcome::Built { .. })
    }
}

/// Structured provenance attached to the root workflow handoff.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub pipeline: String,
    pub version: String,
    pub run_id: String,
    pub atlas: String,
    pub outcomes: Vec<SubjectOutcome>,
}

/// The sole output of the core: a fully wired, validated root workflow
/// plus the per-subject build record.
#[derive(Debug)]
pub struct CohortBuild {
    pub workflow: Workflow,
    pub provenance: Provenance,
}

impl CohortBuild {
    pub fn outcomes(&self) -> &[SubjectOutcome] {
        &self.provenance.outcomes
    }

    pub fn built_subjects(&self) -> usize {
        self.outcomes()
            .iter()
            .filter(|outcome| outcome.is_built())
            .count()
    }
}

fn root_workflow_name(version: &str) -> String {
    let mut parts = version.split('.');
    let major = parts.next().unwrap_or("0");
    let minor = parts.next().unwrap_or("0");
    format!("dwiflow_{major}_{minor}_wf")
}

fn subject_log_dir(params: &ParameterSet, subject_id: &str) -> PathBuf {
    params
        .output_dir
        .join(format!("sub-{subject_id}"))
        .join("log")
        .join(&params.run_id)
}

/// Top-level driver: assembles one subject subgraph per participant and
/// merges them into the root workflow.
///
/// Build-configuration errors (atlas, participant list, filtering
/// criteria) are fatal before any subgraph is built. Per-subject
/// failures follow the configured policy: abort when
/// `stop_on_first_crash`, otherwise skip the subject with a diagnostic
/// and continue the cohort.
pub fn init_cohort_wf(
    params: &ParameterSet,
    dataset: &dyn DatasetQuery,
    atlases: &AtlasRepository,
) -> Result<CohortBuild> {
    params.validate()?;
    let atlas = atlases.resolve(&params.atlas)?;

    let mut root = Workflow::new(&root_workflow_name(env!("CARGO_PKG_VERSION")));
    let mut outcomes = Vec::new();

    for subject_id in params.normalized_participants() {
        match build_subject(&subject_id, &atlas, dataset, params) {
            Ok((mut subject_wf, sessions)) => {
                let log_dir = subject_log_dir(params, &subject_id);
                fs::create_dir_all(&log_dir).with_context(|| {
                    format!(
                        "subject '{subject_id}': failed to create log directory {}",
                        log_dir.display()
                    )
                })?;
                params.save_to_path(&log_dir.join("dwiflow.toml"))?;
                subject_wf.set_execution_context(Arc::new(ExecutionContext {
                    crashdump_dir: log_dir.clone(),
                    log_dir: log_dir.clone(),
                }));

                if params.write_graph {
                    let dot_path = params
                        .work_dir
                        .join(format!("{}.dot", subject_wf.name()));
                    fs::create_dir_all(&params.work_dir).with_context(|| {
                        format!(
                            "failed to create work directory {}",
                            params.work_dir.display()
                        )
                    })?;
                    fs::write(&dot_path, subject_wf.to_dot()).with_context(|| {
                        format!("failed to write graph diagram {}", dot_path.display())
                    })?;
                }

                let instance_name = subject_wf.name().to_string();
                root.add_subflow(&instance_name, subject_wf)?;
                info!(subject = %subject_id, sessions, "subject workflow built");
                outcomes.push(SubjectOutcome::Built {
                    subject_id,
                    sessions,
                    log_dir,
                });
            }
            Err(error) => {
                if params.stop_on_first_crash {
                    return Err(error.context(format!(
                        "failed to build workflow for subject '{subject_id}'"
                    )));
                }
                warn!(subject = %subject_id, "skipping subject: {error:#}");
                outcomes.push(SubjectOutcome::Skipped {
                    subject_id,
                    reason: format!("{error:#}"),
                });
            }
        }
    }

    root.validate()?;

    Ok(CohortBuild {
        workflow: root,
        provenance: Provenance {
            pipeline: "dwiflow".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_id: params.run_id.clone(),
            atlas: atlas.name.clone(),
            outcomes,
        },
    })
}

/// Builds one subject subgraph: the pre-populated subject input node,
/// the nested anatomical workflow, and (unless `anat_only`) one nested
/// session subgraph per discovered scan, each wired to the same shared
/// anatomical outputs.
pub fn init_single_subject_wf(
    subject_id: &str,
    atlas: &Atlas,
    subject_data: &SubjectData,
    sessions: &[SessionData],
    params: &ParameterSet,
) -> Result<Workflow> {
    let mut workflow = Workflow::new(&format!("single_subject_{subject_id}_wf"));

    workflow.add_node(
        Node::identity(
            "inputnode_subject",
            &[
                "base_directory",
                "anatomical_reference",
                "anatomical_brain_mask",
                "mni_to_native_transform",
                "gm_probabilistic_segmentation",
                "atlas_name",
                "atlas_nifti_file",
                "atlas_table",
                "label_column",
                "subject_id",
            ],
        )
        .with_param("base_directory", path_value(&params.output_dir))
        .with_param("anatomical_reference", path_value(&subject_data.anatomical_reference))
        .with_param(
            "anatomical_brain_mask",
            path_value(&subject_data.anatomical_brain_mask),
        )
        .with_param(
            "mni_to_native_transform",
            path_value(&subject_data.mni_to_native_transform),
        )
        .with_param(
            "gm_probabilistic_segmentation",
            path_value(&subject_data.gm_probabilistic_segmentation),
        )
        .with_param("atlas_name", atlas.name.as_str())
        .with_param("atlas_nifti_file", path_value(&atlas.parcellation))
        .with_param("atlas_table", path_value(&atlas.label_table))
        .with_param("label_column", atlas.label_column.as_str())
        .with_param("subject_id", subject_id),
    )?;

    workflow.add_subflow("anatomical_wf", init_anatomical_wf("anatomical_wf")?)?;
    workflow.connect_all(&[
        Link::new(
            "inputnode_subject",
            "base_directory",
            "anatomical_wf",
            "inputnode.base_directory",
        ),
        Link::new(
            "inputnode_subject",
            "atlas_name",
            "anatomical_wf",
            "inputnode.atlas_name",
        ),
        Link::new(
            "inputnode_subject",
            "atlas_nifti_file",
            "anatomical_wf",
            "inputnode.atlas_nifti_file",
        ),
        Link::new(
            "inputnode_subject",
            "anatomical_reference",
            "anatomical_wf",
            "inputnode.anatomical_reference",
        ),
        Link::new(
            "inputnode_subject",
            "mni_to_native_transform",
            "anatomical_wf",
            "inputnode.mni_to_native_transform",
        ),
        Link::new(
            "inputnode_subject",
            "gm_probabilistic_segmentation",
            "anatomical_wf",
            "inputnode.gm_probabilistic_segmentation",
        ),
        Link::new(
            "inputnode_subject",
            "subject_id",
            "anatomical_wf",
            "inputnode.subject_id",
        ),
    ])?;

    if params.anat_only {
        return Ok(workflow);
    }

    // Anatomical results are broadcast read-only to every session
    // subgraph; they are computed exactly once per subject.
    for session in sessions {
        let session_wf = init_diffusion_wf(session, params)?;
        let instance_name = session_wf.name().to_string();
        workflow.add_subflow(&instance_name, session_wf)?;
        workflow.connect_all(&[
            Link::new(
                "inputnode_subject",
                "base_directory",
                &instance_name,
                "inputnode.base_directory",
            ),
            Link::new(
                "inputnode_subject",
                "atlas_name",
                &instance_name,
                "inputnode.atlas_name",
            ),
            Link::new(
                "inputnode_subject",
                "anatomical_reference",
                &instance_name,
                "inputnode.t1w_file",
            ),
            Link::new(
                "inputnode_subject",
                "anatomical_brain_mask",
                &instance_name,
                "inputnode.t1w_mask_file",
            ),
            Link::new(
                "anatomical_wf",
                "outputnode.whole_brain_parcellation",
                &instance_name,
                "inputnode.whole_brain_t1w_parcellation",
            ),
            Link::new(
                "anatomical_wf",
                "outputnode.gm_cropped_parcellation",
                &instance_name,
                "inputnode.gm_cropped_t1w_parcellation",
            ),
        ])?;
    }

    Ok(workflow)
}

fn build_subject(
    subject_id: &str,
    atlas: &Atlas,
    dataset: &dyn DatasetQuery,
    params: &ParameterSet,
) -> Result<(Workflow, usize)> {
    let (subject_data, sessions) = dataset
        .collect(subject_id)
        .with_context(|| format!("discovery failed for subject '{subject_id}'"))?;
    let workflow = init_single_subject_wf(subject_id, atlas, &subject_data, &sessions, params)?;
    let session_count = if params.anat_only { 0 } else { sessions.len() };
    Ok((workflow, session_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::bail;

    struct StaticDataset {
        sessions_per_subject: HashMap<String, usize>,
    }

    impl StaticDataset {
        fn new(subjects: &[(&str, usize)]) -> Self {
            Self {
                sessions_per_subject: subjects
                    .iter()
                    .map(|(subject_id, sessions)| (subject_id.to_string(), *sessions))
                    .collect(),
            }
        }
    }

    impl DatasetQuery for StaticDataset {
        fn collect(&self, participant_label: &str) -> Result<(SubjectData, Vec<SessionData>)> {
            let Some(session_count) = self.sessions_per_subject.get(participant_label) else {
                bail!("subject '{participant_label}': no directory in test dataset");
            };
            let prefix = format!("sub-{participant_label}");
            let subject_data = SubjectData {
                anatomical_reference: PathBuf::from(format!("{prefix}_desc-preproc_T1w.nii.gz")),
                anatomical_brain_mask: PathBuf::from(format!("{prefix}_desc-brain_mask.nii.gz")),
                mni_to_native_transform: PathBuf::from(format!("{prefix}_xfm.h5")),
                gm_probabilistic_segmentation: PathBuf::from(format!(
                    "{prefix}_label-GM_probseg.nii.gz"
                )),
            };
            let sessions = (1..=*session_count)
                .map(|index| {
                    let session_prefix = format!("{prefix}_ses-{index}");
                    SessionData {
                        session_id: index.to_string(),
                        dwi_nifti: PathBuf::from(format!(
                            "{session_prefix}_desc-preproc_dwi.nii.gz"
                        )),
                        dwi_grad: PathBuf::from(format!("{session_prefix}_desc-preproc_dwi.b")),
                        dwi_reference: PathBuf::from(format!("{session_prefix}_dwiref.nii.gz")),
                        dwi_mask: PathBuf::from(format!(
                            "{session_prefix}_desc-brain_mask.nii.gz"
                        )),
                    }
                })
                .collect();
            Ok((subject_data, sessions))
        }
    }

    fn atlas_repository(root: &Path) -> AtlasRepository {
        let atlas_dir = root.join("brainnetome");
        fs::create_dir_all(&atlas_dir).expect("atlas dir should be created");
        fs::write(
            atlas_dir.join("atlas.toml"),
            "parcellation = \"parcellation.nii.gz\"\n\
             label_table = \"labels.tsv\"\n\
             label_column = \"region_name\"\n",
        )
        .expect("manifest should be written");
        AtlasRepository::new(root)
    }

    fn test_params(output_root: &Path, labels: &[&str]) -> ParameterSet {
        let mut params = ParameterSet::default();
        params.participant_label = labels.iter().map(|label| label.to_string()).collect();
        params.output_dir = output_root.join("dwiflow");
        params.work_dir = output_root.join("work");
        params
    }

    #[test]
    fn test_cohort_of_two_subjects_with_uneven_session_counts() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let params = test_params(dir.path(), &["01", "02"]);
        let dataset = StaticDataset::new(&[("01", 1), ("02", 2)]);
        let atlases = atlas_repository(dir.path());

        let build = init_cohort_wf(&params, &dataset, &atlases).expect("cohort should build");
        assert_eq!(build.workflow.subflow_count(), 2);
        assert_eq!(build.built_subjects(), 2);

        let first = build
            .workflow
            .subflow("single_subject_01_wf")
            .expect("subject 01 subgraph should exist");
        let second = build
            .workflow
            .subflow("single_subject_02_wf")
            .expect("subject 02 subgraph should exist");

        // One anatomical subflow each, plus one session subflow per scan.
        assert_eq!(first.subflow_count(), 2);
        assert_eq!(second.subflow_count(), 3);
        assert!(second.subflow("ses_1_dwi_wf").is_some());
        assert!(second.subflow("ses_2_dwi_wf").is_some());

        // Every session is wired to the subject's single anatomical output.
        for session_name in ["ses_1_dwi_wf", "ses_2_dwi_wf"] {
            assert!(second.links().contains(&Link::new(
                "anatomical_wf",
                "outputnode.whole_brain_parcellation",
                session_name,
                "inputnode.whole_brain_t1w_parcellation",
            )));
        }
    }

    #[test]
    fn test_anat_only_builds_zero_session_subgraphs() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut params = test_params(dir.path(), &["01"]);
        params.anat_only = true;
        let dataset = StaticDataset::new(&[("01", 3)]);
        let atlases = atlas_repository(dir.path());

        let build = init_cohort_wf(&params, &dataset, &atlases).expect("cohort should build");
        let subject = build
            .workflow
            .subflow("single_subject_01_wf")
            .expect("subject subgraph should exist");
        assert_eq!(subject.subflow_count(), 1);
        assert!(subject.subflow("anatomical_wf").is_some());
        assert_eq!(
            build.outcomes(),
            &[SubjectOutcome::Built {
                subject_id: "01".to_string(),
                sessions: 0,
                log_dir: params.output_dir.join("sub-01/log").join(&params.run_id),
            }]
        );
    }

    #[test]
    fn test_failed_subject_is_skipped_and_cohort_continues() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let params = test_params(dir.path(), &["01", "99", "02"]);
        let dataset = StaticDataset::new(&[("01", 1), ("02", 1)]);
        let atlases = atlas_repository(dir.path());

        let build = init_cohort_wf(&params, &dataset, &atlases).expect("cohort should build");
        assert_eq!(build.workflow.subflow_count(), 2);
        assert_eq!(build.built_subjects(), 2);

        let skipped = &build.outcomes()[1];
        assert_eq!(skipped.subject_id(), "99");
        match skipped {
            SubjectOutcome::Skipped { reason, .. } => {
                assert!(reason.contains("subject '99'"));
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_on_first_crash_aborts_the_build() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut params = test_params(dir.path(), &["99", "01"]);
        params.stop_on_first_crash = true;
        let dataset = StaticDataset::new(&[("01", 1)]);
        let atlases = atlas_repository(dir.path());

        let err = init_cohort_wf(&params, &dataset, &atlases)
            .expect_err("failing subject should abort");
        assert!(err
            .to_string()
            .contains("failed to build workflow for subject '99'"));
    }

    #[test]
    fn test_unresolved_atlas_is_fatal_before_any_subject_builds() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut params = test_params(dir.path(), &["01"]);
        params.atlas = "unknown".to_string();
        let dataset = StaticDataset::new(&[("01", 1)]);
        let atlases = atlas_repository(dir.path());

        let err = init_cohort_wf(&params, &dataset, &atlases)
            .expect_err("unknown atlas should be fatal");
        assert!(err.to_string().contains("could not resolve atlas 'unknown'"));
    }

    #[test]
    fn test_bad_sift_configuration_is_fatal_before_any_subject_builds() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut params = test_params(dir.path(), &["01"]);
        params.tractography.sift_filtering = true;
        let dataset = StaticDataset::new(&[("01", 1)]);
        let atlases = atlas_repository(dir.path());

        let err = init_cohort_wf(&params, &dataset, &atlases)
            .expect_err("missing termination criterion should be fatal");
        assert!(err.to_string().contains("must be set"));
    }

    #[test]
    fn test_provenance_and_log_dir_are_persisted_per_subject() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let params = test_params(dir.path(), &["01"]);
        let dataset = StaticDataset::new(&[("01", 1)]);
        let atlases = atlas_repository(dir.path());

        let build = init_cohort_wf(&params, &dataset, &atlases).expect("cohort should build");
        let log_dir = params.output_dir.join("sub-01/log").join(&params.run_id);
        assert!(log_dir.is_dir());

        let persisted = ParameterSet::load_from_path(&log_dir.join("dwiflow.toml"))
            .expect("provenance parameters should load");
        assert_eq!(persisted, params);

        let subject = build
            .workflow
            .subflow("single_subject_01_wf")
            .expect("subject subgraph should exist");
        let context = subject
            .execution_context()
            .expect("execution context should be attached");
        assert_eq!(context.crashdump_dir, log_dir);
        assert_eq!(build.provenance.atlas, "brainnetome");
        assert_eq!(build.provenance.run_id, params.run_id);
    }

    #[test]
    fn test_write_graph_emits_subject_diagram() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let mut params = test_params(dir.path(), &["01"]);
        params.write_graph = true;
        let dataset = StaticDataset::new(&[("01", 1)]);
        let atlases = atlas_repository(dir.path());

        init_cohort_wf(&params, &dataset, &atlases).expect("cohort should build");
        let dot_path = params.work_dir.join("single_subject_01_wf.dot");
        let dot = fs::read_to_string(&dot_path).expect("diagram should be written");
        assert!(dot.contains("subgraph \"cluster_anatomical_wf\""));
    }

    #[test]
    fn test_root_workflow_name_tracks_version() {
        assert_eq!(root_workflow_name("0.1.0"), "dwiflow_0_1_wf");
        assert_eq!(root_workflow_name("2.3"), "dwiflow_2_3_wf");
    }
}
