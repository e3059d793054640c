use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};

use dwiflow_core::atlas::AtlasRepository;
use dwiflow_core::cohort::{init_cohort_wf, SubjectOutcome};
use dwiflow_core::config::ParameterSet;
use dwiflow_core::discovery::DerivativesLayout;
use dwiflow_core::logging::{init_logging, LoggingOptions};

#[derive(Debug, Parser)]
#[command(
    name = "dwiflow",
    version,
    about = "Assemble post-processing workflows for preprocessed diffusion MRI derivatives"
)]
struct Cli {
    #[arg(help = "Root of the upstream preprocessed derivatives dataset")]
    derivatives_dir: PathBuf,

    #[arg(help = "Output directory for post-processing derivatives")]
    output_dir: PathBuf,

    #[arg(
        long = "participant-label",
        value_name = "LABEL",
        help = "Participant to process (repeatable); overrides the parameter file"
    )]
    participant_label: Vec<String>,

    #[arg(
        long,
        value_name = "FILE",
        help = "TOML parameter file; explicit flags override its values"
    )]
    config: Option<PathBuf>,

    #[arg(long, value_name = "NAME", help = "Parcellation atlas name")]
    atlas: Option<String>,

    #[arg(
        long,
        value_name = "DIR",
        default_value = "atlases",
        help = "Directory of atlas manifests"
    )]
    atlas_dir: PathBuf,

    #[arg(long, value_name = "DIR", help = "Working directory")]
    work_dir: Option<PathBuf>,

    #[arg(long, help = "Build anatomical workflows only, skip diffusion sessions")]
    anat_only: bool,

    #[arg(long, help = "Write a Graphviz diagram per subject workflow")]
    write_graph: bool,

    #[arg(long, help = "Abort the whole build on the first failing subject")]
    stop_on_first_crash: bool,

    #[arg(long, value_name = "ID", help = "Run identifier (defaults to a fresh one)")]
    run_id: Option<String>,

    #[arg(long, value_name = "N", help = "Threads passed to external tools")]
    nthreads: Option<usize>,

    #[arg(long, value_name = "NAME", help = "Tractography algorithm")]
    tract_algorithm: Option<String>,

    #[arg(long, value_name = "N", help = "Number of streamlines to select")]
    n_tracts: Option<u64>,

    #[arg(long, value_name = "DEG", help = "Maximum streamline angle")]
    angle: Option<f64>,

    #[arg(long, help = "Enable SIFT streamline filtering")]
    sift: bool,

    #[arg(long, value_name = "N", help = "SIFT termination: absolute streamline count")]
    sift_term_number: Option<u64>,

    #[arg(long, value_name = "RATIO", help = "SIFT termination: ratio of streamlines kept")]
    sift_term_ratio: Option<f64>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let params = resolve_parameter_set(&cli)?;

    let _guard = init_logging(&LoggingOptions {
        verbose: cli.verbose,
        cli_log_filter: cli.log_filter.clone(),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        log_dir: Some(params.work_dir.join("logs")),
    })?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        run_id = %params.run_id,
        derivatives = %cli.derivatives_dir.display(),
        output = %params.output_dir.display(),
        participants = ?params.participant_label,
        "building dwiflow workflow"
    );

    let dataset = DerivativesLayout::new(&cli.derivatives_dir);
    let atlases = AtlasRepository::new(&cli.atlas_dir);
    let build = init_cohort_wf(&params, &dataset, &atlases)?;

    info!(
        "workflow graph with {} nodes built successfully",
        build.workflow.node_count()
    );
    for outcome in build.outcomes() {
        if let SubjectOutcome::Skipped { subject_id, reason } = outcome {
            warn!(subject = %subject_id, "subject skipped: {reason}");
        }
    }

    if params.write_graph {
        let dot_path = params
            .work_dir
            .join(format!("{}.dot", build.workflow.name()));
        fs::write(&dot_path, build.workflow.to_dot())
            .with_context(|| format!("failed to write graph diagram {}", dot_path.display()))?;
        info!("graph diagram written to {}", dot_path.display());
    }

    if build.built_subjects() == 0 {
        bail!("no subject workflow could be built");
    }
    Ok(())
}

fn resolve_parameter_set(cli: &Cli) -> Result<ParameterSet> {
    let mut params = match &cli.config {
        Some(path) => ParameterSet::load_from_path(path)?,
        None => ParameterSet::default(),
    };

    params.output_dir = cli.output_dir.clone();
    if !cli.participant_label.is_empty() {
        params.participant_label = cli.participant_label.clone();
    }
    if let Some(atlas) = &cli.atlas {
        params.atlas = atlas.clone();
    }
    if let Some(work_dir) = &cli.work_dir {
        params.work_dir = work_dir.clone();
    }
    if let Some(run_id) = &cli.run_id {
        params.run_id = run_id.clone();
    }
    if let Some(nthreads) = cli.nthreads {
        params.omp_nthreads = nthreads;
    }
    if cli.anat_only {
        params.anat_only = true;
    }
    if cli.write_graph {
        params.write_graph = true;
    }
    if cli.stop_on_first_crash {
        params.stop_on_first_crash = true;
    }

    let tractography = &mut params.tractography;
    if let Some(algorithm) = &cli.tract_algorithm {
        tractography.algorithm = algorithm.clone();
    }
    if let Some(n_tracts) = cli.n_tracts {
        tractography.n_tracts = n_tracts;
    }
    if let Some(angle) = cli.angle {
        tractography.angle = angle;
    }
    if cli.sift {
        tractography.sift_filtering = true;
    }
    if let Some(number) = cli.sift_term_number {
        tractography.sift_term_number = Some(number);
    }
    if let Some(ratio) = cli.sift_term_ratio {
        tractography.sift_term_ratio = Some(ratio);
    }

    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(
            std::iter::once("dwiflow").chain(args.iter().copied()),
        )
        .expect("arguments should parse")
    }

    #[test]
    fn test_cli_flags_override_parameter_file() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let config_path = dir.path().join("params.toml");
        let mut file_params = ParameterSet::default();
        file_params.participant_label = vec!["01".to_string()];
        file_params.atlas = "schaefer400".to_string();
        file_params.omp_nthreads = 2;
        file_params.save_to_path(&config_path).expect("parameter file should save");

        let cli = parse(&[
            "derivatives",
            "out",
            "--config",
            config_path.to_str().expect("path should be utf-8"),
            "--participant-label",
            "02",
            "--nthreads",
            "4",
            "--sift",
            "--sift-term-number",
            "500000",
        ]);
        let params = resolve_parameter_set(&cli).expect("parameters should resolve");

        assert_eq!(params.participant_label, vec!["02"]);
        assert_eq!(params.atlas, "schaefer400");
        assert_eq!(params.omp_nthreads, 4);
        assert_eq!(params.output_dir, PathBuf::from("out"));
        assert!(params.tractography.sift_filtering);
        assert_eq!(params.tractography.sift_term_number, Some(500_000));
    }

    #[test]
    fn test_repeatable_participant_label() {
        let cli = parse(&[
            "derivatives",
            "out",
            "--participant-label",
            "01",
            "--participant-label",
            "02",
        ]);
        let params = resolve_parameter_set(&cli).expect("parameters should resolve");
        assert_eq!(params.participant_label, vec!["01", "02"]);
    }

    #[test]
    fn test_defaults_survive_without_config_file() {
        let cli = parse(&["derivatives", "out"]);
        let params = resolve_parameter_set(&cli).expect("parameters should resolve");
        assert_eq!(params.atlas, "brainnetome");
        assert!(!params.anat_only);
        assert_eq!(params.tractography.algorithm, "SD_Stream");
    }
}
