use anyhow::Result;

use crate::config::{ParameterSet, SiftTermination};
use crate::derivatives::DerivativeDescriptor;
use crate::discovery::SessionData;
use crate::graph::{Link, Workflow, INPUTNODE, OUTPUTNODE};
use crate::node::{path_value, Node};
use crate::procedures::tensor::init_tensor_wf;

/// Normalizes step and length limits to the first spatial voxel
/// dimension of the input image. The graph carries this as a function
/// node the execution engine evaluates against the DWI header.
pub fn scale_tractography_parameters(
    pixdim: f64,
    stepscale: f64,
    lenscale_min: f64,
    lenscale_max: f64,
) -> (f64, f64, f64) {
    (
        stepscale * pixdim,
        lenscale_min * pixdim,
        lenscale_max * pixdim,
    )
}

/// Builds the MRtrix tractography workflow: response function, per-tissue
/// fiber-orientation distributions, joint normalization, 5-tissue-type
/// segmentation, voxel-size-scaled step/length parameters, streamline
/// generation, an unfiltered-tract sink and, when enabled, SIFT
/// filtering.
///
/// Contract: inputnode `[base_directory, dwi_file, dwi_reference,
/// dwi_grad, dwi_mask_file, t1w_file, t1w_mask_file]`, outputnode
/// `[tck_file]` (wired from the filter when filtering is enabled).
pub fn init_mrtrix_tractography_wf(name: &str, params: &ParameterSet) -> Result<Workflow> {
    let tractography = &params.tractography;
    // Resolved before any node exists so a bad filtering configuration
    // is a build-configuration error, not a graph-integrity one.
    let sift_criterion = if tractography.sift_filtering {
        Some(tractography.sift_criterion()?)
    } else {
        None
    };

    let mut workflow = Workflow::new(name);

    workflow.add_node(Node::identity(
        INPUTNODE,
        &[
            "base_directory",
            "dwi_file",
            "dwi_reference",
            "dwi_grad",
            "dwi_mask_file",
            "t1w_file",
            "t1w_mask_file",
        ],
    ))?;
    workflow.add_node(Node::identity(OUTPUTNODE, &["tck_file"]))?;

    workflow.add_node(
        Node::tool(
            "dwi2response",
            "dwi2response",
            &["in_file", "grad_file", "in_mask"],
            &["wm_file", "gm_file", "csf_file", "voxels_file"],
        )
        .with_param("algorithm", "dhollander")
        .with_param("wm_file", "wm.txt")
        .with_param("gm_file", "gm.txt")
        .with_param("csf_file", "csf.txt")
        .with_param("voxels_file", "voxels.mif"),
    )?;
    workflow.add_node(
        Node::tool(
            "dwi2fod",
            "dwi2fod",
            &["in_file", "grad_file", "in_mask", "wm_txt", "gm_txt", "csf_txt"],
            &["wm_odf", "gm_odf", "csf_odf"],
        )
        .with_param("algorithm", "msmt_csd"),
    )?;
    workflow.add_node(Node::tool(
        "mtnormalise",
        "mtnormalise",
        &["in_wm_fod", "in_gm_fod", "in_csf_fod", "in_mask"],
        &["out_wm_fod", "out_gm_fod", "out_csf_fod"],
    ))?;
    workflow.add_node(
        Node::tool(
            "gen_5tt",
            "5ttgen",
            &["in_file", "in_mask"],
            &["out_file"],
        )
        .with_param("algorithm", "fsl"),
    )?;
    workflow.add_node(
        Node::function(
            "estimate_tractography_parameters",
            "scale_tractography_parameters",
            &["in_file", "stepscale", "lenscale_min", "lenscale_max"],
            &["stepscale", "lenscale_min", "lenscale_max"],
        )
        .with_param("stepscale", tractography.stepscale)
        .with_param("lenscale_min", tractography.lenscale_min)
        .with_param("lenscale_max", tractography.lenscale_max),
    )?;
    workflow.add_node(
        Node::tool(
            "tckgen",
            "tckgen",
            &[
                "in_file",
                "act_file",
                "seed_image",
                "step_size",
                "min_length",
                "max_length",
            ],
            &["out_file"],
        )
        .with_param("algorithm", tractography.algorithm.as_str())
        .with_param("select", tractography.n_tracts)
        .with_param("angle", tractography.angle),
    )?;
    workflow.add_node(Node::derivative_sink(
        "ds_unfiltered_tracts",
        DerivativeDescriptor::new("tracts", "tck")
            .with_desc("unfiltered")
            .with_reconstruction("mrtrix"),
    ))?;

    workflow.connect_all(&[
        Link::new(INPUTNODE, "dwi_file", "dwi2response", "in_file"),
        Link::new(INPUTNODE, "dwi_grad", "dwi2response", "grad_file"),
        Link::new(INPUTNODE, "dwi_mask_file", "dwi2response", "in_mask"),
        Link::new(INPUTNODE, "dwi_file", "dwi2fod", "in_file"),
        Link::new(INPUTNODE, "dwi_grad", "dwi2fod", "grad_file"),
        Link::new(INPUTNODE, "dwi_mask_file", "dwi2fod", "in_mask"),
        Link::new("dwi2response", "wm_file", "dwi2fod", "wm_txt"),
        Link::new("dwi2response", "gm_file", "dwi2fod", "gm_txt"),
        Link::new("dwi2response", "csf_file", "dwi2fod", "csf_txt"),
        Link::new("dwi2fod", "wm_odf", "mtnormalise", "in_wm_fod"),
        Link::new("dwi2fod", "gm_odf", "mtnormalise", "in_gm_fod"),
        Link::new("dwi2fod", "csf_odf", "mtnormalise", "in_csf_fod"),
        Link::new(INPUTNODE, "dwi_mask_file", "mtnormalise", "in_mask"),
        Link::new(INPUTNODE, "t1w_file", "gen_5tt", "in_file"),
        Link::new(INPUTNODE, "t1w_mask_file", "gen_5tt", "in_mask"),
        Link::new(
            INPUTNODE,
            "dwi_file",
            "estimate_tractography_parameters",
            "in_file",
        ),
        Link::new("mtnormalise", "out_wm_fod", "tckgen", "in_file"),
        Link::new("gen_5tt", "out_file", "tckgen", "act_file"),
        Link::new(INPUTNODE, "dwi_mask_file", "tckgen", "seed_image"),
        Link::new(
            "estimate_tractography_parameters",
            "stepscale",
            "tckgen",
            "step_size",
        ),
        Link::new(
            "estimate_tractography_parameters",
            "lenscale_min",
            "tckgen",
            "min_length",
        ),
        Link::new(
            "estimate_tractography_parameters",
            "lenscale_max",
            "tckgen",
            "max_length",
        ),
        Link::new("tckgen", "out_file", "ds_unfiltered_tracts", "in_file"),
        Link::new(
            INPUTNODE,
            "base_directory",
            "ds_unfiltered_tracts",
            "base_directory",
        ),
        Link::new(INPUTNODE, "dwi_file", "ds_unfiltered_tracts", "source_file"),
    ])?;

    if let Some(criterion) = sift_criterion {
        let mut tcksift = Node::tool(
            "tcksift",
            "tcksift",
            &["in_tracks", "in_fod", "act_file"],
            &["out_file"],
        )
        .with_param("fd_scale_gm", true);
        match criterion {
            SiftTermination::Number(number) => tcksift.set_param("term_number", number),
            SiftTermination::Ratio(ratio) => tcksift.set_param("term_ratio", ratio),
        }
        workflow.add_node(tcksift)?;
        workflow.connect_all(&[
            Link::new("tckgen", "out_file", "tcksift", "in_tracks"),
            Link::new("mtnormalise", "out_wm_fod", "tcksift", "in_fod"),
            Link::new("gen_5tt", "out_file", "tcksift", "act_file"),
            Link::new("tcksift", "out_file", OUTPUTNODE, "tck_file"),
        ])?;
    } else {
        workflow.connect_all(&[Link::new("tckgen", "out_file", OUTPUTNODE, "tck_file")])?;
    }

    Ok(workflow)
}

/// Builds one session-level diffusion workflow wrapping tensor
/// estimation and tractography. The per-session file paths arrive as
/// pre-populated parameters on the inputnode; subject-level values
/// (anatomy, atlas, base directory) are wired in by the parent.
///
/// Contract: inputnode `[base_directory, atlas_name, t1w_file,
/// t1w_mask_file, whole_brain_t1w_parcellation,
/// gm_cropped_t1w_parcellation, dwi_nifti, dwi_grad, dwi_reference,
/// dwi_mask]`, outputnode `[tck_file]`.
pub fn init_diffusion_wf(session: &SessionData, params: &ParameterSet) -> Result<Workflow> {
    let name = format!("ses_{}_dwi_wf", session.session_id);
    let mut workflow = Workflow::new(&name);

    workflow.add_node(
        Node::identity(
            INPUTNODE,
            &[
                "base_directory",
                "atlas_name",
                "t1w_file",
                "t1w_mask_file",
                "whole_brain_t1w_parcellation",
                "gm_cropped_t1w_parcellation",
                "dwi_nifti",
                "dwi_grad",
                "dwi_reference",
                "dwi_mask",
            ],
        )
        .with_param("dwi_nifti", path_value(&session.dwi_nifti))
        .with_param("dwi_grad", path_value(&session.dwi_grad))
        .with_param("dwi_reference", path_value(&session.dwi_reference))
        .with_param("dwi_mask", path_value(&session.dwi_mask)),
    )?;
    workflow.add_node(Node::identity(OUTPUTNODE, &["tck_file"]))?;

    workflow.add_subflow("tensor_wf", init_tensor_wf("tensor_wf", params)?)?;
    workflow.add_subflow(
        "tractography_wf",
        init_mrtrix_tractography_wf("tractography_wf", params)?,
    )?;

    workflow.connect_all(&[
        Link::new(
            INPUTNODE,
            "base_directory",
            "tensor_wf",
            "inputnode.base_directory",
        ),
        Link::new(INPUTNODE, "dwi_nifti", "tensor_wf", "inputnode.dwi_nifti"),
        Link::new(INPUTNODE, "dwi_grad", "tensor_wf", "inputnode.dwi_grad"),
        Link::new(INPUTNODE, "dwi_mask", "tensor_wf", "inputnode.dwi_mask"),
        Link::new(
            INPUTNODE,
            "base_directory",
            "tractography_wf",
            "inputnode.base_directory",
        ),
        Link::new(
            INPUTNODE,
            "dwi_nifti",
            "tractography_wf",
            "inputnode.dwi_file",
        ),
        Link::new(
            INPUTNODE,
            "dwi_reference",
            "tractography_wf",
            "inputnode.dwi_reference",
        ),
        Link::new(
            INPUTNODE,
            "dwi_grad",
            "tractography_wf",
            "inputnode.dwi_grad",
        ),
        Link::new(
            INPUTNODE,
            "dwi_mask",
            "tractography_wf",
            "inputnode.dwi_mask_file",
        ),
        Link::new(
            INPUTNODE,
            "t1w_file",
            "tractography_wf",
            "inputnode.t1w_file",
        ),
        Link::new(
            INPUTNODE,
            "t1w_mask_file",
            "tractography_wf",
            "inputnode.t1w_mask_file",
        ),
        Link::new(
            "tractography_wf",
            "outputnode.tck_file",
            OUTPUTNODE,
            "tck_file",
        ),
    ])?;

    Ok(workflow)
}
