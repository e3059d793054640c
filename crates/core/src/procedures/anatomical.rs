use anyhow::Result;

use crate::derivatives::DerivativeDescriptor;
use crate::graph::{Link, Workflow, INPUTNODE, OUTPUTNODE};
use crate::node::Node;
use crate::procedures::registration::init_registration_wf;

/// Builds the subject-level anatomical workflow: nests the atlas
/// registration, crops the registered parcellation to gray matter, and
/// sinks both parcellations as subject-space derivatives.
///
/// Contract: inputnode `[base_directory, atlas_name, atlas_nifti_file,
/// anatomical_reference, mni_to_native_transform,
/// gm_probabilistic_segmentation, subject_id]`, outputnode
/// `[whole_brain_parcellation, gm_cropped_parcellation]`.
pub fn init_anatomical_wf(name: &str) -> Result<Workflow> {
    let mut workflow = Workflow::new(name);

    workflow.add_node(Node::identity(
        INPUTNODE,
        &[
            "base_directory",
            "atlas_name",
            "atlas_nifti_file",
            "anatomical_reference",
            "mni_to_native_transform",
            "gm_probabilistic_segmentation",
            "subject_id",
        ],
    ))?;
    workflow.add_node(Node::identity(
        OUTPUTNODE,
        &["whole_brain_parcellation", "gm_cropped_parcellation"],
    ))?;

    workflow.add_subflow("atlas_registration", init_registration_wf("atlas_registration")?)?;

    workflow.add_node(
        Node::function(
            "crop_to_gm",
            "crop_parcellation_to_gm",
            &["parcellation", "gm_probability", "probability_threshold"],
            &["cropped_parcellation"],
        )
        .with_param("probability_threshold", 0.5),
    )?;

    workflow.add_node(Node::derivative_sink(
        "ds_whole_brain_parcellation",
        DerivativeDescriptor::new("dseg", "nii.gz").with_desc("WholeBrain"),
    ))?;
    workflow.add_node(Node::derivative_sink(
        "ds_gm_cropped_parcellation",
        DerivativeDescriptor::new("dseg", "nii.gz").with_desc("GMCropped"),
    ))?;

    workflow.connect_all(&[
        Link::new(
            INPUTNODE,
            "anatomical_reference",
            "atlas_registration",
            "inputnode.anatomical_reference",
        ),
        Link::new(
            INPUTNODE,
            "mni_to_native_transform",
            "atlas_registration",
            "inputnode.mni_to_native_transform",
        ),
        Link::new(
            INPUTNODE,
            "atlas_name",
            "atlas_registration",
            "inputnode.atlas_name",
        ),
        Link::new(
            INPUTNODE,
            "atlas_nifti_file",
            "atlas_registration",
            "inputnode.atlas_nifti_file",
        ),
        Link::new(
            "atlas_registration",
            "outputnode.whole_brain_parcellation",
            "crop_to_gm",
            "parcellation",
        ),
        Link::new(
            INPUTNODE,
            "gm_probabilistic_segmentation",
            "crop_to_gm",
            "gm_probability",
        ),
        Link::new(
            "atlas_registration",
            "outputnode.whole_brain_parcellation",
            OUTPUTNODE,
            "whole_brain_parcellation",
        ),
        Link::new(
            "crop_to_gm",
            "cropped_parcellation",
            OUTPUTNODE,
            "gm_cropped_parcellation",
        ),
        Link::new(
            "atlas_registration",
            "outputnode.whole_brain_parcellation",
            "ds_whole_brain_parcellation",
            "in_file",
        ),
        Link::new(
            INPUTNODE,
            "base_directory",
            "ds_whole_brain_parcellation",
            "base_directory",
        ),
        Link::new(
            INPUTNODE,
            "anatomical_reference",
            "ds_whole_brain_parcellation",
            "source_file",
        ),
        Link::new(
            "crop_to_gm",
            "cropped_parcellation",
            "ds_gm_cropped_parcellation",
            "in_file",
        ),
        Link::new(
            INPUTNODE,
            "base_directory",
            "ds_gm_cropped_parcellation",
            "base_directory",
        ),
        Link::new(
            INPUTNODE,
            "anatomical_reference",
            "ds_gm_cropped_parcellation",
            "source_file",
        ),
    ])?;

    Ok(workflow)
}
