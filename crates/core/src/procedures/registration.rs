use anyhow::Result;

use crate::graph::{Link, Workflow, INPUTNODE, OUTPUTNODE};
use crate::node::Node;

/// Builds the atlas-registration workflow: warps the template-space
/// parcellation into subject anatomical space using the precomputed
/// template-to-native transform.
///
/// Contract: inputnode `[anatomical_reference, mni_to_native_transform,
/// atlas_name, atlas_nifti_file]`, outputnode `[whole_brain_parcellation]`.
pub fn init_registration_wf(name: &str) -> Result<Workflow> {
    let mut workflow = Workflow::new(name);

    workflow.add_node(Node::identity(
        INPUTNODE,
        &[
            "anatomical_reference",
            "mni_to_native_transform",
            "atlas_name",
            "atlas_nifti_file",
        ],
    ))?;
    workflow.add_node(Node::identity(OUTPUTNODE, &["whole_brain_parcellation"]))?;

    // Parcellation labels are categorical; a continuous interpolation
    // kernel would invent label values at region boundaries.
    workflow.add_node(
        Node::tool(
            "apply_transforms",
            "antsApplyTransforms",
            &["input_image", "transforms", "reference_image"],
            &["output_image"],
        )
        .with_param("interpolation", "NearestNeighbor"),
    )?;

    workflow.connect_all(&[
        Link::new(INPUTNODE, "atlas_nifti_file", "apply_transforms", "input_image"),
        Link::new(
            INPUTNODE,
            "mni_to_native_transform",
            "apply_transforms",
            "transforms",
        ),
        Link::new(
            INPUTNODE,
            "anatomical_reference",
            "apply_transforms",
            "reference_image",
        ),
        Link::new(
            "apply_transforms",
            "output_image",
            OUTPUTNODE,
            "whole_brain_parcellation",
        ),
    ])?;

    Ok(workflow)
}
