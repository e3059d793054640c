use anyhow::Result;

use crate::config::ParameterSet;
use crate::derivatives::DerivativeDescriptor;
use crate::fanout::{fan_in_links, sink_per_parameter};
use crate::graph::{Link, Workflow, INPUTNODE, OUTPUTNODE};
use crate::node::Node;

/// Scalar and vector quantities derived from the fitted tensor, in the
/// order they are aggregated and sunk.
pub const TENSOR_PARAMETERS: [&str; 9] =
    ["adc", "fa", "ad", "rd", "cl", "cp", "cs", "evec", "eval"];

/// Builds the tensor-estimation workflow: fits the diffusion tensor,
/// derives the nine parameter maps, sinks one derivative per parameter
/// and aggregates them into an ordered sequence.
///
/// Contract: inputnode `[base_directory, dwi_nifti, dwi_grad, dwi_mask]`,
/// outputnode = `TENSOR_PARAMETERS`.
pub fn init_tensor_wf(name: &str, params: &ParameterSet) -> Result<Workflow> {
    let mut workflow = Workflow::new(name);

    workflow.add_node(Node::identity(
        INPUTNODE,
        &["base_directory", "dwi_nifti", "dwi_grad", "dwi_mask"],
    ))?;
    workflow.add_node(Node::identity(OUTPUTNODE, &TENSOR_PARAMETERS))?;

    workflow.add_node(
        Node::tool(
            "dwi2tensor",
            "dwi2tensor",
            &["in_file", "grad_file", "in_mask"],
            &["out_file"],
        )
        .with_param("nthreads", params.omp_nthreads),
    )?;

    let metric_outputs: Vec<String> = TENSOR_PARAMETERS
        .iter()
        .map(|parameter| format!("out_{parameter}"))
        .collect();
    let metric_output_refs: Vec<&str> = metric_outputs.iter().map(String::as_str).collect();
    let mut tensor2metric = Node::tool(
        "tensor2metric",
        "tensor2metric",
        &["in_file"],
        &metric_output_refs,
    );
    for parameter in TENSOR_PARAMETERS {
        tensor2metric.set_param(&format!("out_{parameter}"), format!("{parameter}.nii.gz"));
    }
    workflow.add_node(tensor2metric)?;

    workflow.add_node(Node::fan_in("listify_tensor_params", TENSOR_PARAMETERS.len()))?;

    let template = DerivativeDescriptor::new("dwimap", "nii.gz").with_reconstruction("mrtrix3");
    for sink in sink_per_parameter("ds_tensor", &TENSOR_PARAMETERS, &template)? {
        workflow.add_node(sink)?;
    }

    let mut links = vec![
        Link::new(INPUTNODE, "dwi_nifti", "dwi2tensor", "in_file"),
        Link::new(INPUTNODE, "dwi_grad", "dwi2tensor", "grad_file"),
        Link::new(INPUTNODE, "dwi_mask", "dwi2tensor", "in_mask"),
        Link::new("dwi2tensor", "out_file", "tensor2metric", "in_file"),
    ];
    for parameter in TENSOR_PARAMETERS {
        links.push(Link::new(
            "tensor2metric",
            &format!("out_{parameter}"),
            OUTPUTNODE,
            parameter,
        ));
        links.push(Link::new(
            "tensor2metric",
            &format!("out_{parameter}"),
            &format!("ds_tensor_{parameter}"),
            "in_file",
        ));
        links.push(Link::new(
            INPUTNODE,
            "base_directory",
            &format!("ds_tensor_{parameter}"),
            "base_directory",
        ));
        links.push(Link::new(
            INPUTNODE,
            "dwi_nifti",
            &format!("ds_tensor_{parameter}"),
            "source_file",
        ));
    }
    links.extend(fan_in_links(
        OUTPUTNODE,
        &TENSOR_PARAMETERS,
        "listify_tensor_params",
    ));
    workflow.connect_all(&links)?;

    Ok(workflow)
}
