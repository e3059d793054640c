use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::derivatives::DerivativeDescriptor;
use crate::graph::Link;
use crate::node::Node;

/// Generates one node per item of a runtime-determined list. Names come
/// from the template closure and must be collision-free across the
/// generated set; an empty list yields an empty set.
pub fn fan_out<T>(items: &[T], template: impl Fn(usize, &T) -> Node) -> Result<Vec<Node>> {
    let mut seen = HashSet::new();
    let mut nodes = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let node = template(index, item);
        if !seen.insert(node.name().to_string()) {
            bail!("fan-out produced duplicate node name '{}'", node.name());
        }
        nodes.push(node);
    }
    Ok(nodes)
}

/// One derivative sink per computed parameter, each tagged with the
/// parameter name as the descriptor's `desc` entity. Output order
/// follows the declared parameter order.
pub fn sink_per_parameter(
    prefix: &str,
    parameters: &[&str],
    template: &DerivativeDescriptor,
) -> Result<Vec<Node>> {
    fan_out(parameters, |_, parameter| {
        Node::derivative_sink(
            &format!("{prefix}_{parameter}"),
            template.clone().with_desc(parameter),
        )
    })
}

/// Wires the i-th source port (declared order) to `in<i+1>` of a fan-in
/// aggregator, so the ordered sequence it emits preserves that order.
pub fn fan_in_links(source: &str, source_ports: &[&str], aggregator: &str) -> Vec<Link> {
    source_ports
        .iter()
        .enumerate()
        .map(|(index, port)| Link::new(source, port, aggregator, &format!("in{}", index + 1)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    #[test]
    fn test_sink_per_parameter_tags_each_sink_in_order() {
        let parameters = ["adc", "fa", "ad"];
        let template = DerivativeDescriptor::new("dwimap", "nii.gz");
        let sinks =
            sink_per_parameter("ds_tensor", &parameters, &template).expect("fan-out should build");

        assert_eq!(sinks.len(), parameters.len());
        for (sink, parameter) in sinks.iter().zip(parameters) {
            assert_eq!(sink.name(), format!("ds_tensor_{parameter}"));
            match sink.kind() {
                NodeKind::DerivativeSink { descriptor } => {
                    assert_eq!(descriptor.desc.as_deref(), Some(parameter));
                }
                other => panic!("expected derivative sink, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_fan_out_of_empty_list_yields_no_nodes() {
        let sinks = sink_per_parameter("ds", &[], &DerivativeDescriptor::new("dwimap", "nii.gz"))
            .expect("empty fan-out should build");
        assert!(sinks.is_empty());
    }

    #[test]
    fn test_fan_out_rejects_name_collisions() {
        let err = fan_out(&["a", "b"], |_, _| Node::identity("same", &["value"]))
            .expect_err("collision should error");
        assert!(err.to_string().contains("duplicate node name 'same'"));
    }

    #[test]
    fn test_fan_in_links_preserve_declared_order() {
        let links = fan_in_links("outputnode", &["adc", "fa", "ad"], "listify");
        assert_eq!(links.len(), 3);
        assert_eq!(links[0], Link::new("outputnode", "adc", "listify", "in1"));
        assert_eq!(links[1], Link::new("outputnode", "fa", "listify", "in2"));
        assert_eq!(links[2], Link::new("outputnode", "ad", "listify", "in3"));
    }
}
