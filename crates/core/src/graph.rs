use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use crate::node::Node;

pub const INPUTNODE: &str = "inputnode";
pub const OUTPUTNODE: &str = "outputnode";

/// A member of a workflow: either an atomic node or a nested workflow
/// wrapped as a single node. Nesting depth is unlimited.
#[derive(Debug, Clone)]
pub enum Member {
    Node(Node),
    Subflow(Workflow),
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Node(node) => node.name(),
            Member::Subflow(workflow) => workflow.name(),
        }
    }

    /// Declared input ports visible to the owning workflow. For a nested
    /// workflow these are `inputnode.<field>` for each field of its
    /// `inputnode` identity node.
    fn has_input(&self, port: &str) -> bool {
        match self {
            Member::Node(node) => node.has_input(port),
            Member::Subflow(workflow) => port
                .strip_prefix("inputnode.")
                .is_some_and(|field| workflow.identity_field(INPUTNODE, field)),
        }
    }

    fn has_output(&self, port: &str) -> bool {
        match self {
            Member::Node(node) => node.has_output(port),
            Member::Subflow(workflow) => port
                .strip_prefix("outputnode.")
                .is_some_and(|field| workflow.identity_field(OUTPUTNODE, field)),
        }
    }
}

/// Directed port-to-port edge weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLink {
    pub source_port: String,
    pub target_port: String,
}

/// One requested connection, named by member rather than index so batch
/// requests can be built before looking anything up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub source: String,
    pub source_port: String,
    pub target: String,
    pub target_port: String,
}

impl Link {
    pub fn new(source: &str, source_port: &str, target: &str, target_port: &str) -> Self {
        Self {
            source: source.to_string(),
            source_port: source_port.to_string(),
            target: target.to_string(),
            target_port: target_port.to_string(),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source, self.source_port, self.target, self.target_port
        )
    }
}

/// Shared, read-only execution-time paths attached once per subject
/// workflow. All nested members reference the same value; nothing is
/// copied into individual nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub crashdump_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// A named collection of members and directed port-to-port edges,
/// acyclic at all times, itself usable as a member of a parent workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    graph: StableDiGraph<Member, PortLink>,
    members: HashMap<String, NodeIndex>,
    execution_context: Option<Arc<ExecutionContext>>,
}

impl Workflow {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            graph: StableDiGraph::new(),
            members: HashMap::new(),
            execution_context: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_node(&mut self, node: Node) -> Result<NodeIndex> {
        self.add_member(Member::Node(node))
    }

    /// Wraps an entire workflow as a single member under `instance_name`.
    /// Its `inputnode`/`outputnode` identity-node fields become the
    /// externally visible ports of the instance.
    pub fn add_subflow(&mut self, instance_name: &str, mut workflow: Workflow) -> Result<NodeIndex> {
        workflow.name = instance_name.to_string();
        self.add_member(Member::Subflow(workflow))
    }

    fn add_member(&mut self, member: Member) -> Result<NodeIndex> {
        let name = member.name().to_string();
        if name.is_empty() {
            bail!("workflow '{}': member name must not be empty", self.name);
        }
        if self.members.contains_key(&name) {
            bail!("workflow '{}': duplicate node name '{name}'", self.name);
        }
        let index = self.graph.add_node(member);
        self.members.insert(name, index);
        Ok(index)
    }

    /// Best-effort batch connect: every link is validated and applied
    /// independently. Failed links never mutate the edge set; successful
    /// links stay applied even when a later link fails.
    pub fn connect(&mut self, links: &[Link]) -> Vec<Result<()>> {
        links.iter().map(|link| self.connect_one(link)).collect()
    }

    /// All-or-fail-fast wrapper used by procedure builders, whose port
    /// names are fixed at compile time.
    pub fn connect_all(&mut self, links: &[Link]) -> Result<()> {
        for link in links {
            self.connect_one(link)?;
        }
        Ok(())
    }

    fn connect_one(&mut self, link: &Link) -> Result<()> {
        let source_index = self.member_index(&link.source).ok_or_else(|| {
            anyhow!(
                "workflow '{}': unknown source node '{}'",
                self.name,
                link.source
            )
        })?;
        let target_index = self.member_index(&link.target).ok_or_else(|| {
            anyhow!(
                "workflow '{}': unknown target node '{}'",
                self.name,
                link.target
            )
        })?;

        if !self.graph[source_index].has_output(&link.source_port) {
            bail!(
                "workflow '{}': node '{}' has no output port '{}'",
                self.name,
                link.source,
                link.source_port
            );
        }
        if !self.graph[target_index].has_input(&link.target_port) {
            bail!(
                "workflow '{}': node '{}' has no input port '{}'",
                self.name,
                link.target,
                link.target_port
            );
        }
        if source_index == target_index
            || has_path_connecting(&self.graph, target_index, source_index, None)
        {
            bail!(
                "workflow '{}': connecting {link} would create a cycle",
                self.name
            );
        }

        self.graph.add_edge(
            source_index,
            target_index,
            PortLink {
                source_port: link.source_port.clone(),
                target_port: link.target_port.clone(),
            },
        );
        Ok(())
    }

    fn member_index(&self, name: &str) -> Option<NodeIndex> {
        self.members.get(name).copied()
    }

    fn identity_field(&self, node_name: &str, field: &str) -> bool {
        match self.member_index(node_name).map(|index| &self.graph[index]) {
            Some(Member::Node(node)) => node.has_output(field),
            _ => false,
        }
    }

    /// Member names at this nesting level, in insertion order.
    pub fn member_names(&self) -> Vec<String> {
        self.graph
            .node_indices()
            .map(|index| self.graph[index].name().to_string())
            .collect()
    }

    pub fn get_node(&self, name: &str) -> Option<&Node> {
        match self.member_index(name).map(|index| &self.graph[index]) {
            Some(Member::Node(node)) => Some(node),
            _ => None,
        }
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        let index = self.member_index(name)?;
        match &mut self.graph[index] {
            Member::Node(node) => Some(node),
            _ => None,
        }
    }

    pub fn subflow(&self, name: &str) -> Option<&Workflow> {
        match self.member_index(name).map(|index| &self.graph[index]) {
            Some(Member::Subflow(workflow)) => Some(workflow),
            _ => None,
        }
    }

    pub fn subflow_count(&self) -> usize {
        self.graph
            .node_indices()
            .filter(|index| matches!(self.graph[*index], Member::Subflow(_)))
            .count()
    }

    /// Fully expanded node set: the qualified (dot-separated) name of
    /// every atomic node reachable through nesting. Pure, so flattening
    /// twice yields the same result.
    pub fn nodes(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_nodes("", &mut names);
        names
    }

    fn collect_nodes(&self, prefix: &str, names: &mut Vec<String>) {
        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Member::Node(node) => names.push(format!("{prefix}{}", node.name())),
                Member::Subflow(workflow) => {
                    workflow.collect_nodes(&format!("{prefix}{}.", workflow.name()), names);
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes().len()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edges at this nesting level, reconstructed as `Link`s.
    pub fn links(&self) -> Vec<Link> {
        self.graph
            .edge_references()
            .map(|edge| {
                let weight = edge.weight();
                Link::new(
                    self.graph[edge.source()].name(),
                    &weight.source_port,
                    self.graph[edge.target()].name(),
                    &weight.target_port,
                )
            })
            .collect()
    }

    /// Whole-graph integrity pass run once more before handoff. Connects
    /// already reject cycle-closing edges; this re-checks every nesting
    /// level in one sweep.
    pub fn validate(&self) -> Result<()> {
        if toposort(&self.graph, None).is_err() {
            bail!("cycle detected in workflow '{}'", self.name);
        }
        for index in self.graph.node_indices() {
            if let Member::Subflow(workflow) = &self.graph[index] {
                workflow.validate()?;
            }
        }
        Ok(())
    }

    pub fn set_execution_context(&mut self, context: Arc<ExecutionContext>) {
        self.execution_context = Some(context);
    }

    pub fn execution_context(&self) -> Option<&Arc<ExecutionContext>> {
        self.execution_context.as_ref()
    }

    /// Graphviz rendering for diagnostics: one `subgraph cluster` per
    /// nested workflow, edges labelled with their port pair.
    pub fn to_dot(&self) -> String {
        let mut buffer = String::new();
        let _ = writeln!(buffer, "digraph \"{}\" {{", self.name);
        let _ = writeln!(buffer, "  compound=true;");
        self.write_dot_body(&mut buffer, "  ", "");
        buffer.push_str("}\n");
        buffer
    }

    fn write_dot_body(&self, buffer: &mut String, indent: &str, prefix: &str) {
        for index in self.graph.node_indices() {
            match &self.graph[index] {
                Member::Node(node) => {
                    let _ = writeln!(buffer, "{indent}\"{prefix}{}\";", node.name());
                }
                Member::Subflow(workflow) => {
                    let _ = writeln!(
                        buffer,
                        "{indent}subgraph \"cluster_{prefix}{}\" {{",
                        workflow.name()
                    );
                    let _ = writeln!(buffer, "{indent}  label=\"{}\";", workflow.name());
                    workflow.write_dot_body(
                        buffer,
                        &format!("{indent}  "),
                        &format!("{prefix}{}.", workflow.name()),
                    );
                    let _ = writeln!(buffer, "{indent}}}");
                }
            }
        }
        for edge in self.graph.edge_references() {
            let weight = edge.weight();
            let source = self.dot_endpoint(edge.source(), &weight.source_port, prefix);
            let target = self.dot_endpoint(edge.target(), &weight.target_port, prefix);
            let _ = writeln!(
                buffer,
                "{indent}\"{source}\" -> \"{target}\" [label=\"{} -> {}\"];",
                weight.source_port, weight.target_port
            );
        }
    }

    /// Edges touching a nested workflow attach to its inner
    /// `inputnode`/`outputnode` rather than the cluster itself.
    fn dot_endpoint(&self, index: NodeIndex, port: &str, prefix: &str) -> String {
        match &self.graph[index] {
            Member::Node(node) => format!("{prefix}{}", node.name()),
            Member::Subflow(workflow) => {
                let inner = port.split('.').next().unwrap_or(INPUTNODE);
                format!("{prefix}{}.{inner}", workflow.name())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough(name: &str) -> Node {
        Node::identity(name, &["value"])
    }

    #[test]
    fn test_duplicate_node_name_rejected() {
        let mut workflow = Workflow::new("wf");
        workflow
            .add_node(passthrough("node"))
            .expect("first node should be added");

        let err = workflow
            .add_node(passthrough("node"))
            .expect_err("duplicate node name should error");
        assert!(err.to_string().contains("duplicate node name 'node'"));
    }

    #[test]
    fn test_empty_member_name_rejected() {
        let mut workflow = Workflow::new("wf");
        let err = workflow
            .add_node(Node::identity("", &["value"]))
            .expect_err("empty name should error");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[test]
    fn test_invalid_port_connect_never_mutates_edge_set() {
        let mut workflow = Workflow::new("wf");
        workflow
            .add_node(passthrough("a"))
            .expect("node should be added");
        workflow
            .add_node(passthrough("b"))
            .expect("node should be added");

        let err = workflow
            .connect_all(&[Link::new("a", "value", "b", "missing")])
            .expect_err("unknown target port should error");
        assert!(err.to_string().contains("has no input port 'missing'"));
        assert_eq!(workflow.edge_count(), 0);

        let err = workflow
            .connect_all(&[Link::new("a", "missing", "b", "value")])
            .expect_err("unknown source port should error");
        assert!(err.to_string().contains("has no output port 'missing'"));
        assert_eq!(workflow.edge_count(), 0);
    }

    #[test]
    fn test_batch_connect_applies_valid_links_best_effort() {
        let mut workflow = Workflow::new("wf");
        for name in ["a", "b", "c"] {
            workflow
                .add_node(passthrough(name))
                .expect("node should be added");
        }

        let results = workflow.connect(&[
            Link::new("a", "value", "b", "value"),
            Link::new("a", "value", "b", "missing"),
            Link::new("b", "value", "c", "value"),
        ]);

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
        assert_eq!(workflow.edge_count(), 2);
    }

    #[test]
    fn test_cycle_closing_edge_rejected_at_connect_time() {
        let mut workflow = Workflow::new("wf");
        for name in ["a", "b", "c"] {
            workflow
                .add_node(passthrough(name))
                .expect("node should be added");
        }
        workflow
            .connect_all(&[
                Link::new("a", "value", "b", "value"),
                Link::new("b", "value", "c", "value"),
            ])
            .expect("forward edges should connect");

        let err = workflow
            .connect_all(&[Link::new("c", "value", "a", "value")])
            .expect_err("closing edge should be rejected");
        assert!(err.to_string().contains("would create a cycle"));
        assert_eq!(workflow.edge_count(), 2);
        workflow.validate().expect("graph should stay valid");
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut workflow = Workflow::new("wf");
        workflow
            .add_node(passthrough("a"))
            .expect("node should be added");
        let err = workflow
            .connect_all(&[Link::new("a", "value", "a", "value")])
            .expect_err("self loop should be rejected");
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_nested_ports_resolve_through_identity_contract() {
        let mut inner = Workflow::new("inner");
        inner
            .add_node(Node::identity(INPUTNODE, &["anat"]))
            .expect("inputnode should be added");
        inner
            .add_node(Node::identity(OUTPUTNODE, &["parcellation"]))
            .expect("outputnode should be added");
        inner
            .connect_all(&[Link::new(INPUTNODE, "anat", OUTPUTNODE, "parcellation")])
            .expect("inner wiring should connect");

        let mut outer = Workflow::new("outer");
        outer
            .add_node(Node::identity("source", &["anat"]))
            .expect("source should be added");
        outer
            .add_node(Node::identity("sink", &["parcellation"]))
            .expect("sink should be added");
        outer
            .add_subflow("registration", inner)
            .expect("subflow should be added");

        outer
            .connect_all(&[
                Link::new("source", "anat", "registration", "inputnode.anat"),
                Link::new(
                    "registration",
                    "outputnode.parcellation",
                    "sink",
                    "parcellation",
                ),
            ])
            .expect("nested ports should resolve");

        let err = outer
            .connect_all(&[Link::new(
                "source",
                "anat",
                "registration",
                "inputnode.missing",
            )])
            .expect_err("unknown nested field should error");
        assert!(err.to_string().contains("has no input port"));
    }

    #[test]
    fn test_flatten_counts_nested_nodes_and_is_idempotent() {
        let mut inner = Workflow::new("inner");
        inner
            .add_node(Node::identity(INPUTNODE, &["x"]))
            .expect("inputnode should be added");
        inner
            .add_node(Node::identity(OUTPUTNODE, &["x"]))
            .expect("outputnode should be added");

        let mut middle = Workflow::new("middle");
        middle
            .add_node(passthrough("stage"))
            .expect("stage should be added");
        middle
            .add_subflow("inner_wf", inner)
            .expect("inner subflow should be added");

        let mut root = Workflow::new("root");
        root.add_node(passthrough("top"))
            .expect("top should be added");
        root.add_subflow("middle_wf", middle)
            .expect("middle subflow should be added");

        let first = root.nodes();
        assert_eq!(first.len(), 4);
        assert!(first.contains(&"top".to_string()));
        assert!(first.contains(&"middle_wf.stage".to_string()));
        assert!(first.contains(&"middle_wf.inner_wf.inputnode".to_string()));
        assert!(first.contains(&"middle_wf.inner_wf.outputnode".to_string()));

        assert_eq!(root.nodes(), first);
        assert_eq!(root.node_count(), first.len());
    }

    #[test]
    fn test_to_dot_renders_nested_clusters() {
        let mut inner = Workflow::new("inner");
        inner
            .add_node(Node::identity(INPUTNODE, &["x"]))
            .expect("inputnode should be added");

        let mut root = Workflow::new("root");
        root.add_node(passthrough("top"))
            .expect("top should be added");
        root.add_subflow("inner_wf", inner)
            .expect("subflow should be added");
        root.connect_all(&[Link::new("top", "value", "inner_wf", "inputnode.x")])
            .expect("edge should connect");

        let dot = root.to_dot();
        assert!(dot.contains("digraph \"root\""));
        assert!(dot.contains("subgraph \"cluster_inner_wf\""));
        assert!(dot.contains("\"top\" -> \"inner_wf.inputnode\""));
    }
}
