use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::derivatives::DerivativeDescriptor;

/// What a node stands for in the assembled plan. The core never runs any
/// of these itself; the execution engine interprets the kind at runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Pass-through node carrying the `inputnode`/`outputnode` contract.
    Identity,
    /// Aggregates `in1..inN` into a single ordered sequence on `out`.
    FanIn { capacity: usize },
    /// Inline transform evaluated by the engine, identified by name.
    Function { callable: String },
    /// Invocation of an external command-line tool.
    ExternalTool { command: String },
    /// Persists one artifact to a deterministically named output path.
    DerivativeSink { descriptor: DerivativeDescriptor },
}

/// Atomic unit of declared work: named input/output ports plus a
/// build-time resolved parameter mapping. Ports are matched by exact
/// name only; parameters never flow along edges.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    name: String,
    kind: NodeKind,
    inputs: Vec<String>,
    outputs: Vec<String>,
    params: BTreeMap<String, Value>,
}

impl Node {
    fn new(name: &str, kind: NodeKind, inputs: &[&str], outputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            kind,
            inputs: inputs.iter().map(|port| port.to_string()).collect(),
            outputs: outputs.iter().map(|port| port.to_string()).collect(),
            params: BTreeMap::new(),
        }
    }

    /// Identity node: every field is both an input and an output port.
    pub fn identity(name: &str, fields: &[&str]) -> Self {
        Self::new(name, NodeKind::Identity, fields, fields)
    }

    /// List aggregator with `capacity` positional inputs `in1..inN` and a
    /// single ordered-sequence output `out`. A capacity of zero is legal
    /// and yields no input ports.
    pub fn fan_in(name: &str, capacity: usize) -> Self {
        let inputs: Vec<String> = (1..=capacity).map(|index| format!("in{index}")).collect();
        let input_refs: Vec<&str> = inputs.iter().map(String::as_str).collect();
        Self::new(name, NodeKind::FanIn { capacity }, &input_refs, &["out"])
    }

    /// Inline transform node; `callable` names the function the execution
    /// engine resolves at runtime.
    pub fn function(name: &str, callable: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self::new(
            name,
            NodeKind::Function {
                callable: callable.to_string(),
            },
            inputs,
            outputs,
        )
    }

    /// External-tool node. The core treats the tool as opaque: only the
    /// declared ports and the parameter template matter here.
    pub fn tool(name: &str, command: &str, inputs: &[&str], outputs: &[&str]) -> Self {
        Self::new(
            name,
            NodeKind::ExternalTool {
                command: command.to_string(),
            },
            inputs,
            outputs,
        )
    }

    /// Derivative sink: persists `in_file` under a path computed from
    /// `source_file`, `base_directory` and the descriptor.
    pub fn derivative_sink(name: &str, descriptor: DerivativeDescriptor) -> Self {
        Self::new(
            name,
            NodeKind::DerivativeSink { descriptor },
            &["base_directory", "in_file", "source_file"],
            &["out_file"],
        )
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn set_param(&mut self, key: &str, value: impl Into<Value>) {
        self.params.insert(key.to_string(), value.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.iter().any(|name| name == port)
    }

    pub fn has_output(&self, port: &str) -> bool {
        self.outputs.iter().any(|name| name == port)
    }
}

/// Path parameters are carried as plain strings so the parameter mapping
/// stays a flat JSON object.
pub fn path_value(path: &Path) -> Value {
    Value::String(path.display().to_string())
}
