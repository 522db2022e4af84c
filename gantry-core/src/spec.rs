use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// The kind of work a node performs. Unknown kinds deserialize as
/// `Other` and dispatch to the generate executor at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    LlmGenerate,
    LlmToolUse,
    Router,
    Function,
    #[serde(untagged)]
    Other(String),
}

/// When an edge fires relative to its source node's recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Always,
    OnSuccess,
    OnFailure,
    Conditional,
    LlmDecide,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub output_keys: Vec<String>,
    /// Router decision label -> target node id. Implicit edges.
    #[serde(default)]
    pub routes: HashMap<String, String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub allow_loop: bool,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            input_keys: Vec::new(),
            output_keys: Vec::new(),
            routes: HashMap::new(),
            tools: Vec::new(),
            allow_loop: false,
        }
    }

    pub fn with_inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_route(mut self, label: impl Into<String>, target: impl Into<String>) -> Self {
        self.routes.insert(label.into(), target.into());
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_loop(mut self) -> Self {
        self.allow_loop = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: String,
    pub source: String,
    pub target: String,
    pub condition: EdgeCondition,
    /// Required iff `condition == Conditional`.
    #[serde(default)]
    pub condition_expr: Option<String>,
    /// Tie-break ordering (descending) when multiple edges from the
    /// same source qualify.
    #[serde(default)]
    pub priority: i32,
    /// Source output key -> target input key renaming.
    #[serde(default)]
    pub input_mapping: HashMap<String, String>,
    #[serde(default)]
    pub allow_cycle: bool,
}

impl EdgeSpec {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition,
            condition_expr: None,
            priority: 0,
            input_mapping: HashMap::new(),
            allow_cycle: false,
        }
    }

    pub fn with_expr(mut self, expr: impl Into<String>) -> Self {
        self.condition_expr = Some(expr.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.input_mapping.insert(from.into(), to.into());
        self
    }

    pub fn allow_cycle(mut self) -> Self {
        self.allow_cycle = true;
        self
    }
}

/// Immutable description of a workflow. Built once by the caller,
/// read-only for the lifetime of execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub entry_node: String,
    /// Alternate named start nodes, e.g. for resuming after a pause.
    #[serde(default)]
    pub entry_points: HashMap<String, String>,
    #[serde(default)]
    pub terminal_nodes: HashSet<String>,
    #[serde(default)]
    pub pause_nodes: HashSet<String>,
    /// The closed universe of blackboard keys known to exist
    /// independent of any node.
    #[serde(default)]
    pub memory_keys: HashSet<String>,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub allow_cycles: bool,
}

impl GraphSpec {
    pub fn new(entry_node: impl Into<String>) -> Self {
        Self {
            entry_node: entry_node.into(),
            entry_points: HashMap::new(),
            terminal_nodes: HashSet::new(),
            pause_nodes: HashSet::new(),
            memory_keys: HashSet::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            allow_cycles: false,
        }
    }

    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn add_edge(mut self, edge: EdgeSpec) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn add_entry_point(mut self, name: impl Into<String>, node: impl Into<String>) -> Self {
        self.entry_points.insert(name.into(), node.into());
        self
    }

    pub fn add_terminal(mut self, node: impl Into<String>) -> Self {
        self.terminal_nodes.insert(node.into());
        self
    }

    pub fn add_pause(mut self, node: impl Into<String>) -> Self {
        self.pause_nodes.insert(node.into());
        self
    }

    pub fn add_memory_key(mut self, key: impl Into<String>) -> Self {
        self.memory_keys.insert(key.into());
        self
    }

    pub fn allow_cycles(mut self) -> Self {
        self.allow_cycles = true;
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |edge| edge.source == id)
    }

    /// Whether the node continues the graph through explicit edges or
    /// router routes. A node without either is a leaf.
    pub fn has_outgoing(&self, id: &str) -> bool {
        if self.edges.iter().any(|edge| edge.source == id) {
            return true;
        }
        self.node(id).map_or(false, |node| !node.routes.is_empty())
    }

    /// Terminal means declared terminal or leaf.
    pub fn is_terminal(&self, id: &str) -> bool {
        self.terminal_nodes.contains(id) || !self.has_outgoing(id)
    }
}
