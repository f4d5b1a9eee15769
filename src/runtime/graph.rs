//! Hierarchical graph construction and flattening
//!
//! A [`HierBlock`] holds stream and message connections between blocks and
//! nested hierarchical blocks. Its own external ports are forwarded to inner
//! endpoints with [`HierBlock::connect_input`] / [`HierBlock::connect_output`].
//! [`HierBlock::flatten`] resolves every hierarchical endpoint and returns the
//! primitive edges the graph compiler wires into buffers.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use super::block::{BlockId, BlockRef};
use super::errors::ConnectionError;

/// Either end of a connection: a primitive block or a nested hierarchy
#[derive(Clone)]
pub enum NodeRef {
    Block(BlockRef),
    Hier(HierBlock),
}

impl NodeRef {
    pub fn name(&self) -> String {
        match self {
            NodeRef::Block(b) => b.alias().to_string(),
            NodeRef::Hier(h) => h.name().to_string(),
        }
    }

    fn same(&self, other: &NodeRef) -> bool {
        match (self, other) {
            (NodeRef::Block(a), NodeRef::Block(b)) => a == b,
            (NodeRef::Hier(a), NodeRef::Hier(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }

    fn check_stream_port(&self, port: usize, output: bool) -> Result<(), ConnectionError> {
        let count = match self {
            NodeRef::Block(b) if output => b.meta().outputs.len(),
            NodeRef::Block(b) => b.meta().inputs.len(),
            NodeRef::Hier(h) if output => h.0.noutputs,
            NodeRef::Hier(h) => h.0.ninputs,
        };
        if port < count {
            Ok(())
        } else {
            Err(ConnectionError::PortNotFound {
                block: self.name(),
                port: port.to_string(),
                direction: if output { "output" } else { "input" },
            })
        }
    }

    fn check_msg_port(&self, port: &str, output: bool) -> Result<(), ConnectionError> {
        let known = match self {
            NodeRef::Block(b) if output => b.meta().message_outputs.iter().any(|p| p == port),
            NodeRef::Block(b) => b.meta().message_inputs.iter().any(|p| p == port),
            NodeRef::Hier(h) if output => h.0.msg_outputs.iter().any(|p| p == port),
            NodeRef::Hier(h) => h.0.msg_inputs.iter().any(|p| p == port),
        };
        if known {
            Ok(())
        } else {
            Err(ConnectionError::PortNotFound {
                block: self.name(),
                port: port.to_string(),
                direction: if output { "message output" } else { "message input" },
            })
        }
    }
}

impl From<BlockRef> for NodeRef {
    fn from(b: BlockRef) -> Self {
        NodeRef::Block(b)
    }
}

impl From<&BlockRef> for NodeRef {
    fn from(b: &BlockRef) -> Self {
        NodeRef::Block(b.clone())
    }
}

impl From<HierBlock> for NodeRef {
    fn from(h: HierBlock) -> Self {
        NodeRef::Hier(h)
    }
}

impl From<&HierBlock> for NodeRef {
    fn from(h: &HierBlock) -> Self {
        NodeRef::Hier(h.clone())
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A stream connection between two primitive blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub src: BlockRef,
    pub src_port: usize,
    pub dst: BlockRef,
    pub dst_port: usize,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}->{}:{}", self.src, self.src_port, self.dst, self.dst_port)
    }
}

/// A message connection between two primitive blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MsgEdge {
    pub src: BlockRef,
    pub src_port: String,
    pub dst: BlockRef,
    pub dst_port: String,
}

impl fmt::Display for MsgEdge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}->{}:{}", self.src, self.src_port, self.dst, self.dst_port)
    }
}

#[derive(Clone)]
struct HierEdge {
    src: NodeRef,
    src_port: usize,
    dst: NodeRef,
    dst_port: usize,
}

#[derive(Clone)]
struct HierMsgEdge {
    src: NodeRef,
    src_port: String,
    dst: NodeRef,
    dst_port: String,
}

#[derive(Default)]
struct HierGraph {
    edges: Vec<HierEdge>,
    msg_edges: Vec<HierMsgEdge>,
    /// External input -> inner destinations
    inputs: Vec<Vec<(NodeRef, usize)>>,
    /// External output -> inner source
    outputs: Vec<Option<(NodeRef, usize)>>,
    msg_inputs: BTreeMap<String, Vec<(NodeRef, String)>>,
    msg_outputs: BTreeMap<String, (NodeRef, String)>,
}

struct HierInner {
    name: String,
    ninputs: usize,
    noutputs: usize,
    msg_inputs: Vec<String>,
    msg_outputs: Vec<String>,
    graph: Mutex<HierGraph>,
}

/// Primitive edges and blocks produced by [`HierBlock::flatten`]
#[derive(Debug, Default, Clone)]
pub struct Flattened {
    pub blocks: Vec<BlockRef>,
    pub edges: Vec<Edge>,
    pub msg_edges: Vec<MsgEdge>,
}

/// A graph of blocks that can itself be used as a block
#[derive(Clone)]
pub struct HierBlock(Arc<HierInner>);

impl HierBlock {
    /// A hierarchy with `ninputs` / `noutputs` external stream ports
    pub fn new(name: impl Into<String>, ninputs: usize, noutputs: usize) -> Self {
        Self::with_message_ports(name, ninputs, noutputs, Vec::new(), Vec::new())
    }

    pub fn with_message_ports(
        name: impl Into<String>,
        ninputs: usize,
        noutputs: usize,
        msg_inputs: Vec<String>,
        msg_outputs: Vec<String>,
    ) -> Self {
        let graph = HierGraph {
            inputs: vec![Vec::new(); ninputs],
            outputs: vec![None; noutputs],
            ..HierGraph::default()
        };
        Self(Arc::new(HierInner {
            name: name.into(),
            ninputs,
            noutputs,
            msg_inputs,
            msg_outputs,
            graph: Mutex::new(graph),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn graph(&self) -> MutexGuard<'_, HierGraph> {
        self.0.graph.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Connect output `src_port` of `src` to input `dst_port` of `dst`
    pub fn connect(
        &self,
        src: impl Into<NodeRef>,
        src_port: usize,
        dst: impl Into<NodeRef>,
        dst_port: usize,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        let dst = dst.into();
        src.check_stream_port(src_port, true)?;
        dst.check_stream_port(dst_port, false)?;

        let mut graph = self.graph();
        if graph
            .edges
            .iter()
            .any(|e| e.dst.same(&dst) && e.dst_port == dst_port)
        {
            return Err(ConnectionError::DuplicateConnection(format!(
                "Input {}:{} is already connected",
                dst.name(),
                dst_port
            )));
        }
        graph.edges.push(HierEdge {
            src,
            src_port,
            dst,
            dst_port,
        });
        Ok(())
    }

    pub fn disconnect(
        &self,
        src: impl Into<NodeRef>,
        src_port: usize,
        dst: impl Into<NodeRef>,
        dst_port: usize,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        let dst = dst.into();
        let mut graph = self.graph();
        let before = graph.edges.len();
        graph.edges.retain(|e| {
            !(e.src.same(&src) && e.src_port == src_port && e.dst.same(&dst) && e.dst_port == dst_port)
        });
        if graph.edges.len() == before {
            return Err(ConnectionError::EdgeNotFound(format!(
                "{}:{}->{}:{}",
                src.name(),
                src_port,
                dst.name(),
                dst_port
            )));
        }
        Ok(())
    }

    /// Remove every stream and message connection
    pub fn disconnect_all(&self) {
        let mut graph = self.graph();
        graph.edges.clear();
        graph.msg_edges.clear();
        graph.inputs.iter_mut().for_each(Vec::clear);
        graph.outputs.iter_mut().for_each(|o| *o = None);
        graph.msg_inputs.clear();
        graph.msg_outputs.clear();
    }

    /// Connect message port `src_port` of `src` to message port `dst_port` of `dst`
    pub fn msg_connect(
        &self,
        src: impl Into<NodeRef>,
        src_port: &str,
        dst: impl Into<NodeRef>,
        dst_port: &str,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        let dst = dst.into();
        src.check_msg_port(src_port, true)?;
        dst.check_msg_port(dst_port, false)?;
        self.graph().msg_edges.push(HierMsgEdge {
            src,
            src_port: src_port.to_string(),
            dst,
            dst_port: dst_port.to_string(),
        });
        Ok(())
    }

    pub fn msg_disconnect(
        &self,
        src: impl Into<NodeRef>,
        src_port: &str,
        dst: impl Into<NodeRef>,
        dst_port: &str,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        let dst = dst.into();
        let mut graph = self.graph();
        let before = graph.msg_edges.len();
        graph.msg_edges.retain(|e| {
            !(e.src.same(&src) && e.src_port == src_port && e.dst.same(&dst) && e.dst_port == dst_port)
        });
        if graph.msg_edges.len() == before {
            return Err(ConnectionError::EdgeNotFound(format!(
                "{}:{}->{}:{}",
                src.name(),
                src_port,
                dst.name(),
                dst_port
            )));
        }
        Ok(())
    }

    /// Forward external input `port` to input `dst_port` of an inner node.
    /// One external input may feed several inner inputs.
    pub fn connect_input(
        &self,
        port: usize,
        dst: impl Into<NodeRef>,
        dst_port: usize,
    ) -> Result<(), ConnectionError> {
        let dst = dst.into();
        dst.check_stream_port(dst_port, false)?;
        let mut graph = self.graph();
        let Some(targets) = graph.inputs.get_mut(port) else {
            return Err(ConnectionError::PortNotFound {
                block: self.0.name.clone(),
                port: port.to_string(),
                direction: "input",
            });
        };
        targets.push((dst, dst_port));
        Ok(())
    }

    /// Drive external output `port` from output `src_port` of an inner node
    pub fn connect_output(
        &self,
        src: impl Into<NodeRef>,
        src_port: usize,
        port: usize,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        src.check_stream_port(src_port, true)?;
        let mut graph = self.graph();
        let Some(slot) = graph.outputs.get_mut(port) else {
            return Err(ConnectionError::PortNotFound {
                block: self.0.name.clone(),
                port: port.to_string(),
                direction: "output",
            });
        };
        if slot.is_some() {
            return Err(ConnectionError::DuplicateConnection(format!(
                "Output {}:{} is already driven",
                self.0.name, port
            )));
        }
        *slot = Some((src, src_port));
        Ok(())
    }

    /// Forward external message input `port` to an inner message input
    pub fn msg_connect_input(
        &self,
        port: &str,
        dst: impl Into<NodeRef>,
        dst_port: &str,
    ) -> Result<(), ConnectionError> {
        let dst = dst.into();
        NodeRef::from(self).check_msg_port(port, false)?;
        dst.check_msg_port(dst_port, false)?;
        self.graph()
            .msg_inputs
            .entry(port.to_string())
            .or_default()
            .push((dst, dst_port.to_string()));
        Ok(())
    }

    /// Drive external message output `port` from an inner message output
    pub fn msg_connect_output(
        &self,
        src: impl Into<NodeRef>,
        src_port: &str,
        port: &str,
    ) -> Result<(), ConnectionError> {
        let src = src.into();
        NodeRef::from(self).check_msg_port(port, true)?;
        src.check_msg_port(src_port, true)?;
        self.graph()
            .msg_outputs
            .insert(port.to_string(), (src, src_port.to_string()));
        Ok(())
    }

    /// Resolve every hierarchical endpoint into primitive blocks
    pub fn flatten(&self) -> Result<Flattened, ConnectionError> {
        let mut out = Flattened::default();
        let mut seen_blocks = HashSet::new();
        let mut visited = Vec::new();
        self.flatten_into(&mut out, &mut seen_blocks, &mut visited)?;
        Ok(out)
    }

    fn flatten_into(
        &self,
        out: &mut Flattened,
        seen_blocks: &mut HashSet<BlockId>,
        visited: &mut Vec<*const HierInner>,
    ) -> Result<(), ConnectionError> {
        let me = Arc::as_ptr(&self.0);
        if visited.contains(&me) {
            return Ok(());
        }
        visited.push(me);

        let (edges, msg_edges, children) = {
            let graph = self.graph();
            let mut children: Vec<HierBlock> = Vec::new();
            let mut note_child = |node: &NodeRef| {
                if let NodeRef::Hier(h) = node {
                    if !children.iter().any(|c| Arc::ptr_eq(&c.0, &h.0)) {
                        children.push(h.clone());
                    }
                }
            };
            for e in &graph.edges {
                note_child(&e.src);
                note_child(&e.dst);
            }
            for e in &graph.msg_edges {
                note_child(&e.src);
                note_child(&e.dst);
            }
            for (node, _) in graph.inputs.iter().flatten() {
                note_child(node);
            }
            for (node, _) in graph.outputs.iter().flatten() {
                note_child(node);
            }
            (graph.edges.clone(), graph.msg_edges.clone(), children)
        };

        let mut add_block = |out: &mut Flattened, b: &BlockRef| {
            if seen_blocks.insert(b.id()) {
                out.blocks.push(b.clone());
            }
        };

        for e in &edges {
            let (src, src_port) = resolve_src(&e.src, e.src_port)?;
            add_block(out, &src);
            for (dst, dst_port) in resolve_dst(&e.dst, e.dst_port)? {
                add_block(out, &dst);
                out.edges.push(Edge {
                    src: src.clone(),
                    src_port,
                    dst,
                    dst_port,
                });
            }
        }

        for e in &msg_edges {
            let (src, src_port) = resolve_msg_src(&e.src, &e.src_port)?;
            add_block(out, &src);
            for (dst, dst_port) in resolve_msg_dst(&e.dst, &e.dst_port)? {
                add_block(out, &dst);
                out.msg_edges.push(MsgEdge {
                    src: src.clone(),
                    src_port: src_port.clone(),
                    dst,
                    dst_port,
                });
            }
        }

        for child in children {
            child.flatten_into(out, seen_blocks, visited)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HierBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("HierBlock").field("name", &self.0.name).finish()
    }
}

fn resolve_src(node: &NodeRef, port: usize) -> Result<(BlockRef, usize), ConnectionError> {
    match node {
        NodeRef::Block(b) => Ok((b.clone(), port)),
        NodeRef::Hier(h) => {
            let inner = h.graph().outputs.get(port).cloned().flatten();
            match inner {
                Some((node, port)) => resolve_src(&node, port),
                None => Err(ConnectionError::UnmappedHierPort {
                    block: h.name().to_string(),
                    port: format!("output {port}"),
                }),
            }
        }
    }
}

fn resolve_dst(node: &NodeRef, port: usize) -> Result<Vec<(BlockRef, usize)>, ConnectionError> {
    match node {
        NodeRef::Block(b) => Ok(vec![(b.clone(), port)]),
        NodeRef::Hier(h) => {
            let targets = h.graph().inputs.get(port).cloned().unwrap_or_default();
            if targets.is_empty() {
                return Err(ConnectionError::UnmappedHierPort {
                    block: h.name().to_string(),
                    port: format!("input {port}"),
                });
            }
            let mut out = Vec::new();
            for (node, port) in targets {
                out.extend(resolve_dst(&node, port)?);
            }
            Ok(out)
        }
    }
}

fn resolve_msg_src(node: &NodeRef, port: &str) -> Result<(BlockRef, String), ConnectionError> {
    match node {
        NodeRef::Block(b) => Ok((b.clone(), port.to_string())),
        NodeRef::Hier(h) => {
            let inner = h.graph().msg_outputs.get(port).cloned();
            match inner {
                Some((node, port)) => resolve_msg_src(&node, &port),
                None => Err(ConnectionError::UnmappedHierPort {
                    block: h.name().to_string(),
                    port: port.to_string(),
                }),
            }
        }
    }
}

fn resolve_msg_dst(node: &NodeRef, port: &str) -> Result<Vec<(BlockRef, String)>, ConnectionError> {
    match node {
        NodeRef::Block(b) => Ok(vec![(b.clone(), port.to_string())]),
        NodeRef::Hier(h) => {
            let targets = h.graph().msg_inputs.get(port).cloned().unwrap_or_default();
            if targets.is_empty() {
                return Err(ConnectionError::UnmappedHierPort {
                    block: h.name().to_string(),
                    port: port.to_string(),
                });
            }
            let mut out = Vec::new();
            for (node, port) in targets {
                out.extend(resolve_msg_dst(&node, &port)?);
            }
            Ok(out)
        }
    }
}
