//! # Queries
//!
//! Read-only questions over a finished [`ObjectGraph`].
//!
//! Indices that not every caller needs (reverse edges, dominators) are built
//! on first use and cached for the life of the engine.

mod dominators;

use std::collections::{BTreeMap, VecDeque};
use std::io;

use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::debug;

use self::dominators::Dominators;
use crate::diagnostics::DiagnosticsReport;
use crate::dump::SegmentMap;
use crate::error::{HeapdigError, Result};
use crate::graph::{Edge, EdgeSource, Object, ObjectGraph, ObjectId};
use crate::roots::{Root, RootId};
use crate::symbols::SymbolCatalog;
use crate::types::Address;
use crate::value::{Value, ValueReader};

/// Elements of a `[n]T` object decoded by [`QueryEngine::fields`]
const MAX_FIELD_ELEMENTS: u64 = 64;

/// One line of the type census
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CensusEntry
{
    pub type_name: String,
    pub count: u64,
    pub total_bytes: u64,
}

/// Bytes an object keeps alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retained
{
    pub object: ObjectId,
    /// Own size plus everything it dominates
    pub bytes: u64,
    /// Immediate dominator, `None` when only roots dominate it
    pub dominator: Option<ObjectId>,
}

pub struct QueryEngine<'s>
{
    segments: &'s SegmentMap,
    catalog: &'s SymbolCatalog,
    graph: &'s ObjectGraph,
    incoming: OnceCell<Vec<Vec<usize>>>,
    dominators: OnceCell<Dominators>,
}

impl<'s> QueryEngine<'s>
{
    pub fn new(segments: &'s SegmentMap, catalog: &'s SymbolCatalog, graph: &'s ObjectGraph) -> Self
    {
        Self {
            segments,
            catalog,
            graph,
            incoming: OnceCell::new(),
            dominators: OnceCell::new(),
        }
    }

    pub fn graph(&self) -> &'s ObjectGraph
    {
        self.graph
    }

    pub fn catalog(&self) -> &'s SymbolCatalog
    {
        self.catalog
    }

    /// Object count and bytes per concrete type, largest total first
    pub fn census(&self) -> Vec<CensusEntry>
    {
        let mut totals: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for object in self.graph.objects() {
            let entry = totals.entry(object.type_name(self.catalog)).or_default();
            entry.0 += 1;
            entry.1 = entry.1.saturating_add(object.size);
        }
        let mut census: Vec<CensusEntry> = totals
            .into_iter()
            .map(|(type_name, (count, total_bytes))| CensusEntry {
                type_name,
                count,
                total_bytes,
            })
            .collect();
        census.sort_by(|a, b| b.total_bytes.cmp(&a.total_bytes).then_with(|| a.type_name.cmp(&b.type_name)));
        census
    }

    /// The object whose byte window contains `address`
    pub fn object_at(&self, address: Address) -> Option<&'s Object>
    {
        self.graph.object_containing(address)
    }

    pub fn objects(&self) -> &'s [Object]
    {
        self.graph.objects()
    }

    /// Objects whose type name is exactly `name`, `[n]T` included
    pub fn objects_of_type<'q>(&'q self, name: &'q str) -> impl Iterator<Item = &'s Object> + 'q
    {
        self.graph
            .objects()
            .iter()
            .filter(move |object| object.type_name(self.catalog) == name)
    }

    pub fn objects_matching<'q>(&'q self, pattern: &'q Regex) -> impl Iterator<Item = &'s Object> + 'q
    {
        self.graph
            .objects()
            .iter()
            .filter(move |object| pattern.is_match(&object.type_name(self.catalog)))
    }

    /// Typed reads over the same dump and catalog
    pub fn reader(&self) -> ValueReader<'s>
    {
        ValueReader::new(self.segments, self.catalog)
    }

    /// Decoded leaf values of an object, keyed by field path
    pub fn fields(&self, object: &Object) -> Result<Vec<(String, Value)>>
    {
        let reader = self.reader();
        if object.repeat == 1 {
            return Ok(reader.read(object.address, object.ty)?.leaves(MAX_FIELD_ELEMENTS));
        }
        let count = object.repeat.min(MAX_FIELD_ELEMENTS);
        let values = reader.read_many(object.address, object.ty, count)?;
        let mut out = Vec::new();
        for (index, value) in values.iter().enumerate() {
            for (path, leaf) in value.leaves(MAX_FIELD_ELEMENTS) {
                let path = if path.is_empty() {
                    format!("[{index}]")
                } else {
                    format!("[{index}].{path}")
                };
                out.push((path, leaf));
            }
        }
        Ok(out)
    }

    pub fn roots(&self) -> &'s [Root]
    {
        self.graph.roots()
    }

    pub fn root(&self, id: RootId) -> Option<&'s Root>
    {
        self.graph.roots().get(id.0 as usize)
    }

    /// Outgoing edges of the object containing `address`
    pub fn edges_from(&self, address: Address) -> &'s [Edge]
    {
        match self.object_at(address) {
            Some(object) => self.graph.edges_from_source(EdgeSource::Object(object.id)),
            None => &[],
        }
    }

    pub fn edges_from_root(&self, id: RootId) -> &'s [Edge]
    {
        self.graph.edges_from_source(EdgeSource::Root(id))
    }

    /// Edges landing inside the object containing `address`
    pub fn edges_to(&self, address: Address) -> Vec<&'s Edge>
    {
        let Some(object) = self.object_at(address) else {
            return Vec::new();
        };
        let edges = self.graph.edges();
        self.incoming()[object.id.index()]
            .iter()
            .map(|&index| &edges[index])
            .collect()
    }

    /// Shortest chain of edges from any root to the object containing `target`
    ///
    /// Roots are tried in id order and edges in offset order, so the answer is
    /// stable between runs. Returns `Ok(None)` when nothing reaches the object.
    pub fn path_from_any_root(&self, target: Address) -> Result<Option<Vec<Edge>>>
    {
        let goal = self
            .object_at(target)
            .ok_or_else(|| HeapdigError::InvalidArgument(format!("no object contains {target}")))?;

        let mut via: Vec<Option<&Edge>> = vec![None; self.graph.objects().len()];
        let mut queue = VecDeque::new();
        for root in self.graph.roots() {
            for edge in self.edges_from_root(root.id) {
                if let Some(object) = edge.object {
                    if via[object.index()].is_none() {
                        via[object.index()] = Some(edge);
                        queue.push_back(object);
                    }
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            if current == goal.id {
                break;
            }
            for edge in self.graph.edges_from_source(EdgeSource::Object(current)) {
                if let Some(object) = edge.object {
                    if via[object.index()].is_none() {
                        via[object.index()] = Some(edge);
                        queue.push_back(object);
                    }
                }
            }
        }

        let mut path = Vec::new();
        let mut current = goal.id;
        while let Some(edge) = via[current.index()] {
            path.push(*edge);
            match edge.source {
                EdgeSource::Root(_) => {
                    path.reverse();
                    return Ok(Some(path));
                }
                EdgeSource::Object(source) => current = source,
            }
            if path.len() > via.len() {
                break;
            }
        }
        Ok(None)
    }

    pub fn diagnostics(&self) -> &'s DiagnosticsReport
    {
        self.graph.diagnostics()
    }

    pub fn is_complete(&self) -> bool
    {
        self.graph.is_complete()
    }

    /// Retained size of every object, indexed by object id
    pub fn retained_sizes(&self) -> Vec<Retained>
    {
        let dominators = self.dominators();
        self.graph
            .objects()
            .iter()
            .map(|object| {
                let node = object.id.index() + 1;
                Retained {
                    object: object.id,
                    bytes: dominators.retained(node),
                    dominator: dominators
                        .immediate_dominator(node)
                        .filter(|&idom| idom != 0)
                        .map(|idom| ObjectId(u32::try_from(idom - 1).unwrap_or(u32::MAX))),
                }
            })
            .collect()
    }

    /// The `count` objects retaining the most bytes
    pub fn top_retainers(&self, count: usize) -> Vec<Retained>
    {
        let mut retained = self.retained_sizes();
        retained.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.object.cmp(&b.object)));
        retained.truncate(count);
        retained
    }

    /// Write the graph in Graphviz DOT form
    ///
    /// Roots are boxes and objects are ellipses labelled with address and
    /// type. Edges carry the pointer's offset in their source; edges that
    /// reach no object are left out.
    pub fn write_dot(&self, out: &mut impl io::Write) -> io::Result<()>
    {
        writeln!(out, "digraph heap {{")?;
        for root in self.roots() {
            writeln!(out, "  r{} [shape=box, label=\"{}\"];", root.id.0, dot_escape(&root.name))?;
        }
        for object in self.objects() {
            writeln!(
                out,
                "  o{} [label=\"{}\\n{}\"];",
                object.id.0,
                object.address,
                dot_escape(&object.type_name(self.catalog))
            )?;
        }
        for edge in self.graph.edges() {
            let Some(target) = edge.object else {
                continue;
            };
            let source = match edge.source {
                EdgeSource::Root(id) => format!("r{}", id.0),
                EdgeSource::Object(id) => format!("o{}", id.0),
            };
            writeln!(out, "  {source} -> o{} [label=\"+{}\"];", target.0, edge.offset)?;
        }
        writeln!(out, "}}")
    }

    fn incoming(&self) -> &Vec<Vec<usize>>
    {
        self.incoming.get_or_init(|| {
            let mut incoming = vec![Vec::new(); self.graph.objects().len()];
            for (index, edge) in self.graph.edges().iter().enumerate() {
                if let Some(object) = edge.object {
                    incoming[object.index()].push(index);
                }
            }
            debug!(edges = self.graph.edges().len(), "built reverse edge index");
            incoming
        })
    }

    fn dominators(&self) -> &Dominators
    {
        self.dominators.get_or_init(|| {
            let objects = self.graph.objects();
            let mut successors = vec![Vec::new(); objects.len() + 1];
            let mut sizes = vec![0u64; objects.len() + 1];
            for object in objects {
                sizes[object.id.index() + 1] = object.size;
            }
            for edge in self.graph.edges() {
                let Some(target) = edge.object else {
                    continue;
                };
                let from = match edge.source {
                    EdgeSource::Root(_) => 0,
                    EdgeSource::Object(id) => id.index() + 1,
                };
                successors[from].push(target.index() + 1);
            }
            for targets in &mut successors {
                targets.dedup();
            }
            debug!(nodes = successors.len(), "computing dominators");
            Dominators::compute(&successors, &sizes)
        })
    }
}

fn dot_escape(text: &str) -> String
{
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
