//! # Object Graph
//!
//! The deduplicated reachability closure of the root set.
//!
//! ## Construction
//!
//! Every pointer found while scanning a root or an object becomes a *claim*:
//! an address plus the typing it was reached under. Claims live in a shared
//! [`DashSet`]; the worker whose insert succeeds owns the claim and scans it.
//! No claim is ever scanned twice, so cycles terminate.
//!
//! The frontier is processed in batches on scoped worker threads. A
//! cooperative abort flag is checked before each batch. An aborted build still
//! produces a graph, flagged incomplete.
//!
//! ## Finalization
//!
//! Claims are folded into objects (see `finalize`). The result does not
//! depend on the order in which workers happened to discover claims.

mod finalize;
mod scan;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashSet;
use tracing::{debug, info, trace, warn};

use self::scan::{Claim, ScanOutput, Scanner};
use crate::diagnostics::{Diagnostic, DiagnosticsReport};
use crate::dump::SegmentMap;
use crate::options::AnalysisOptions;
use crate::roots::{Root, RootId};
use crate::symbols::{SymbolCatalog, TypeId};
use crate::types::Address;

/// Index of an object in address order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u32);

impl ObjectId
{
    pub fn index(self) -> usize
    {
        self.0 as usize
    }
}

/// A discovered allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object
{
    pub id: ObjectId,
    pub address: Address,
    /// Bytes covered by the object
    pub size: u64,
    pub ty: TypeId,
    /// Number of leading values of `ty` that are scanned for pointers
    ///
    /// A slice's backing array is scanned up to the slice length, while
    /// `size` covers its whole capacity.
    pub repeat: u64,
}

impl Object
{
    pub fn end(&self) -> Address
    {
        self.address.saturating_add(self.size)
    }

    pub fn contains(&self, address: Address) -> bool
    {
        address >= self.address && address < self.end()
    }

    /// Number of `ty` values that fit in the object
    pub fn length(&self, catalog: &SymbolCatalog) -> u64
    {
        match catalog.descriptor(self.ty).size {
            0 => self.repeat,
            elem => self.size / elem,
        }
    }

    /// Display name of the object's type, `[n]T` when it holds more than one value
    pub fn type_name(&self, catalog: &SymbolCatalog) -> String
    {
        let name = &catalog.descriptor(self.ty).name;
        match self.length(catalog) {
            1 => name.clone(),
            n => format!("[{n}]{name}"),
        }
    }
}

/// What an edge starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeSource
{
    Root(RootId),
    Object(ObjectId),
}

impl fmt::Display for EdgeSource
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            EdgeSource::Root(id) => write!(f, "{id}"),
            EdgeSource::Object(id) => write!(f, "object#{}", id.0),
        }
    }
}

/// Why an edge's target could not become an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeFault
{
    DanglingPointer,
    OutOfBounds,
    UnknownConcreteType,
}

impl fmt::Display for EdgeFault
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            EdgeFault::DanglingPointer => write!(f, "dangling"),
            EdgeFault::OutOfBounds => write!(f, "out-of-bounds"),
            EdgeFault::UnknownConcreteType => write!(f, "unknown-type"),
        }
    }
}

/// A pointer from a root or object to an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Edge
{
    pub source: EdgeSource,
    /// Byte offset of the pointer inside its source
    pub offset: u64,
    pub target: Address,
    /// Object containing `target`, if any
    pub object: Option<ObjectId>,
    pub fault: Option<EdgeFault>,
}

/// The finished graph
#[derive(Debug, Clone)]
pub struct ObjectGraph
{
    pub(crate) roots: Vec<Root>,
    pub(crate) objects: Vec<Object>,
    /// Sorted by source, then offset
    pub(crate) edges: Vec<Edge>,
    pub(crate) diagnostics: DiagnosticsReport,
    pub(crate) complete: bool,
}

impl ObjectGraph
{
    /// Traverse from `roots` and fold the discovered claims into objects
    ///
    /// `diagnostics` carries problems found before traversal (catalog and
    /// root enumeration) into the graph's report.
    pub fn build(
        segments: &SegmentMap,
        catalog: &SymbolCatalog,
        roots: Vec<Root>,
        diagnostics: Vec<Diagnostic>,
        options: &AnalysisOptions,
    ) -> Self
    {
        let started = Instant::now();
        let registry = DashSet::new();
        let scanner = Scanner::new(segments, catalog, &registry);
        let workers = options.effective_workers();
        let batch_size = options.batch_size.max(1);

        let mut collected = ScanOutput {
            diagnostics,
            ..ScanOutput::default()
        };
        for root in &roots {
            collected.merge(scanner.scan_root(root));
        }

        let mut frontier = std::mem::take(&mut collected.claims);
        let mut rounds = 0usize;
        let mut complete = true;
        while !frontier.is_empty() {
            if options.is_aborted() {
                complete = false;
                break;
            }
            rounds += 1;
            trace!(round = rounds, frontier = frontier.len(), "expanding frontier");
            let (output, finished) = expand(&scanner, &frontier, workers, batch_size, options);
            frontier = output.claims;
            collected.edges.extend(output.edges);
            collected.diagnostics.extend(output.diagnostics);
            if !finished {
                complete = false;
                break;
            }
        }
        if !complete {
            warn!(pending = frontier.len(), "graph construction aborted; results are partial");
        }

        let claims: Vec<Claim> = registry.into_iter().collect();
        debug!(claims = claims.len(), rounds, "traversal finished");

        let graph = finalize::finalize(roots, claims, collected.edges, collected.diagnostics, complete);
        info!(
            objects = graph.objects.len(),
            edges = graph.edges.len(),
            diagnostics = graph.diagnostics.len(),
            complete,
            elapsed_ms = started.elapsed().as_millis(),
            "object graph built"
        );
        graph
    }

    pub fn roots(&self) -> &[Root]
    {
        &self.roots
    }

    /// Objects in address order
    pub fn objects(&self) -> &[Object]
    {
        &self.objects
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object>
    {
        self.objects.get(id.index())
    }

    pub fn edges(&self) -> &[Edge]
    {
        &self.edges
    }

    pub fn diagnostics(&self) -> &DiagnosticsReport
    {
        &self.diagnostics
    }

    /// False when construction was aborted before the frontier drained
    pub fn is_complete(&self) -> bool
    {
        self.complete
    }

    /// The object whose byte window contains `address`
    pub fn object_containing(&self, address: Address) -> Option<&Object>
    {
        finalize::containing(&self.objects, address)
    }

    /// Edges leaving `source`, ordered by offset
    pub fn edges_from_source(&self, source: EdgeSource) -> &[Edge]
    {
        let start = self.edges.partition_point(|edge| edge.source < source);
        let end = self.edges.partition_point(|edge| edge.source <= source);
        &self.edges[start..end]
    }
}

/// Scan one frontier on `workers` threads
///
/// Returns the merged output and whether every batch was processed.
fn expand(
    scanner: &Scanner<'_>,
    frontier: &[Claim],
    workers: usize,
    batch_size: usize,
    options: &AnalysisOptions,
) -> (ScanOutput, bool)
{
    let batches: Vec<&[Claim]> = frontier.chunks(batch_size).collect();
    let next = AtomicUsize::new(0);
    let merged = Mutex::new(ScanOutput::default());
    let finished = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers.min(batches.len()).max(1) {
            scope.spawn(|| {
                let mut local = ScanOutput::default();
                loop {
                    if options.is_aborted() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(batch) = batches.get(index) else {
                        break;
                    };
                    for claim in *batch {
                        local.merge(scanner.scan_claim(claim));
                    }
                    finished.fetch_add(1, Ordering::Relaxed);
                }
                if let Ok(mut merged) = merged.lock() {
                    merged.merge(local);
                }
            });
        }
    });

    let output = merged.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    (output, finished.load(Ordering::Relaxed) == batches.len())
}
