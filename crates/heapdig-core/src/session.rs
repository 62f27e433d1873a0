//! # Session
//!
//! One analysis run: a core dump, the executable's metadata, and the object
//! graph built from them.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use heapdig_core::Session;
//!
//! let session = Session::open(Path::new("core.1234"), Path::new("server"))?;
//! for entry in session.query().census().iter().take(10) {
//!     println!("{:>10} {:>12} {}", entry.count, entry.total_bytes, entry.type_name);
//! }
//! # Ok::<(), heapdig_core::HeapdigError>(())
//! ```

use std::path::Path;
use std::time::Instant;

use tracing::{info, warn};

use crate::diagnostics::Diagnostic;
use crate::dump::{open_core, SegmentMap};
use crate::error::{HeapdigError, Result};
use crate::graph::ObjectGraph;
use crate::options::AnalysisOptions;
use crate::query::QueryEngine;
use crate::roots::build_roots;
use crate::symbols::{MetadataImage, NoSourceLocations, SourceLocator, SymbolCatalog};
use crate::types::{ExecutionContext, ProcessInfo, StackFrame};
use crate::unwind::FrameWalker;

#[derive(Debug)]
pub struct Session
{
    segments: SegmentMap,
    catalog: SymbolCatalog,
    process: Option<ProcessInfo>,
    contexts: Vec<ExecutionContext>,
    graph: ObjectGraph,
}

impl Session
{
    /// Analyze `dump` using the executable at `metadata`
    ///
    /// ## Errors
    ///
    /// Fails when either file cannot be read or parsed at the container
    /// level. Problems inside otherwise readable files become diagnostics.
    pub fn open(dump: &Path, metadata: &Path) -> Result<Self>
    {
        Self::open_with_options(dump, metadata, AnalysisOptions::default())
    }

    pub fn open_with_options(dump: &Path, metadata: &Path, options: AnalysisOptions) -> Result<Self>
    {
        let started = Instant::now();
        let image = MetadataImage::open(metadata)?;
        let catalog = image.catalog()?;
        let core = open_core(dump, Some(&image.executable_layer()))?;
        if core.segments.architecture() != image.architecture() {
            return Err(HeapdigError::MalformedMetadata(format!(
                "{} is built for {}, the dump is {}",
                metadata.display(),
                image.architecture(),
                core.segments.architecture()
            )));
        }
        if options.is_aborted() {
            return Err(HeapdigError::Aborted);
        }

        let locator: Box<dyn SourceLocator> = match image.line_table() {
            Ok(table) => Box::new(table),
            Err(err) => {
                warn!(error = %err, "line table unavailable; frame roots carry no source locations");
                Box::new(NoSourceLocations)
            }
        };

        let session = Self::assemble(
            core.segments,
            catalog,
            Some(core.process),
            core.contexts,
            core.diagnostics,
            locator.as_ref(),
            &options,
        );
        info!(
            dump = %dump.display(),
            objects = session.graph.objects().len(),
            elapsed_ms = started.elapsed().as_millis(),
            "session ready"
        );
        Ok(session)
    }

    /// Analyze an address space that was assembled by the caller
    pub fn from_parts(
        segments: SegmentMap,
        catalog: SymbolCatalog,
        contexts: Vec<ExecutionContext>,
        options: &AnalysisOptions,
    ) -> Self
    {
        Self::assemble(segments, catalog, None, contexts, Vec::new(), &NoSourceLocations, options)
    }

    fn assemble(
        segments: SegmentMap,
        catalog: SymbolCatalog,
        process: Option<ProcessInfo>,
        contexts: Vec<ExecutionContext>,
        mut diagnostics: Vec<Diagnostic>,
        locator: &dyn SourceLocator,
        options: &AnalysisOptions,
    ) -> Self
    {
        let roots = build_roots(&segments, &catalog, &contexts, locator, options.root_options());
        diagnostics.extend_from_slice(catalog.diagnostics());
        diagnostics.extend(roots.diagnostics);
        let graph = ObjectGraph::build(&segments, &catalog, roots.roots, diagnostics, options);
        Self {
            segments,
            catalog,
            process,
            contexts,
            graph,
        }
    }

    pub fn query(&self) -> QueryEngine<'_>
    {
        QueryEngine::new(&self.segments, &self.catalog, &self.graph)
    }

    pub fn segments(&self) -> &SegmentMap
    {
        &self.segments
    }

    pub fn catalog(&self) -> &SymbolCatalog
    {
        &self.catalog
    }

    /// Process details from the core's notes; `None` for assembled sessions
    pub fn process(&self) -> Option<&ProcessInfo>
    {
        self.process.as_ref()
    }

    pub fn contexts(&self) -> &[ExecutionContext]
    {
        &self.contexts
    }

    pub fn graph(&self) -> &ObjectGraph
    {
        &self.graph
    }

    /// Walked frames of `context`, innermost first
    ///
    /// Empty when the context's stack is not in the dump.
    pub fn frames(&self, context: &ExecutionContext, max_frames: usize) -> Vec<StackFrame>
    {
        match context.stack.and_then(|start| self.segments.segment_containing(start)) {
            Some(stack) => FrameWalker::new(&self.segments, max_frames).walk(context, (stack.start(), stack.end())),
            None => Vec::new(),
        }
    }
}
