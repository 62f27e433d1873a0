use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use heapdig_core::graph::{Edge, EdgeSource};
use heapdig_core::roots::RootKind;
use heapdig_core::value::Value;
use heapdig_core::{Address, AnalysisOptions, HeapdigError, QueryEngine, Result as AnalysisResult, Session};
use heapdig_utils::{LogLevel, LoggingConfig, info, init_logging_with, warn};
use regex::Regex;

/// Inspect the live heap of a crashed Go process from its core dump.
#[derive(Parser, Debug)]
#[command(name = "heapdig")]
#[command(version)]
#[command(about = "Inspect the live heap of a crashed Go process from its core dump", long_about = None)]
struct Cli
{
    /// ELF core file
    dump: PathBuf,
    /// The executable that produced the dump, with DWARF
    metadata: PathBuf,
    /// Graph worker threads (0 = one per CPU)
    #[arg(long, default_value_t = 0)]
    workers: usize,
    /// Claims handed to a worker at a time
    #[arg(long, default_value_t = 256)]
    batch_size: usize,
    /// Frames walked per thread
    #[arg(long, default_value_t = 1024)]
    max_frames: usize,
    /// Do not treat register values as roots
    #[arg(long, default_value_t = false)]
    no_register_roots: bool,
    /// More log output on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Object count and bytes per type
    Census
    {
        /// Only the largest N types
        #[arg(long)]
        top: Option<usize>,
    },
    /// List objects, optionally filtered by type
    Objects
    {
        /// Exact type name, e.g. `main.node` or `[8]uint8`
        #[arg(long = "type", conflicts_with = "type_re")]
        type_name: Option<String>,
        /// Regular expression over type names
        #[arg(long)]
        type_re: Option<String>,
    },
    /// Show the object containing an address
    Object
    {
        /// Address (hex with 0x prefix, or decimal)
        address: Address,
    },
    /// Shortest chain of references from a root to an address
    Path
    {
        address: Address,
    },
    /// List traversal roots
    Roots,
    /// List everything that could not be fully decoded
    Diagnostics,
    /// Objects retaining the most memory
    Retained
    {
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Summary of the dump and the graph
    Info,
    /// Mapped memory ranges and where their bytes come from
    Mappings,
    /// Stack frames of every thread
    Goroutines,
    /// Write the object graph in Graphviz DOT form
    Objgraph
    {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main()
{
    let cli = Cli::parse();

    let logging = match LoggingConfig::from_env() {
        Ok(config) => config.with_level(LogLevel::from_verbosity(cli.verbose)),
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };
    let _guard = match init_logging_with(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> AnalysisResult<()>
{
    let mut options = AnalysisOptions::default()
        .with_workers(cli.workers)
        .with_batch_size(cli.batch_size)
        .with_max_frames(cli.max_frames);
    options.register_roots = !cli.no_register_roots;

    let abort = options.abort.clone();
    if let Err(e) = ctrlc::set_handler(move || abort.store(true, Ordering::Relaxed)) {
        warn!("Ctrl-C handler unavailable: {e}");
    }

    info!("Opening {} with metadata from {}", cli.dump.display(), cli.metadata.display());
    let session = Session::open_with_options(&cli.dump, &cli.metadata, options)?;
    let query = session.query();
    if !query.is_complete() {
        eprintln!("warning: analysis was interrupted; results are partial");
    }

    match cli.command {
        Commands::Census { top } => print_census(&query, top),
        Commands::Objects { type_name, type_re } => print_objects(&query, type_name.as_deref(), type_re.as_deref())?,
        Commands::Object { address } => print_object(&query, address)?,
        Commands::Path { address } => print_path(&query, address)?,
        Commands::Roots => {
            for root in query.roots() {
                let ty = &session.catalog().descriptor(root.ty).name;
                let place = root.address().map_or_else(|| "(register)".to_string(), |a| a.to_string());
                println!("{:>6}  {:<8}  {place}  {}  {ty}", root.id.0, root.kind.label(), root.name);
            }
        }
        Commands::Diagnostics => {
            for diagnostic in query.diagnostics().iter() {
                println!("{diagnostic}");
            }
        }
        Commands::Retained { top } => {
            println!("{:>14}  {:>18}  TYPE", "RETAINED", "ADDRESS");
            for retained in query.top_retainers(top) {
                if let Some(object) = query.graph().object(retained.object) {
                    let name = object.type_name(session.catalog());
                    println!("{:>14}  {}  {name}", retained.bytes, object.address);
                }
            }
        }
        Commands::Info => {
            if let Some(process) = session.process() {
                println!("Process:       {} ({})", process.command, process.pid.0);
                if !process.args.is_empty() {
                    println!("Command line:  {}", process.args);
                }
            }
            println!("Architecture:  {}", session.segments().architecture());
            println!("Segments:      {}", session.segments().segments().len());
            println!("Threads:       {}", session.contexts().len());
            println!("Types:         {}", session.catalog().types().len());
            println!("Roots:         {}", query.roots().len());
            println!("Objects:       {}", query.objects().len());
            println!("Edges:         {}", query.graph().edges().len());
            let bytes: u64 = query.objects().iter().map(|object| object.size).sum();
            println!("Live bytes:    {bytes}");
            println!("Diagnostics:   {}", query.diagnostics().len());
            println!("Complete:      {}", query.is_complete());
        }
        Commands::Mappings => {
            println!("{:>18}  {:>18}  PERM  ORIGIN", "START", "END");
            for segment in session.segments().segments() {
                println!(
                    "{}  {}  {}   {:?}",
                    segment.start(),
                    segment.end(),
                    segment.permissions(),
                    segment.origin()
                );
            }
        }
        Commands::Goroutines => {
            for context in session.contexts() {
                println!("thread {}", context.thread);
                for frame in session.frames(context, cli.max_frames) {
                    let function = session
                        .catalog()
                        .function_containing(frame.pc)
                        .map_or("?", |function| function.name.as_str());
                    println!("  {frame}  {function}");
                }
            }
        }
        Commands::Objgraph { output } => match output {
            Some(path) => {
                let mut file = BufWriter::new(File::create(&path)?);
                query.write_dot(&mut file)?;
                file.flush()?;
                info!("Wrote object graph to {}", path.display());
            }
            None => query.write_dot(&mut io::stdout().lock())?,
        },
    }
    Ok(())
}

fn print_census(query: &QueryEngine<'_>, top: Option<usize>)
{
    let census = query.census();
    let shown = top.unwrap_or(census.len());
    println!("{:>10}  {:>14}  TYPE", "COUNT", "BYTES");
    for entry in census.iter().take(shown) {
        println!("{:>10}  {:>14}  {}", entry.count, entry.total_bytes, entry.type_name);
    }
}

fn print_objects(query: &QueryEngine<'_>, type_name: Option<&str>, type_re: Option<&str>) -> AnalysisResult<()>
{
    let catalog = query.catalog();
    let print = |object: &heapdig_core::graph::Object| {
        println!("{}  {:>10}  {}", object.address, object.size, object.type_name(catalog));
    };
    match (type_name, type_re) {
        (Some(name), _) => query.objects_of_type(name).for_each(print),
        (None, Some(pattern)) => {
            let pattern = Regex::new(pattern).map_err(|e| HeapdigError::InvalidArgument(e.to_string()))?;
            query.objects_matching(&pattern).for_each(print);
        }
        (None, None) => query.objects().iter().for_each(print),
    }
    Ok(())
}

fn print_object(query: &QueryEngine<'_>, address: Address) -> AnalysisResult<()>
{
    let object = query
        .object_at(address)
        .ok_or_else(|| HeapdigError::InvalidArgument(format!("no object contains {address}")))?;
    let catalog = query.catalog();
    println!("{}  {} bytes  {}", object.address, object.size, object.type_name(catalog));

    println!("\nFields:");
    let reader = query.reader();
    for (path, value) in query.fields(object)? {
        let path = if path.is_empty() { "(value)".to_string() } else { path };
        let text = match &value {
            Value::String { .. } => match reader.string_contents(&value) {
                Ok(text) => format!(" {text:?}"),
                Err(e) => format!(" <{e}>"),
            },
            _ => String::new(),
        };
        println!("  {path:<32} {value}{text}");
    }

    println!("\nReferences:");
    for edge in query.edges_from(address) {
        let field = if object.repeat == 1 {
            catalog.field_path(object.ty, edge.offset).unwrap_or_default()
        } else {
            String::new()
        };
        println!("  +{:<6} {field:<24} -> {}", edge.offset, describe_target(query, edge));
    }

    println!("\nReferenced by:");
    for edge in query.edges_to(address) {
        println!("  {} +{}", describe_source(query, edge.source), edge.offset);
    }
    Ok(())
}

fn print_path(query: &QueryEngine<'_>, address: Address) -> AnalysisResult<()>
{
    match query.path_from_any_root(address)? {
        Some(path) => {
            for edge in &path {
                println!("{} +{} -> {}", describe_source(query, edge.source), edge.offset, describe_target(query, edge));
            }
        }
        None => println!("{address} is not reachable from any root"),
    }
    Ok(())
}

fn describe_source(query: &QueryEngine<'_>, source: EdgeSource) -> String
{
    match source {
        EdgeSource::Root(id) => match query.root(id) {
            Some(root) => match &root.kind {
                RootKind::Frame { thread, depth, location: Some(location), .. } => {
                    format!("{} (thread {thread} frame {depth} at {location})", root.name)
                }
                _ => format!("{} ({})", root.name, root.kind.label()),
            },
            None => id.to_string(),
        },
        EdgeSource::Object(id) => match query.graph().object(id) {
            Some(object) => format!("{} {}", object.address, object.type_name(query.catalog())),
            None => source.to_string(),
        },
    }
}

fn describe_target(query: &QueryEngine<'_>, edge: &Edge) -> String
{
    match (edge.fault, edge.object.and_then(|id| query.graph().object(id))) {
        (Some(fault), _) => format!("{} [{fault}]", edge.target),
        (None, Some(object)) => format!("{} {}", edge.target, object.type_name(query.catalog())),
        (None, None) => edge.target.to_string(),
    }
}
