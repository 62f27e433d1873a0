//! Whole-pipeline runs over a synthetic core and executable

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{go_program, CoreBuilder, DebugInfo, DATA, HEAP, STACK, TEXT};
use heapdig_core::graph::EdgeSource;
use heapdig_core::roots::RootKind;
use heapdig_core::types::{Address, ThreadId};
use heapdig_core::{AnalysisOptions, HeapdigError, Session};
use tempfile::NamedTempFile;

const FRAME_POINTER: u64 = STACK + 0x900;

fn put(buffer: &mut [u8], at: u64, word: u64)
{
    let at = usize::try_from(at).unwrap();
    buffer[at..at + 8].copy_from_slice(&word.to_le_bytes());
}

/// Two nodes pointing at each other, a string, and one live frame
///
/// `main.head` holds the first node, `main.name` holds "hello", and the
/// innermost frame of `main.work` keeps the second node in `p`.
fn dump() -> NamedTempFile
{
    let mut data = vec![0u8; 0x100];
    put(&mut data, 0, HEAP);
    put(&mut data, 0x10, HEAP + 0x40);
    put(&mut data, 0x18, 5);

    let mut heap = vec![0u8; 0x100];
    put(&mut heap, 0, HEAP + 0x10);
    put(&mut heap, 8, 1);
    put(&mut heap, 0x10, HEAP);
    put(&mut heap, 0x18, 2);
    heap[0x40..0x45].copy_from_slice(b"hello");

    let mut stack = vec![0u8; 0x1000];
    // Outermost frame: saved frame pointer and return address are zero.
    let cfa = FRAME_POINTER + 16;
    put(&mut stack, cfa - 24 - STACK, HEAP + 0x10);

    CoreBuilder::new()
        .memory(DATA, data)
        .memory(HEAP, heap)
        .memory(STACK, stack)
        .thread(101, TEXT + 0x120, STACK + 0x8c0, FRAME_POINTER)
        .process(101, "server", "./server")
        .write()
}

fn executable(architecture: object::Architecture) -> NamedTempFile
{
    let mut debug = DebugInfo::new();
    go_program(&mut debug);
    common::write_temp(&debug.into_object(architecture))
}

#[test]
fn test_census_of_live_heap()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let session = Session::open(core.path(), exe.path()).unwrap();
    let query = session.query();

    assert!(query.is_complete());
    let census: Vec<(String, u64, u64)> = query
        .census()
        .into_iter()
        .map(|entry| (entry.type_name, entry.count, entry.total_bytes))
        .collect();
    assert_eq!(
        census,
        vec![("main.node".to_string(), 2, 32), ("[5]uint8".to_string(), 1, 5)]
    );
    assert_eq!(session.process().map(|process| process.command.as_str()), Some("server"));
}

#[test]
fn test_roots_cover_globals_and_frames()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let session = Session::open(core.path(), exe.path()).unwrap();
    let query = session.query();

    let names: Vec<&str> = query.roots().iter().map(|root| root.name.as_str()).collect();
    assert_eq!(names, vec!["main.head", "main.name", "main.work.p"]);
    match &query.roots()[2].kind {
        RootKind::Frame {
            thread,
            depth,
            function,
            ..
        } => {
            assert_eq!(*thread, ThreadId(101));
            assert_eq!(*depth, 0);
            assert_eq!(function, "main.work");
        }
        other => panic!("expected a frame root, got {other:?}"),
    }
}

#[test]
fn test_thread_frames()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let session = Session::open(core.path(), exe.path()).unwrap();

    let frames = session.frames(&session.contexts()[0], 64);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].thread, ThreadId(101));
    assert_eq!(frames[0].pc, Address::new(TEXT + 0x120));
    assert_eq!(frames[0].cfa, Address::new(FRAME_POINTER + 16));
    let function = session.catalog().function_containing(frames[0].pc).unwrap();
    assert_eq!(function.name, "main.work");
}

#[test]
fn test_string_contents_of_global()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let session = Session::open(core.path(), exe.path()).unwrap();
    let query = session.query();

    let name = session.catalog().type_by_name("string").unwrap();
    let reader = query.reader();
    let value = reader.read(Address::new(DATA + 0x10), name.id).unwrap().decode();
    assert_eq!(reader.string_contents(&value).unwrap(), "hello");
}

#[test]
fn test_object_queries()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let session = Session::open(core.path(), exe.path()).unwrap();
    let query = session.query();

    let second = query.object_at(Address::new(HEAP + 0x18)).unwrap();
    assert_eq!(second.address, Address::new(HEAP + 0x10));
    let fields: Vec<String> = query
        .fields(second)
        .unwrap()
        .iter()
        .map(|(path, value)| format!("{path}={value}"))
        .collect();
    assert_eq!(fields, vec![format!("next={HEAP:#x}"), "value=2".to_string()]);

    let outgoing = query.edges_from(Address::new(HEAP + 0x10));
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].target, Address::new(HEAP));

    // The first node and the frame slot both reference the second node.
    let incoming = query.edges_to(Address::new(HEAP + 0x10));
    assert_eq!(incoming.len(), 2);

    let path = query.path_from_any_root(Address::new(HEAP + 0x10)).unwrap().unwrap();
    assert_eq!(path.len(), 1);
    assert_eq!(path[0].source, EdgeSource::Root(query.roots()[2].id));

    let text = query.object_at(Address::new(HEAP + 0x42)).unwrap();
    assert_eq!(text.type_name(session.catalog()), "[5]uint8");
    assert!(query.object_at(Address::new(HEAP + 0x45)).is_none());
}

#[test]
fn test_abort_before_traversal()
{
    let (core, exe) = (dump(), executable(object::Architecture::X86_64));
    let abort = Arc::new(AtomicBool::new(false));
    abort.store(true, Ordering::Relaxed);
    let options = AnalysisOptions::default().with_abort(abort);

    let result = Session::open_with_options(core.path(), exe.path(), options);
    assert!(matches!(result, Err(HeapdigError::Aborted)));
}

#[test]
fn test_architecture_mismatch()
{
    let (core, exe) = (dump(), executable(object::Architecture::Aarch64));
    let result = Session::open(core.path(), exe.path());
    assert!(matches!(result, Err(HeapdigError::MalformedMetadata(_))));
}
