//! Object graph construction and queries over hand-built address spaces

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gimli::RunTimeEndian;
use heapdig_core::dump::{Permissions, Segment, SegmentMap};
use heapdig_core::graph::{EdgeFault, EdgeSource};
use heapdig_core::symbols::{CatalogBuilder, Field, ScalarKind, SymbolCatalog, TypeId, TypeKind};
use heapdig_core::types::{Address, Architecture};
use heapdig_core::{AnalysisOptions, DiagnosticKind, Session};

const RODATA: u64 = 0x4a_0000;
const DATA: u64 = 0x50_0000;
const HEAP: u64 = 0xc000_0000;

const NODE_TYPE: u64 = RODATA + 0x100;
const POINT_TYPE: u64 = RODATA + 0x200;
const NODE_PTR_TYPE: u64 = RODATA + 0x300;
const WRAP_TYPE: u64 = RODATA + 0x400;

struct Types
{
    node_ptr: TypeId,
    eface: TypeId,
    ints: TypeId,
}

fn catalog(globals: &[(&str, u64, fn(&Types) -> TypeId)]) -> SymbolCatalog
{
    let mut builder = CatalogBuilder::new(8);
    let int = builder.scalar("int", ScalarKind::Int, 8);
    let node = builder.declare("main.node", Some(16));
    let node_ptr = builder.pointer_to(node);
    builder.define(
        node,
        TypeKind::Struct {
            fields: vec![Field::new("next", 0, node_ptr), Field::new("value", 8, int)],
        },
    );
    let point = builder.structure("main.point", 16, vec![Field::new("x", 0, int), Field::new("y", 8, int)]);
    let eface = builder.interface("interface {}", true);
    let ints = builder.slice_of(int);
    builder.runtime_type(Address::new(NODE_TYPE), node);
    builder.runtime_type(Address::new(POINT_TYPE), point);
    builder.runtime_type(Address::new(NODE_PTR_TYPE), node_ptr);
    let leaf = builder.structure("main.leaf", 8, vec![Field::new("v", 0, int)]);
    let leaf_ptr = builder.pointer_to(leaf);
    let wrap = builder.structure("main.wrap", 8, vec![Field::new("p", 0, leaf_ptr)]);
    builder.runtime_type(Address::new(WRAP_TYPE), wrap);

    let types = Types { node_ptr, eface, ints };
    for (name, address, ty) in globals {
        builder.global(*name, Address::new(*address), ty(&types));
    }
    builder.finish()
}

/// Writable data and heap segments filled from `(address, word)` pairs
fn segments(words: &[(u64, u64)]) -> SegmentMap
{
    let mut data = vec![0u8; 0x100];
    let mut heap = vec![0u8; 0x1000];
    for &(address, word) in words {
        let (buffer, base) = if address >= HEAP { (&mut heap, HEAP) } else { (&mut data, DATA) };
        let at = (address - base) as usize;
        buffer[at..at + 8].copy_from_slice(&word.to_le_bytes());
    }
    SegmentMap::new(
        Architecture::X86_64,
        RunTimeEndian::Little,
        vec![
            Segment::from_bytes(Address::new(RODATA), vec![0u8; 0x1000], Permissions::READ_ONLY),
            Segment::from_bytes(Address::new(DATA), data, Permissions::READ_WRITE),
            Segment::from_bytes(Address::new(HEAP), heap, Permissions::READ_WRITE),
        ],
    )
    .unwrap()
}

fn session(globals: &[(&str, u64, fn(&Types) -> TypeId)], words: &[(u64, u64)], options: &AnalysisOptions) -> Session
{
    Session::from_parts(segments(words), catalog(globals), Vec::new(), options)
}

fn serial() -> AnalysisOptions
{
    AnalysisOptions::default().with_workers(1)
}

#[test]
fn test_direct_interface_round_trip()
{
    // An interface holding a *main.node stores the pointer itself.
    let session = session(
        &[("main.any", DATA, |t| t.eface)],
        &[(DATA, NODE_PTR_TYPE), (DATA + 8, HEAP + 0x20), (HEAP + 0x28, 7)],
        &serial(),
    );
    let query = session.query();

    let node = query.object_at(Address::new(HEAP + 0x20)).unwrap();
    assert_eq!(node.type_name(session.catalog()), "main.node");
    assert_eq!(node.size, 16);

    let edges = query.edges_from_root(query.roots()[0].id);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].offset, 8);
    assert_eq!(edges[0].object, Some(node.id));
}

#[test]
fn test_indirect_interface_round_trip()
{
    // A main.point does not fit in a word; the data word points to a boxed copy.
    let session = session(
        &[("main.any", DATA, |t| t.eface)],
        &[(DATA, POINT_TYPE), (DATA + 8, HEAP + 0x40), (HEAP + 0x40, 3), (HEAP + 0x48, 4)],
        &serial(),
    );
    let query = session.query();

    let point = query.object_at(Address::new(HEAP + 0x40)).unwrap();
    assert_eq!(point.type_name(session.catalog()), "main.point");
    let fields = query.fields(point).unwrap();
    let rendered: Vec<String> = fields.iter().map(|(path, value)| format!("{path}={value}")).collect();
    assert_eq!(rendered, vec!["x=3", "y=4"]);
}

#[test]
fn test_wrapped_and_boxed_interfaces_in_one_dump()
{
    // main.wrap{p *main.leaf} is pointer-shaped, so its data word is the leaf
    // pointer. main.point{x, y} is boxed.
    let session = session(
        &[("main.a", DATA, |t| t.eface), ("main.b", DATA + 0x10, |t| t.eface)],
        &[
            (DATA, WRAP_TYPE),
            (DATA + 8, HEAP + 0x20),
            (DATA + 0x10, POINT_TYPE),
            (DATA + 0x18, HEAP + 0x40),
            (HEAP + 0x20, 5),
            (HEAP + 0x40, 11),
            (HEAP + 0x48, 22),
        ],
        &serial(),
    );
    let query = session.query();

    let census: Vec<(String, u64, u64)> = query
        .census()
        .into_iter()
        .map(|entry| (entry.type_name, entry.count, entry.total_bytes))
        .collect();
    assert_eq!(
        census,
        vec![("main.point".to_string(), 1, 16), ("main.leaf".to_string(), 1, 8)]
    );

    let leaf = query.object_at(Address::new(HEAP + 0x20)).unwrap();
    assert_eq!(leaf.address, Address::new(HEAP + 0x20));
    assert_eq!(leaf.type_name(session.catalog()), "main.leaf");
    let edges = query.edges_from_root(query.roots()[0].id);
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].object, Some(leaf.id));

    let point = query.object_at(Address::new(HEAP + 0x40)).unwrap();
    let rendered: Vec<String> = query
        .fields(point)
        .unwrap()
        .iter()
        .map(|(path, value)| format!("{path}={value}"))
        .collect();
    assert_eq!(rendered, vec!["x=11", "y=22"]);
}

#[test]
fn test_cycle_is_discovered_once()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr)],
        &[(DATA, HEAP), (HEAP, HEAP + 0x10), (HEAP + 0x10, HEAP)],
        &serial(),
    );
    let query = session.query();

    assert_eq!(query.objects().len(), 2);
    assert_eq!(query.graph().edges().len(), 3);
    assert!(query.is_complete());
    let into_first = query.edges_to(Address::new(HEAP + 4));
    assert_eq!(into_first.len(), 2);
    assert!(into_first.iter().any(|edge| matches!(edge.source, EdgeSource::Object(_))));
}

#[test]
fn test_dot_output()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr)],
        &[(DATA, HEAP), (HEAP, HEAP + 0x10), (HEAP + 0x10, HEAP)],
        &serial(),
    );
    let query = session.query();
    let mut out = Vec::new();
    query.write_dot(&mut out).unwrap();
    let dot = String::from_utf8(out).unwrap();

    let root = query.roots()[0].id.0;
    let lines: Vec<&str> = dot.lines().collect();
    assert_eq!(lines.first(), Some(&"digraph heap {"));
    assert_eq!(lines.last(), Some(&"}"));
    assert!(lines.contains(&format!("  r{root} [shape=box, label=\"main.head\"];").as_str()));
    assert!(lines.contains(&"  o0 [label=\"0x00000000c0000000\\nmain.node\"];"));
    assert!(lines.contains(&"  o1 [label=\"0x00000000c0000010\\nmain.node\"];"));
    assert!(lines.contains(&format!("  r{root} -> o0 [label=\"+0\"];").as_str()));
    assert!(lines.contains(&"  o0 -> o1 [label=\"+0\"];"));
    assert!(lines.contains(&"  o1 -> o0 [label=\"+0\"];"));
    assert_eq!(lines.len(), 2 + 1 + 2 + 3);
}

#[test]
fn test_dangling_pointer_is_reported()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr)],
        &[(DATA, HEAP), (HEAP, 0xdead_0000)],
        &serial(),
    );
    let query = session.query();

    assert_eq!(query.objects().len(), 1);
    let edges = query.edges_from(Address::new(HEAP));
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].fault, Some(EdgeFault::DanglingPointer));
    assert_eq!(edges[0].object, None);
    assert_eq!(query.diagnostics().count(DiagnosticKind::DanglingPointer), 1);
}

#[test]
fn test_unknown_interface_type_keeps_edge()
{
    let session = session(
        &[("main.any", DATA, |t| t.eface)],
        &[(DATA, RODATA + 0x880), (DATA + 8, HEAP)],
        &serial(),
    );
    let query = session.query();

    assert!(query.objects().is_empty());
    let edges = query.edges_from_root(query.roots()[0].id);
    assert_eq!(edges[0].fault, Some(EdgeFault::UnknownConcreteType));
    assert_eq!(query.diagnostics().count(DiagnosticKind::UnknownConcreteType), 1);
}

#[test]
fn test_census_totals()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr), ("main.nums", DATA + 0x10, |t| t.ints)],
        &[
            (DATA, HEAP),
            (HEAP, HEAP + 0x10),
            (HEAP + 0x10, HEAP + 0x20),
            (DATA + 0x10, HEAP + 0x100),
            (DATA + 0x18, 3),
            (DATA + 0x20, 4),
        ],
        &serial(),
    );
    let census = session.query().census();

    let summary: Vec<(&str, u64, u64)> = census
        .iter()
        .map(|entry| (entry.type_name.as_str(), entry.count, entry.total_bytes))
        .collect();
    // A slice's backing store is named and sized by its capacity.
    assert_eq!(summary, vec![("main.node", 3, 48), ("[4]int", 1, 32)]);

    // Only the first three elements are scanned.
    let backing = session.query().object_at(Address::new(HEAP + 0x100)).unwrap().clone();
    assert_eq!(backing.repeat, 3);
    assert_eq!(backing.size, 32);
    assert_eq!(backing.length(session.catalog()), 4);
}

#[test]
fn test_subslices_share_one_backing_object()
{
    let session = session(
        &[("main.short", DATA + 0x20, |t| t.ints), ("main.full", DATA + 0x40, |t| t.ints)],
        &[
            (DATA + 0x20, HEAP + 0x100),
            (DATA + 0x28, 2),
            (DATA + 0x30, 4),
            (DATA + 0x40, HEAP + 0x100),
            (DATA + 0x48, 4),
            (DATA + 0x50, 4),
        ],
        &AnalysisOptions::default().with_workers(2),
    );
    let query = session.query();

    assert_eq!(query.objects().len(), 1);
    let backing = &query.objects()[0];
    assert_eq!(backing.type_name(session.catalog()), "[4]int");
    assert_eq!(backing.repeat, 4);
    assert_eq!(query.edges_to(Address::new(HEAP + 0x100)).len(), 2);
}

#[test]
fn test_build_is_deterministic_across_worker_counts()
{
    let globals: [(&str, u64, fn(&Types) -> TypeId); 2] =
        [("main.a", DATA, |t| t.node_ptr), ("main.b", DATA + 8, |t| t.node_ptr)];
    let mut words = vec![(DATA, HEAP), (DATA + 8, HEAP + 0x200)];
    // Two chains that merge halfway.
    for index in 0..16u64 {
        words.push((HEAP + index * 0x10, HEAP + (index + 1) * 0x10));
        words.push((HEAP + 0x200 + index * 0x10, HEAP + 0x80 + index * 0x10));
    }

    let one = session(&globals, &words, &serial());
    let many = session(&globals, &words, &AnalysisOptions::default().with_workers(4).with_batch_size(1));

    assert_eq!(one.graph().objects(), many.graph().objects());
    assert_eq!(one.graph().edges(), many.graph().edges());
    assert_eq!(one.graph().diagnostics(), many.graph().diagnostics());
}

#[test]
fn test_path_from_any_root()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr), ("main.tail", DATA + 8, |t| t.node_ptr)],
        &[
            (DATA, HEAP),
            (DATA + 8, HEAP + 0x40),
            (HEAP, HEAP + 0x10),
            (HEAP + 0x10, HEAP + 0x20),
            (HEAP + 0x20, HEAP + 0x30),
        ],
        &serial(),
    );
    let query = session.query();

    let path = query.path_from_any_root(Address::new(HEAP + 0x28)).unwrap().unwrap();
    let targets: Vec<u64> = path.iter().map(|edge| edge.target.value()).collect();
    assert_eq!(targets, vec![HEAP, HEAP + 0x10, HEAP + 0x20]);
    assert_eq!(path[0].source, EdgeSource::Root(query.roots()[0].id));
    assert!(query.path_from_any_root(Address::new(HEAP + 0x800)).is_err());
}

#[test]
fn test_retained_sizes_follow_dominators()
{
    // head -> second -> third, with a second root reaching third directly.
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr), ("main.tail", DATA + 8, |t| t.node_ptr)],
        &[(DATA, HEAP), (DATA + 8, HEAP + 0x20), (HEAP, HEAP + 0x10), (HEAP + 0x10, HEAP + 0x20)],
        &serial(),
    );
    let query = session.query();
    let retained = query.retained_sizes();

    let head = query.object_at(Address::new(HEAP)).unwrap();
    let second = query.object_at(Address::new(HEAP + 0x10)).unwrap();
    let third = query.object_at(Address::new(HEAP + 0x20)).unwrap();
    assert_eq!(retained[head.id.index()].bytes, 32);
    assert_eq!(retained[head.id.index()].dominator, None);
    assert_eq!(retained[second.id.index()].bytes, 16);
    assert_eq!(retained[second.id.index()].dominator, Some(head.id));
    assert_eq!(retained[third.id.index()].dominator, None);
    assert_eq!(query.top_retainers(1)[0].object, head.id);
}

#[test]
fn test_aborted_build_is_incomplete()
{
    let abort = Arc::new(AtomicBool::new(false));
    abort.store(true, Ordering::Relaxed);
    let options = serial().with_abort(abort);
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr)],
        &[(DATA, HEAP), (HEAP, HEAP + 0x10)],
        &options,
    );
    let query = session.query();

    assert!(!query.is_complete());
    // Claims made while scanning roots are kept; nothing beyond them.
    assert_eq!(query.objects().len(), 1);
    assert!(query.edges_from(Address::new(HEAP)).is_empty());
}

#[test]
fn test_objects_by_type()
{
    let session = session(
        &[("main.head", DATA, |t| t.node_ptr), ("main.any", DATA + 0x10, |t| t.eface)],
        &[
            (DATA, HEAP),
            (DATA + 0x10, POINT_TYPE),
            (DATA + 0x18, HEAP + 0x40),
        ],
        &serial(),
    );
    let query = session.query();

    assert_eq!(query.objects_of_type("main.node").count(), 1);
    let pattern = regex::Regex::new(r"^main\.").unwrap();
    assert_eq!(query.objects_matching(&pattern).count(), 2);
}
