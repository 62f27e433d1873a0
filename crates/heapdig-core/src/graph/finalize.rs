//! Folding claims into objects.
//!
//! Claims arrive in whatever order the workers found them. Everything here is
//! a function of the claim set alone:
//!
//! 1. Per address, the typing covering the most bytes wins; ties go to the
//!    lower type id, then the larger repeat count.
//! 2. A claim starting inside an earlier object's window is interior to it and
//!    does not become an object of its own.
//! 3. Edges are rewritten onto object ids, sorted and deduplicated.

use std::cmp::Reverse;

use tracing::trace;

use super::scan::{Claim, RawEdge, RawSource};
use super::{Edge, EdgeSource, Object, ObjectGraph, ObjectId};
use crate::diagnostics::{Diagnostic, DiagnosticsReport};
use crate::roots::Root;
use crate::types::Address;

pub(super) fn finalize(
    roots: Vec<Root>,
    mut claims: Vec<Claim>,
    raw_edges: Vec<RawEdge>,
    diagnostics: Vec<Diagnostic>,
    complete: bool,
) -> ObjectGraph
{
    claims.sort_by_key(|claim| (claim.address, Reverse(claim.extent), claim.ty, Reverse(claim.repeat)));
    claims.dedup_by_key(|claim| claim.address);

    let mut objects: Vec<Object> = Vec::with_capacity(claims.len());
    let mut interior = 0usize;
    for claim in claims {
        if let Some(last) = objects.last() {
            if claim.address < last.end() {
                interior += 1;
                continue;
            }
        }
        let id = ObjectId(u32::try_from(objects.len()).unwrap_or(u32::MAX));
        objects.push(Object {
            id,
            address: claim.address,
            size: claim.extent,
            ty: claim.ty,
            repeat: claim.repeat,
        });
    }
    trace!(objects = objects.len(), interior, "folded claims");

    let mut edges: Vec<Edge> = raw_edges
        .into_iter()
        .filter_map(|raw| {
            let (source, offset) = match raw.source {
                RawSource::Root(id) => (EdgeSource::Root(id), raw.offset),
                RawSource::Claim(address) => {
                    let object = containing(&objects, address)?;
                    let delta = address.offset_from(object.address)?;
                    (EdgeSource::Object(object.id), raw.offset + delta)
                }
            };
            let object = match raw.fault {
                None => containing(&objects, raw.target).map(|object| object.id),
                Some(_) => None,
            };
            Some(Edge {
                source,
                offset,
                target: raw.target,
                object,
                fault: raw.fault,
            })
        })
        .collect();
    edges.sort_unstable();
    edges.dedup();

    let mut report = DiagnosticsReport::new();
    report.extend(diagnostics);

    ObjectGraph {
        roots,
        objects,
        edges,
        diagnostics: report.finish(),
        complete,
    }
}

pub(super) fn containing(objects: &[Object], address: Address) -> Option<&Object>
{
    let index = objects.partition_point(|object| object.address <= address);
    index
        .checked_sub(1)
        .map(|index| &objects[index])
        .filter(|object| object.contains(address))
}
