// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Opening pinned tables/maps and resolving their key/value layout through
//! the pipeline's type graph.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use log::warn;

use crate::{
    btf::{TypeGraph, TypeId},
    errors::{PipemanError, map_io_error},
    sys,
    types::PipelineHandle,
};

/// An open handle to one pinned map plus the metadata table codecs need to
/// encode keys and values. The canonical type ids are resolved at most once,
/// in [`MapDescriptor::open`], and never change afterwards; `0` means the
/// metadata carries no layout for that side.
#[derive(Debug)]
pub struct MapDescriptor {
    fd: OwnedFd,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    key_type_id: TypeId,
    value_type_id: TypeId,
}

impl MapDescriptor {
    pub(crate) fn open(
        pipeline: &PipelineHandle,
        name: &str,
        graph: Option<&TypeGraph>,
    ) -> Result<Self, PipemanError> {
        let path = pipeline.map_path(name);
        let fd = sys::obj_get(&path).map_err(|e| map_io_error(&format!("map {name}"), e))?;
        let info =
            sys::map_info(fd.as_fd()).map_err(|e| map_io_error(&format!("map {name} info"), e))?;

        let (key_type_id, value_type_id) = match graph {
            Some(graph) => {
                resolve_type_ids(graph, name, info.btf_key_type_id, info.btf_value_type_id)
            }
            None => (0, 0),
        };

        Ok(Self {
            fd,
            map_type: info.map_type,
            key_size: info.key_size,
            value_size: info.value_size,
            max_entries: info.max_entries,
            key_type_id,
            value_type_id,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn map_type(&self) -> u32 {
        self.map_type
    }

    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn key_type_id(&self) -> TypeId {
        self.key_type_id
    }

    pub fn value_type_id(&self) -> TypeId {
        self.value_type_id
    }
}

/// Canonical key/value ids for a map. The kernel-reported ids win when
/// present; otherwise the ids come from the `key`/`value` members of the
/// map's wrapper struct in the reserved definitions section. Missing
/// metadata degrades to `0`, never an error.
fn resolve_type_ids(
    graph: &TypeGraph,
    name: &str,
    raw_key_id: TypeId,
    raw_value_id: TypeId,
) -> (TypeId, TypeId) {
    let wrapper = graph.find_map_type_id(name);
    if wrapper == 0 {
        warn!("no type metadata entry for map {name}");
    }

    let key = if raw_key_id == 0 {
        member_type_or_zero(graph, wrapper, "key")
    } else {
        graph.follow(raw_key_id)
    };
    let value = if raw_value_id == 0 {
        member_type_or_zero(graph, wrapper, "value")
    } else {
        graph.follow(raw_value_id)
    };
    (key, value)
}

fn member_type_or_zero(graph: &TypeGraph, aggregate: TypeId, member: &str) -> TypeId {
    graph
        .find_member_by_name(aggregate, member)
        .map(|md| md.effective_type_id)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_graph() -> (TypeGraph, TypeId, TypeId) {
        // struct { u32 key; u64 value; } registered for "acl_table" in the
        // reserved definitions section.
        let blob = {
            use crate::btf::tests_support::GraphBlob;
            GraphBlob::map_wrapper("acl_table", 4, 8)
        };
        let graph = TypeGraph::parse(&blob.bytes).expect("valid blob");
        (graph, blob.key_id, blob.value_id)
    }

    #[test]
    fn wrapper_members_fill_missing_raw_ids() {
        let (graph, key_id, value_id) = sample_graph();
        let (k, v) = resolve_type_ids(&graph, "acl_table", 0, 0);
        assert_eq!(k, key_id);
        assert_eq!(v, value_id);
    }

    #[test]
    fn raw_ids_take_precedence_and_are_canonicalized() {
        let (graph, key_id, value_id) = sample_graph();
        // Hand the resolver the raw ids directly; they must come back
        // alias-resolved and the wrapper must not override them.
        let (k, v) = resolve_type_ids(&graph, "acl_table", key_id, value_id);
        assert_eq!(k, key_id);
        assert_eq!(v, value_id);
    }

    #[test]
    fn unknown_map_degrades_to_zero_ids() {
        let (graph, _, _) = sample_graph();
        let (k, v) = resolve_type_ids(&graph, "unknown", 0, 0);
        assert_eq!((k, v), (0, 0));
    }
}
