// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Type reflection over the kernel-exported structural metadata attached to
//! a loaded pipeline.
//!
//! The kernel describes the layout of every compiled data structure as a
//! graph of type nodes (integers, structs, unions, arrays, typedefs,
//! pointers). This module fetches that graph from the kernel for one of the
//! pipeline's pinned programs and answers layout questions (alias
//! resolution, member lookup, byte sizes) without any compile-time struct
//! declarations. The graph is parsed once into an owned, immutable value;
//! all queries are pure.
//!
//! Type id `0` is the universal "absent" sentinel: it is never recursed
//! into and every query treats it as terminal.

use std::os::fd::AsFd;

use log::{debug, warn};

use crate::{
    errors::{PipemanError, map_io_error},
    sys,
    types::{PipelineHandle, TC_EGRESS_PROG, TC_INGRESS_PROG, XDP_INGRESS_PROG},
};

/// Integer handle into a [`TypeGraph`]; only meaningful for the graph it
/// came from. `0` means absent/unknown.
pub type TypeId = u32;

/// Name of the data section holding the compiler's map definitions.
const MAPS_SECTION: &str = ".maps";

/// Alias chains in valid metadata are acyclic; the bound only guards
/// against a corrupted blob looping a query forever.
const MAX_ALIAS_DEPTH: usize = 32;

const HEADER_LEN: usize = 24;
const TYPE_RECORD_LEN: usize = 12;
const BTF_MAGIC: u16 = 0xeb9f;

const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

#[derive(Debug, Clone)]
pub(crate) struct StructMember {
    pub(crate) name: String,
    pub(crate) type_id: TypeId,
    pub(crate) bit_offset: u32,
}

#[derive(Debug, Clone)]
pub(crate) enum TypeKind {
    Int { size: u32 },
    Ptr { target: TypeId },
    Array { element: TypeId, count: u32 },
    Struct { size: u32, members: Vec<StructMember> },
    Union { size: u32, members: Vec<StructMember> },
    Typedef { target: TypeId },
    Var { target: TypeId },
    DataSec { entries: Vec<TypeId> },
    /// Node kinds the control plane never inspects (enums, functions,
    /// qualifiers, ...). Kept so ids stay dense and meaningful.
    Other,
}

#[derive(Debug, Clone)]
struct TypeNode {
    name: String,
    kind: TypeKind,
}

/// A member located inside a struct or union, with its alias-resolved type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructMemberDescriptor {
    pub index: usize,
    pub name: String,
    pub effective_type_id: TypeId,
    pub bit_offset: u32,
}

/// An owned, read-only parse of one kernel type-metadata blob.
#[derive(Debug)]
pub struct TypeGraph {
    nodes: Vec<TypeNode>,
}

impl TypeGraph {
    /// Loads the type graph of a pipeline by probing its pinned programs in
    /// a fixed role order; the first program that exists and carries a
    /// nonzero metadata id wins.
    pub fn load(pipeline: &PipelineHandle) -> Result<Self, PipemanError> {
        const CANDIDATES: [&str; 3] = [TC_INGRESS_PROG, XDP_INGRESS_PROG, TC_EGRESS_PROG];

        for prog in CANDIDATES {
            match Self::load_from_program(pipeline, prog) {
                Ok(graph) => return Ok(graph),
                Err(e) => debug!("no type metadata via {prog}: {e}"),
            }
        }
        Err(PipemanError::NotFound(format!(
            "type metadata for pipeline {}",
            pipeline.id()
        )))
    }

    fn load_from_program(pipeline: &PipelineHandle, prog: &str) -> Result<Self, PipemanError> {
        let fd = sys::obj_get(&pipeline.prog_path(prog))
            .map_err(|e| map_io_error(&format!("program {prog}"), e))?;
        let info = sys::prog_info(fd.as_fd())
            .map_err(|e| map_io_error(&format!("program {prog} info"), e))?;
        if info.btf_id == 0 {
            return Err(PipemanError::NotFound(format!("type metadata on {prog}")));
        }
        let bytes = sys::btf_bytes_by_id(info.btf_id)
            .map_err(|e| map_io_error("type metadata blob", e))?;
        Self::parse(&bytes)
    }

    /// Parses a raw metadata blob. Ids are 1-based; index 0 is the reserved
    /// void/absent node.
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, PipemanError> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid("truncated type metadata header"));
        }
        let magic = u16::from_ne_bytes([bytes[0], bytes[1]]);
        if magic != BTF_MAGIC {
            return Err(invalid("bad type metadata magic"));
        }
        let hdr_len = read_u32(bytes, 4)? as usize;
        let type_off = read_u32(bytes, 8)? as usize;
        let type_len = read_u32(bytes, 12)? as usize;
        let str_off = read_u32(bytes, 16)? as usize;
        let str_len = read_u32(bytes, 20)? as usize;
        if hdr_len < HEADER_LEN {
            return Err(invalid("type metadata header too short"));
        }

        let types = section(bytes, hdr_len, type_off, type_len)
            .ok_or_else(|| invalid("type section out of range"))?;
        let strings = section(bytes, hdr_len, str_off, str_len)
            .ok_or_else(|| invalid("string section out of range"))?;

        let mut nodes = vec![TypeNode {
            name: String::new(),
            kind: TypeKind::Other,
        }];

        let mut off = 0;
        while off < types.len() {
            if types.len() - off < TYPE_RECORD_LEN {
                return Err(invalid("truncated type record"));
            }
            let name_off = read_u32(types, off)?;
            let info = read_u32(types, off + 4)?;
            let size_or_type = read_u32(types, off + 8)?;
            off += TYPE_RECORD_LEN;

            let vlen = (info & 0xffff) as usize;
            let kind_flag = info >> 31 != 0;
            let name = string_at(strings, name_off)?;

            let kind = match (info >> 24) & 0x1f {
                KIND_INT => {
                    off = skip(types, off, 4)?;
                    TypeKind::Int { size: size_or_type }
                }
                KIND_PTR => TypeKind::Ptr {
                    target: size_or_type,
                },
                KIND_ARRAY => {
                    let element = read_u32(types, off)?;
                    let count = read_u32(types, off + 8)?;
                    off = skip(types, off, 12)?;
                    TypeKind::Array { element, count }
                }
                kind @ (KIND_STRUCT | KIND_UNION) => {
                    let mut members = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        let member_name = string_at(strings, read_u32(types, off)?)?;
                        let type_id = read_u32(types, off + 4)?;
                        let raw_offset = read_u32(types, off + 8)?;
                        off = skip(types, off, 12)?;
                        // With the flag set, the low 24 bits hold the bit
                        // offset and the rest the bitfield width.
                        let bit_offset = if kind_flag {
                            raw_offset & 0x00ff_ffff
                        } else {
                            raw_offset
                        };
                        members.push(StructMember {
                            name: member_name,
                            type_id,
                            bit_offset,
                        });
                    }
                    if kind == KIND_STRUCT {
                        TypeKind::Struct {
                            size: size_or_type,
                            members,
                        }
                    } else {
                        TypeKind::Union {
                            size: size_or_type,
                            members,
                        }
                    }
                }
                KIND_TYPEDEF => TypeKind::Typedef {
                    target: size_or_type,
                },
                KIND_VAR => {
                    off = skip(types, off, 4)?;
                    TypeKind::Var {
                        target: size_or_type,
                    }
                }
                KIND_DATASEC => {
                    let mut entries = Vec::with_capacity(vlen);
                    for _ in 0..vlen {
                        entries.push(read_u32(types, off)?);
                        off = skip(types, off, 12)?;
                    }
                    TypeKind::DataSec { entries }
                }
                KIND_ENUM => {
                    off = skip(types, off, vlen * 8)?;
                    TypeKind::Other
                }
                KIND_FUNC_PROTO => {
                    off = skip(types, off, vlen * 8)?;
                    TypeKind::Other
                }
                KIND_ENUM64 => {
                    off = skip(types, off, vlen * 12)?;
                    TypeKind::Other
                }
                KIND_DECL_TAG => {
                    off = skip(types, off, 4)?;
                    TypeKind::Other
                }
                KIND_FWD | KIND_VOLATILE | KIND_CONST | KIND_RESTRICT | KIND_FUNC
                | KIND_FLOAT | KIND_TYPE_TAG => TypeKind::Other,
                other => {
                    return Err(invalid(&format!("unknown type node kind {other}")));
                }
            };

            nodes.push(TypeNode { name, kind });
        }

        Ok(Self { nodes })
    }

    fn node(&self, id: TypeId) -> Option<&TypeNode> {
        if id == 0 {
            return None;
        }
        self.nodes.get(id as usize)
    }

    /// Resolves alias chains: repeatedly replaces a typedef or pointer id
    /// with its referent until a concrete node or `0`. Total, never fails.
    pub fn follow(&self, type_id: TypeId) -> TypeId {
        let mut id = type_id;
        for _ in 0..MAX_ALIAS_DEPTH {
            match self.node(id).map(|n| &n.kind) {
                Some(TypeKind::Typedef { target }) | Some(TypeKind::Ptr { target }) => {
                    id = *target;
                }
                _ => return id,
            }
        }
        id
    }

    fn members_of(&self, type_id: TypeId) -> Result<&[StructMember], PipemanError> {
        let id = self.follow(type_id);
        match self.node(id).map(|n| &n.kind) {
            Some(TypeKind::Struct { members, .. }) | Some(TypeKind::Union { members, .. }) => {
                Ok(members)
            }
            _ => Err(invalid("member lookup on a non-aggregate type")),
        }
    }

    /// Finds a member by name inside a struct or union; first match wins.
    pub fn find_member_by_name(
        &self,
        type_id: TypeId,
        member_name: &str,
    ) -> Result<StructMemberDescriptor, PipemanError> {
        let members = self.members_of(type_id)?;
        members
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == member_name)
            .map(|(index, m)| StructMemberDescriptor {
                index,
                name: m.name.clone(),
                effective_type_id: self.follow(m.type_id),
                bit_offset: m.bit_offset,
            })
            .ok_or_else(|| PipemanError::NotFound(format!("member {member_name}")))
    }

    /// Finds a member by ordinal index inside a struct or union.
    pub fn find_member_by_index(
        &self,
        type_id: TypeId,
        index: usize,
    ) -> Result<StructMemberDescriptor, PipemanError> {
        let members = self.members_of(type_id)?;
        let member = members
            .get(index)
            .ok_or_else(|| invalid(&format!("member index {index} out of range")))?;
        Ok(StructMemberDescriptor {
            index,
            name: member.name.clone(),
            effective_type_id: self.follow(member.type_id),
            bit_offset: member.bit_offset,
        })
    }

    /// Byte size of a type. `0` is a soft outcome meaning the size cannot be
    /// derived from the metadata and must be supplied out of band.
    pub fn size_of(&self, type_id: TypeId) -> usize {
        let id = self.follow(type_id);
        match self.node(id).map(|n| &n.kind) {
            Some(TypeKind::Int { size })
            | Some(TypeKind::Struct { size, .. })
            | Some(TypeKind::Union { size, .. }) => *size as usize,
            // Multi-dimensional arrays arrive flattened to one dimension.
            Some(TypeKind::Array { element, count }) => {
                self.size_of(*element) * *count as usize
            }
            _ => {
                debug!("unable to derive a size for type id {type_id}");
                0
            }
        }
    }

    /// Looks up the canonical type id of a named map through the reserved
    /// map-definition section, or `0` when the metadata has no entry.
    pub fn find_map_type_id(&self, name: &str) -> TypeId {
        let Some(entries) = self.nodes.iter().find_map(|n| match &n.kind {
            TypeKind::DataSec { entries } if n.name == MAPS_SECTION => Some(entries),
            _ => None,
        }) else {
            warn!("section with map definitions not found in type metadata");
            return 0;
        };

        for &var_id in entries {
            if let Some(var) = self.node(var_id) {
                if let TypeKind::Var { target } = &var.kind {
                    if var.name == name {
                        return self.follow(*target);
                    }
                }
            }
        }
        0
    }
}

fn invalid(msg: &str) -> PipemanError {
    PipemanError::InvalidInput(msg.to_string())
}

fn read_u32(bytes: &[u8], off: usize) -> Result<u32, PipemanError> {
    bytes
        .get(off..off + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_ne_bytes)
        .ok_or_else(|| invalid("truncated type metadata"))
}

fn section(bytes: &[u8], hdr_len: usize, off: usize, len: usize) -> Option<&[u8]> {
    let start = hdr_len.checked_add(off)?;
    let end = start.checked_add(len)?;
    bytes.get(start..end)
}

fn skip(bytes: &[u8], off: usize, by: usize) -> Result<usize, PipemanError> {
    let next = off + by;
    if next > bytes.len() {
        return Err(invalid("truncated type record"));
    }
    Ok(next)
}

fn string_at(strings: &[u8], off: u32) -> Result<String, PipemanError> {
    let start = off as usize;
    if start >= strings.len() {
        return Err(invalid("string offset out of range"));
    }
    let end = strings[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| invalid("unterminated string in type metadata"))?;
    Ok(String::from_utf8_lossy(&strings[start..end]).into_owned())
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// Emits a syntactically valid metadata blob node by node, mirroring the
    /// wire format the kernel exports. Shared by the query tests here and by
    /// the map-opener tests.
    pub(crate) struct GraphBuilder {
        types: Vec<u8>,
        strings: Vec<u8>,
        next_id: u32,
    }

    impl GraphBuilder {
        pub(crate) fn new() -> Self {
            Self {
                types: Vec::new(),
                strings: vec![0],
                next_id: 1,
            }
        }

        fn intern(&mut self, s: &str) -> u32 {
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(s.as_bytes());
            self.strings.push(0);
            off
        }

        fn node(
            &mut self,
            name: &str,
            kind: u32,
            vlen: u32,
            size_or_type: u32,
            extra: &[u32],
        ) -> TypeId {
            let name_off = if name.is_empty() { 0 } else { self.intern(name) };
            self.types.extend_from_slice(&name_off.to_ne_bytes());
            self.types
                .extend_from_slice(&((kind << 24) | vlen).to_ne_bytes());
            self.types.extend_from_slice(&size_or_type.to_ne_bytes());
            for word in extra {
                self.types.extend_from_slice(&word.to_ne_bytes());
            }
            let id = self.next_id;
            self.next_id += 1;
            id
        }

        pub(crate) fn int(&mut self, name: &str, size: u32) -> TypeId {
            self.node(name, KIND_INT, 0, size, &[0])
        }

        pub(crate) fn ptr(&mut self, target: TypeId) -> TypeId {
            self.node("", KIND_PTR, 0, target, &[])
        }

        pub(crate) fn typedef(&mut self, name: &str, target: TypeId) -> TypeId {
            self.node(name, KIND_TYPEDEF, 0, target, &[])
        }

        pub(crate) fn array(&mut self, element: TypeId, count: u32) -> TypeId {
            self.node("", KIND_ARRAY, 0, 0, &[element, 0, count])
        }

        pub(crate) fn strukt(
            &mut self,
            name: &str,
            size: u32,
            members: &[(&str, TypeId, u32)],
        ) -> TypeId {
            let interned: Vec<u32> = members.iter().map(|(n, _, _)| self.intern(n)).collect();
            let mut extra = Vec::new();
            for ((_, type_id, bit_offset), name_off) in members.iter().zip(interned) {
                extra.extend_from_slice(&[name_off, *type_id, *bit_offset]);
            }
            self.node(name, KIND_STRUCT, members.len() as u32, size, &extra)
        }

        pub(crate) fn fwd(&mut self, name: &str) -> TypeId {
            self.node(name, KIND_FWD, 0, 0, &[])
        }

        pub(crate) fn var(&mut self, name: &str, target: TypeId) -> TypeId {
            self.node(name, KIND_VAR, 0, target, &[1])
        }

        pub(crate) fn datasec(&mut self, name: &str, entries: &[TypeId]) -> TypeId {
            let extra: Vec<u32> = entries.iter().flat_map(|&id| [id, 0, 0]).collect();
            self.node(name, KIND_DATASEC, entries.len() as u32, 0, &extra)
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            let mut blob = Vec::new();
            blob.extend_from_slice(&BTF_MAGIC.to_ne_bytes());
            blob.push(1); // version
            blob.push(0); // flags
            blob.extend_from_slice(&(HEADER_LEN as u32).to_ne_bytes());
            blob.extend_from_slice(&0u32.to_ne_bytes());
            blob.extend_from_slice(&(self.types.len() as u32).to_ne_bytes());
            blob.extend_from_slice(&(self.types.len() as u32).to_ne_bytes());
            blob.extend_from_slice(&(self.strings.len() as u32).to_ne_bytes());
            blob.extend_from_slice(&self.types);
            blob.extend_from_slice(&self.strings);
            blob
        }

        pub(crate) fn parse(&self) -> TypeGraph {
            TypeGraph::parse(&self.build()).expect("builder emits valid metadata")
        }
    }

    /// A built blob registering one map wrapper struct, plus the ids its
    /// `key`/`value` members resolve to.
    pub(crate) struct GraphBlob {
        pub(crate) bytes: Vec<u8>,
        pub(crate) key_id: TypeId,
        pub(crate) value_id: TypeId,
    }

    impl GraphBlob {
        pub(crate) fn map_wrapper(name: &str, key_size: u32, value_size: u32) -> Self {
            let mut b = GraphBuilder::new();
            let key = b.int("k", key_size);
            let value = b.int("v", value_size);
            let wrapper = b.strukt(
                "map_def",
                key_size + value_size,
                &[("key", key, 0), ("value", value, key_size * 8)],
            );
            let var = b.var(name, wrapper);
            b.datasec(MAPS_SECTION, &[var]);
            Self {
                bytes: b.build(),
                key_id: key,
                value_id: value,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{tests_support::GraphBuilder, *};

    #[test]
    fn rejects_bad_magic() {
        let mut blob = GraphBuilder::new().build();
        blob[0] = 0x00;
        assert_matches!(TypeGraph::parse(&blob), Err(PipemanError::InvalidInput(_)));
    }

    #[test]
    fn follow_is_idempotent_and_total() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let ptr = b.ptr(int);
        let alias = b.typedef("u32_ref", ptr);
        let graph = b.parse();

        assert_eq!(graph.follow(alias), int);
        assert_eq!(graph.follow(graph.follow(alias)), graph.follow(alias));
        assert_eq!(graph.follow(int), int);
        assert_eq!(graph.follow(0), 0);
        // Out-of-range ids are terminal, not a panic.
        assert_eq!(graph.follow(999), 999);
    }

    #[test]
    fn member_lookup_by_name_and_index_agree() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let wide = b.int("u64", 8);
        let alias = b.typedef("word", wide);
        let s = b.strukt("entry", 16, &[("key", int, 0), ("value", alias, 64)]);
        let graph = b.parse();

        for (name, index) in [("key", 0), ("value", 1)] {
            let by_name = graph.find_member_by_name(s, name).expect("member exists");
            let by_index = graph.find_member_by_index(s, index).expect("index in range");
            assert_eq!(by_name, by_index);
        }

        let value = graph.find_member_by_name(s, "value").expect("member exists");
        assert_eq!(value.effective_type_id, wide); // alias resolved
        assert_eq!(value.bit_offset, 64);
        assert_eq!(value.index, 1);
    }

    #[test]
    fn member_lookup_rejects_non_aggregates() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let graph = b.parse();

        assert_matches!(
            graph.find_member_by_name(int, "key"),
            Err(PipemanError::InvalidInput(_))
        );
        assert_matches!(
            graph.find_member_by_name(0, "key"),
            Err(PipemanError::InvalidInput(_))
        );
        assert_matches!(
            graph.find_member_by_index(int, 0),
            Err(PipemanError::InvalidInput(_))
        );
    }

    #[test]
    fn member_misses_are_distinguished() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let s = b.strukt("entry", 4, &[("key", int, 0)]);
        let graph = b.parse();

        assert_matches!(
            graph.find_member_by_name(s, "missing"),
            Err(PipemanError::NotFound(_))
        );
        assert_matches!(
            graph.find_member_by_index(s, 1),
            Err(PipemanError::InvalidInput(_))
        );
    }

    #[test]
    fn sizes_cover_scalars_arrays_and_soft_failures() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let inner = b.array(int, 4);
        let outer = b.array(inner, 2);
        let s = b.strukt("entry", 24, &[("k", int, 0)]);
        let fwd = b.fwd("opaque");
        let graph = b.parse();

        assert_eq!(graph.size_of(int), 4);
        assert_eq!(graph.size_of(inner), 16);
        assert_eq!(graph.size_of(outer), 32);
        assert_eq!(graph.size_of(s), 24);
        // Unsized kinds degrade to the soft 0, never an error.
        assert_eq!(graph.size_of(fwd), 0);
        assert_eq!(graph.size_of(0), 0);
    }

    #[test]
    fn map_type_id_resolves_through_the_maps_section() {
        let mut b = GraphBuilder::new();
        let int = b.int("u32", 4);
        let wrapper = b.strukt("acl_table_t", 8, &[("key", int, 0), ("value", int, 32)]);
        let wrapper_alias = b.typedef("acl_table_def", wrapper);
        let var = b.var("acl_table", wrapper_alias);
        b.datasec(MAPS_SECTION, &[var]);
        let graph = b.parse();

        assert_eq!(graph.find_map_type_id("acl_table"), wrapper);
        assert_eq!(graph.find_map_type_id("unknown_table"), 0);
    }

    #[test]
    fn missing_maps_section_yields_zero() {
        let mut b = GraphBuilder::new();
        b.int("u32", 4);
        let graph = b.parse();
        assert_eq!(graph.find_map_type_id("acl_table"), 0);
    }
}
