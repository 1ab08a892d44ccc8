// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! pipeman is the control-plane runtime for kernel-resident packet
//! pipelines: compiled, verified eBPF programs and match-action tables
//! produced by an upstream compiler.
//!
//! The library loads a compiled pipeline object, persists its programs and
//! maps under a per-pipeline bpffs namespace, attaches network interfaces
//! through the XDP and TC hook points, and reflects over the kernel's
//! structural type metadata so tables can be encoded and decoded without
//! compile-time struct definitions.
//!
//! Everything here is synchronous and blocking; callers serialize access to
//! a given pipeline id themselves. Concurrent independent invocations
//! against the same pipeline are not mutually excluded.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! let pipeline = pipeman::load(1, Path::new("pipeline.o"))?;
//! let port = pipeman::add_port(1, "eth0")?;
//! for object in pipeman::list_objects(1)? {
//!     println!("{object}");
//! }
//! # Ok::<(), pipeman::PipemanError>(())
//! ```

use std::path::Path;

mod attach;
mod btf;
pub mod errors;
mod maps;
mod netlink;
mod objects;
mod pipeline;
mod sys;
mod types;
mod utils;

pub use btf::{StructMemberDescriptor, TypeGraph, TypeId};
pub use errors::PipemanError;
pub use maps::MapDescriptor;
pub use types::{PipelineHandle, Port};

pub mod directories {
    //! Well-known locations in the shared persisted-object namespace.

    /// Mount point of the bpf filesystem holding every pipeline namespace.
    pub const BPF_FS: &str = "/sys/fs/bpf";
    /// A pipeline's namespace lives at `<BPF_FS>/<PIPELINE_PREFIX><id>`.
    pub(crate) const PIPELINE_PREFIX: &str = "pipeline";
    pub(crate) const MAPS_SUBDIR: &str = "maps";
    pub(crate) const LINKS_SUBDIR: &str = "links";
}

/// Loads a compiled pipeline object and persists it under the given id.
///
/// The load runs as a chain of phases: parse and verify, program pinning,
/// map pinning, ternary partition wiring, initializer runs. A failing
/// phase aborts the operation with the namespace left exactly as the phase
/// left it. There is no rollback: unload and retry.
pub fn load(id: u32, object_path: &Path) -> Result<PipelineHandle, PipemanError> {
    let handle = PipelineHandle::new(id);
    pipeline::load(&handle, object_path)?;
    Ok(handle)
}

/// Removes a pipeline's persisted namespace. Individual entry removals are
/// best-effort and independent.
pub fn unload(id: u32) -> Result<(), PipemanError> {
    pipeline::unload(&PipelineHandle::new(id))
}

/// True if a pipeline namespace is present under this id.
pub fn pipeline_exists(id: u32) -> bool {
    PipelineHandle::new(id).exists()
}

/// Attaches a network interface to a loaded pipeline and returns the port
/// id (the kernel interface index).
pub fn add_port(id: u32, iface: &str) -> Result<u32, PipemanError> {
    attach::add_port(&PipelineHandle::new(id), iface)
}

/// Detaches a network interface: releases the XDP attachment and destroys
/// the combined TC hook together with its filters.
pub fn del_port(id: u32, iface: &str) -> Result<(), PipemanError> {
    attach::del_port(&PipelineHandle::new(id), iface)
}

/// Lists the interfaces currently bound to this pipeline.
pub fn list_ports(id: u32) -> Result<Vec<Port>, PipemanError> {
    attach::list_ports(&PipelineHandle::new(id))
}

/// Lists the operator-visible logical objects (tables, counters, meters,
/// ...) of a pipeline. Names whose auxiliaries fold to the same owner may
/// repeat; consumers tolerate repeats.
pub fn list_objects(id: u32) -> Result<Vec<String>, PipemanError> {
    objects::list_objects(&PipelineHandle::new(id))
}

/// Opens a named pinned map of a pipeline. With a loaded [`TypeGraph`] the
/// descriptor additionally carries the canonical key/value type ids; absent
/// type metadata is non-fatal and leaves the ids at 0.
pub fn open_map(
    id: u32,
    name: &str,
    graph: Option<&TypeGraph>,
) -> Result<MapDescriptor, PipemanError> {
    MapDescriptor::open(&PipelineHandle::new(id), name, graph)
}

/// Wall-clock instant the pipeline was loaded, in epoch seconds.
/// Best-effort: 0 means the instant could not be derived.
pub fn get_load_timestamp(id: u32) -> u64 {
    pipeline::load_timestamp(&PipelineHandle::new(id))
}

/// True for pipelines whose packet path runs entirely at TC, marked by the
/// XDP helper program standing alone.
pub fn is_tc_based(id: u32) -> bool {
    pipeline::is_tc_based(&PipelineHandle::new(id))
}

/// True if the pipeline ships any egress-side program.
pub fn has_egress_program(id: u32) -> bool {
    pipeline::has_egress_program(&PipelineHandle::new(id))
}
