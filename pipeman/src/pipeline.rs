// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Pipeline lifecycle: loading a compiled object into the kernel, pinning
//! its programs and maps into the per-pipeline namespace, wiring the ternary
//! partition tables and running the map initializers.
//!
//! The load is a chain of ordered phases. A failing phase aborts the whole
//! operation and leaves the namespace exactly as the phase left it; there
//! is no rollback, the operator unloads and retries. The parsed object is
//! dropped on every exit path.

use std::{
    collections::HashMap,
    fs,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use aya::{Ebpf, EbpfLoader, programs::Program};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::{
    directories::BPF_FS,
    errors::{PipemanError, map_io_error},
    maps::MapDescriptor,
    objects::TERNARY_TUPLE_INFIX,
    sys,
    types::{
        PipelineHandle, TC_EGRESS_PROG, TC_INIT_PROG, XDP_EGRESS_PROG,
        XDP_EGRESS_PROG_OPTIMIZED, XDP_HELPER_PROG, XDP_INGRESS_PROG, XDP_INIT_PROG,
    },
    utils,
};

/// Shared index table owning the partitions of one ternary table.
const TUPLES_MAP_SUFFIX: &str = "_tuples_map";

pub(crate) fn load(pipeline: &PipelineHandle, object_path: &Path) -> Result<(), PipemanError> {
    let data = fs::read(object_path)
        .map_err(|e| map_io_error(&format!("pipeline object {}", object_path.display()), e))?;

    // Phase 1: parse the object and verify-load every program. The section
    // names are recovered separately since loaded programs are keyed by
    // function name.
    let sections = section_by_function(&data)?;
    let mut ebpf = EbpfLoader::new().load(&data)?;
    load_programs(&mut ebpf)?;

    ensure_pipeline_layout(pipeline)?;

    // Phase 2: persist programs under their section-derived names.
    pin_programs(pipeline, &mut ebpf, &sections)?;

    // Phase 3: persist maps, taking over stale pins from a previous load.
    let map_names = pin_maps(pipeline, &mut ebpf)?;

    // Phase 4: install ternary partition maps into their index tables.
    wire_tuples(pipeline, &map_names)?;

    // Phase 5: run the designated initializers to prime default map state.
    run_initializers(pipeline)?;

    Ok(())
}

/// Removes the whole per-pipeline namespace. Entry removals are independent
/// and best-effort; one stuck entry does not block the rest.
pub(crate) fn unload(pipeline: &PipelineHandle) -> Result<(), PipemanError> {
    utils::remove_tree_best_effort(&pipeline.root_path())
        .map_err(|e| map_io_error(&format!("pipeline {}", pipeline.id()), e))
}

pub(crate) fn is_tc_based(pipeline: &PipelineHandle) -> bool {
    prog_exists(pipeline, XDP_HELPER_PROG)
        && !prog_exists(pipeline, XDP_INGRESS_PROG)
        && !prog_exists(pipeline, XDP_EGRESS_PROG)
        && !prog_exists(pipeline, XDP_EGRESS_PROG_OPTIMIZED)
}

pub(crate) fn has_egress_program(pipeline: &PipelineHandle) -> bool {
    prog_exists(pipeline, TC_EGRESS_PROG)
        || prog_exists(pipeline, XDP_EGRESS_PROG)
        || prog_exists(pipeline, XDP_EGRESS_PROG_OPTIMIZED)
}

pub(crate) fn prog_exists(pipeline: &PipelineHandle, name: &str) -> bool {
    pipeline.prog_path(name).exists()
}

/// Wall-clock instant the pipeline was loaded, in epoch seconds, combined
/// from the kernel's monotonic load time, the system uptime and the current
/// time. Best-effort: any read failure yields the 0 sentinel.
pub(crate) fn load_timestamp(pipeline: &PipelineHandle) -> u64 {
    match try_load_timestamp(pipeline) {
        Ok(ts) => ts,
        Err(e) => {
            warn!("failed to derive load timestamp: {e}");
            0
        }
    }
}

fn try_load_timestamp(pipeline: &PipelineHandle) -> Result<u64, PipemanError> {
    let fd = open_pipeline_program(pipeline)?;
    let info = sys::prog_info(fd.as_fd()).map_err(|e| map_io_error("pipeline program info", e))?;
    let loaded_secs_after_boot = info.load_time_ns as f64 / 1e9;

    let uptime = fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| utils::parse_uptime(&content))
        .ok_or_else(|| PipemanError::Error("unreadable system uptime".to_string()))?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| PipemanError::Error("wall clock before epoch".to_string()))?
        .as_secs_f64();

    Ok((now - uptime + loaded_secs_after_boot) as u64)
}

/// Opens the program whose identity stands for the whole pipeline: the XDP
/// helper when present, the XDP ingress program otherwise.
pub(crate) fn open_pipeline_program(pipeline: &PipelineHandle) -> Result<OwnedFd, PipemanError> {
    sys::obj_get(&pipeline.prog_path(XDP_HELPER_PROG))
        .or_else(|_| sys::obj_get(&pipeline.prog_path(XDP_INGRESS_PROG)))
        .map_err(|e| map_io_error("pipeline program", e))
}

/// Persistence name of a program: its section name with every path
/// separator flattened to an underscore, nothing else altered.
fn pin_name_from_section(section: &str) -> String {
    section.replace('/', "_")
}

fn section_by_function(data: &[u8]) -> Result<HashMap<String, String>, PipemanError> {
    let file = object::File::parse(data)?;
    let mut sections = HashMap::new();
    for sym in file.symbols() {
        if sym.kind() != SymbolKind::Text {
            continue;
        }
        let Some(index) = sym.section_index() else {
            continue;
        };
        let Ok(section) = file.section_by_index(index) else {
            continue;
        };
        let (Ok(fn_name), Ok(sec_name)) = (sym.name(), section.name()) else {
            continue;
        };
        if fn_name.is_empty() {
            continue;
        }
        sections.insert(fn_name.to_string(), sec_name.to_string());
    }
    Ok(sections)
}

fn ensure_pipeline_layout(pipeline: &PipelineHandle) -> Result<(), PipemanError> {
    if !utils::is_bpffs_mounted().map_err(|e| PipemanError::Error(e.to_string()))? {
        utils::create_bpffs(BPF_FS).map_err(|e| PipemanError::Error(e.to_string()))?;
    }
    fs::create_dir_all(pipeline.root_path())?;
    fs::create_dir_all(pipeline.maps_root())?;
    fs::create_dir_all(pipeline.links_root())?;
    Ok(())
}

fn load_programs(ebpf: &mut Ebpf) -> Result<(), PipemanError> {
    for (name, prog) in ebpf.programs_mut() {
        let loaded = match prog {
            Program::Xdp(p) => p.load(),
            Program::SchedClassifier(p) => p.load(),
            _ => {
                warn!("program {name} has an unexpected hook type, not loading");
                continue;
            }
        };
        loaded.map_err(|e| {
            warn!("failed to load program {name}: {e}");
            PipemanError::BpfProgramError(e)
        })?;
    }
    Ok(())
}

fn pin_programs(
    pipeline: &PipelineHandle,
    ebpf: &mut Ebpf,
    sections: &HashMap<String, String>,
) -> Result<(), PipemanError> {
    for (name, prog) in ebpf.programs_mut() {
        let Some(section) = sections.get(name) else {
            warn!("no section recorded for program {name}, skipping pin");
            continue;
        };
        let pin_name = pin_name_from_section(section);
        let path = pipeline.prog_path(&pin_name);
        debug!("pinning program {name} at {}", path.display());
        let pinned = match prog {
            Program::Xdp(p) => p.pin(&path),
            Program::SchedClassifier(p) => p.pin(&path),
            _ => continue,
        };
        pinned.map_err(|e| PipemanError::UnableToPinProgram {
            name: pin_name.clone(),
            source: e,
        })?;
    }
    Ok(())
}

fn pin_maps(pipeline: &PipelineHandle, ebpf: &mut Ebpf) -> Result<Vec<String>, PipemanError> {
    let mut pinned = Vec::new();
    for (name, map) in ebpf.maps_mut() {
        // Dotted names are compiler-internal sections, reserved.
        if name.contains('.') {
            continue;
        }
        let path = pipeline.map_path(name);
        if path.exists() {
            // Clean takeover from a previous load of this pipeline id.
            fs::remove_file(&path)
                .map_err(|e| map_io_error(&format!("stale pin for map {name}"), e))?;
        }
        map.pin(&path).map_err(|e| PipemanError::UnableToPinMap {
            name: name.to_string(),
            source: e,
        })?;
        pinned.push(name.to_string());
    }
    Ok(pinned)
}

fn wire_tuples(pipeline: &PipelineHandle, map_names: &[String]) -> Result<(), PipemanError> {
    for name in map_names {
        let Some(index_table) = tuple_index_table(name) else {
            continue;
        };
        let partition = tuple_partition_id(name)?;
        join_tuple(pipeline, name, &index_table, partition)?;
    }
    Ok(())
}

/// Installs one partition map into its owning index table. Both handles are
/// scoped to this sub-step and released when it completes.
fn join_tuple(
    pipeline: &PipelineHandle,
    tuple_name: &str,
    index_table: &str,
    partition: u32,
) -> Result<(), PipemanError> {
    let index_map = MapDescriptor::open(pipeline, index_table, None)?;
    let tuple_map = MapDescriptor::open(pipeline, tuple_name, None)?;

    let tuple_fd = tuple_map.fd().as_raw_fd() as u32;
    sys::map_update_elem(
        index_map.fd(),
        &partition.to_ne_bytes(),
        &tuple_fd.to_ne_bytes(),
    )
    .map_err(|e| map_io_error(&format!("ternary partition {tuple_name}"), e))?;
    debug!("wired {tuple_name} into {index_table} at partition {partition}");
    Ok(())
}

/// Owning index table of a ternary partition map, or None for ordinary
/// maps: the name truncated at the partition infix plus the index suffix.
fn tuple_index_table(map_name: &str) -> Option<String> {
    map_name
        .find(TERNARY_TUPLE_INFIX)
        .map(|pos| format!("{}{}", &map_name[..pos], TUPLES_MAP_SUFFIX))
}

/// Numeric partition id carried in the map's trailing digits. A missing or
/// non-numeric tail is a data error in the compiled object, not transient.
fn tuple_partition_id(map_name: &str) -> Result<u32, PipemanError> {
    map_name
        .rsplit('_')
        .next()
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or_else(|| {
            PipemanError::InvalidInput(format!("no numeric partition id in {map_name}"))
        })
}

fn run_initializers(pipeline: &PipelineHandle) -> Result<(), PipemanError> {
    for prog in [TC_INIT_PROG, XDP_INIT_PROG] {
        let path = pipeline.prog_path(prog);
        if !path.exists() {
            continue;
        }
        let fd = sys::obj_get(&path).map_err(|e| PipemanError::InitError {
            name: prog.to_string(),
            source: e,
        })?;
        sys::prog_run_once(fd.as_fd()).map_err(|e| PipemanError::InitError {
            name: prog.to_string(),
            source: e,
        })?;
        debug!("initializer {prog} primed default map state");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn pin_names_flatten_every_separator() {
        assert_eq!(pin_name_from_section("tc/ingress/prog"), "tc_ingress_prog");
        assert_eq!(
            pin_name_from_section("classifier/tc-ingress"),
            "classifier_tc-ingress"
        );
        assert_eq!(pin_name_from_section("xdp"), "xdp");
    }

    #[test]
    fn tuple_names_derive_owner_and_partition() {
        assert_eq!(
            tuple_index_table("ipv4_lpm_tuple_3").as_deref(),
            Some("ipv4_lpm_tuples_map")
        );
        assert_eq!(
            tuple_partition_id("ipv4_lpm_tuple_3").expect("numeric tail"),
            3
        );
        // The index table itself carries no partition infix.
        assert_eq!(tuple_index_table("ipv4_lpm_tuples_map"), None);
        assert_eq!(tuple_index_table("plain_table"), None);
    }

    #[test]
    fn non_numeric_partition_tail_is_a_data_error() {
        assert_matches!(
            tuple_partition_id("router_lpm_tuple_x"),
            Err(PipemanError::InvalidInput(_))
        );
    }
}
