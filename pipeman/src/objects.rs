// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Classification of the flat pinned-map namespace into operator-visible
//! logical objects.
//!
//! The compiler shares one namespace between logical tables and their
//! implementation artifacts; the split is purely name-driven, so the rules
//! live in static tables and the classifier is a pure function.

use std::{
    fs,
    path::Path,
};

use crate::{
    errors::{PipemanError, map_io_error},
    types::PipelineHandle,
};

/// Compiler bookkeeping entries that are never operator-visible.
const RESERVED_NAMES: [&str; 10] = [
    "clone_session_tbl",
    "clone_session_tbl_inner",
    "multicast_grp_tbl",
    "multicast_grp_tbl_inner",
    "hdr_md_cpumap",
    "xdp2tc_shared_map",
    "xdp2tc_cpumap",
    "tx_port",
    "egress_progs_table",
    "crc_lookup_tbl",
];

const RESERVED_PREFIXES: [&str; 1] = ["ebpf_"];

/// Implementation suffixes folded into their logical owner. Exactly one
/// suffix is stripped per name.
const IMPL_SUFFIXES: [&str; 8] = [
    "_defaultAction",
    "_prefixes",
    "_tuple",
    "_tuples_map",
    "_groups_inner",
    "_groups",
    "_defaultActionGroup",
    "_actions",
];

/// Ternary partition maps carry this infix plus a numeric partition id;
/// they surface only through their owning index table.
pub(crate) const TERNARY_TUPLE_INFIX: &str = "_tuple_";

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ObjectClass {
    Hidden,
    Logical(String),
}

/// Classifies one namespace entry. Exclusion filtering runs first, then the
/// ternary-partition pattern, then suffix folding; anything left is itself a
/// logical object.
pub(crate) fn classify_object_name(name: &str) -> ObjectClass {
    if RESERVED_NAMES.contains(&name) {
        return ObjectClass::Hidden;
    }
    if RESERVED_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return ObjectClass::Hidden;
    }
    if name.contains(TERNARY_TUPLE_INFIX) {
        return ObjectClass::Hidden;
    }
    for suffix in IMPL_SUFFIXES {
        if let Some(owner) = name.strip_suffix(suffix) {
            return ObjectClass::Logical(owner.to_string());
        }
    }
    ObjectClass::Logical(name.to_string())
}

/// Enumerates the logical objects of a pipeline. Several auxiliaries may
/// fold to the same owner within one pass; repeats are intentionally kept
/// for consumers to fold as they see fit.
pub(crate) fn list_objects(pipeline: &PipelineHandle) -> Result<Vec<String>, PipemanError> {
    let maps_root = pipeline.maps_root();
    collect_objects(&maps_root)
}

fn collect_objects(maps_root: &Path) -> Result<Vec<String>, PipemanError> {
    let entries = fs::read_dir(maps_root)
        .map_err(|e| map_io_error(&format!("object namespace {}", maps_root.display()), e))?;

    let mut objects = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let ObjectClass::Logical(logical) = classify_object_name(&name) {
            objects.push(logical);
        }
    }
    objects.sort();
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use std::fs::File;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn suffixed_names_fold_to_their_owner() {
        assert_eq!(
            classify_object_name("acl_table_defaultAction"),
            ObjectClass::Logical("acl_table".to_string())
        );
        assert_eq!(
            classify_object_name("ipv4_lpm_tuples_map"),
            ObjectClass::Logical("ipv4_lpm".to_string())
        );
        assert_eq!(
            classify_object_name("as_groups"),
            ObjectClass::Logical("as".to_string())
        );
    }

    #[test]
    fn plain_names_are_logical_as_is() {
        assert_eq!(
            classify_object_name("simple_table"),
            ObjectClass::Logical("simple_table".to_string())
        );
    }

    #[test]
    fn reserved_and_partition_names_are_hidden() {
        assert_eq!(classify_object_name("ebpf_internal_x"), ObjectClass::Hidden);
        assert_eq!(classify_object_name("tx_port"), ObjectClass::Hidden);
        assert_eq!(
            classify_object_name("egress_progs_table"),
            ObjectClass::Hidden
        );
        // Suffix-shaped but carrying the ternary infix: hidden, reachable
        // only through its owner.
        assert_eq!(
            classify_object_name("router_lpm_tuple_2"),
            ObjectClass::Hidden
        );
    }

    #[test]
    fn one_suffix_is_stripped_not_two() {
        assert_eq!(
            classify_object_name("as_groups_inner"),
            ObjectClass::Logical("as".to_string())
        );
    }

    #[test]
    fn enumeration_keeps_repeats_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in [
            "acl_table",
            "acl_table_defaultAction",
            "router_lpm_tuple_2",
            "router_lpm_tuples_map",
            "ebpf_pipeline_meta",
            "tx_port",
        ] {
            File::create(dir.path().join(name)).expect("create");
        }

        let objects = collect_objects(dir.path()).expect("listing succeeds");
        assert_eq!(
            objects,
            vec![
                "acl_table".to_string(),
                "acl_table".to_string(),
                "router_lpm".to_string(),
            ]
        );
    }

    #[test]
    fn missing_namespace_maps_to_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("maps");
        assert_matches!(
            collect_objects(&missing),
            Err(PipemanError::NotFound(_))
        );
    }
}
