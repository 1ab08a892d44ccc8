// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Port attachment: wiring a network interface into a loaded pipeline
//! through the XDP and TC hook points, and enumerating the interfaces a
//! pipeline currently serves.
//!
//! XDP attachments are persisted as pinned links under the pipeline's
//! `links/` directory; TC filters live on the combined clsact hook and are
//! torn down with it.

use std::{
    fs, mem,
    os::fd::{AsFd, AsRawFd},
};

use aya::programs::{
    SchedClassifier, TcAttachType, Xdp, XdpFlags,
    links::{FdLink, PinnedLink},
    tc,
};
use aya_obj::programs::XdpAttachType;
use log::{debug, info, warn};
use nix::libc;

use crate::{
    errors::{PipemanError, map_io_error, not_supported},
    maps::MapDescriptor,
    netlink::{LinkDetails, NetlinkManager},
    pipeline, sys,
    types::{
        PipelineHandle, Port, TC_EGRESS_PROG, TC_INGRESS_PROG, XDP_DEVMAP, XDP_EGRESS_PROG,
        XDP_EGRESS_PROG_OPTIMIZED, XDP_HELPER_PROG, XDP_INGRESS_PROG, XDP_JUMP_TBL,
    },
    utils,
};

pub(crate) fn add_port(pipeline: &PipelineHandle, iface: &str) -> Result<u32, PipemanError> {
    let ifindex = utils::get_ifindex(iface)?;

    // A pinned XDP helper marks a pipeline whose packet path runs at TC;
    // full XDP pipelines carry their own ingress/egress programs instead.
    if pipeline::prog_exists(pipeline, XDP_HELPER_PROG) {
        tc_port_add(pipeline, iface, ifindex)?;
    } else {
        xdp_port_add(pipeline, iface, ifindex)?;
    }
    Ok(ifindex)
}

pub(crate) fn del_port(pipeline: &PipelineHandle, iface: &str) -> Result<(), PipemanError> {
    let ifindex = utils::get_ifindex(iface)?;

    // Releasing the pinned link detaches the XDP (or helper) program; a
    // missing pin means nothing is attached on this interface.
    match PinnedLink::from_pin(pipeline.xdp_link_path(ifindex)) {
        Ok(link) => {
            let _ = link
                .unpin()
                .map_err(|e| map_io_error(&format!("XDP link for {iface}"), e))?;
        }
        Err(e) => debug!("no pinned XDP link for {iface}: {e}"),
    }

    let netlink = NetlinkManager::new()?;
    if let Err(e) = netlink.qdisc_del_clsact(ifindex) {
        // The hook may never have existed, e.g. behind a dummy attachment.
        if e.raw_os_error() != Some(libc::ENOENT) {
            return Err(map_io_error(&format!("combined hook on {iface}"), e));
        }
    }
    Ok(())
}

/// Interfaces whose live XDP program is the pipeline's own: the recorded
/// program id must match the interface's and be nonzero. Interfaces that
/// cannot be read or carry no attachment are skipped, not reported.
pub(crate) fn list_ports(pipeline: &PipelineHandle) -> Result<Vec<Port>, PipemanError> {
    let prog = pipeline::open_pipeline_program(pipeline)?;
    let info = sys::prog_info(prog.as_fd())
        .map_err(|e| map_io_error("pipeline program info", e))?;
    drop(prog);

    let netlink = NetlinkManager::new()?;
    let links = netlink.dump_links()?;
    Ok(match_ports(links, info.id))
}

fn match_ports(links: Vec<LinkDetails>, pipeline_prog_id: u32) -> Vec<Port> {
    links
        .into_iter()
        .filter(|link| link.xdp_prog_id != 0 && link.xdp_prog_id == pipeline_prog_id)
        .map(|link| Port {
            id: link.index,
            name: link.name,
        })
        .collect()
}

fn xdp_port_add(
    pipeline: &PipelineHandle,
    iface: &str,
    ifindex: u32,
) -> Result<(), PipemanError> {
    attach_xdp_program(pipeline, XDP_INGRESS_PROG, iface, ifindex)?;
    update_egress_devmap(pipeline, iface, ifindex)?;
    install_optimized_egress(pipeline)?;
    create_hook_and_attach_tc(pipeline, iface, ifindex)
}

fn tc_port_add(pipeline: &PipelineHandle, iface: &str, ifindex: u32) -> Result<(), PipemanError> {
    attach_xdp_program(pipeline, XDP_HELPER_PROG, iface, ifindex)?;
    create_hook_and_attach_tc(pipeline, iface, ifindex)
}

/// Attaches a pinned XDP program to an interface, preferring the driver
/// path and persisting the attachment as a pinned link.
fn attach_xdp_program(
    pipeline: &PipelineHandle,
    prog_name: &str,
    iface: &str,
    ifindex: u32,
) -> Result<(), PipemanError> {
    let path = pipeline.prog_path(prog_name);
    let mut xdp = Xdp::from_pin(&path, XdpAttachType::Interface).map_err(|e| {
        warn!("failed to open program {prog_name}: {e}");
        PipemanError::BpfProgramError(e)
    })?;

    let link_id = attach_with_fallback(iface, |flags| xdp.attach(iface, flags))?;
    let owned_link = xdp.take_link(link_id)?;
    let fd_link = TryInto::<FdLink>::try_into(owned_link).map_err(|e| {
        PipemanError::Error(format!("FdLink conversion failed on interface {iface}: {e}"))
    })?;

    fs::create_dir_all(pipeline.links_root())?;
    fd_link
        .pin(pipeline.xdp_link_path(ifindex))
        .map_err(PipemanError::UnableToPinLink)?;
    Ok(())
}

/// Driver-mode attach with exactly one generic-mode retry when the driver
/// reports the mode as unsupported. Any other driver-mode failure is final.
fn attach_with_fallback<T, E, F>(iface: &str, mut attach: F) -> Result<T, E>
where
    E: std::error::Error + 'static,
    F: FnMut(XdpFlags) -> Result<T, E>,
{
    match attach(XdpFlags::DRV_MODE) {
        Ok(attached) => Ok(attached),
        Err(e) if not_supported(&e) => {
            info!("XDP driver mode not supported on {iface}, retrying in generic mode");
            attach(XdpFlags::SKB_MODE)
        }
        Err(e) => Err(e),
    }
}

/// Installs the redirect-table entry for this interface. The XDP egress
/// program is optional; the slot is written either way so redirects keep
/// working, with fd -1 standing for "no egress program".
fn update_egress_devmap(
    pipeline: &PipelineHandle,
    iface: &str,
    ifindex: u32,
) -> Result<(), PipemanError> {
    let egress = sys::obj_get(&pipeline.prog_path(XDP_EGRESS_PROG)).ok();

    let devmap = MapDescriptor::open(pipeline, XDP_DEVMAP, None)?;
    let capacity = devmap.max_entries();
    if capacity == 0 {
        return Err(PipemanError::InvalidInput(
            "redirect table has no capacity".to_string(),
        ));
    }
    if ifindex >= capacity {
        warn!(
            "the index {ifindex} of interface {iface} is at or above the redirect table \
             capacity {capacity}; installing at the wrapped slot, overriding any prior binding"
        );
    }
    let slot = devmap_slot(ifindex, capacity);

    let egress_fd = egress.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1);
    sys_update(
        &devmap,
        &slot.to_ne_bytes(),
        &devmap_value(ifindex, egress_fd),
        "redirect table",
    )
}

/// When the optimized egress program is present it takes precedence over
/// the devmap-carried one through the single-slot jump table.
fn install_optimized_egress(pipeline: &PipelineHandle) -> Result<(), PipemanError> {
    let Ok(egress) = sys::obj_get(&pipeline.prog_path(XDP_EGRESS_PROG_OPTIMIZED)) else {
        return Ok(());
    };

    let jump_table = MapDescriptor::open(pipeline, XDP_JUMP_TBL, None)?;
    let fd = egress.as_raw_fd() as u32;
    sys_update(&jump_table, &0u32.to_ne_bytes(), &fd.to_ne_bytes(), "jump table")?;
    debug!("optimized egress program installed via the jump table");
    Ok(())
}

fn sys_update(
    map: &MapDescriptor,
    key: &[u8],
    value: &[u8],
    what: &str,
) -> Result<(), PipemanError> {
    sys::map_update_elem(map.fd(), key, value)
        .map_err(|e| map_io_error(&format!("{what} update"), e))
}

fn devmap_slot(ifindex: u32, capacity: u32) -> u32 {
    ifindex % capacity
}

/// Wire layout of the kernel's devmap value: the target interface index
/// followed by the egress program fd, -1 when no program rides along.
fn devmap_value(ifindex: u32, prog_fd: i32) -> [u8; 8] {
    let mut value = [0u8; 8];
    value[..4].copy_from_slice(&ifindex.to_ne_bytes());
    value[4..].copy_from_slice(&prog_fd.to_ne_bytes());
    value
}

fn create_hook_and_attach_tc(
    pipeline: &PipelineHandle,
    iface: &str,
    ifindex: u32,
) -> Result<(), PipemanError> {
    ensure_clsact_hook(iface, ifindex)?;
    attach_tc_program(pipeline, TC_INGRESS_PROG, iface, TcAttachType::Ingress)?;
    attach_tc_program(pipeline, TC_EGRESS_PROG, iface, TcAttachType::Egress)
}

/// Creates the combined ingress/egress hook, reusing one that is already
/// present. A plain ingress qdisc cannot host the egress side and is a
/// conflict.
fn ensure_clsact_hook(iface: &str, ifindex: u32) -> Result<(), PipemanError> {
    let netlink = NetlinkManager::new()?;
    if netlink.has_qdisc("clsact", ifindex as i32)? {
        debug!("clsact hook already present on {iface}, reusing it");
        return Ok(());
    }
    if netlink.has_qdisc("ingress", ifindex as i32)? {
        return Err(PipemanError::InvalidInput(format!(
            "an ingress-only qdisc occupies {iface}"
        )));
    }
    tc::qdisc_add_clsact(iface)
        .map_err(|e| map_io_error(&format!("combined hook on {iface}"), e))
}

fn attach_tc_program(
    pipeline: &PipelineHandle,
    prog_name: &str,
    iface: &str,
    attach_type: TcAttachType,
) -> Result<(), PipemanError> {
    let path = pipeline.prog_path(prog_name);
    if !path.exists() {
        if matches!(attach_type, TcAttachType::Egress) {
            debug!("pipeline has no TC egress program, skipping");
            return Ok(());
        }
        return Err(PipemanError::NotFound(format!("program {prog_name}")));
    }

    let mut prog = SchedClassifier::from_pin(&path)?;
    let link_id = prog.attach(iface, attach_type)?;
    let link = prog.take_link(link_id)?;
    // The filter is qdisc state and must outlive this process; it is
    // removed when the clsact hook is destroyed on detach.
    mem::forget(link);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, io};

    use assert_matches::assert_matches;
    use nix::libc;

    use super::*;

    #[test]
    fn devmap_slot_wraps_at_capacity() {
        assert_eq!(devmap_slot(3, 64), 3);
        assert_eq!(devmap_slot(64, 64), 0);
        assert_eq!(devmap_slot(67, 64), 3);
    }

    #[test]
    fn devmap_value_carries_index_then_fd() {
        let value = devmap_value(7, -1);
        assert_eq!(&value[..4], &7u32.to_ne_bytes());
        assert_eq!(&value[4..], &(-1i32).to_ne_bytes());
    }

    #[test]
    fn fallback_retries_exactly_once_on_unsupported_mode() {
        let calls = Cell::new(0u32);
        let result: Result<u32, io::Error> = attach_with_fallback("eth0", |flags| {
            calls.set(calls.get() + 1);
            match calls.get() {
                1 => {
                    assert_eq!(flags, XdpFlags::DRV_MODE);
                    Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
                }
                _ => {
                    assert_eq!(flags, XdpFlags::SKB_MODE);
                    Ok(42)
                }
            }
        });
        assert_eq!(result.expect("generic mode succeeds"), 42);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn fallback_does_not_retry_other_errors() {
        let calls = Cell::new(0u32);
        let result: Result<u32, io::Error> = attach_with_fallback("eth0", |_| {
            calls.set(calls.get() + 1);
            Err(io::Error::from_raw_os_error(libc::EACCES))
        });
        assert_matches!(result, Err(e) if e.raw_os_error() == Some(libc::EACCES));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn ports_match_on_equal_nonzero_program_ids() {
        let links = vec![
            LinkDetails {
                index: 1,
                name: "lo".to_string(),
                xdp_prog_id: 0,
            },
            LinkDetails {
                index: 2,
                name: "eth0".to_string(),
                xdp_prog_id: 77,
            },
            LinkDetails {
                index: 3,
                name: "eth1".to_string(),
                xdp_prog_id: 78,
            },
        ];
        let ports = match_ports(links, 77);
        assert_eq!(
            ports,
            vec![Port {
                id: 2,
                name: "eth0".to_string()
            }]
        );
    }
}
