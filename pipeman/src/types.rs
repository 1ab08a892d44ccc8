// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Identity types shared across the crate: the pipeline handle and the
//! well-known names the pipeline compiler emits for program roles and
//! bookkeeping maps.

use std::path::PathBuf;

use crate::directories::{BPF_FS, LINKS_SUBDIR, MAPS_SUBDIR, PIPELINE_PREFIX};

// Pinned program names, derived from the compiler's section names with every
// path separator replaced by an underscore.
pub(crate) const TC_INGRESS_PROG: &str = "classifier_tc-ingress";
pub(crate) const TC_EGRESS_PROG: &str = "classifier_tc-egress";
pub(crate) const TC_INIT_PROG: &str = "classifier_map-initializer";
pub(crate) const XDP_HELPER_PROG: &str = "xdp_xdp-helper";
pub(crate) const XDP_INGRESS_PROG: &str = "xdp_xdp-ingress";
pub(crate) const XDP_EGRESS_PROG: &str = "xdp_xdp-egress";
pub(crate) const XDP_EGRESS_PROG_OPTIMIZED: &str = "xdp_xdp-egress-optimized";
pub(crate) const XDP_INIT_PROG: &str = "xdp_map-initializer";

// Bookkeeping maps wired by the attach path.
pub(crate) const XDP_DEVMAP: &str = "tx_port";
pub(crate) const XDP_JUMP_TBL: &str = "egress_progs_table";

/// Identity of a loaded pipeline. Maps deterministically to a directory in
/// the shared bpffs namespace; owns no kernel resource itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle {
    id: u32,
}

impl PipelineHandle {
    pub fn new(id: u32) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn root_path(&self) -> PathBuf {
        PathBuf::from(format!("{BPF_FS}/{PIPELINE_PREFIX}{}", self.id))
    }

    pub(crate) fn prog_path(&self, name: &str) -> PathBuf {
        self.root_path().join(name)
    }

    pub(crate) fn maps_root(&self) -> PathBuf {
        self.root_path().join(MAPS_SUBDIR)
    }

    pub(crate) fn map_path(&self, name: &str) -> PathBuf {
        self.maps_root().join(name)
    }

    pub(crate) fn links_root(&self) -> PathBuf {
        self.root_path().join(LINKS_SUBDIR)
    }

    /// Pin location for the XDP attachment link of one port.
    pub(crate) fn xdp_link_path(&self, ifindex: u32) -> PathBuf {
        self.links_root().join(format!("xdp_{ifindex}"))
    }

    pub fn exists(&self) -> bool {
        self.root_path().exists()
    }
}

/// A network interface currently served by a pipeline. The id is the kernel
/// interface index, which doubles as the pipeline's port id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub id: u32,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_paths_are_deterministic() {
        let pipeline = PipelineHandle::new(7);
        assert_eq!(pipeline.id(), 7);
        assert_eq!(
            pipeline.prog_path(TC_INGRESS_PROG),
            PathBuf::from("/sys/fs/bpf/pipeline7/classifier_tc-ingress")
        );
        assert_eq!(
            pipeline.map_path("acl_table"),
            PathBuf::from("/sys/fs/bpf/pipeline7/maps/acl_table")
        );
        assert_eq!(
            pipeline.xdp_link_path(3),
            PathBuf::from("/sys/fs/bpf/pipeline7/links/xdp_3")
        );
    }
}
