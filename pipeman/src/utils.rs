// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

use std::{
    fs,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};

use anyhow::{Context, bail};
use log::{debug, info};
use nix::{
    mount::{MsFlags, mount},
    net::if_::if_nametoindex,
};

use crate::{directories::BPF_FS, errors::PipemanError};

pub(crate) fn get_ifindex(iface: &str) -> Result<u32, PipemanError> {
    match if_nametoindex(iface) {
        Ok(index) => {
            debug!("Map {} to {}", iface, index);
            Ok(index)
        }
        Err(_) => {
            info!("unable to resolve interface {}", iface);
            Err(PipemanError::InvalidInput(format!(
                "no such interface: {iface}"
            )))
        }
    }
}

pub(crate) fn create_bpffs(directory: &str) -> anyhow::Result<()> {
    debug!("Creating bpffs at {directory}");
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RELATIME;
    mount::<str, str, str, str>(None, directory, Some("bpf"), flags, None)
        .with_context(|| format!("unable to create bpffs at {directory}"))
}

pub(crate) fn is_bpffs_mounted() -> Result<bool, anyhow::Error> {
    let file = File::open("/proc/mounts").context("Failed to open /proc/mounts")?;
    bpffs_mounted_in(BufReader::new(file))
}

fn bpffs_mounted_in(reader: impl BufRead) -> Result<bool, anyhow::Error> {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                let parts: Vec<&str> = line.split(' ').collect();
                if parts.len() != 6 {
                    bail!("expected 6 parts in proc mount")
                }
                if parts[1] == BPF_FS && parts[2] == "bpf" {
                    return Ok(true);
                }
            }
            Err(e) => bail!("problem reading lines {}", e),
        }
    }
    Ok(false)
}

/// Parses the first field of a `/proc/uptime` style line: seconds since
/// boot, fractional.
pub(crate) fn parse_uptime(content: &str) -> Option<f64> {
    content
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
}

/// Removes a directory tree entry by entry, ignoring individual failures so
/// one stuck entry does not block the rest.
pub(crate) fn remove_tree_best_effort(path: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let entry_path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => {
                let _ = remove_tree_best_effort(&entry_path);
            }
            Ok(_) => {
                let _ = fs::remove_file(&entry_path);
            }
            Err(_) => continue,
        }
    }
    let _ = fs::remove_dir(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs::{File, create_dir_all};

    use super::*;

    #[test]
    fn uptime_parses_first_field() {
        assert_eq!(parse_uptime("12345.67 56789.01\n"), Some(12345.67));
        assert_eq!(parse_uptime("42\n"), Some(42.0));
        assert_eq!(parse_uptime(""), None);
        assert_eq!(parse_uptime("garbage here"), None);
    }

    #[test]
    fn detects_bpffs_mount_line() {
        let mounts = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
none /sys/fs/bpf bpf rw,nosuid,nodev,noexec,relatime 0 0
";
        assert!(bpffs_mounted_in(mounts.as_bytes()).expect("parses"));

        let without = "sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0\n";
        assert!(!bpffs_mounted_in(without.as_bytes()).expect("parses"));
    }

    #[test]
    fn tree_removal_is_best_effort_and_recursive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("pipeline1");
        create_dir_all(root.join("maps")).expect("mkdir");
        File::create(root.join("prog_a")).expect("create");
        File::create(root.join("maps/table_b")).expect("create");

        remove_tree_best_effort(&root).expect("removal walks the tree");
        assert!(!root.exists());
    }
}
