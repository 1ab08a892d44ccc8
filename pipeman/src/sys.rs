// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of pipeman

//! Thin `bpf(2)` wrappers for the handful of commands the loader library
//! does not expose: opening arbitrary pinned objects, full map/program info
//! queries, fetching a type-metadata blob by id, fd-valued map updates and
//! synthetic single-shot program runs.
//!
//! Each attribute struct is the command-specific prefix of the kernel's
//! `bpf_attr` union; the kernel accepts a shorter size and treats the
//! missing tail as zero.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use nix::libc;

const BPF_MAP_UPDATE_ELEM: libc::c_int = 2;
const BPF_OBJ_GET: libc::c_int = 7;
const BPF_PROG_TEST_RUN: libc::c_int = 10;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;
const BPF_BTF_GET_FD_BY_ID: libc::c_int = 19;

/// Input buffer handed to initializer programs; large enough for any hook
/// type's minimum frame requirements.
const TEST_RUN_DATA_LEN: usize = 128;

fn sys_bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<i64> {
    // SAFETY: `attr` is a repr(C) prefix of bpf_attr, valid for the size we
    // report; the kernel does not retain the pointer past the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>() as libc::c_uint,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as i64)
    }
}

/// Opens a pinned program or map without assuming its type.
pub(crate) fn obj_get(path: &Path) -> io::Result<OwnedFd> {
    #[repr(C)]
    struct ObjAttr {
        pathname: u64,
        bpf_fd: u32,
        file_flags: u32,
    }

    let pathname = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };
    let fd = sys_bpf(BPF_OBJ_GET, &mut attr)?;
    // SAFETY: a nonnegative return from BPF_OBJ_GET is a fresh fd we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

pub(crate) fn map_update_elem(map: BorrowedFd<'_>, key: &[u8], value: &[u8]) -> io::Result<()> {
    #[repr(C)]
    struct MapElemAttr {
        map_fd: u32,
        _pad: u32,
        key: u64,
        value: u64,
        flags: u64,
    }

    let mut attr = MapElemAttr {
        map_fd: map.as_raw_fd() as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_ptr() as u64,
        flags: 0,
    };
    sys_bpf(BPF_MAP_UPDATE_ELEM, &mut attr).map(|_| ())
}

/// Runs a program once with an empty input frame, for its side effects only.
pub(crate) fn prog_run_once(prog: BorrowedFd<'_>) -> io::Result<()> {
    #[repr(C)]
    #[derive(Default)]
    struct TestRunAttr {
        prog_fd: u32,
        retval: u32,
        data_size_in: u32,
        data_size_out: u32,
        data_in: u64,
        data_out: u64,
        repeat: u32,
        duration: u32,
    }

    let data_in = [0u8; TEST_RUN_DATA_LEN];
    let mut attr = TestRunAttr {
        prog_fd: prog.as_raw_fd() as u32,
        data_size_in: TEST_RUN_DATA_LEN as u32,
        data_in: data_in.as_ptr() as u64,
        repeat: 1,
        ..Default::default()
    };
    sys_bpf(BPF_PROG_TEST_RUN, &mut attr).map(|_| ())
}

fn obj_get_info<T>(fd: BorrowedFd<'_>, info: &mut T) -> io::Result<()> {
    #[repr(C)]
    struct InfoAttr {
        bpf_fd: u32,
        info_len: u32,
        info: u64,
    }

    let mut attr = InfoAttr {
        bpf_fd: fd.as_raw_fd() as u32,
        info_len: mem::size_of::<T>() as u32,
        info: info as *mut T as u64,
    };
    sys_bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr).map(|_| ())
}

/// Prefix of the kernel's `bpf_prog_info`, through the fields this crate
/// reads. Field order and padding mirror the kernel layout exactly.
#[repr(C)]
#[derive(Default)]
pub(crate) struct ProgInfo {
    pub(crate) prog_type: u32,
    pub(crate) id: u32,
    tag: [u8; 8],
    jited_prog_len: u32,
    xlated_prog_len: u32,
    jited_prog_insns: u64,
    xlated_prog_insns: u64,
    pub(crate) load_time_ns: u64,
    created_by_uid: u32,
    nr_map_ids: u32,
    map_ids: u64,
    name: [u8; 16],
    ifindex: u32,
    flags: u32,
    netns_dev: u64,
    netns_ino: u64,
    nr_jited_ksyms: u32,
    nr_jited_func_lens: u32,
    jited_ksyms: u64,
    jited_func_lens: u64,
    pub(crate) btf_id: u32,
    func_info_rec_size: u32,
}

pub(crate) fn prog_info(prog: BorrowedFd<'_>) -> io::Result<ProgInfo> {
    let mut info = ProgInfo::default();
    obj_get_info(prog, &mut info)?;
    Ok(info)
}

/// Prefix of the kernel's `bpf_map_info`, through the raw type-metadata ids
/// that the loader library does not surface.
#[repr(C)]
#[derive(Default)]
pub(crate) struct MapInfo {
    pub(crate) map_type: u32,
    pub(crate) id: u32,
    pub(crate) key_size: u32,
    pub(crate) value_size: u32,
    pub(crate) max_entries: u32,
    map_flags: u32,
    name: [u8; 16],
    ifindex: u32,
    btf_vmlinux_value_type_id: u32,
    netns_dev: u64,
    netns_ino: u64,
    btf_id: u32,
    pub(crate) btf_key_type_id: u32,
    pub(crate) btf_value_type_id: u32,
}

pub(crate) fn map_info(map: BorrowedFd<'_>) -> io::Result<MapInfo> {
    let mut info = MapInfo::default();
    obj_get_info(map, &mut info)?;
    Ok(info)
}

#[repr(C)]
#[derive(Default)]
struct BtfInfo {
    btf: u64,
    btf_size: u32,
    id: u32,
    name: u64,
    name_len: u32,
    kernel_btf: u32,
}

/// Fetches the raw type-metadata blob the kernel holds under `btf_id`.
/// Two-pass: the first info query reports the size, the second fills the
/// caller's buffer.
pub(crate) fn btf_bytes_by_id(btf_id: u32) -> io::Result<Vec<u8>> {
    #[repr(C)]
    #[derive(Default)]
    struct GetIdAttr {
        id: u32,
        next_id: u32,
        open_flags: u32,
    }

    let mut attr = GetIdAttr {
        id: btf_id,
        ..Default::default()
    };
    let fd = sys_bpf(BPF_BTF_GET_FD_BY_ID, &mut attr)?;
    // SAFETY: a nonnegative return is a fresh fd we own.
    let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

    let mut info = BtfInfo::default();
    obj_get_info(fd.as_fd(), &mut info)?;
    if info.btf_size == 0 {
        return Err(io::Error::other("kernel reported an empty type section"));
    }

    let mut buf = vec![0u8; info.btf_size as usize];
    let mut info = BtfInfo {
        btf: buf.as_mut_ptr() as u64,
        btf_size: buf.len() as u32,
        ..Default::default()
    };
    obj_get_info(fd.as_fd(), &mut info)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The attribute structs must keep the kernel's exact layout; a drifted
    // offset corrupts the syscall silently.
    #[test]
    fn info_struct_layouts_match_kernel() {
        assert_eq!(mem::size_of::<ProgInfo>(), 136);
        assert_eq!(mem::size_of::<MapInfo>(), 80);
        assert_eq!(mem::size_of::<BtfInfo>(), 32);
        assert_eq!(mem::offset_of!(ProgInfo, load_time_ns), 40);
        assert_eq!(mem::offset_of!(ProgInfo, btf_id), 128);
        assert_eq!(mem::offset_of!(MapInfo, btf_key_type_id), 68);
        assert_eq!(mem::offset_of!(MapInfo, btf_value_type_id), 72);
    }
}
