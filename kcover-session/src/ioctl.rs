//! Raw kcov ioctl interface, see `include/uapi/linux/kcov.h`.

use std::os::raw::c_ulong;

use nix::sys::ioctl::ioctl_num_type;
use nix::{ioctl_write_int_bad, ioctl_write_ptr_bad};
use nix::{request_code_none, request_code_read, request_code_write};

const KCOV_IOC_MAGIC: u8 = b'c';

pub const KCOV_INIT_TRACE: ioctl_num_type =
    request_code_read!(KCOV_IOC_MAGIC, 1, std::mem::size_of::<c_ulong>());
pub const KCOV_ENABLE: ioctl_num_type = request_code_none!(KCOV_IOC_MAGIC, 100);
pub const KCOV_DISABLE: ioctl_num_type = request_code_none!(KCOV_IOC_MAGIC, 101);
pub const KCOV_REMOTE_ENABLE: ioctl_num_type = request_code_write!(
    KCOV_IOC_MAGIC,
    102,
    std::mem::size_of::<KcovRemoteArg>()
);

/// Record the program counter of every basic block.
pub const KCOV_TRACE_PC: u32 = 0;

/// Mirrors `struct kcov_remote_arg` with no trailing per-subsystem handles.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct KcovRemoteArg {
    pub trace_mode: u32,
    pub area_size: u32,
    pub num_handles: u32,
    // `common_handle` is an `__aligned_u64`.
    pub reserved: u32,
    pub common_handle: u64,
}

ioctl_write_int_bad!(kcov_init_trace, KCOV_INIT_TRACE);
ioctl_write_int_bad!(kcov_enable, KCOV_ENABLE);
ioctl_write_int_bad!(kcov_disable, KCOV_DISABLE);
ioctl_write_ptr_bad!(kcov_remote_enable, KCOV_REMOTE_ENABLE, KcovRemoteArg);
