//! Live kernel replacement (spec §4.4 "Live kernel replacement").
//!
//! Wraps the two raw syscalls the operation needs directly via `libc`,
//! matching the teacher's comfort with raw `libc::` calls at kernel
//! boundaries it has no higher-level crate for (see `isolation.rs`'s
//! `unshare`/`sethostname` calls).

use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

const KEXEC_ARCH_DEFAULT: libc::c_ulong = 0;
const LINUX_REBOOT_MAGIC1: libc::c_int = 0xfee1dead_u32 as libc::c_int;
const LINUX_REBOOT_MAGIC2: libc::c_int = 672_274_793;
const LINUX_REBOOT_CMD_KEXEC: libc::c_int = 0x4547_5254;

/// Loads `kernel_image` (and optional `initrd`) as the next kernel via
/// `kexec_file_load(2)`. Does not execute it — that is a separate,
/// irrevocable step (`execute`).
pub fn load(kernel_image: &Path, initrd: Option<&Path>, cmdline: &str) -> Result<(), String> {
    let kernel_file =
        File::open(kernel_image).map_err(|e| format!("open {}: {e}", kernel_image.display()))?;
    let initrd_file = match initrd {
        Some(path) => Some(File::open(path).map_err(|e| format!("open {}: {e}", path.display()))?),
        None => None,
    };
    let cmdline_c = CString::new(cmdline).map_err(|e| format!("cmdline has embedded NUL: {e}"))?;

    let kernel_fd = kernel_file.as_raw_fd();
    let initrd_fd = initrd_file.as_ref().map_or(-1, |f| f.as_raw_fd());
    let mut flags: libc::c_ulong = 0;
    if initrd_fd < 0 {
        flags |= KEXEC_FILE_NO_INITRAMFS;
    }

    let rc = unsafe {
        libc::syscall(
            libc::SYS_kexec_file_load,
            kernel_fd,
            initrd_fd,
            (cmdline_c.as_bytes_with_nul().len()) as libc::c_ulong,
            cmdline_c.as_ptr(),
            flags,
        )
    };
    if rc != 0 {
        return Err(format!("kexec_file_load failed: {}", std::io::Error::last_os_error()));
    }
    let _ = KEXEC_ARCH_DEFAULT;
    Ok(())
}

const KEXEC_FILE_NO_INITRAMFS: libc::c_ulong = 0x4;

/// The point of no return: tells the kernel to boot the previously-loaded
/// image. Never returns on success.
pub fn execute() -> Result<(), String> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_reboot,
            LINUX_REBOOT_MAGIC1,
            LINUX_REBOOT_MAGIC2,
            LINUX_REBOOT_CMD_KEXEC,
            std::ptr::null::<libc::c_void>(),
        )
    };
    Err(format!("reboot(LINUX_REBOOT_CMD_KEXEC) returned unexpectedly: rc={rc}, {}", std::io::Error::last_os_error()))
}
