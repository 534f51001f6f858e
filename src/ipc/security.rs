//! Security attributes for the control pipe.
//!
//! Clients live inside arbitrary applications, including sandboxed
//! app-container processes, so the pipe's DACL grants GENERIC_ALL to
//! the Everyone group (WD) and to ALL APPLICATION PACKAGES (AC), both
//! inheritable. Remote access is rejected separately at pipe creation.

use std::ffi::{c_void, OsStr};
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

use windows_sys::Win32::Foundation::LocalFree;
use windows_sys::Win32::Security::Authorization::ConvertStringSecurityDescriptorToSecurityDescriptorW;
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;

/// GENERIC_ALL for Everyone and for all app packages.
const PIPE_SDDL: &str = "D:(A;OICI;GA;;;WD)(A;OICI;GA;;;AC)";

const SDDL_REVISION_1: u32 = 1;

/// Owned `SECURITY_ATTRIBUTES` for pipe creation. The descriptor is a
/// single LocalAlloc block released on drop, after the last pipe
/// instance has been created from it.
pub struct PipeSecurity {
    attributes: SECURITY_ATTRIBUTES,
    descriptor: *mut c_void,
}

impl PipeSecurity {
    /// Build the broker's pipe security attributes from [`PIPE_SDDL`].
    pub fn broker_default() -> io::Result<Self> {
        let sddl: Vec<u16> = OsStr::new(PIPE_SDDL)
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        let mut descriptor: *mut c_void = ptr::null_mut();
        // SAFETY: `sddl` is NUL-terminated and outlives the call; the
        // returned descriptor is freed in Drop.
        let ok = unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                sddl.as_ptr(),
                SDDL_REVISION_1,
                &mut descriptor,
                ptr::null_mut(),
            )
        };
        if ok == 0 || descriptor.is_null() {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            attributes: SECURITY_ATTRIBUTES {
                nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor,
                bInheritHandle: 0,
            },
            descriptor,
        })
    }

    /// Raw pointer for `create_with_security_attributes_raw`.
    pub fn attributes_ptr(&self) -> *mut c_void {
        &self.attributes as *const SECURITY_ATTRIBUTES as *mut c_void
    }
}

impl Drop for PipeSecurity {
    fn drop(&mut self) {
        // SAFETY: the descriptor came from
        // ConvertStringSecurityDescriptorToSecurityDescriptorW, which
        // allocates with LocalAlloc.
        unsafe {
            LocalFree(self.descriptor);
        }
    }
}

// SAFETY: the raw pointers reference memory owned by this value and
// are never shared mutably.
unsafe impl Send for PipeSecurity {}
