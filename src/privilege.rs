//! One-shot privilege transitions (C4, SPEC_FULL §4.4).
//!
//! Ordering invariant enforced by the caller (`lifecycle::main_configure`):
//! bind low-numbered ports, then `change_root`, then `drop_privileges`,
//! then open the post-drop file log sink.

use std::path::Path;

use log::{info, warn};

use crate::error::PrivilegeError;

/// No-op if `path` is `None`. `chroot` requires root, so this must run
/// before [`drop_privileges`].
pub fn change_root(path: Option<&Path>) -> Result<(), PrivilegeError> {
    let path = match path {
        Some(p) => p,
        None => return Ok(()),
    };
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .expect("chroot path must not contain NUL bytes");
    if unsafe { libc::chroot(c_path.as_ptr()) } != 0 {
        return Err(PrivilegeError::Chroot(
            std::io::Error::last_os_error(),
            path.to_path_buf(),
        ));
    }
    let root = std::ffi::CString::new("/").unwrap();
    if unsafe { libc::chdir(root.as_ptr()) } != 0 {
        return Err(PrivilegeError::Chroot(
            std::io::Error::last_os_error(),
            path.to_path_buf(),
        ));
    }
    info!("Switched to chroot directory: {}", path.display());
    Ok(())
}

/// Drops group and user identity. When `critical` is `true` (first
/// configuration), any failure aborts; when `false` (a later reload that
/// only re-applies the same identity, which will naturally fail the second
/// time), failures are logged but tolerated.
pub fn drop_privileges(
    gid: Option<u32>,
    uid: Option<u32>,
    critical: bool,
) -> Result<(), PrivilegeError> {
    if let Some(gid) = gid {
        if unsafe { libc::setgid(gid) } != 0 {
            let err = PrivilegeError::SetGid(gid, std::io::Error::last_os_error());
            if critical {
                return Err(err);
            }
            warn!("{}", err);
        }
        let groups = [gid as libc::gid_t];
        if unsafe { libc::setgroups(1, groups.as_ptr()) } != 0 {
            let err = PrivilegeError::SetGroups(std::io::Error::last_os_error());
            if critical {
                return Err(err);
            }
            warn!("{}", err);
        }
    }
    if let Some(uid) = uid {
        if unsafe { libc::setuid(uid) } != 0 {
            let err = PrivilegeError::SetUid(uid, std::io::Error::last_os_error());
            if critical {
                return Err(err);
            }
            warn!("{}", err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_root_is_a_no_op_without_a_path() {
        assert!(change_root(None).is_ok());
    }

    #[test]
    fn drop_privileges_is_a_no_op_without_ids() {
        assert!(drop_privileges(None, None, true).is_ok());
    }
}
