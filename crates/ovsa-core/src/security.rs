use crate::error::{OvsaError, Result};

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Disable core dumps for the current process. Called once by every tool
/// before any key material is loaded.
pub fn disable_core_dumps() -> Result<()> {
    #[cfg(unix)]
    {
        use libc::{rlimit, setrlimit, RLIMIT_CORE};
        let rlim = rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let result = unsafe { setrlimit(RLIMIT_CORE, &rlim) };
        if result == 0 {
            Ok(())
        } else {
            Err(OvsaError::Crypto("failed to disable core dumps".into()))
        }
    }
    #[cfg(not(unix))]
    {
        Ok(())
    }
}

/// Set restrictive file permissions (0600) on secret-bearing files.
pub fn set_secure_permissions(path: &std::path::Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(|e| OvsaError::file_io(path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
