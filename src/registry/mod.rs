#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Persistent registries: the package catalog and the maintainer roster.
//! Both follow the same discipline: every mutation is committed to disk
//! with an atomic write before the operation returns success.

pub mod maintainers;
pub mod packages;

use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` atomically (tmp + fsync + rename) with `mode`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        let _ = f.sync_all();
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode));
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&tmp, path)?;
    Ok(())
}
