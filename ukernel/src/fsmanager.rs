//! Jails guest filesystem path syscalls (`open`/`openat`/`statx`/...)
//! under a fixed host directory. Grounded on `dbt/util/fsmanager.cpp`'s
//! chroot-root jail, expressed with `anyhow` the way
//! `examples/HiSA-Team-shadowfax` reaches for it whenever a path
//! resolution can fail.

use std::path::{Component, Path, PathBuf};

use crate::error::UkernelError;

pub struct FsManager {
    root: PathBuf,
}

impl FsManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FsManager { root: root.into() }
    }

    /// Resolves a guest-supplied path (already UTF-8 decoded by the
    /// syscall dispatcher) to a host path under `root`. A leading `/` is
    /// guest-rooted, not host-rooted; any `..` component that would walk
    /// above `root` is rejected rather than silently clamped.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, UkernelError> {
        let mut resolved = PathBuf::new();
        let relative = guest_path.trim_start_matches('/');

        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(UkernelError::PathEscape(guest_path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {}
            }
        }

        Ok(self.root.join(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_guest_rooted_path_under_fsroot() {
        let fsm = FsManager::new("/tmp/guestroot");
        let resolved = fsm.resolve("/etc/hosts").unwrap();
        assert_eq!(resolved, Path::new("/tmp/guestroot/etc/hosts"));
    }

    #[test]
    fn rejects_parent_escape() {
        let fsm = FsManager::new("/tmp/guestroot");
        assert!(fsm.resolve("/../../etc/shadow").is_err());
    }

    #[test]
    fn internal_parent_dir_that_stays_inside_root_is_fine() {
        let fsm = FsManager::new("/tmp/guestroot");
        let resolved = fsm.resolve("/a/b/../c").unwrap();
        assert_eq!(resolved, Path::new("/tmp/guestroot/a/c"));
    }
}
