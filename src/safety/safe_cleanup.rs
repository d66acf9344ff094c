//! Symlink-safe recursive removal for execution workspaces.
//!
//! User code owns everything inside its workspace and may leave symlinks
//! pointing anywhere on the host, or directories it has made unreadable.
//! Removal walks the tree with `openat`/`fstatat`/`unlinkat` relative to
//! directory descriptors, never follows a link, and never crosses a
//! filesystem boundary.

use crate::config::types::{EngineError, Result};
use std::ffi::{CStr, CString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const DIR_OPEN_FLAGS: libc::c_int =
    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

struct FdGuard(RawFd);

impl FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

/// Owns a `DIR*` stream; closing it also closes the dup'd descriptor.
struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe {
            libc::closedir(self.0);
        }
    }
}

fn last_os_error(context: impl std::fmt::Display) -> EngineError {
    EngineError::Filesystem(format!("{}: {}", context, std::io::Error::last_os_error()))
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        EngineError::Filesystem(format!(
            "Path contains NUL byte and cannot be opened safely: {}",
            path.display()
        ))
    })?;

    let fd = unsafe { libc::open(path_c.as_ptr(), DIR_OPEN_FLAGS) };
    if fd < 0 {
        return Err(last_os_error(format!(
            "open directory failed for {}",
            path.display()
        )));
    }
    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> std::io::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(last_os_error(format!("unlinkat failed for {:?}", name)));
    }
    Ok(())
}

fn open_child_dir(parent_fd: RawFd, name: &CStr) -> Result<FdGuard> {
    let fd = unsafe { libc::openat(parent_fd, name.as_ptr(), DIR_OPEN_FLAGS) };
    if fd >= 0 {
        return Ok(FdGuard(fd));
    }

    // A directory chmod'ed to 000 by user code: restore owner access and retry
    let errno = std::io::Error::last_os_error().raw_os_error();
    if errno == Some(libc::EACCES) {
        let rc = unsafe { libc::fchmodat(parent_fd, name.as_ptr(), 0o700, 0) };
        if rc == 0 {
            let fd = unsafe { libc::openat(parent_fd, name.as_ptr(), DIR_OPEN_FLAGS) };
            if fd >= 0 {
                return Ok(FdGuard(fd));
            }
        }
    }
    Err(last_os_error(format!(
        "openat failed for child directory {:?}",
        name
    )))
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    let child = open_child_dir(parent_fd, name)?;
    remove_dir_contents_fd(child.as_raw_fd(), root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    // Write permission on the directory is needed to unlink its entries
    unsafe {
        libc::fchmod(dir_fd, 0o700);
    }

    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(last_os_error("dup for directory iteration failed"));
    }

    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(last_os_error("fdopendir failed"));
    }
    let stream = DirStream(dir);

    // Collect names first; unlinking while readdir is mid-stream can skip entries
    let mut names: Vec<CString> = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(stream.0) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            if errno != 0 {
                return Err(EngineError::Filesystem(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            break;
        }

        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(name.to_owned());
    }
    drop(stream);

    for name in &names {
        let st = match fstatat_nofollow(dir_fd, name) {
            Ok(st) => st,
            // Already gone
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => continue,
            Err(e) => {
                return Err(EngineError::Filesystem(format!(
                    "fstatat failed for {:?}: {}",
                    name, e
                )))
            }
        };

        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(EngineError::Filesystem(format!(
                    "Refusing to cross filesystem boundary at directory {:?}",
                    name
                )));
            }
            recurse_remove_dir(dir_fd, name, root_dev)?;
        } else {
            remove_entry_at(dir_fd, name, 0)?;
        }
    }

    Ok(())
}

/// Remove a tree without following symlinks.
///
/// A missing path is not an error, so repeated removal is idempotent.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        EngineError::Filesystem(format!(
            "Cannot remove path without parent: {}",
            path.display()
        ))
    })?;
    let name_os = path.file_name().ok_or_else(|| {
        EngineError::Filesystem(format!(
            "Cannot remove path without file name: {}",
            path.display()
        ))
    })?;
    let name_c = CString::new(name_os.as_bytes()).map_err(|_| {
        EngineError::Filesystem(format!(
            "Path contains NUL byte and cannot be removed safely: {}",
            path.display()
        ))
    })?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name_c).map_err(|e| {
        EngineError::Filesystem(format!("fstatat failed for {}: {}", path.display(), e))
    })?;

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.as_raw_fd(), &name_c, st.st_dev)
    } else {
        remove_entry_at(parent_fd.as_raw_fd(), &name_c, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_removes_nested_tree() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("ws");
        fs::create_dir_all(target.join("a/b/c")).unwrap();
        fs::write(target.join("a/b/c/file.txt"), b"data").unwrap();
        fs::write(target.join("top.txt"), b"data").unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_does_not_follow_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let outside = root.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("keep.txt"), b"keep").unwrap();

        let target = root.path().join("ws");
        fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&outside, target.join("escape")).unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
        assert!(outside.join("keep.txt").exists());
    }

    #[test]
    fn test_removes_unreadable_directory() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("ws");
        let locked = target.join("locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("inner.txt"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        remove_tree_secure(&target).unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_missing_path_is_ok() {
        let root = tempfile::tempdir().unwrap();
        remove_tree_secure(&root.path().join("never-created")).unwrap();
    }
}
