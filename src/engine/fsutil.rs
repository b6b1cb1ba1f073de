//! Filesystem helpers shared by staging and the delta codec.

use std::fs;
use std::io;
use std::path::Path;

/// Entries the OS drops into bundles that never belong to the content.
pub fn is_transient_metadata(name: &str) -> bool {
    name == ".DS_Store"
        || name == "__MACOSX"
        || name == ".fseventsd"
        || name == ".Spotlight-V100"
        || name == ".Trashes"
        || name.starts_with("._")
}

/// Recursively copy `src` to `dest`, keeping symlinks as symlinks.
/// Returns the number of bytes copied.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        copy_symlink(src, dest)?;
        return Ok(0);
    }
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        return fs::copy(src, dest);
    }

    fs::create_dir_all(dest)?;
    fs::set_permissions(dest, meta.permissions())?;

    let mut total_size = 0u64;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        total_size += copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
    }
    Ok(total_size)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    let target = fs::read_link(src)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dest: &Path) -> io::Result<()> {
    // No portable symlink creation; copy what the link points at.
    fs::copy(src, dest).map(|_| ())
}

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// `true` when something (including a dangling symlink) exists at `path`.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
