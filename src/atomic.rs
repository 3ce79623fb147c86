use crate::error::{DeployError, Result};
use std::io::Write;
use std::path::Path;

/// Replace `dest` with `bytes` via a sibling temp file and rename.
///
/// Readers see either the previous contents or the new ones, never a prefix.
pub fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".chainboot")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|err| DeployError::io("create temp file", dir, err))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| DeployError::io("write", tmp.path().to_path_buf(), err))?;
    tmp.persist(dest)
        .map_err(|err| DeployError::io("replace", dest, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_contents_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Move.toml");
        std::fs::write(&path, "old").unwrap();
        write_atomic(&path, b"new").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
