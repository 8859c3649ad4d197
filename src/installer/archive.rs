//! Safe archive extraction
//!
//! Every entry path is validated before any file is written: absolute
//! paths, `..` segments and anything resolving outside the extraction root
//! are rejected with `PathTraversal`. A poisoned archive therefore never
//! touches the target directory tree.

use super::InstallError;
use flate2::read::GzDecoder;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Validate and join an archive entry path under `root`.
pub fn safe_join(root: &Path, entry: &str) -> Result<PathBuf, InstallError> {
    let entry_path = Path::new(entry);
    if entry.is_empty() {
        return Err(InstallError::PathTraversal("empty entry path".to_string()));
    }
    if entry_path.is_absolute() || entry.starts_with('/') || entry.starts_with('\\') {
        return Err(InstallError::PathTraversal(entry.to_string()));
    }
    let mut joined = root.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            // ParentDir, RootDir and windows Prefix all escape the root.
            _ => return Err(InstallError::PathTraversal(entry.to_string())),
        }
    }
    if !joined.starts_with(root) {
        return Err(InstallError::PathTraversal(entry.to_string()));
    }
    Ok(joined)
}

pub fn extract_zip(archive_path: &Path, target: &Path) -> Result<(), InstallError> {
    let file = fs::File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| InstallError::Archive(e.to_string()))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| InstallError::Archive(e.to_string()))?;
        let name = entry.name().to_string();
        if name.is_empty() {
            continue;
        }
        let dest = safe_join(target, &name)?;
        if entry.is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

pub fn extract_tar_gz(archive_path: &Path, target: &Path) -> Result<(), InstallError> {
    let file = fs::File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    for entry in archive
        .entries()
        .map_err(|e| InstallError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| InstallError::Archive(e.to_string()))?;
        let name = entry
            .path()
            .map_err(|e| InstallError::Archive(e.to_string()))?
            .to_string_lossy()
            .to_string();
        if name.is_empty() {
            continue;
        }
        let dest = safe_join(target, &name)?;
        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&dest)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            // Symlinks and specials are skipped; release archives only
            // carry regular files.
            continue;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// Recursively locate `filename` (case-insensitive) under `root`.
pub fn find_file(root: &Path, filename: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        } else if entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case(filename)
        {
            return Some(path);
        }
    }
    dirs.into_iter().find_map(|dir| find_file(&dir, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "nekkus-archive-{label}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_safe_join_accepts_nested_paths() {
        let root = Path::new("/tmp/extract");
        let joined = safe_join(root, "sing-box-1.9.0/sing-box").unwrap();
        assert_eq!(joined, root.join("sing-box-1.9.0").join("sing-box"));
    }

    #[test]
    fn test_safe_join_rejects_traversal() {
        let root = Path::new("/tmp/extract");
        assert!(matches!(
            safe_join(root, "../evil"),
            Err(InstallError::PathTraversal(_))
        ));
        assert!(matches!(
            safe_join(root, "sub/../../evil"),
            Err(InstallError::PathTraversal(_))
        ));
        assert!(matches!(
            safe_join(root, "/etc/passwd"),
            Err(InstallError::PathTraversal(_))
        ));
        assert!(matches!(
            safe_join(root, ""),
            Err(InstallError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_zip_roundtrip() {
        let dir = temp_dir("zip-ok");
        let archive_path = dir.join("ok.zip");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            writer.start_file("pkg/sing-box", options).unwrap();
            writer.write_all(b"#!fake").unwrap();
            writer.finish().unwrap();
        }

        let out = dir.join("out");
        extract_zip(&archive_path, &out).unwrap();
        assert!(out.join("pkg").join("sing-box").is_file());
        assert_eq!(
            find_file(&out, "SING-BOX").unwrap(),
            out.join("pkg").join("sing-box")
        );
    }

    #[test]
    fn test_zip_traversal_rejected_and_target_untouched() {
        let dir = temp_dir("zip-evil");
        let archive_path = dir.join("evil.zip");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::FileOptions::default();
            writer.start_file("../evil", options).unwrap();
            writer.write_all(b"boom").unwrap();
            writer.finish().unwrap();
        }

        let out = dir.join("out");
        fs::create_dir_all(&out).unwrap();
        let err = extract_zip(&archive_path, &out).unwrap_err();
        assert!(matches!(err, InstallError::PathTraversal(_)));
        assert!(!dir.join("evil").exists());
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_tar_gz_roundtrip() {
        let dir = temp_dir("tar-ok");
        let archive_path = dir.join("ok.tar.gz");
        {
            let file = fs::File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let data = b"#!fake";
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, "pkg/sing-box", data.as_slice())
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let out = dir.join("out");
        extract_tar_gz(&archive_path, &out).unwrap();
        assert!(out.join("pkg").join("sing-box").is_file());
    }
}
