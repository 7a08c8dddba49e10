use std::collections::HashSet;
use std::io::{Cursor, Read, Seek};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::StagingError;

/// Expand a zip archive below `dest`, one file per contained path.
///
/// `claimed` holds the workdir-relative paths already staged; an entry landing
/// on one of them is a collision. Returns the relative paths written, in
/// archive order.
pub fn expand_zip(
    name: &str,
    data: &[u8],
    root: &Path,
    dest: &Path,
    claimed: &mut HashSet<PathBuf>,
) -> Result<Vec<PathBuf>, StagingError> {
    expand(name, Cursor::new(data), root, dest, claimed)
}

fn expand<R: Read + Seek>(
    name: &str,
    data: R,
    root: &Path,
    dest: &Path,
    claimed: &mut HashSet<PathBuf>,
) -> Result<Vec<PathBuf>, StagingError> {
    let corrupt = |source| StagingError::CorruptArchive {
        name: name.to_string(),
        source,
    };

    let mut archive = ZipArchive::new(data).map_err(corrupt)?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(corrupt)?;

        // ZIP Slip protection: the entry must stay inside its destination
        let entry_path = match file.enclosed_name() {
            Some(path) => dest.join(path),
            None => return Err(StagingError::UnsafePath(file.name().to_string())),
        };
        let outpath = root.join(&entry_path);

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }

        if !claimed.insert(entry_path.clone()) {
            return Err(StagingError::Collision(entry_path));
        }
        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&outpath)?;
        std::io::copy(&mut file, &mut outfile).map_err(|e| {
            // Decompression failures surface as io errors from the reader
            StagingError::CorruptArchive {
                name: name.to_string(),
                source: zip::result::ZipError::Io(e),
            }
        })?;

        if let Some(mode) = file.unix_mode() {
            std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode & 0o777))?;
        }
        written.push(entry_path);
    }

    Ok(written)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub(crate) fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            for (path, content) in entries {
                if path.ends_with('/') {
                    writer
                        .add_directory(*path, SimpleFileOptions::default())
                        .unwrap();
                } else {
                    writer
                        .start_file(*path, SimpleFileOptions::default())
                        .unwrap();
                    writer.write_all(content.as_bytes()).unwrap();
                }
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_expand_preserves_structure() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[("src/", ""), ("src/main.py", "print(1)"), ("README", "hi")]);
        let mut claimed = HashSet::new();

        let written =
            expand_zip("sub.zip", &data, dir.path(), Path::new(""), &mut claimed).unwrap();

        assert_eq!(
            written,
            vec![PathBuf::from("src/main.py"), PathBuf::from("README")]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/main.py")).unwrap(),
            "print(1)"
        );
    }

    #[test]
    fn test_expand_detects_collision() {
        let dir = tempfile::tempdir().unwrap();
        let data = build_zip(&[("grade.py", "x")]);
        let mut claimed: HashSet<PathBuf> = [PathBuf::from("grade.py")].into_iter().collect();

        let err = expand_zip("sub.zip", &data, dir.path(), Path::new(""), &mut claimed).unwrap_err();
        assert!(matches!(err, StagingError::Collision(p) if p == Path::new("grade.py")));
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut claimed = HashSet::new();
        let err = expand_zip(
            "broken.zip",
            b"PK\x03\x04 definitely not a zip",
            dir.path(),
            Path::new(""),
            &mut claimed,
        )
        .unwrap_err();
        assert!(matches!(err, StagingError::CorruptArchive { .. }));
    }
}
