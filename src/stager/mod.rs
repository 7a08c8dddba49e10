//! Working-directory assembly
//!
//! Every file lands in the run's workdir by exactly one rule:
//! - a role with a configured path (`path_script`, `path_solution`) puts the file at that path
//! - an input file under a configured `prefix_input` goes to `<prefix><name>`
//! - otherwise a file with a key goes to its `name` and is indexed under the key
//! - a test file with neither is hidden and never staged
//!
//! Submission files always go to their `name`. Zip archives are expanded where
//! they would have been placed. The resulting `StagedManifest` is how builders
//! and testers find things; they never search the workdir themselves.

pub mod archive;

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::StagingError;
use crate::models::{File, FileRole, Test};
use crate::storage::BlobStore;

/// One staged file, relative to the workdir
#[derive(Debug, Clone, PartialEq)]
pub struct StagedEntry {
    pub path: PathBuf,
    pub key: Option<String>,
    pub role: FileRole,
}

#[derive(Debug, Clone)]
pub struct StagedManifest {
    root: PathBuf,
    entries: Vec<StagedEntry>,
}

impl StagedManifest {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            entries: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[StagedEntry] {
        &self.entries
    }

    pub fn absolute(&self, entry: &StagedEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    fn test_entries(&self) -> impl Iterator<Item = &StagedEntry> {
        self.entries
            .iter()
            .filter(|e| e.role != FileRole::Submission)
    }

    /// Test file staged at exactly `path`
    pub fn by_path(&self, path: &str) -> Option<&StagedEntry> {
        let wanted = normalize(path).ok()?;
        self.test_entries().find(|e| e.path == wanted)
    }

    /// First test file indexed under `key`, in staging order
    pub fn by_key(&self, key: &str) -> Option<&StagedEntry> {
        self.test_entries().find(|e| e.key.as_deref() == Some(key))
    }

    /// Locate the file playing `role` for `test`: configured path first, then key
    pub fn locate(&self, test: &Test, role: FileRole) -> Option<PathBuf> {
        let entry = match test.role_path(role) {
            Some(path) => self.by_path(path),
            None => self.by_key(role.lookup_key()),
        };
        entry.map(|e| self.absolute(e))
    }

    /// Input files for `test`, sorted by path.
    ///
    /// With a prefix every input-role file was staged under it, so the role
    /// alone selects them; other files sharing the directory are not inputs.
    pub fn inputs(&self, test: &Test) -> Vec<PathBuf> {
        let mut inputs: Vec<&StagedEntry> = match test.prefix_input.as_deref() {
            Some(_) => self
                .test_entries()
                .filter(|e| e.role == FileRole::Input)
                .collect(),
            None => self
                .test_entries()
                .filter(|e| e.key.as_deref() == Some(FileRole::Input.lookup_key()))
                .collect(),
        };
        inputs.sort_by(|a, b| a.path.cmp(&b.path));
        inputs.into_iter().map(|e| self.absolute(e)).collect()
    }

    pub fn submissions(&self) -> impl Iterator<Item = &StagedEntry> {
        self.entries
            .iter()
            .filter(|e| e.role == FileRole::Submission)
    }

    /// Entry point handed to testers: the first staged submission file
    pub fn submission_entry(&self) -> Option<PathBuf> {
        self.submissions().next().map(|e| self.absolute(e))
    }
}

/// Reject absolute and parent-escaping destinations, drop `.` components
fn normalize(path: &str) -> Result<PathBuf, StagingError> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(StagingError::UnsafePath(path.to_string())),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(StagingError::UnsafePath(path.to_string()));
    }
    Ok(out)
}

/// Destination of a test file, or `None` if it is hidden
fn test_destination(test: &Test, file: &File, role: FileRole) -> Option<String> {
    if let Some(path) = test.role_path(role) {
        return Some(path.to_string());
    }
    if role == FileRole::Input {
        if let Some(prefix) = test.prefix_input.as_deref() {
            return Some(format!("{}{}", prefix, file.name));
        }
    }
    file.key.as_ref().map(|_| file.name.clone())
}

struct Stager<'a> {
    manifest: StagedManifest,
    claimed: HashSet<PathBuf>,
    blobs: &'a BlobStore,
}

impl Stager<'_> {
    async fn place(
        &mut self,
        file: &File,
        dest: &str,
        role: FileRole,
    ) -> Result<(), StagingError> {
        let rel = normalize(dest)?;
        let data = self.blobs.fetch(&file.path).await?;
        let root = self.manifest.root.clone();

        if file.is_archive() {
            let dir = rel.parent().map(Path::to_path_buf).unwrap_or_default();
            let written = archive::expand_zip(&file.name, &data, &root, &dir, &mut self.claimed)?;
            debug!("Expanded {} ({} entries) into {:?}", file.name, written.len(), dir);
            self.manifest
                .entries
                .extend(written.into_iter().map(|path| StagedEntry {
                    path,
                    key: file.key.clone(),
                    role,
                }));
            return Ok(());
        }

        if !self.claimed.insert(rel.clone()) {
            return Err(StagingError::Collision(rel));
        }
        let out = root.join(&rel);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, &data)?;
        debug!("Staged {} as {:?} ({:?})", file.id, rel, role);

        self.manifest.entries.push(StagedEntry {
            path: rel,
            key: file.key.clone(),
            role,
        });
        Ok(())
    }
}

/// Materialize `workdir` from the test's files and the submission's files
pub async fn stage(
    workdir: &Path,
    test: &Test,
    test_files: &[(File, FileRole)],
    submission_files: &[File],
    blobs: &BlobStore,
) -> Result<StagedManifest, StagingError> {
    let mut stager = Stager {
        manifest: StagedManifest::new(workdir),
        claimed: HashSet::new(),
        blobs,
    };

    for (file, role) in test_files {
        match test_destination(test, file, *role) {
            Some(dest) => stager.place(file, &dest, *role).await?,
            None => debug!("File {} has no key or path, not staged", file.id),
        }
    }

    for file in submission_files {
        stager.place(file, &file.name, FileRole::Submission).await?;
    }

    Ok(stager.manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_record() -> Test {
        serde_json::from_str(
            r#"{"id": "t", "assignment": "a", "name": "n", "maxscore": 10,
                "builder": "null", "tester": "io"}"#,
        )
        .unwrap()
    }

    struct Blobs {
        dir: tempfile::TempDir,
    }

    impl Blobs {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn file(&self, id: &str, key: Option<&str>, name: &str, content: &[u8]) -> File {
            let path = self.dir.path().join(id);
            std::fs::write(&path, content).unwrap();
            File {
                id: id.into(),
                key: key.map(Into::into),
                name: name.into(),
                path: path.to_string_lossy().into_owned(),
                owner: "u".into(),
            }
        }
    }

    #[tokio::test]
    async fn test_path_and_key_placement() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let mut test = test_record();
        test.path_script = Some("bin/grade.py".into());

        let files = vec![
            (blobs.file("f1", None, "grade.py", b"script"), FileRole::Script),
            (blobs.file("f2", Some("solution"), "sol.py", b"sol"), FileRole::Solution),
            (blobs.file("f3", None, "secret.txt", b"hidden"), FileRole::Generic),
        ];
        let subs = vec![blobs.file("s1", None, "main.py", b"print(1)")];

        let manifest = stage(work.path(), &test, &files, &subs, &BlobStore::local())
            .await
            .unwrap();

        assert_eq!(
            manifest.locate(&test, FileRole::Script),
            Some(work.path().join("bin/grade.py"))
        );
        assert_eq!(
            manifest.locate(&test, FileRole::Solution),
            Some(work.path().join("sol.py"))
        );
        assert!(!work.path().join("secret.txt").exists());
        assert_eq!(manifest.submission_entry(), Some(work.path().join("main.py")));
        assert_eq!(std::fs::read(work.path().join("bin/grade.py")).unwrap(), b"script");
    }

    #[tokio::test]
    async fn test_hidden_solution_is_not_found() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let test = test_record();
        let files = vec![(blobs.file("f1", None, "sol.py", b"sol"), FileRole::Solution)];

        let manifest = stage(work.path(), &test, &files, &[], &BlobStore::local())
            .await
            .unwrap();

        assert_eq!(manifest.locate(&test, FileRole::Solution), None);
        assert!(manifest.entries().is_empty());
    }

    #[tokio::test]
    async fn test_inputs_by_prefix_sorted() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let mut test = test_record();
        test.prefix_input = Some("inputs/".into());

        let files = vec![
            (blobs.file("i2", None, "2.txt", b"b"), FileRole::Input),
            (blobs.file("i1", None, "1.txt", b"a"), FileRole::Input),
        ];
        let manifest = stage(work.path(), &test, &files, &[], &BlobStore::local())
            .await
            .unwrap();

        assert_eq!(
            manifest.inputs(&test),
            vec![work.path().join("inputs/1.txt"), work.path().join("inputs/2.txt")]
        );
    }

    #[tokio::test]
    async fn test_prefix_inputs_exclude_neighbours_and_normalize() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let mut test = test_record();
        test.prefix_input = Some("./io/".into());
        test.path_solution = Some("io/solution.py".into());

        let files = vec![
            (blobs.file("sol", None, "solution.py", b"s"), FileRole::Solution),
            (blobs.file("i1", None, "1.in", b"a"), FileRole::Input),
        ];
        let manifest = stage(work.path(), &test, &files, &[], &BlobStore::local())
            .await
            .unwrap();

        assert_eq!(manifest.inputs(&test), vec![work.path().join("io/1.in")]);
        assert_eq!(
            manifest.locate(&test, FileRole::Solution),
            Some(work.path().join("io/solution.py"))
        );
    }

    #[tokio::test]
    async fn test_collision_is_an_error() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let test = test_record();
        let files = vec![(blobs.file("f1", Some("script"), "main.py", b"a"), FileRole::Script)];
        let subs = vec![blobs.file("s1", None, "main.py", b"b")];

        let err = stage(work.path(), &test, &files, &subs, &BlobStore::local())
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Collision(p) if p == Path::new("main.py")));
    }

    #[tokio::test]
    async fn test_submission_archive_expanded() {
        let blobs = Blobs::new();
        let work = tempfile::tempdir().unwrap();
        let test = test_record();
        let data = archive::tests::build_zip(&[("pkg/", ""), ("pkg/add.py", "x"), ("run.py", "y")]);
        let subs = vec![blobs.file("s1", None, "submission.zip", &data)];

        let manifest = stage(work.path(), &test, &[], &subs, &BlobStore::local())
            .await
            .unwrap();

        assert_eq!(manifest.submissions().count(), 2);
        assert!(work.path().join("pkg/add.py").exists());
        assert!(!work.path().join("submission.zip").exists());
    }

    #[test]
    fn test_escaping_destination_rejected() {
        assert!(matches!(normalize("../etc/passwd"), Err(StagingError::UnsafePath(_))));
        assert!(matches!(normalize("/etc/passwd"), Err(StagingError::UnsafePath(_))));
        assert_eq!(normalize("./a/b").unwrap(), PathBuf::from("a/b"));
    }
}
