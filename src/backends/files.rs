//! Implements backup of the application's file assets using [FilesArchive].

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use walkdir::WalkDir;

use super::{Backend, RestoreTarget};

const ARCHIVE_FILE_NAME: &str = "files.tar";

/// Asset directories to back up.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilesConfig {
    /// Directory the asset directories are relative to. Restores extract here.
    pub root: PathBuf,
    /// Asset directories relative to [root](Self::root).
    #[serde(default)]
    pub directories: Vec<PathBuf>,
}

#[derive(Debug, Display, Error, From)]
pub enum ArchiveError {
    /// No asset directory is configured.
    #[display("no asset directories configured")]
    #[from(ignore)]
    NothingToArchive,
    /// A configured asset directory doesn't exist.
    #[display("asset directory does not exist: {}", _0.display())]
    #[from(ignore)]
    MissingDirectory(#[error(ignore)] PathBuf),
    /// A configured directory is absolute or escapes the root.
    #[display("asset directory must be relative to the root: {}", _0.display())]
    #[from(ignore)]
    InvalidDirectory(#[error(ignore)] PathBuf),
    #[display("walking asset directory failed: {_0}")]
    #[from]
    Walk(walkdir::Error),
    #[from]
    Io(io::Error),
}

/// The [FilesArchive] backend bundles the asset directories into one tar archive.
#[derive(Debug, Clone)]
pub struct FilesArchive {
    config: FilesConfig,
}

impl FilesArchive {
    pub fn new(config: FilesConfig) -> Self {
        if config.root.is_relative() {
            log::warn!(target: "backend::files", "files root is relative: {}", config.root.display());
        }

        Self { config }
    }

    fn check_directory(&self, dir: &Path) -> Result<PathBuf, ArchiveError> {
        let escapes = dir.is_absolute()
            || dir
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if escapes {
            return Err(ArchiveError::InvalidDirectory(dir.to_path_buf()));
        }

        let absolute = self.config.root.join(dir);
        if !absolute.is_dir() {
            return Err(ArchiveError::MissingDirectory(absolute));
        }
        Ok(absolute)
    }
}

impl Backend for FilesArchive {
    type Error = ArchiveError;

    fn backup(&self, work_dir: &Path, prefix: &str) -> Result<PathBuf, Self::Error> {
        if self.config.directories.is_empty() {
            return Err(ArchiveError::NothingToArchive);
        }
        let sources = self
            .config
            .directories
            .iter()
            .map(|dir| self.check_directory(dir))
            .collect::<Result<Vec<_>, _>>()?;

        let archive_file = work_dir.join(format!("{prefix}_{ARCHIVE_FILE_NAME}"));
        log::info!(target: "backend::files", "Archive {} asset directories to: {}", sources.len(), archive_file.display());

        let writer = BufWriter::new(File::create_new(&archive_file)?);
        let mut archive = tar::Builder::new(writer);
        let mut files = 0usize;

        for source in &sources {
            for entry in WalkDir::new(source).follow_links(false) {
                let entry = entry?;
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.config.root) else {
                    continue;
                };

                if entry.file_type().is_dir() {
                    archive.append_dir(relative, path)?;
                } else if entry.file_type().is_file() {
                    archive.append_path_with_name(path, relative)?;
                    files += 1;
                } else {
                    log::debug!(target: "backend::files", "Skipping special file: {}", path.display());
                }
            }
        }

        archive.into_inner()?.flush()?;
        log::info!(target: "backend::files", "Finished archive of {files} files.");
        Ok(archive_file)
    }

    fn restore(&self, artifact: &Path, target: &RestoreTarget) -> Result<(), Self::Error> {
        let root = target.files_root.as_deref().unwrap_or(&self.config.root);
        log::info!(target: "backend::files", "Extract {} into: {}", artifact.display(), root.display());

        fs::create_dir_all(root)?;
        let mut archive = tar::Archive::new(BufReader::new(File::open(artifact)?));
        archive.set_preserve_permissions(true);
        archive.set_overwrite(true);
        archive.unpack(root)?;

        log::info!(target: "backend::files", "Finished restore of asset directories.");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assets(root: &Path) {
        fs::create_dir_all(root.join("uploads/products")).unwrap();
        fs::create_dir_all(root.join("receipts")).unwrap();
        fs::create_dir_all(root.join("ignored")).unwrap();
        fs::write(root.join("uploads/products/1.png"), b"png").unwrap();
        fs::write(root.join("uploads/logo.svg"), b"<svg/>").unwrap();
        fs::write(root.join("receipts/2024-01.pdf"), b"pdf").unwrap();
        fs::write(root.join("ignored/secret"), b"no").unwrap();
    }

    #[test]
    fn archives_and_restores_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        assets(&root);

        let backend = FilesArchive::new(FilesConfig {
            root: root.clone(),
            directories: vec!["uploads".into(), "receipts".into()],
        });
        let work = dir.path().join("work");
        fs::create_dir(&work).unwrap();
        let archive = backend.backup(&work, "assets_2024").unwrap();
        assert_eq!(archive.file_name().unwrap(), "assets_2024_files.tar");

        let restored = dir.path().join("restored");
        backend
            .restore(
                &archive,
                &RestoreTarget {
                    files_root: Some(restored.clone()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(fs::read(restored.join("uploads/products/1.png")).unwrap(), b"png");
        assert_eq!(fs::read(restored.join("uploads/logo.svg")).unwrap(), b"<svg/>");
        assert_eq!(fs::read(restored.join("receipts/2024-01.pdf")).unwrap(), b"pdf");
        assert!(!restored.join("ignored").exists());
    }

    #[test]
    fn rejects_missing_and_escaping_directories() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path();

        let backend = FilesArchive::new(FilesConfig {
            root: dir.path().to_path_buf(),
            directories: vec!["missing".into()],
        });
        assert!(matches!(
            backend.backup(work, "a"),
            Err(ArchiveError::MissingDirectory(_))
        ));

        let backend = FilesArchive::new(FilesConfig {
            root: dir.path().to_path_buf(),
            directories: vec!["../etc".into()],
        });
        assert!(matches!(
            backend.backup(work, "b"),
            Err(ArchiveError::InvalidDirectory(_))
        ));

        let backend = FilesArchive::new(FilesConfig::default());
        assert!(matches!(
            backend.backup(work, "c"),
            Err(ArchiveError::NothingToArchive)
        ));
    }

    #[test]
    fn walk_errors_convert_into_archive_errors() {
        fn converts<E: From<walkdir::Error> + From<io::Error>>() {}
        converts::<ArchiveError>();

        let dir = tempfile::tempdir().unwrap();
        let err = WalkDir::new(dir.path().join("vanished"))
            .into_iter()
            .next()
            .unwrap()
            .unwrap_err();
        assert!(matches!(ArchiveError::from(err), ArchiveError::Walk(_)));
    }
}
