use bytes::Bytes;
use std::io::Cursor;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory not found; {0}")]
    NotFound(String),

    #[error("could not read or write archive; {0}")]
    Archive(String),
}

/// An opaque handle to a tree of files.
///
/// A directory either points at a path on the host or holds a snapshot taken out of a container. Snapshots are
/// kept as a tar archive whose entries are relative to the directory's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directory {
    Host(PathBuf),
    Archive(Bytes),
}

impl Directory {
    /// Refers to an existing directory on the host.
    pub fn host(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();

        let full_path = path.canonicalize().map_err(|e| {
            DirectoryError::NotFound(format!("'{}'; {}", path.to_string_lossy(), e))
        })?;

        if !full_path.is_dir() {
            return Err(DirectoryError::NotFound(format!(
                "'{}' is not a directory",
                full_path.to_string_lossy()
            )));
        }

        Ok(Directory::Host(full_path))
    }

    /// Returns the directory's contents as a tar archive rooted at the directory itself.
    pub fn to_archive(&self) -> Result<Bytes, DirectoryError> {
        match self {
            Directory::Host(path) => {
                let mut builder = tar::Builder::new(Vec::new());
                builder.follow_symlinks(false);
                builder
                    .append_dir_all(".", path)
                    .map_err(|e| DirectoryError::Archive(e.to_string()))?;

                let archive = builder
                    .into_inner()
                    .map_err(|e| DirectoryError::Archive(e.to_string()))?;

                Ok(Bytes::from(archive))
            }
            Directory::Archive(archive) => Ok(archive.clone()),
        }
    }

    /// Lists every path within the directory, relative to its root and sorted.
    pub fn entries(&self) -> Result<Vec<String>, DirectoryError> {
        let archive = self.to_archive()?;
        let mut archive = tar::Archive::new(Cursor::new(archive));

        let mut entries = vec![];

        for entry in archive
            .entries()
            .map_err(|e| DirectoryError::Archive(e.to_string()))?
        {
            let entry = entry.map_err(|e| DirectoryError::Archive(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| DirectoryError::Archive(e.to_string()))?;

            let relative: PathBuf = path
                .components()
                .filter(|component| !matches!(component, std::path::Component::CurDir))
                .collect();

            if relative.as_os_str().is_empty() {
                continue;
            }

            entries.push(relative.to_string_lossy().to_string());
        }

        entries.sort();
        entries.dedup();

        Ok(entries)
    }

    /// Writes the directory's contents out to the given host path, creating it if needed.
    pub fn export(&self, destination: impl AsRef<Path>) -> Result<(), DirectoryError> {
        let destination = destination.as_ref();

        std::fs::create_dir_all(destination).map_err(|e| {
            DirectoryError::Archive(format!(
                "could not create '{}'; {}",
                destination.to_string_lossy(),
                e
            ))
        })?;

        let archive = self.to_archive()?;
        tar::Archive::new(Cursor::new(archive))
            .unpack(destination)
            .map_err(|e| DirectoryError::Archive(e.to_string()))?;

        Ok(())
    }
}

/// Rebuilds an archive with the first path component of every entry removed.
///
/// Container engines hand back a directory as an archive rooted at the directory's own name ("app/...").
/// Entries that refer to the root itself are dropped.
pub fn strip_root(archive: &[u8]) -> Result<Bytes, DirectoryError> {
    let mut source = tar::Archive::new(archive);
    let mut builder = tar::Builder::new(Vec::new());

    for entry in source
        .entries()
        .map_err(|e| DirectoryError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| DirectoryError::Archive(e.to_string()))?;

        let path = entry
            .path()
            .map_err(|e| DirectoryError::Archive(e.to_string()))?
            .into_owned();

        let relative = without_first_component(&path);
        if relative.as_os_str().is_empty() {
            continue;
        }

        let mut header = entry.header().clone();
        let entry_type = header.entry_type();

        if entry_type.is_symlink() || entry_type.is_hard_link() {
            let target = entry
                .link_name()
                .map_err(|e| DirectoryError::Archive(e.to_string()))?
                .map(|target| target.into_owned())
                .unwrap_or_default();

            // Hard links point at other entries of the same archive so they move with them.
            let target = if entry_type.is_hard_link() {
                without_first_component(&target)
            } else {
                target
            };

            builder
                .append_link(&mut header, &relative, &target)
                .map_err(|e| DirectoryError::Archive(e.to_string()))?;
        } else {
            builder
                .append_data(&mut header, &relative, &mut entry)
                .map_err(|e| DirectoryError::Archive(e.to_string()))?;
        }
    }

    let archive = builder
        .into_inner()
        .map_err(|e| DirectoryError::Archive(e.to_string()))?;

    Ok(Bytes::from(archive))
}

fn without_first_component(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, std::path::Component::CurDir))
        .skip(1)
        .collect()
}
