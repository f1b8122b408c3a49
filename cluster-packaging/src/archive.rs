// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Tar archive helpers.

Installer images and vendored application sources travel as
uncompressed tar streams. Archives are staged through anonymous
temporary files so callers only ever see forward-only streams.
*/

use {
    crate::{
        error::{ClusterPackagingError, Result},
        io::{spool_to_temp_file, PackageStream},
    },
    std::{
        io::{Read, Seek, SeekFrom},
        path::{Component, Path, PathBuf},
    },
};

/// Archive a directory tree as an uncompressed tar stream.
///
/// Entry paths are relative to the directory root. The content is
/// staged in an unlinked temporary file, so the returned stream stays
/// valid after the source directory is removed.
pub fn pack_directory(dir: &Path) -> Result<PackageStream> {
    let mut file = tempfile::tempfile()?;

    {
        let mut builder = tar::Builder::new(&mut file);
        builder.follow_symlinks(false);

        builder
            .append_dir_all("", dir)
            .map_err(|e| ClusterPackagingError::IoPath(format!("{}", dir.display()), e))?;

        builder.finish()?;
    }

    file.seek(SeekFrom::Start(0))?;

    Ok(Box::pin(futures::io::AllowStdIo::new(
        std::io::BufReader::new(file),
    )))
}

/// Extract a tar stream into a directory.
pub async fn unpack_stream(stream: PackageStream, target: &Path) -> Result<()> {
    let file = spool_to_temp_file(stream).await?;

    unpack_reader(file, target)
}

/// Extract a tar archive from a synchronous reader into a directory.
pub fn unpack_reader(reader: impl Read, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", target.display()), e))?;

    let mut archive = tar::Archive::new(reader);

    archive
        .unpack(target)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", target.display()), e))?;

    Ok(())
}

/// Extract only the named entries of a tar archive.
///
/// Returns the entry paths that were found. Entries absent from the
/// archive are not an error; callers decide whether a missing path
/// matters.
pub fn unpack_selected(
    reader: impl Read,
    target: &Path,
    wanted: &[&str],
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(target)
        .map_err(|e| ClusterPackagingError::IoPath(format!("{}", target.display()), e))?;

    let mut archive = tar::Archive::new(reader);
    let mut extracted = vec![];

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = normalize_entry_path(&entry.path()?);

        if wanted.iter().any(|w| Path::new(w) == path) {
            entry.unpack_in(target)?;
            extracted.push(path);
        }
    }

    Ok(extracted)
}

// Strips leading `./` components so entry matching does not depend on
// how the archive was produced.
fn normalize_entry_path(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

#[cfg(test)]
mod test {
    use {super::*, crate::io::read_stream_to_vec};

    fn sample_dir() -> Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;

        std::fs::create_dir_all(dir.path().join("resources"))?;
        std::fs::write(dir.path().join("resources/app.yaml"), b"manifest")?;
        std::fs::write(dir.path().join("top.txt"), b"top level")?;

        Ok(dir)
    }

    #[tokio::test]
    async fn pack_unpack_round_trip() -> Result<()> {
        let source = sample_dir()?;
        let stream = pack_directory(source.path())?;

        let target = tempfile::tempdir()?;
        unpack_stream(stream, target.path()).await?;

        assert_eq!(
            std::fs::read(target.path().join("resources/app.yaml"))?,
            b"manifest"
        );
        assert_eq!(std::fs::read(target.path().join("top.txt"))?, b"top level");

        Ok(())
    }

    #[tokio::test]
    async fn stream_outlives_source_directory() -> Result<()> {
        let source = sample_dir()?;
        let stream = pack_directory(source.path())?;
        drop(source);

        let data = read_stream_to_vec(stream).await?;
        assert!(!data.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn selected_extraction_skips_other_entries() -> Result<()> {
        let source = sample_dir()?;
        let stream = pack_directory(source.path())?;
        let file = crate::io::spool_to_temp_file(stream).await?;

        let target = tempfile::tempdir()?;
        let extracted = unpack_selected(file, target.path(), &["resources/app.yaml"])?;

        assert_eq!(extracted, vec![PathBuf::from("resources/app.yaml")]);
        assert!(target.path().join("resources/app.yaml").exists());
        assert!(!target.path().join("top.txt").exists());

        Ok(())
    }
}
