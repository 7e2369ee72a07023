//! Local staging of TLS material for a launch.
//!
//! The key is moved (it is per-launch and must not linger at its source),
//! the CA is copied. Returned paths are relative to the remote home
//! directory, under the session's resource path.

use std::path::{Path, PathBuf};

use crate::error::StagingError;

/// Source files to stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub keyfile: PathBuf,
    pub cafile: PathBuf,
}

/// Staged paths, relative to the remote home directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCerts {
    pub keyfile: String,
    pub cafile: String,
}

/// Move the key and copy the CA into `dest_dir`.
pub async fn stage(
    certs: &CertPaths,
    dest_dir: &Path,
    resource_path: &str,
) -> Result<StagedCerts, StagingError> {
    let key_name = file_name(&certs.keyfile)?;
    let ca_name = file_name(&certs.cafile)?;

    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|source| StagingError::CreateDir {
            path: dest_dir.to_path_buf(),
            source,
        })?;

    let key_dest = dest_dir.join(&key_name);
    move_file(&certs.keyfile, &key_dest).await?;

    let ca_dest = dest_dir.join(&ca_name);
    tokio::fs::copy(&certs.cafile, &ca_dest)
        .await
        .map_err(|source| StagingError::Copy {
            from: certs.cafile.clone(),
            to: ca_dest.clone(),
            source,
        })?;

    tracing::debug!(key = %key_dest.display(), ca = %ca_dest.display(), "staged certificates");

    Ok(StagedCerts {
        keyfile: remote_relative(resource_path, &key_name),
        cafile: remote_relative(resource_path, &ca_name),
    })
}

fn file_name(path: &Path) -> Result<String, StagingError> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StagingError::NoFileName(path.to_path_buf()))
}

fn remote_relative(resource_path: &str, name: &str) -> String {
    let base = resource_path.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

/// Rename, falling back to copy + remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), StagingError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    let err = |source| StagingError::Move {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    };
    tokio::fs::copy(from, to).await.map_err(err)?;
    tokio::fs::remove_file(from).await.map_err(err)?;
    Ok(())
}
