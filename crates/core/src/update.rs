//! Update Handler: downloads the installer package, extracts it, and
//! hands control to it. Grounded in the teacher's archive-handling
//! dependency shape generalized from tar+flate2 to a plain zip, since
//! platform installer payloads in this domain ship as zip.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kraken_agent_domain::error::{Error, Result};
use kraken_agent_domain::types::AgentIdentity;
use serde::Deserialize;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateTask {
    pub installer_url: String,
}

/// Extracts `archive_bytes` (a zip) under `dest_dir`, returning the path
/// to the installer executable if one matching `expected_name` was
/// found at the top level or one directory down.
fn extract_zip(archive_bytes: &[u8], dest_dir: &Path, expected_name: &str) -> Result<PathBuf> {
    let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
        .map_err(|e| Error::Other(format!("installer archive is not a valid zip: {e}")))?;

    archive.extract(dest_dir).map_err(|e| Error::Other(format!("failed to extract installer archive: {e}")))?;

    let direct = dest_dir.join(expected_name);
    if direct.exists() {
        return Ok(direct);
    }

    for entry in std::fs::read_dir(dest_dir)?.flatten() {
        let candidate = entry.path().join(expected_name);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(Error::Other(format!("installer executable `{expected_name}` not found in extracted archive")))
}

#[cfg(unix)]
fn installer_executable_name() -> &'static str {
    "installer"
}
#[cfg(windows)]
fn installer_executable_name() -> &'static str {
    "installer.exe"
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}
#[cfg(windows)]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Downloads, extracts, and spawns the installer. The installer is
/// responsible for stopping and replacing this process; this function
/// does not wait for it to exit.
pub async fn handle_update(task: &UpdateTask, identity: &AgentIdentity, work_dir: &Path) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|e| Error::Http(e.to_string()))?;

    let response = client.get(&task.installer_url).send().await.map_err(|e| Error::Http(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Http(format!("installer download rejected with status {}", response.status())));
    }
    let bytes = response.bytes().await.map_err(|e| Error::Http(e.to_string()))?;

    std::fs::create_dir_all(work_dir)?;
    let installer_path = extract_zip(&bytes, work_dir, installer_executable_name())?;
    mark_executable(&installer_path)?;

    tokio::process::Command::new(&installer_path)
        .arg("--agentId")
        .arg(identity.agent_id.to_string())
        .arg("--workspaceId")
        .arg(&identity.workspace_id)
        .arg("--debug")
        .spawn()
        .map_err(|e| Error::Other(format!("failed to spawn installer: {e}")))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip_with_installer(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options = zip::write::FileOptions::default();
            writer.start_file(name, options).unwrap();
            writer.write_all(b"#!/bin/sh\necho installed\n").unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extract_zip_finds_executable_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip_with_installer("installer");
        let found = extract_zip(&archive, dir.path(), "installer").unwrap();
        assert!(found.exists());
    }

    #[test]
    fn extract_zip_errors_when_executable_missing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip_with_installer("something-else");
        let result = extract_zip(&archive, dir.path(), "installer");
        assert!(result.is_err());
    }

    #[test]
    fn extract_zip_rejects_non_zip_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_zip(b"not a zip", dir.path(), "installer");
        assert!(result.is_err());
    }
}
