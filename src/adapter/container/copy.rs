//! Container file transfer (spec.md §4 "exec in container, copy,
//! compose/lifecycle wrappers") via the Docker API's tar-archive upload and
//! download endpoints, the same approach
//! `other_examples`' houdini `export_rootfs` uses for the download side;
//! the upload side builds the tar archive locally with the `tar` crate
//! before handing it to `upload_to_container`.

use std::path::Path;

use bollard::container::{DownloadFromContainerOptions, UploadToContainerOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{CrossExecError, ErrorContext};

/// Copies a single local file into `container_id` at `remote_path`, the way
/// `docker cp local container:remote` does: the file is archived under its
/// own basename and extracted by the daemon relative to `remote_path`'s
/// parent directory.
pub async fn upload_file(
    docker: &Docker,
    container_id: &str,
    local: &Path,
    remote_path: &str,
) -> Result<(), CrossExecError> {
    let bytes = tokio::fs::read(local).await.map_err(|e| io_err(local, e))?;
    let file_name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".into());
    let remote_dir = parent_dir(remote_path);

    let tar_bytes = build_single_file_tar(&file_name, &bytes)?;

    docker
        .upload_to_container(
            container_id,
            Some(UploadToContainerOptions {
                path: remote_dir,
                ..Default::default()
            }),
            tar_bytes.into(),
        )
        .await
        .map_err(|e| adapter_err(container_id, e))
}

/// Downloads `remote_path` (file or directory) from `container_id` and
/// writes the tar stream the daemon returns to `local`, verbatim — callers
/// that want individual files extracted are expected to unpack it, mirroring
/// `docker cp container:remote local` when `local` names an archive.
pub async fn download_path(
    docker: &Docker,
    container_id: &str,
    remote_path: &str,
    local: &Path,
) -> Result<(), CrossExecError> {
    let mut stream = docker.download_from_container(
        container_id,
        Some(DownloadFromContainerOptions { path: remote_path }),
    );

    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| io_err(local, e))?;
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| adapter_err(container_id, e))?;
        file.write_all(&bytes).await.map_err(|e| io_err(local, e))?;
    }
    Ok(())
}

fn build_single_file_tar(file_name: &str, bytes: &[u8]) -> Result<Vec<u8>, CrossExecError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, file_name, bytes)
        .map_err(|e| CrossExecError::AdapterError {
            adapter: "container",
            message: format!("failed to build tar archive: {e}"),
            context: ErrorContext::new(),
            transient: false,
            cause: None,
        })?;
    builder.into_inner().map_err(|e| CrossExecError::AdapterError {
        adapter: "container",
        message: format!("failed to finalize tar archive: {e}"),
        context: ErrorContext::new(),
        transient: false,
        cause: None,
    })
}

fn parent_dir(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => "/".to_string(),
    }
}

fn io_err(path: &Path, e: std::io::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "container",
        message: format!("{}: {e}", path.display()),
        context: ErrorContext::new(),
        transient: false,
        cause: Some(Box::new(e)),
    }
}

fn adapter_err(container_id: &str, e: bollard::errors::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "container",
        message: e.to_string(),
        context: ErrorContext::new().with_container(container_id),
        transient: matches!(e, bollard::errors::Error::DockerResponseServerError { status_code, .. } if status_code >= 500),
        cause: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_dir_strips_file_name() {
        assert_eq!(parent_dir("/etc/app/config.toml"), "/etc/app");
        assert_eq!(parent_dir("config.toml"), "/");
    }

    #[test]
    fn single_file_tar_is_well_formed() {
        let tar_bytes = build_single_file_tar("hello.txt", b"hi").unwrap();
        let mut archive = tar::Archive::new(tar_bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_string_lossy(), "hello.txt");
    }
}
