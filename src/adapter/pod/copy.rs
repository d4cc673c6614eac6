//! Pod file transfer via exec'd tar streams (spec.md §4 component share
//! table: "pod exec, port-forward, log stream, cp, label selection"),
//! the same trick `kubectl cp` itself is built on: there is no separate
//! Kubernetes copy API, so both directions shell out to `tar` inside the
//! container over an exec'd attach.

use std::path::Path;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams};
use kube::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{CrossExecError, ErrorContext};

/// Streams `local` into the pod at `remote_path` by piping a single-file
/// tar archive into an exec'd `tar xf -`.
pub async fn upload_file(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    local: &Path,
    remote_path: &str,
) -> Result<(), CrossExecError> {
    let bytes = tokio::fs::read(local).await.map_err(|e| io_err(local, e))?;
    let file_name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload".into());
    let tar_bytes = build_single_file_tar(&file_name, &bytes)?;
    let remote_dir = parent_dir(remote_path);

    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut params = AttachParams::default().stdin(true).stdout(false).stderr(false);
    if let Some(c) = container {
        params = params.container(c);
    }
    let argv = vec!["tar".to_string(), "xf".to_string(), "-".to_string(), "-C".to_string(), remote_dir];

    let mut attached = api
        .exec(pod, argv, &params)
        .await
        .map_err(|e| exec_err(pod, e))?;

    if let Some(mut stdin) = attached.stdin() {
        stdin.write_all(&tar_bytes).await.map_err(|e| io_err(local, e))?;
        let _ = stdin.shutdown().await;
    }
    let _ = attached.join().await;
    Ok(())
}

/// Downloads `remote_path` out of the pod as a tar stream, written verbatim
/// to `local` — the directory/archive counterpart of `upload_file`.
pub async fn download_path(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    remote_path: &str,
    local: &Path,
) -> Result<(), CrossExecError> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut params = AttachParams::default().stdout(true).stderr(false);
    if let Some(c) = container {
        params = params.container(c);
    }
    let remote_dir = parent_dir(remote_path);
    let base_name = base_name(remote_path);
    let argv = vec![
        "tar".to_string(),
        "cf".to_string(),
        "-".to_string(),
        "-C".to_string(),
        remote_dir,
        base_name,
    ];

    let mut attached = api
        .exec(pod, argv, &params)
        .await
        .map_err(|e| exec_err(pod, e))?;

    let mut file = tokio::fs::File::create(local).await.map_err(|e| io_err(local, e))?;
    if let Some(mut stdout) = attached.stdout() {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.map_err(|e| io_err(local, e))?;
        file.write_all(&buf).await.map_err(|e| io_err(local, e))?;
    }
    let _ = attached.join().await;
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
            adapter: "pod",
            message: format!("failed to build tar archive: {e}"),
            context: ErrorContext::new(),
            transient: false,
            cause: None,
        })?;
    builder.into_inner().map_err(|e| CrossExecError::AdapterError {
        adapter: "pod",
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

fn base_name(remote_path: &str) -> String {
    match remote_path.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => remote_path.to_string(),
    }
}

fn io_err(path: &Path, e: std::io::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "pod",
        message: format!("{}: {e}", path.display()),
        context: ErrorContext::new(),
        transient: false,
        cause: Some(Box::new(e)),
    }
}

fn exec_err(pod: &str, e: kube::Error) -> CrossExecError {
    CrossExecError::AdapterError {
        adapter: "pod",
        message: e.to_string(),
        context: ErrorContext::new().with_pod(pod),
        transient: true,
        cause: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_remote_path_into_dir_and_base_name() {
        assert_eq!(parent_dir("/var/log/app.log"), "/var/log");
        assert_eq!(base_name("/var/log/app.log"), "app.log");
        assert_eq!(parent_dir("app.log"), "/");
        assert_eq!(base_name("app.log"), "app.log");
    }
}
