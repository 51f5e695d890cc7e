//! Guest control over QMP.
//!
//! Each VM exposes a QMP socket. A request opens the socket, negotiates
//! capabilities, sends one command and reads until the matching reply,
//! skipping asynchronous events. The socket only exists while the QEMU
//! process is alive, so a connect failure is normal and callers retry.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use stratus_id::VmId;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::paths::Paths;
use crate::vm::Disk;

/// Default timeout for a single QMP exchange.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the guest control channel.
#[derive(Debug, Error)]
pub enum GuestError {
    #[error("monitor socket unavailable: {0}")]
    Unavailable(#[source] std::io::Error),

    #[error("monitor I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("monitor did not respond within {0:?}")]
    Timeout(Duration),

    #[error("monitor protocol error: {0}")]
    Protocol(String),

    #[error("monitor command failed: {class}: {desc}")]
    Command { class: String, desc: String },

    #[error("monitor JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Out-of-band control of a running guest.
#[async_trait]
pub trait GuestControl: Send + Sync {
    /// Request an ACPI power-down.
    async fn shutdown(&self, id: &VmId) -> Result<(), GuestError>;

    async fn set_vnc_password(&self, id: &VmId, password: &str) -> Result<(), GuestError>;

    /// Disks currently attached, as the hypervisor sees them.
    async fn list_disks(&self, id: &VmId) -> Result<Vec<Disk>, GuestError>;
}

/// QMP client for the VM sockets under [`Paths::sock_path`].
pub struct QmpMonitor {
    paths: Paths,
    timeout: Duration,
}

impl QmpMonitor {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn execute(
        &self,
        id: &VmId,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<Value, GuestError> {
        let sock = self.paths.sock_path(id);
        tokio::time::timeout(self.timeout, exchange(&sock, command, arguments))
            .await
            .map_err(|_| GuestError::Timeout(self.timeout))?
    }
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

async fn exchange(
    sock: &Path,
    command: &str,
    arguments: Option<Value>,
) -> Result<Value, GuestError> {
    let stream = UnixStream::connect(sock)
        .await
        .map_err(GuestError::Unavailable)?;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let greeting = next_message(&mut lines).await?;
    if greeting.get("QMP").is_none() {
        return Err(GuestError::Protocol(format!(
            "unexpected greeting: {}",
            greeting
        )));
    }

    for (name, args) in [("qmp_capabilities", None), (command, arguments)] {
        let mut request = json!({ "execute": name });
        if let Some(args) = args {
            request["arguments"] = args;
        }
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        write.write_all(&line).await?;

        let reply = loop {
            let message = next_message(&mut lines).await?;
            if message.get("event").is_some() {
                debug!(event = %message["event"], "Skipping QMP event");
                continue;
            }
            break message;
        };

        if let Some(error) = reply.get("error") {
            let error: QmpError = serde_json::from_value(error.clone())?;
            return Err(GuestError::Command {
                class: error.class,
                desc: error.desc,
            });
        }

        if name == command {
            return reply
                .get("return")
                .cloned()
                .ok_or_else(|| GuestError::Protocol(format!("reply without return: {}", reply)));
        }
    }

    Err(GuestError::Protocol("no reply".to_string()))
}

async fn next_message<R>(lines: &mut tokio::io::Lines<R>) -> Result<Value, GuestError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(serde_json::from_str(&line)?),
            None => return Err(GuestError::Protocol("monitor closed connection".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockInfo {
    device: String,
    #[serde(default)]
    inserted: Option<Inserted>,
}

#[derive(Debug, Deserialize)]
struct Inserted {
    file: String,
}

/// Map a `query-block` reply to disks. Virtio devices are named
/// `virtio<index>`; anything without an inserted medium is skipped.
fn parse_block_info(value: Value) -> Result<Vec<Disk>, GuestError> {
    let blocks: Vec<BlockInfo> = serde_json::from_value(value)?;
    let mut disks: Vec<Disk> = blocks
        .into_iter()
        .filter_map(|block| {
            let inserted = block.inserted?;
            let digits = block
                .device
                .trim_start_matches(|c: char| !c.is_ascii_digit());
            let index = digits.parse().ok()?;
            Some(Disk {
                index,
                path: inserted.file.into(),
            })
        })
        .collect();
    disks.sort_by_key(|disk| disk.index);
    Ok(disks)
}

#[async_trait]
impl GuestControl for QmpMonitor {
    async fn shutdown(&self, id: &VmId) -> Result<(), GuestError> {
        self.execute(id, "system_powerdown", None).await?;
        Ok(())
    }

    async fn set_vnc_password(&self, id: &VmId, password: &str) -> Result<(), GuestError> {
        self.execute(
            id,
            "change-vnc-password",
            Some(json!({ "password": password })),
        )
        .await?;
        Ok(())
    }

    async fn list_disks(&self, id: &VmId) -> Result<Vec<Disk>, GuestError> {
        let reply = self.execute(id, "query-block", None).await?;
        parse_block_info(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixListener;

    /// Serve one QMP session that answers `reply` to the command.
    fn serve(listener: UnixListener, reply: Value) -> tokio::task::JoinHandle<Vec<Value>> {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();

            write
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();

            let caps: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            seen.push(caps);
            write.write_all(b"{\"return\": {}}\n").await.unwrap();

            let cmd: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
            seen.push(cmd);
            write
                .write_all(b"{\"event\": \"POWERDOWN\", \"timestamp\": {}}\n")
                .await
                .unwrap();
            let mut line = serde_json::to_vec(&reply).unwrap();
            line.push(b'\n');
            write.write_all(&line).await.unwrap();
            seen
        })
    }

    fn monitor(dir: &Path) -> QmpMonitor {
        QmpMonitor::new(Paths::new(dir, dir, dir, dir)).with_timeout(Duration::from_secs(5))
    }

    fn bind(monitor: &QmpMonitor, id: &VmId) -> UnixListener {
        let sock = monitor.paths.sock_path(id);
        std::fs::create_dir_all(sock.parent().unwrap()).unwrap();
        UnixListener::bind(sock).unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_skips_events() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let id = VmId::new();
        let server = serve(bind(&monitor, &id), json!({ "return": {} }));

        monitor.shutdown(&id).await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0]["execute"], "qmp_capabilities");
        assert_eq!(seen[1]["execute"], "system_powerdown");
    }

    #[tokio::test]
    async fn test_vnc_password_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let id = VmId::new();
        let server = serve(bind(&monitor, &id), json!({ "return": {} }));

        monitor.set_vnc_password(&id, "hunter2").await.unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[1]["execute"], "change-vnc-password");
        assert_eq!(seen[1]["arguments"]["password"], "hunter2");
    }

    #[tokio::test]
    async fn test_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = monitor(dir.path());
        let id = VmId::new();
        let _server = serve(
            bind(&monitor, &id),
            json!({ "error": { "class": "GenericError", "desc": "VNC not enabled" } }),
        );

        let err = monitor.set_vnc_password(&id, "x").await.unwrap_err();
        assert!(matches!(err, GuestError::Command { ref class, .. } if class == "GenericError"));
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = monitor(dir.path()).shutdown(&VmId::new()).await.unwrap_err();
        assert!(matches!(err, GuestError::Unavailable(_)));
    }

    #[test]
    fn test_parse_block_info() {
        let reply = json!([
            { "device": "virtio1", "inserted": { "file": "/var/lib/stratus/disks/b.qcow2" } },
            { "device": "virtio0", "inserted": { "file": "/var/lib/stratus/disks/a.qcow2" } },
            { "device": "floppy0" },
            { "device": "ide1-cd0" }
        ]);
        let disks = parse_block_info(reply).unwrap();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].index, 0);
        assert_eq!(disks[0].path, PathBuf::from("/var/lib/stratus/disks/a.qcow2"));
        assert_eq!(disks[1].index, 1);
    }
}
