//! Turns a remote GPU host reached over SSH into a drop-in replacement for
//! the local worker.
//!
//! Locate a binary, launch it, verify liveness with a Ping/Pong round trip
//! before returning — the same shape as spawning the worker locally, just
//! driving the system `ssh`/`scp` binaries instead of launching the worker
//! binary directly. There is no SSH crate this module depends on, so it
//! shells out via `tokio::process::Command` rather than linking one.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::error::{RemoteError, RemoteResult};
use crate::kernel::{Endpoints, KernelClient};
use crate::providers::{GPUProvider, Pod};

const CMD_PORT_REMOTE: u16 = 15555;
const EVENT_PORT_REMOTE: u16 = 15556;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: &str = "60";
const KEEPALIVE_COUNT_MAX: &str = "3";

/// Resolve the private key to pass to `ssh -i`: `FORGE_SSH_KEY`
/// env override, then `~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`.
pub fn resolve_ssh_key() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("FORGE_SSH_KEY") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let home = dirs::home_dir()?;
    let ed25519 = home.join(".ssh").join("id_ed25519");
    if ed25519.exists() {
        return Some(ed25519);
    }
    let rsa = home.join(".ssh").join("id_rsa");
    if rsa.exists() {
        return Some(rsa);
    }
    None
}

/// Owns the local-forward SSH tunnel and the deployed worker binary's
/// remote lifetime. Calling [`RemoteBridge::connect`] resolves the endpoint,
/// deploys, starts, and tunnels the remote worker; [`RemoteBridge::disconnect`]
/// tears the tunnel down and reverts the
/// `KernelClient`'s endpoints.
pub struct RemoteBridge {
    worker_binary: PathBuf,
    tunnel: tokio::sync::Mutex<Option<Child>>,
}

struct SshEndpoint {
    user: String,
    host: String,
    port: u16,
}

impl RemoteBridge {
    /// `worker_binary` is the path to the locally-built `forge-worker`
    /// binary, staged to the remote host via `scp` on connect.
    pub fn new(worker_binary: PathBuf) -> Self {
        Self {
            worker_binary,
            tunnel: tokio::sync::Mutex::new(None),
        }
    }

    /// Resolves the SSH endpoint for `pod_id`, looked up on
    /// `provider`, deploys and starts the remote worker, and opens the
    /// tunnel. On success, atomically swaps `client`'s endpoints to the
    /// local forwarded ports; on failure, tears everything down and returns
    /// a classified [`RemoteError`].
    pub async fn connect(
        &self,
        provider: &dyn GPUProvider,
        pod_id: &str,
        client: &KernelClient,
    ) -> RemoteResult<()> {
        let pod = provider
            .get_pod(pod_id)
            .map_err(|e| RemoteError::DeploymentFailure(format!("could not look up pod: {e}")))?;

        let endpoint = parse_ssh_endpoint(&pod)?;
        let key = resolve_ssh_key();

        self.stage_worker(&endpoint, key.as_deref()).await?;
        self.start_remote_worker(&endpoint, key.as_deref()).await?;

        let tunnel = self.open_tunnel(&endpoint, key.as_deref()).await?;
        *self.tunnel.lock().await = Some(tunnel);

        if let Err(e) = self.probe_tunnel().await {
            self.disconnect().await;
            return Err(e);
        }

        client.swap_endpoints(Endpoints {
            cmd_addr: format!("127.0.0.1:{CMD_PORT_REMOTE}").parse().unwrap(),
            event_addr: format!("127.0.0.1:{EVENT_PORT_REMOTE}").parse().unwrap(),
            local_worker_binary: None,
        });

        Ok(())
    }

    /// Kill the tunnel child process. The remote worker itself is left
    /// running; the pod owns its lifecycle. Callers should
    /// revert the `KernelClient`'s endpoints back to local separately, since
    /// this type has no knowledge of what "local" means for the caller.
    pub async fn disconnect(&self) {
        if let Some(mut child) = self.tunnel.lock().await.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }

    async fn stage_worker(&self, endpoint: &SshEndpoint, key: Option<&std::path::Path>) -> RemoteResult<()> {
        let remote_dest = format!("{}@{}:~/forge-worker", endpoint.user, endpoint.host);

        let mut cmd = Command::new("scp");
        cmd.arg("-P").arg(endpoint.port.to_string());
        if let Some(key) = key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.worker_binary)
            .arg(&remote_dest);

        run_ssh_family(cmd, "scp", CONNECT_TIMEOUT).await
    }

    async fn start_remote_worker(&self, endpoint: &SshEndpoint, key: Option<&std::path::Path>) -> RemoteResult<()> {
        let remote_cmd = format!(
            "chmod +x ~/forge-worker && nohup ~/forge-worker --cmd-port {CMD_PORT_REMOTE} --event-port {EVENT_PORT_REMOTE} >~/forge-worker.log 2>&1 & disown"
        );

        let mut cmd = self.ssh_base_command(endpoint, key);
        cmd.arg(remote_cmd);

        run_ssh_family(cmd, "ssh", CONNECT_TIMEOUT).await
    }

    async fn open_tunnel(&self, endpoint: &SshEndpoint, key: Option<&std::path::Path>) -> RemoteResult<Child> {
        let mut cmd = self.ssh_base_command(endpoint, key);
        cmd.arg("-N")
            .arg("-L")
            .arg(format!("{CMD_PORT_REMOTE}:localhost:{CMD_PORT_REMOTE}"))
            .arg("-L")
            .arg(format!("{EVENT_PORT_REMOTE}:localhost:{EVENT_PORT_REMOTE}"))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| RemoteError::ConnectTimeout(format!("failed to start ssh tunnel: {e}")))
    }

    fn ssh_base_command(&self, endpoint: &SshEndpoint, key: Option<&std::path::Path>) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(endpoint.port.to_string());
        if let Some(key) = key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-o")
            .arg(format!("ServerAliveInterval={KEEPALIVE_INTERVAL}"))
            .arg("-o")
            .arg(format!("ServerAliveCountMax={KEEPALIVE_COUNT_MAX}"))
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}@{}", endpoint.user, endpoint.host));
        cmd
    }

    async fn probe_tunnel(&self) -> RemoteResult<()> {
        let addr = format!("127.0.0.1:{CMD_PORT_REMOTE}");
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            if tokio::net::TcpStream::connect(&addr).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RemoteError::ConnectTimeout(format!(
                    "forwarded port {addr} never became reachable"
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

fn parse_ssh_endpoint(pod: &Pod) -> RemoteResult<SshEndpoint> {
    let conn = pod.ssh_connection.as_deref().ok_or_else(|| {
        RemoteError::DeploymentFailure(format!("pod {} has no ssh endpoint yet", pod.id))
    })?;

    // Accepts `user@host:port` or `user@host` (default port 22), matching
    // the shape providers commonly report for SSH-reachable GPU pods.
    let (user_host, port) = match conn.rsplit_once(':') {
        Some((left, port)) => (left, port.parse().unwrap_or(22)),
        None => (conn, 22),
    };
    let (user, host) = user_host.split_once('@').ok_or_else(|| {
        RemoteError::DeploymentFailure(format!("malformed ssh connection string: {conn}"))
    })?;

    Ok(SshEndpoint {
        user: user.to_string(),
        host: host.to_string(),
        port,
    })
}

/// Run an `ssh`/`scp` child to completion, classifying failure per spec
/// §4.6's taxonomy by inspecting stderr and exit status — the same approach
/// a typical SSH-tunneling pod manager takes.
async fn run_ssh_family(mut cmd: Command, program: &str, timeout: Duration) -> RemoteResult<()> {
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| RemoteError::DeploymentFailure(format!("failed to start {program}: {e}")))?;

    let mut stderr_buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_buf).await;
    }

    let status = tokio::time::timeout(timeout, child.wait())
        .await
        .map_err(|_| RemoteError::ConnectTimeout(format!("{program} timed out")))?
        .map_err(|e| RemoteError::DeploymentFailure(format!("{program} wait failed: {e}")))?;

    if status.success() {
        return Ok(());
    }

    Err(classify_ssh_failure(program, &stderr_buf))
}

fn classify_ssh_failure(program: &str, stderr: &str) -> RemoteError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") && lower.contains("publickey") {
        return RemoteError::KeyNotInAgent(stderr.to_string());
    }
    if lower.contains("permission denied") {
        return RemoteError::PermissionDenied(stderr.to_string());
    }
    if lower.contains("authentication failed") || lower.contains("auth fail") {
        return RemoteError::SshAuth {
            user: "unknown".to_string(),
            host: "unknown".to_string(),
        };
    }
    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("connection refused") {
        return RemoteError::ConnectTimeout(stderr.to_string());
    }
    RemoteError::DeploymentFailure(format!("{program} failed: {stderr}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_with_ssh(conn: Option<&str>) -> Pod {
        Pod {
            id: "pod-1".to_string(),
            name: "test".to_string(),
            status: "running".to_string(),
            gpu_name: "A100".to_string(),
            gpu_count: 1,
            price_hr: 1.5,
            ssh_connection: conn.map(|s| s.to_string()),
            ip: None,
            created_at: "0".to_string(),
            updated_at: "0".to_string(),
        }
    }

    #[test]
    fn parses_user_host_port() {
        let endpoint = parse_ssh_endpoint(&pod_with_ssh(Some("root@1.2.3.4:2222"))).unwrap();
        assert_eq!(endpoint.user, "root");
        assert_eq!(endpoint.host, "1.2.3.4");
        assert_eq!(endpoint.port, 2222);
    }

    #[test]
    fn defaults_port_22_when_absent() {
        let endpoint = parse_ssh_endpoint(&pod_with_ssh(Some("root@1.2.3.4"))).unwrap();
        assert_eq!(endpoint.port, 22);
    }

    #[test]
    fn missing_ssh_endpoint_is_deployment_failure() {
        let err = parse_ssh_endpoint(&pod_with_ssh(None)).unwrap_err();
        assert!(matches!(err, RemoteError::DeploymentFailure(_)));
    }

    #[test]
    fn classifies_publickey_rejection() {
        let err = classify_ssh_failure("ssh", "Permission denied (publickey).");
        assert!(matches!(err, RemoteError::KeyNotInAgent(_)));
    }

    #[test]
    fn classifies_generic_permission_denied() {
        let err = classify_ssh_failure("scp", "scp: Permission denied");
        assert!(matches!(err, RemoteError::PermissionDenied(_)));
    }

    #[test]
    fn classifies_connection_timeout() {
        let err = classify_ssh_failure("ssh", "ssh: connect to host 1.2.3.4 port 22: Connection timed out");
        assert!(matches!(err, RemoteError::ConnectTimeout(_)));
    }
}
