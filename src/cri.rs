//! Container runtime lookups: container id to host PIDs.
//!
//! The runtime is picked by probing well-known sockets. Docker is asked
//! through its Engine API over the unix socket with a hyper client;
//! containerd containers are
//! found by scanning the cgroup membership of every process under the proc
//! root, which needs no gRPC client.

use std::fs;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::StatusCode;
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::Deserialize;
use thiserror::Error;

pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

const DOCKER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("no container runtime available: {0}")]
    Unavailable(String),
    #[error("container {0} not found")]
    NotFound(String),
    #[error("container runtime I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected container runtime response: {0}")]
    Protocol(String),
}

pub trait PidLookup: Send + Sync {
    /// Host PIDs of the container's processes, init process first.
    fn get_pids(&self, container_id: &str) -> Result<Vec<u32>, RuntimeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    Containerd { proc_root: PathBuf },
    Docker { socket: PathBuf },
}

fn socket_alive(path: &Path) -> bool {
    UnixStream::connect(path).is_ok()
}

impl Runtime {
    pub fn detect(proc_root: &Path) -> Result<Self, RuntimeError> {
        Self::detect_at(
            Path::new(CONTAINERD_SOCKET),
            Path::new(DOCKER_SOCKET),
            proc_root,
        )
    }

    pub fn detect_at(
        containerd: &Path,
        docker: &Path,
        proc_root: &Path,
    ) -> Result<Self, RuntimeError> {
        if socket_alive(containerd) {
            return Ok(Runtime::Containerd {
                proc_root: proc_root.to_path_buf(),
            });
        }
        if socket_alive(docker) {
            return Ok(Runtime::Docker {
                socket: docker.to_path_buf(),
            });
        }
        Err(RuntimeError::Unavailable(format!(
            "neither {} nor {} accepts connections",
            containerd.display(),
            docker.display()
        )))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Runtime::Containerd { .. } => "containerd",
            Runtime::Docker { .. } => "docker",
        }
    }
}

impl PidLookup for Runtime {
    fn get_pids(&self, container_id: &str) -> Result<Vec<u32>, RuntimeError> {
        match self {
            Runtime::Containerd { proc_root } => cgroup_pids(proc_root, container_id),
            Runtime::Docker { socket } => docker_pids(socket, container_id),
        }
    }
}

/// PIDs whose cgroup path mentions `container_id`, in ascending order.
pub fn cgroup_pids(proc_root: &Path, container_id: &str) -> Result<Vec<u32>, RuntimeError> {
    if container_id.is_empty() {
        return Err(RuntimeError::NotFound(container_id.to_string()));
    }
    let mut pids = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // Processes exit while we scan.
        let Ok(cgroup) = fs::read_to_string(entry.path().join("cgroup")) else {
            continue;
        };
        if cgroup.lines().any(|line| line.contains(container_id)) {
            pids.push(pid);
        }
    }
    if pids.is_empty() {
        return Err(RuntimeError::NotFound(container_id.to_string()));
    }
    pids.sort_unstable();
    Ok(pids)
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
    #[serde(rename = "Pid", default)]
    pid: u32,
}

/// Inspect a container through the Engine API and return the status code
/// and body.
async fn inspect(socket: &Path, container_id: &str) -> Result<(StatusCode, Bytes), RuntimeError> {
    let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
    let uri: hyper::Uri = UnixUri::new(socket, &format!("/containers/{container_id}/json")).into();
    let response = client
        .get(uri)
        .await
        .map_err(|e| RuntimeError::Unavailable(format!("{}: {e}", socket.display())))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| RuntimeError::Protocol(format!("reading inspect body: {e}")))?
        .to_bytes();
    Ok((status, body))
}

fn docker_pids(socket: &Path, container_id: &str) -> Result<Vec<u32>, RuntimeError> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (status, body) = rt.block_on(async {
        tokio::time::timeout(DOCKER_TIMEOUT, inspect(socket, container_id))
            .await
            .map_err(|_| {
                RuntimeError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("inspect {container_id} timed out"),
                ))
            })?
    })?;
    match status {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(RuntimeError::NotFound(container_id.to_string())),
        other => {
            return Err(RuntimeError::Protocol(format!(
                "inspect {container_id} returned HTTP {other}"
            )))
        }
    }
    let inspect: InspectResponse =
        serde_json::from_slice(&body).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
    if !inspect.state.running || inspect.state.pid == 0 {
        return Err(RuntimeError::NotFound(format!("{container_id} (not running)")));
    }
    Ok(vec![inspect.state.pid])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn serve_once(listener: UnixListener, response: &'static str) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            conn.write_all(response.as_bytes()).unwrap();
            String::from_utf8(request).unwrap()
        })
    }

    #[test]
    fn test_cgroup_scan() {
        let root = tempfile::tempdir().unwrap();
        let id = "4f1c2e9a";
        for (pid, cgroup) in [
            ("300", format!("0::/kubepods/pod1/cri-containerd-{id}.scope\n")),
            ("200", format!("0::/kubepods/pod1/{id}\n")),
            ("100", "0::/system.slice/sshd.service\n".to_string()),
        ] {
            fs::create_dir(root.path().join(pid)).unwrap();
            fs::write(root.path().join(pid).join("cgroup"), cgroup).unwrap();
        }
        fs::create_dir(root.path().join("self")).unwrap();
        fs::create_dir(root.path().join("400")).unwrap();

        let runtime = Runtime::Containerd {
            proc_root: root.path().to_path_buf(),
        };
        assert_eq!(runtime.get_pids(id).unwrap(), vec![200, 300]);
        assert!(matches!(
            runtime.get_pids("missing"),
            Err(RuntimeError::NotFound(_))
        ));
        assert!(matches!(runtime.get_pids(""), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_docker_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            "HTTP/1.0 200 OK\r\nContent-Type: application/json\r\n\r\n{\"Id\":\"abc\",\"State\":{\"Running\":true,\"Pid\":4242}}",
        );

        let runtime = Runtime::Docker { socket };
        assert_eq!(runtime.get_pids("abc").unwrap(), vec![4242]);
        assert!(server.join().unwrap().starts_with("GET /containers/abc/json HTTP/1.1"));
    }

    #[test]
    fn test_docker_chunked_reply_on_open_connection() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let body = "{\"State\":{\"Running\":true,\"Pid\":4242}}";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n{:x}\r\n{body}\r\n0\r\n\r\n",
            body.len()
        );
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 512];
            let mut request = Vec::new();
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
            }
            conn.write_all(response.as_bytes()).unwrap();
            // Keep the connection open until the client goes away.
            while conn.read(&mut buf).map(|n| n > 0).unwrap_or(false) {}
        });

        let runtime = Runtime::Docker { socket };
        let start = std::time::Instant::now();
        assert_eq!(runtime.get_pids("abc").unwrap(), vec![4242]);
        assert!(start.elapsed() < DOCKER_TIMEOUT);
        server.join().unwrap();
    }

    #[test]
    fn test_docker_server_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 2\r\n\r\n{}",
        );
        let runtime = Runtime::Docker { socket };
        assert!(matches!(runtime.get_pids("abc"), Err(RuntimeError::Protocol(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_docker_not_running_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("docker.sock");
        let runtime = Runtime::Docker {
            socket: socket.clone(),
        };

        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            "HTTP/1.0 200 OK\r\n\r\n{\"State\":{\"Running\":false,\"Pid\":0}}",
        );
        assert!(matches!(runtime.get_pids("abc"), Err(RuntimeError::NotFound(_))));
        server.join().unwrap();

        fs::remove_file(&socket).unwrap();
        let server = serve_once(
            UnixListener::bind(&socket).unwrap(),
            "HTTP/1.0 404 Not Found\r\n\r\n{\"message\":\"No such container\"}",
        );
        assert!(matches!(runtime.get_pids("abc"), Err(RuntimeError::NotFound(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_detect_prefers_containerd() {
        let dir = tempfile::tempdir().unwrap();
        let containerd = dir.path().join("containerd.sock");
        let docker = dir.path().join("docker.sock");

        assert!(matches!(
            Runtime::detect_at(&containerd, &docker, Path::new("/proc")),
            Err(RuntimeError::Unavailable(_))
        ));

        let _docker_listener = UnixListener::bind(&docker).unwrap();
        let runtime = Runtime::detect_at(&containerd, &docker, Path::new("/proc")).unwrap();
        assert_eq!(runtime.name(), "docker");

        let _containerd_listener = UnixListener::bind(&containerd).unwrap();
        let runtime = Runtime::detect_at(&containerd, &docker, Path::new("/proc")).unwrap();
        assert_eq!(
            runtime,
            Runtime::Containerd {
                proc_root: PathBuf::from("/proc")
            }
        );
    }
}
