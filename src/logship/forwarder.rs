//! The forwarder child process
//!
//! A forked process whose sole job is to connect back to the parent's
//! loopback listener, connect outward to the collector's log endpoint, and
//! relay frames between the two until the zero-length termination frame,
//! end-of-stream, or the death of the parent process. The parent never
//! kills it explicitly.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{Error, Result};

use super::frame;

/// How often the relay loop checks parent liveness while idle.
const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Spawn the forwarder binary for a shipper listening on `local_port`.
///
/// The binary is resolved from the `MLTRACK_FORWARDER` environment variable
/// when set, then next to the current executable, then `PATH`. Arguments:
/// remote endpoint, local port, parent pid.
///
/// # Errors
///
/// Process spawn failure (missing binary, resource limits).
pub fn spawn(remote: &str, local_port: u16, parent_pid: u32) -> std::io::Result<Child> {
    Command::new(binary_path())
        .arg(remote)
        .arg(local_port.to_string())
        .arg(parent_pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
}

fn binary_path() -> PathBuf {
    let name = "mltrack-forwarder";
    if let Ok(path) = std::env::var("MLTRACK_FORWARDER") {
        return PathBuf::from(path);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join(name);
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from(name)
}

/// Run the relay loop: parent loopback socket in, remote endpoint out.
///
/// `remote` is `host:port` (an optional `tcp://` prefix is accepted).
/// Returns when the stream terminates or the parent process disappears.
///
/// # Errors
///
/// Connection failure to either endpoint, or a mid-frame socket error.
pub async fn run(remote: &str, local_port: u16, parent_pid: u32) -> Result<()> {
    let remote_addr = remote.trim_start_matches("tcp://");
    let local = TcpStream::connect(("127.0.0.1", local_port)).await?;
    let upstream = TcpStream::connect(remote_addr).await?;
    relay(local, upstream, parent_pid).await
}

/// Copy frames from `local` to `upstream` until termination.
///
/// A zero-length frame or end-of-stream ends the relay cleanly; so does the
/// parent process going away while the stream is idle.
pub async fn relay(local: TcpStream, upstream: TcpStream, parent_pid: u32) -> Result<()> {
    let (mut reader, _) = local.into_split();
    let (_, mut writer) = upstream.into_split();

    loop {
        let next = tokio::time::timeout(LIVENESS_POLL, frame::read_frame(&mut reader)).await;
        match next {
            Ok(Ok(Some(body))) => frame::write_raw_frame(&mut writer, &body).await?,
            Ok(Ok(None)) => {
                // Pass the termination frame along before closing.
                frame::write_end_frame(&mut writer).await?;
                return Ok(());
            }
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                if !parent_alive(parent_pid) {
                    tracing::info!(parent_pid, "parent process gone, exiting relay");
                    return Ok(());
                }
            }
        }
    }
}

/// Best-effort parent liveness check.
#[cfg(target_os = "linux")]
fn parent_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// On platforms without a cheap liveness probe, rely on end-of-stream alone.
#[cfg(not(target_os = "linux"))]
fn parent_alive(_pid: u32) -> bool {
    true
}

/// Parse the forwarder's command-line arguments.
///
/// # Errors
///
/// [`Error::Config`] when an argument is missing or malformed.
pub fn parse_args(args: &[String]) -> Result<(String, u16, u32)> {
    let [remote, port, pid] = args else {
        return Err(Error::Config(
            "usage: mltrack-forwarder <remote> <local-port> <parent-pid>".into(),
        ));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("invalid port: {port}")))?;
    let pid: u32 = pid
        .parse()
        .map_err(|_| Error::Config(format!("invalid pid: {pid}")))?;
    Ok((remote.clone(), port, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_args() {
        let args = vec![
            "collector.example.com:9443".to_string(),
            "45123".to_string(),
            "4242".to_string(),
        ];
        let (remote, port, pid) = parse_args(&args).unwrap();
        assert_eq!(remote, "collector.example.com:9443");
        assert_eq!(port, 45123);
        assert_eq!(pid, 4242);
    }

    #[test]
    fn test_parse_args_rejects_bad_port() {
        let args = vec!["r".to_string(), "notaport".to_string(), "1".to_string()];
        assert!(parse_args(&args).is_err());
    }

    #[test]
    fn test_parse_args_rejects_wrong_arity() {
        assert!(parse_args(&["only".to_string()]).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_own_process_is_alive() {
        assert!(parent_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_relay_copies_frames_and_terminates() {
        use crate::logship::{LogLevel, LogRecord};
        use tokio::net::TcpListener;

        // "Parent" side listener and a stand-in for the remote collector.
        let parent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let parent_addr = parent.local_addr().unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let relay_task = tokio::spawn(async move {
            let local = TcpStream::connect(parent_addr).await.unwrap();
            let upstream = TcpStream::connect(remote_addr).await.unwrap();
            relay(local, upstream, std::process::id()).await
        });

        let (parent_conn, _) = parent.accept().await.unwrap();
        let (remote_conn, _) = remote.accept().await.unwrap();
        let (_, mut parent_writer) = parent_conn.into_split();
        let (mut remote_reader, _) = remote_conn.into_split();

        let record = LogRecord::new(LogLevel::Info, "trainer", "step done", "log");
        frame::write_frame(&mut parent_writer, &record).await.unwrap();
        frame::write_end_frame(&mut parent_writer).await.unwrap();

        let body = frame::read_frame(&mut remote_reader).await.unwrap().unwrap();
        let relayed: LogRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(relayed.message, "step done");

        // Termination frame is passed along, then the relay exits.
        assert!(frame::read_frame(&mut remote_reader).await.unwrap().is_none());
        relay_task.await.unwrap().unwrap();
    }
}
