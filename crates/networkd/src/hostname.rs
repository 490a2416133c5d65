//! Transient hostname client.
//!
//! A DHCP lease may carry a hostname the machine should adopt while the
//! lease is held. Hostname changes go through the hostname daemon's control
//! socket with a one-line command; sending the empty string clears the
//! transient hostname again. The call is fire-and-forget: a missing daemon
//! is logged and otherwise ignored.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOSTNAMED_SOCKET: &str = "/run/systemd/hostnamed.sock";

#[derive(Debug, Clone)]
pub struct HostnameClient {
    socket_path: PathBuf,
}

impl HostnameClient {
    pub fn new() -> Self {
        Self {
            socket_path: PathBuf::from(HOSTNAMED_SOCKET),
        }
    }

    /// Client talking to an alternate socket path (tests).
    pub fn with_socket_path(path: &Path) -> Self {
        Self {
            socket_path: path.to_path_buf(),
        }
    }

    /// Set the transient hostname; an empty name clears it. Never fails —
    /// an unreachable hostname daemon must not disturb link configuration.
    pub fn set_hostname(&self, hostname: &str) {
        if hostname.is_empty() {
            log::debug!("clearing transient hostname");
        } else {
            log::debug!("setting transient hostname: '{hostname}'");
        }

        let mut stream = match UnixStream::connect(&self.socket_path) {
            Ok(s) => s,
            Err(e) => {
                log::info!("not connected to hostname daemon, ignoring transient hostname: {e}");
                return;
            }
        };

        let _ = stream.set_write_timeout(Some(Duration::from_secs(1)));
        if let Err(e) = writeln!(stream, "SET-HOSTNAME {hostname}") {
            log::warn!("could not set transient hostname: {e}");
        }
    }
}

impl Default for HostnameClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    #[test]
    fn test_set_hostname_no_daemon() {
        // Must not panic or error out when nothing listens.
        let client = HostnameClient::with_socket_path(Path::new("/tmp/nonexistent-hostnamed.sock"));
        client.set_hostname("worker-1");
        client.set_hostname("");
    }

    #[test]
    fn test_set_hostname_sends_command() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("hostnamed.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let client = HostnameClient::with_socket_path(&sock);
        client.set_hostname("worker-1");

        let (stream, _) = listener.accept().unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        assert_eq!(line, "SET-HOSTNAME worker-1\n");
    }

    #[test]
    fn test_clear_hostname_sends_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("hostnamed.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let client = HostnameClient::with_socket_path(&sock);
        client.set_hostname("");

        let (stream, _) = listener.accept().unwrap();
        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line).unwrap();
        assert_eq!(line, "SET-HOSTNAME \n");
    }
}
