//! Docker availability probe for container-backed suites.

use std::path::Path;
use std::process::Command;

/// Returns `true` if a Docker daemon is reachable.
#[must_use]
pub fn available() -> bool {
    available_with_host(std::env::var("DOCKER_HOST").ok())
}

fn available_with_host(host: Option<String>) -> bool {
    if let Some(host) = host {
        if let Some(path) = host.strip_prefix("unix://") {
            return Path::new(path).exists();
        }
        return true;
    }

    Path::new("/var/run/docker.sock").exists()
        || Command::new("docker")
            .arg("info")
            .output()
            .is_ok_and(|output| output.status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_unix_socket_is_unavailable() {
        assert!(!available_with_host(Some(
            "unix:///definitely/missing.sock".into()
        )));
    }

    #[test]
    fn tcp_host_is_trusted() {
        assert!(available_with_host(Some("tcp://127.0.0.1:2375".into())));
    }
}
