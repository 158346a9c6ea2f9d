// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Listening sockets shared by a supervising process.
//!
//! A supervisor may bind privileged or contended ports once and pass them to child containers by
//! file descriptor, avoiding races on rebinding. The mapping is a JSON object `{"<port>": fd}`
//! in the `HIVE_SHARED_SOCKET_FDS` environment variable. When the expected entry is absent the
//! caller falls back to a local bind.

use std::collections::HashMap;

pub const SHARED_SOCKET_FDS_ENV: &str = "HIVE_SHARED_SOCKET_FDS";

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("no shared sockets were passed to this process")]
    NoSharedSockets,
    #[error("no shared socket was created for port {0}")]
    SocketNotCreated(u16),
    #[error("invalid shared socket map: {0}")]
    InvalidFdMap(String),
    #[error("shared sockets are not supported on this platform")]
    Unsupported,
}

/// The `port -> fd` map passed by the supervisor, if any.
pub fn shared_socket_fds() -> Result<HashMap<u16, i32>, SocketError> {
    let raw = std::env::var(SHARED_SOCKET_FDS_ENV).map_err(|_| SocketError::NoSharedSockets)?;
    parse_fd_map(&raw)
}

pub(crate) fn parse_fd_map(raw: &str) -> Result<HashMap<u16, i32>, SocketError> {
    let map: HashMap<String, i32> =
        serde_json::from_str(raw).map_err(|e| SocketError::InvalidFdMap(e.to_string()))?;
    map.into_iter()
        .map(|(port, fd)| {
            let port = port
                .parse::<u16>()
                .map_err(|_| SocketError::InvalidFdMap(format!("bad port {:?}", port)))?;
            Ok((port, fd))
        })
        .collect()
}

/// Take ownership of the shared listening socket for `port`.
#[cfg(unix)]
pub fn take_shared_listener(port: u16) -> Result<std::net::TcpListener, SocketError> {
    use std::os::unix::io::FromRawFd;

    let fds = shared_socket_fds()?;
    let fd = *fds.get(&port).ok_or(SocketError::SocketNotCreated(port))?;
    // The supervisor hands over ownership of the descriptor.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    Ok(listener)
}

#[cfg(not(unix))]
pub fn take_shared_listener(_port: u16) -> Result<std::net::TcpListener, SocketError> {
    Err(SocketError::Unsupported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_port_fd_map() {
        let map = parse_fd_map(r#"{"4321": 5, "80": 6}"#).unwrap();
        assert_eq!(map.get(&4321), Some(&5));
        assert_eq!(map.get(&80), Some(&6));
    }

    #[test]
    fn rejects_bad_ports() {
        assert!(matches!(
            parse_fd_map(r#"{"notaport": 5}"#),
            Err(SocketError::InvalidFdMap(_))
        ));
        assert!(matches!(parse_fd_map("[1, 2]"), Err(SocketError::InvalidFdMap(_))));
    }

    #[test]
    fn absent_env_means_no_shared_sockets() {
        assert!(matches!(shared_socket_fds(), Err(SocketError::NoSharedSockets)));
    }
}
