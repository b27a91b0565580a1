use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{Result, TransportError};

/// Maximum socket path length.
/// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
pub const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
pub const MAX_PATH_LEN: usize = 104;

fn check_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(TransportError::PathTooLong {
            path: path.to_path_buf(),
            len,
            max: MAX_PATH_LEN,
        });
    }
    Ok(())
}

/// Connect to a device (or emulator) listening on a Unix domain socket.
pub async fn connect(path: impl AsRef<Path>) -> Result<UnixStream> {
    let path = path.as_ref();
    check_len(path)?;
    let stream = UnixStream::connect(path)
        .await
        .map_err(|source| TransportError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(?path, "connected to unix domain socket");
    Ok(stream)
}

/// Bind a listening socket at `path` for an emulated device.
///
/// A stale socket left by a previous run is removed; any other existing file
/// is an error and is left untouched.
pub fn listen(path: impl AsRef<Path>) -> Result<UnixListener> {
    let path = path.as_ref();
    check_len(path)?;
    let open_err = |source| TransportError::Open {
        path: path.to_path_buf(),
        source,
    };

    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(open_err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "existing path is not a unix socket",
            )));
        }
        debug!(?path, "removing stale socket");
        std::fs::remove_file(path).map_err(open_err)?;
    }
    let listener = UnixListener::bind(path).map_err(open_err)?;
    debug!(?path, "listening on unix domain socket");
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let dir = std::env::temp_dir().join(format!("steplink-uds-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("device.sock");
        let _ = std::fs::remove_file(&sock_path);
        let listener = UnixListener::bind(&sock_path).unwrap();

        let mut client = connect(&sock_path).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_listen_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("steplink-uds-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("emulator.sock");

        drop(listen(&sock_path).unwrap());
        assert!(sock_path.exists());
        let listener = listen(&sock_path).unwrap();
        let _client = connect(&sock_path).await.unwrap();
        listener.accept().await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_listen_refuses_regular_file() {
        let dir = std::env::temp_dir().join(format!("steplink-uds-file-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file_path = dir.join("not-a-socket");
        std::fs::write(&file_path, b"keep").unwrap();

        assert!(matches!(listen(&file_path), Err(TransportError::Open { .. })));
        assert_eq!(std::fs::read(&file_path).unwrap(), b"keep");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = connect(&long_path).await;
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let result = connect("/nonexistent/steplink.sock").await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }
}
