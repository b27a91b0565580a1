use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::{Result, TransportError};

/// A serial tty in raw mode, driven by the tokio reactor.
#[derive(Debug)]
pub struct SerialPort {
    fd: AsyncFd<OwnedFd>,
    path: PathBuf,
}

/// Open `path` as a raw 8N1 serial line at `baud`.
pub fn open(path: impl AsRef<Path>, baud: u32) -> Result<SerialPort> {
    let path = path.as_ref().to_path_buf();
    let speed = speed_for(baud).ok_or(TransportError::UnsupportedBaud(baud))?;
    let open_err = |source| TransportError::Open {
        path: path.clone(),
        source,
    };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(&path)
        .map_err(open_err)?;
    let fd = OwnedFd::from(file);
    configure(fd.as_raw_fd(), speed).map_err(open_err)?;
    let fd = AsyncFd::new(fd).map_err(open_err)?;

    debug!(?path, baud, "opened serial port");
    Ok(SerialPort { fd, path })
}

impl SerialPort {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn speed_for(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460_800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921_600 => libc::B921600,
        _ => return None,
    };
    Some(speed)
}

fn configure(fd: RawFd, speed: libc::speed_t) -> io::Result<()> {
    // SAFETY: termios is a plain C struct; all-zero is a valid value that
    // tcgetattr fully overwrites below.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };

    // SAFETY: `fd` is an open descriptor owned by the caller and `tio` is a
    // valid writable termios.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `tio` is a valid termios obtained from tcgetattr.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;

    // SAFETY: as above; `speed` is one of the libc B* constants.
    if unsafe { libc::cfsetspeed(&mut tio, speed) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is open and `tio` is fully initialised.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // Drop whatever the device sent before we were listening.
    // SAFETY: `fd` is an open tty descriptor.
    if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for SerialPort {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|inner| {
                // SAFETY: `unfilled` is a valid writable buffer of the given
                // length and the descriptor stays open while `inner` lives.
                let n = unsafe {
                    libc::read(
                        inner.as_raw_fd(),
                        unfilled.as_mut_ptr().cast::<libc::c_void>(),
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                // SAFETY: `data` is a valid readable buffer of the given length
                // and the descriptor stays open while `inner` lives.
                let n = unsafe {
                    libc::write(
                        inner.as_raw_fd(),
                        data.as_ptr().cast::<libc::c_void>(),
                        data.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the driver; nothing is buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DEFAULT_BAUD;

    #[test]
    fn test_supported_baud_rates() {
        assert_eq!(speed_for(115_200), Some(libc::B115200));
        assert_eq!(speed_for(9600), Some(libc::B9600));
        assert_eq!(speed_for(12345), None);
    }

    #[test]
    fn test_unsupported_baud_rejected_before_open() {
        let err = open("/nonexistent/tty", 1234).unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedBaud(1234)));
    }

    #[tokio::test]
    async fn test_missing_device() {
        let err = open("/nonexistent/steplink-tty", DEFAULT_BAUD).unwrap_err();
        match err {
            TransportError::Open { path, source } => {
                assert_eq!(path, PathBuf::from("/nonexistent/steplink-tty"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_non_tty_fails_configuration() {
        let dir = std::env::temp_dir().join(format!("steplink-serial-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("plain-file");
        std::fs::write(&path, b"").unwrap();

        let err = open(&path, DEFAULT_BAUD).unwrap_err();
        assert!(matches!(err, TransportError::Open { .. }), "{err}");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
