use std::fmt;
use std::path::PathBuf;

use crate::error::Result;
use crate::link::Link;

const UNIX_PREFIX: &str = "unix:";

/// Default line rate of the controller firmware.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Where the controller is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    /// A serial tty such as `/dev/ttyACM0`.
    Serial { path: PathBuf, baud: u32 },
    /// A Unix domain socket, written as `unix:<path>`.
    Unix(PathBuf),
}

impl Device {
    /// Parse a device argument. `baud` only applies to serial devices.
    pub fn parse(arg: &str, baud: u32) -> Self {
        match arg.strip_prefix(UNIX_PREFIX) {
            Some(path) => Device::Unix(PathBuf::from(path)),
            None => Device::Serial {
                path: PathBuf::from(arg),
                baud,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Device::Serial { .. } => "serial",
            Device::Unix(_) => "unix",
        }
    }

    /// Open the device and attach it to `link`.
    pub async fn connect(&self, link: &Link) -> Result<()> {
        match self {
            #[cfg(unix)]
            Device::Serial { path, baud } => {
                let port = crate::serial::open(path, *baud)?;
                link.connect(port, self.to_string()).await;
            }
            #[cfg(unix)]
            Device::Unix(path) => {
                let stream = crate::uds::connect(path).await?;
                link.connect(stream, self.to_string()).await;
            }
            #[cfg(not(unix))]
            _ => {
                let _ = link;
                return Err(crate::error::TransportError::Unsupported(self.kind()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Serial { path, baud } => write!(f, "{}@{baud}", path.display()),
            Device::Unix(path) => write!(f, "{UNIX_PREFIX}{}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial() {
        let device = Device::parse("/dev/ttyACM0", 115_200);
        assert_eq!(
            device,
            Device::Serial {
                path: PathBuf::from("/dev/ttyACM0"),
                baud: 115_200
            }
        );
        assert_eq!(device.to_string(), "/dev/ttyACM0@115200");
        assert_eq!(device.kind(), "serial");
    }

    #[test]
    fn test_parse_unix() {
        let device = Device::parse("unix:/tmp/emu.sock", 9600);
        assert_eq!(device, Device::Unix(PathBuf::from("/tmp/emu.sock")));
        assert_eq!(device.to_string(), "unix:/tmp/emu.sock");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_failure_leaves_link_detached() {
        let link = Link::new();
        let device = Device::parse("unix:/nonexistent/emu.sock", 115_200);
        assert!(device.connect(&link).await.is_err());
        assert!(!link.is_connected());
    }
}
