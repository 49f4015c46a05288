use std::net::SocketAddr;
use std::path::PathBuf;

use veilroom_shared::constants::{DEFAULT_CONTROL_PORT, DEFAULT_SOCKS_PORT, PUB_CONV_PORT};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub base_dir: PathBuf,
    pub tor_exe: PathBuf,
    pub tor_log: Option<PathBuf>,
    pub socks_port: u16,
    pub control_port: u16,
    pub use_control_pass: bool,
    /// Local bind address the onion router forwards the service port to.
    pub listen_addr: SocketAddr,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./veilroom"),
            tor_exe: PathBuf::from("tor"),
            tor_log: None,
            socks_port: DEFAULT_SOCKS_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            use_control_pass: true,
            listen_addr: ([127, 0, 0, 1], PUB_CONV_PORT).into(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VEILROOM_BASE_DIR") {
            config.base_dir = PathBuf::from(dir);
        }

        if let Ok(exe) = std::env::var("VEILROOM_TOR_EXE") {
            config.tor_exe = PathBuf::from(exe);
        }

        if let Ok(path) = std::env::var("VEILROOM_TOR_LOG") {
            if !path.is_empty() {
                config.tor_log = Some(PathBuf::from(path));
            }
        }

        if let Ok(port) = std::env::var("VEILROOM_SOCKS_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.socks_port = p,
                Err(_) => {
                    tracing::warn!(value = %port, "Invalid VEILROOM_SOCKS_PORT, using default");
                }
            }
        }

        if let Ok(port) = std::env::var("VEILROOM_CONTROL_PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.control_port = p,
                Err(_) => {
                    tracing::warn!(value = %port, "Invalid VEILROOM_CONTROL_PORT, using default");
                }
            }
        }

        if let Ok(val) = std::env::var("VEILROOM_CONTROL_PASS") {
            config.use_control_pass = val != "false" && val != "0";
        }

        if let Ok(addr) = std::env::var("VEILROOM_LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => {
                    tracing::warn!(value = %addr, "Invalid VEILROOM_LISTEN_ADDR, using default");
                }
            }
        }

        if let Ok(offset) = std::env::var("VEILROOM_PORT_OFFSET") {
            match offset.parse::<u16>() {
                Ok(o) => config.apply_port_offset(o),
                Err(_) => {
                    tracing::warn!(value = %offset, "Invalid VEILROOM_PORT_OFFSET, ignoring");
                }
            }
        }

        config
    }

    /// Shift every local port so several daemons can share one machine.
    pub fn apply_port_offset(&mut self, offset: u16) {
        self.socks_port += offset;
        self.control_port += offset;
        self.listen_addr.set_port(self.listen_addr.port() + offset);
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.base_dir.join("blobs")
    }

    pub fn router_data_dir(&self) -> PathBuf {
        self.base_dir.join("router")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.listen_addr.port(), PUB_CONV_PORT);
        assert_eq!(config.socks_port, DEFAULT_SOCKS_PORT);
        assert!(config.use_control_pass);
    }

    #[test]
    fn test_port_offset() {
        let mut config = DaemonConfig::default();
        config.apply_port_offset(100);
        assert_eq!(config.socks_port, DEFAULT_SOCKS_PORT + 100);
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT + 100);
        assert_eq!(config.listen_addr.port(), PUB_CONV_PORT + 100);
    }
}
