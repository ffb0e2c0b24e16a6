use crate::daemon_conf::setting_of;
use anyhow::{anyhow, Context, Result};
use std::{fmt, fs, net::{IpAddr, SocketAddr}, path::Path};
use tokio::net::lookup_host;
use tracing::{info, warn};

pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Bind address of the console, as read from the daemon's config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub ip: String,
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self { ip: DEFAULT_IP.to_string(), port: DEFAULT_PORT }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl Settings {
    /// Picks `web_ip` / `web_port` out of `text`. Anything missing or
    /// unparsable keeps the value from `previous`.
    pub fn resolve(text: &str, previous: &Settings) -> Settings {
        let mut next = previous.clone();
        for line in text.lines() {
            match setting_of(line) {
                Some(("web_ip", ip)) if !ip.is_empty() => next.ip = ip.to_string(),
                Some(("web_port", port)) => match port.parse::<u16>() {
                    Ok(p) => next.port = p,
                    Err(e) => warn!("ignoring web_port {:?}: {e}", port),
                },
                _ => {}
            }
        }
        next
    }

    /// Like [`Settings::resolve`], reading from disk. An unreadable file
    /// leaves `previous` in force.
    pub fn load(path: &Path, previous: &Settings) -> Settings {
        match fs::read(path) {
            Ok(bytes) => {
                let s = Self::resolve(&String::from_utf8_lossy(&bytes), previous);
                info!("web settings: IP={}, Port={}", s.ip, s.port);
                s
            }
            Err(e) => {
                warn!("could not open config file {}: {e}", path.display());
                previous.clone()
            }
        }
    }

    /// Address to bind. `ip` may be a literal address or a host name; a
    /// name resolves to its first address.
    pub async fn socket_addr(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.ip.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        lookup_host((self.ip.as_str(), self.port))
            .await
            .with_context(|| format!("resolve bind host {}", self.ip))?
            .next()
            .ok_or_else(|| anyhow!("bind host {} has no addresses", self.ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_ip_and_port() {
        let s = Settings::resolve("# c\nweb_ip = 0.0.0.0\nweb_port=9000\n", &Settings::default());
        assert_eq!(s, Settings { ip: "0.0.0.0".into(), port: 9000 });
        assert_eq!(s.to_string(), "0.0.0.0:9000");
    }

    #[test]
    fn bad_port_keeps_previous() {
        let prev = Settings { ip: "10.0.0.1".into(), port: 7000 };
        let s = Settings::resolve("web_port=eighty\n#web_ip=1.1.1.1\n", &prev);
        assert_eq!(s, prev);
    }

    #[tokio::test]
    async fn missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("absent.conf"), &Settings::default());
        assert_eq!(s, Settings::default());
        assert_eq!(s.socket_addr().await.unwrap().port(), DEFAULT_PORT);
    }

    #[test]
    fn non_utf8_file_still_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("dp.conf");
        fs::write(&p, b"# caf\xE9\nweb_port=9100\n").unwrap();
        let s = Settings::load(&p, &Settings::default());
        assert_eq!(s.port, 9100);
    }

    #[tokio::test]
    async fn host_names_are_resolved() {
        let s = Settings { ip: "localhost".into(), port: 9200 };
        let addr = s.socket_addr().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 9200);

        let v6 = Settings { ip: "::1".into(), port: 9300 };
        assert_eq!(v6.socket_addr().await.unwrap(), "[::1]:9300".parse().unwrap());
    }
}
