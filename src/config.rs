use crate::buffer;
use crate::support::ProxyError;
use serde_derive::Deserialize;
use std::time::Duration;

/// Proxy instance configuration.
///
/// `port` 0 requests a kernel-assigned port; look the bound port up with
/// `Proxy::port`. Buffer capacities must be multiples of the buffer increment.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener bind address, in dotted-quad notation.
    pub bind_address: String,
    /// Listener port; 0 for kernel-assigned.
    pub port: u16,
    /// Per-endpoint inbound buffer capacity.
    pub read_buffer_size: usize,
    /// Per-endpoint outbound buffer capacity. Bounds the write queue; a full
    /// buffer applies back-pressure to the opposite endpoint.
    pub write_buffer_size: usize,
    /// Origin connect deadline in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        ProxyConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            read_buffer_size: buffer::BUF_SIZE_INCREMENT,
            write_buffer_size: 8 * buffer::BUF_SIZE_INCREMENT,
            connect_timeout_ms: 30_000,
        }
    }
}

impl ProxyConfig {
    /// Loads a configuration from a TOML document.
    pub fn from_toml_str(toml: &str) -> Result<ProxyConfig, ProxyError> {
        let config: ProxyConfig =
            serdeconv::from_toml_str(toml).map_err(|err| ProxyError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[inline]
    pub fn connect_deadline(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), ProxyError> {
        for (name, size) in &[
            ("read_buffer_size", self.read_buffer_size),
            ("write_buffer_size", self.write_buffer_size),
        ] {
            if *size == 0 || size % buffer::BUF_SIZE_INCREMENT != 0 {
                return Err(ProxyError::Config(format!(
                    "{} must be a nonzero multiple of {}, got {}",
                    name,
                    buffer::BUF_SIZE_INCREMENT,
                    size
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        ProxyConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_toml() {
        let config = ProxyConfig::from_toml_str(
            r#"
bind_address = "0.0.0.0"
port = 8080
connect_timeout_ms = 500
"#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.connect_deadline(), Duration::from_millis(500));
        assert_eq!(config.read_buffer_size, buffer::BUF_SIZE_INCREMENT);
    }

    #[test]
    fn test_rejects_unaligned_buffer() {
        let result = ProxyConfig::from_toml_str("read_buffer_size = 1000");
        assert!(result.is_err());
    }
}
