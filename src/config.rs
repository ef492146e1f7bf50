use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    load_dotenv_from(Path::new(".env"));
}

fn load_dotenv_from(env_path: &Path) {
    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: We're single-threaded at this point (called before any async runtime)
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split `.env` content into key/value pairs.
fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            if !key.is_empty() {
                pairs.push((key, value));
            }
        }
    }
    pairs
}

/// Command line interface; every option can also come from the environment.
#[derive(Debug, Parser)]
#[command(name = "mqtt-sensor-exporter")]
#[command(about = "Export Homie and Home Assistant MQTT sensors as Prometheus metrics")]
pub struct Cli {
    /// MQTT broker host
    #[arg(long, env = "MQTT_BROKER_HOST", default_value = "::1")]
    pub broker_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_BROKER_PORT", default_value_t = 1883)]
    pub broker_port: u16,

    /// MQTT client id
    #[arg(long, env = "MQTT_CLIENT_ID", default_value = "homiexporter")]
    pub client_id: String,

    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Address to serve /metrics on, as <ip>:<port>
    #[arg(short, long, env = "EXPORTER_LISTEN", default_value = "[::1]:8080")]
    pub listen: String,

    /// Topic prefix of Home Assistant state topics (empty matches any topic)
    #[arg(long, env = "HA_STATE_PREFIX", default_value = "")]
    pub ha_state_prefix: String,

    /// Enable debug logging
    #[arg(short, long, env = "EXPORTER_DEBUG")]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub exporter: ExporterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttConfig {
    /// Host as handed to the client, IPv6 literals are bracketed.
    pub fn connect_host(&self) -> String {
        if self.broker_host.contains(':') && !self.broker_host.starts_with('[') {
            format!("[{}]", self.broker_host)
        } else {
            self.broker_host.clone()
        }
    }

    /// `host:port` form used in logs and the client status metric.
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.connect_host(), self.broker_port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    pub listen_address: String,
    pub ha_state_prefix: String,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: "::1".to_string(),
                broker_port: 1883,
                client_id: "homiexporter".to_string(),
                username: None,
                password: None,
            },
            exporter: ExporterConfig {
                listen_address: "[::1]:8080".to_string(),
                ha_state_prefix: String::new(),
                debug: false,
            },
        }
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            mqtt: MqttConfig {
                broker_host: cli.broker_host,
                broker_port: cli.broker_port,
                client_id: cli.client_id,
                username: cli.username,
                password: cli.password,
            },
            exporter: ExporterConfig {
                listen_address: cli.listen,
                ha_state_prefix: cli.ha_state_prefix,
                debug: cli.debug,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv() {
        let content = "# comment\n\nMQTT_BROKER_HOST = 10.0.0.2\nEXPORTER_LISTEN=\"0.0.0.0:9100\"\nHA_STATE_PREFIX='tele'\nNAME=two words\ninvalid line\n";
        let pairs = parse_dotenv(content);
        assert_eq!(
            pairs,
            vec![
                ("MQTT_BROKER_HOST", "10.0.0.2"),
                ("EXPORTER_LISTEN", "0.0.0.0:9100"),
                ("HA_STATE_PREFIX", "tele"),
                ("NAME", "two words"),
            ]
        );
    }

    #[test]
    fn test_cli_defaults_match_config_default() {
        let cli = Cli::try_parse_from(["mqtt-sensor-exporter"]).unwrap();
        let config = Config::from(cli);
        let default = Config::default();
        // Env may override in CI, only compare when unset
        if std::env::var("MQTT_BROKER_HOST").is_err() {
            assert_eq!(config.mqtt.broker_host, default.mqtt.broker_host);
        }
        if std::env::var("EXPORTER_LISTEN").is_err() {
            assert_eq!(config.exporter.listen_address, default.exporter.listen_address);
        }
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "mqtt-sensor-exporter",
            "--broker-host",
            "broker.lan",
            "--broker-port",
            "8883",
            "--listen",
            "0.0.0.0:9000",
            "--ha-state-prefix",
            "tele",
            "--debug",
        ])
        .unwrap();
        let config = Config::from(cli);
        assert_eq!(config.mqtt.broker_address(), "broker.lan:8883");
        assert_eq!(config.exporter.listen_address, "0.0.0.0:9000");
        assert_eq!(config.exporter.ha_state_prefix, "tele");
        assert!(config.exporter.debug);
    }

    #[test]
    fn test_broker_address_brackets_ipv6() {
        let config = Config::default();
        assert_eq!(config.mqtt.broker_address(), "[::1]:1883");
    }
}
