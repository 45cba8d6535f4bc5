use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::device::DeviceKind;

pub const DEFAULT_BROKER_HOST: &str = "app.coreiot.io";
pub const DEFAULT_BROKER_PORT: u16 = 1883;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub auto_connect: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub profile: Profile,
    pub telemetry_interval: Duration,
}

/// Broker identity for one simulated device. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
}

// Serde shape of one entry in the profile store
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProfile {
    client_id: String,
    user_name: String,
    #[serde(default)]
    password: String,
}

fn env_required(key: &str) -> Result<String, String> {
    env::var(key).map_err(|_| format!("{key} environment variable is required"))
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean env var. Unset means `default`; anything unrecognised is an error.
fn env_flag(key: &str, default: bool) -> Result<bool, String> {
    match env::var(key) {
        Ok(v) => parse_flag(&v).ok_or_else(|| format!("{key} must be true or false, got '{v}'")),
        Err(_) => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let kind: DeviceKind = match env::var("DEVICE_KIND") {
            Ok(v) => v.parse()?,
            Err(_) => DeviceKind::Hvac,
        };
        let profile_name = env_required("DEVICE_PROFILE")?;
        let profiles_file = env_or_default("PROFILES_FILE", "profiles.json".to_string());
        let profile = load_profile(&profiles_file, &profile_name)?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_or_default("MQTT_BROKER_HOST", DEFAULT_BROKER_HOST.to_string()),
                broker_port: env_or_default("MQTT_BROKER_PORT", DEFAULT_BROKER_PORT),
                connect_timeout: Duration::from_secs(env_or_default(
                    "MQTT_CONNECT_TIMEOUT_SECS",
                    60,
                )),
                keep_alive: Duration::from_secs(env_or_default("MQTT_KEEP_ALIVE_SECS", 60)),
                auto_connect: env_flag("AUTO_CONNECT", true)?,
            },
            device: DeviceConfig {
                kind,
                profile,
                telemetry_interval: Duration::from_secs(env_or_default(
                    "TELEMETRY_INTERVAL_SECS",
                    kind.default_telemetry_interval().as_secs(),
                )),
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.mqtt.broker_host.is_empty() {
            return Err("MQTT_BROKER_HOST must not be empty".into());
        }
        if self.mqtt.connect_timeout.is_zero() {
            return Err("MQTT_CONNECT_TIMEOUT_SECS must be > 0".into());
        }
        if self.device.telemetry_interval.is_zero() {
            return Err("TELEMETRY_INTERVAL_SECS must be > 0".into());
        }
        if self.device.profile.client_id.is_empty() {
            return Err(format!(
                "Profile {} has an empty clientId",
                self.device.profile.name
            ));
        }
        Ok(())
    }
}

fn load_profile(path: &str, name: &str) -> Result<Profile, String> {
    let content =
        std::fs::read_to_string(path).map_err(|e| format!("Failed to read {path}: {e}"))?;
    parse_profile(&content, name).map_err(|e| format!("{path}: {e}"))
}

/// Select one profile from a store shaped `{"<name>": {clientId, userName, password}}`.
pub fn parse_profile(content: &str, name: &str) -> Result<Profile, String> {
    let mut store: HashMap<String, RawProfile> =
        serde_json::from_str(content).map_err(|e| format!("Failed to parse profiles: {e}"))?;

    let raw = store
        .remove(name)
        .ok_or_else(|| format!("No profile named '{name}'"))?;

    Ok(Profile {
        name: name.to_string(),
        client_id: raw.client_id,
        username: raw.user_name,
        password: raw.password,
    })
}
