#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;
use wayfarer_services::SecretString;

/// Default config path: `~/.wayfarer/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".wayfarer").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
}

/// Transport/observability settings.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for bearer tokens.
	pub auth_hmac_secret: Option<SecretString>,
}

/// Chat semantics knobs consumed by the session handler.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	/// Maximum message content length in characters.
	pub max_message_chars: usize,
	/// Recent-message window returned with a join ack.
	pub recent_message_limit: usize,
	/// Default member cap applied to rooms created without one.
	pub default_max_members: u32,
	/// Typing indicator rate limit: burst size.
	pub typing_rate_burst: u32,
	/// Typing indicator rate limit: events per rolling minute.
	pub typing_rate_per_minute: u32,
	/// Reaction rate limit: burst size.
	pub reaction_rate_burst: u32,
	/// Reaction rate limit: events per rolling minute.
	pub reaction_rate_per_minute: u32,
	/// Drop rate-limit buckets idle longer than this.
	pub rate_limit_idle_expiry: Duration,
	/// Interval for the rate-limit sweep task.
	pub rate_limit_sweep_interval: Duration,
}

impl Default for ChatSettings {
	fn default() -> Self {
		Self {
			max_message_chars: 2000,
			recent_message_limit: 50,
			default_max_members: 256,
			typing_rate_burst: 5,
			typing_rate_per_minute: 30,
			reaction_rate_burst: 10,
			reaction_rate_per_minute: 120,
			rate_limit_idle_expiry: Duration::from_secs(300),
			rate_limit_sweep_interval: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	max_message_chars: Option<usize>,
	recent_message_limit: Option<usize>,
	default_max_members: Option<u32>,
	typing_rate_burst: Option<u32>,
	typing_rate_per_minute: Option<u32>,
	reaction_rate_burst: Option<u32>,
	reaction_rate_per_minute: Option<u32>,
	rate_limit_idle_expiry_secs: Option<u64>,
	rate_limit_sweep_interval_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ChatSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			chat: ChatSettings {
				max_message_chars: file.chat.max_message_chars.unwrap_or(defaults.max_message_chars),
				recent_message_limit: file.chat.recent_message_limit.unwrap_or(defaults.recent_message_limit),
				default_max_members: file.chat.default_max_members.unwrap_or(defaults.default_max_members),
				typing_rate_burst: file.chat.typing_rate_burst.unwrap_or(defaults.typing_rate_burst),
				typing_rate_per_minute: file.chat.typing_rate_per_minute.unwrap_or(defaults.typing_rate_per_minute),
				reaction_rate_burst: file.chat.reaction_rate_burst.unwrap_or(defaults.reaction_rate_burst),
				reaction_rate_per_minute: file.chat.reaction_rate_per_minute.unwrap_or(defaults.reaction_rate_per_minute),
				rate_limit_idle_expiry: file
					.chat
					.rate_limit_idle_expiry_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.rate_limit_idle_expiry),
				rate_limit_sweep_interval: file
					.chat
					.rate_limit_sweep_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.rate_limit_sweep_interval),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("WAYFARER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WAYFARER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WAYFARER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WAYFARER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WAYFARER_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("WAYFARER_MAX_MESSAGE_CHARS")
		&& let Ok(chars) = v.trim().parse::<usize>()
	{
		cfg.chat.max_message_chars = chars;
		info!(chars, "chat config: max_message_chars overridden by env");
	}

	if let Ok(v) = std::env::var("WAYFARER_RECENT_MESSAGE_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
	{
		cfg.chat.recent_message_limit = limit;
		info!(limit, "chat config: recent_message_limit overridden by env");
	}

	if let Ok(v) = std::env::var("WAYFARER_TYPING_RATE_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.chat.typing_rate_burst = burst;
		info!(burst, "chat config: typing_rate_burst overridden by env");
	}

	if let Ok(v) = std::env::var("WAYFARER_TYPING_RATE_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.chat.typing_rate_per_minute = rate;
		info!(rate, "chat config: typing_rate_per_minute overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_protocol_contract() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.chat.max_message_chars, 2000);
		assert_eq!(cfg.chat.recent_message_limit, 50);
		assert!(cfg.server.auth_hmac_secret.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "s3cret"
			health_bind = "127.0.0.1:8080"

			[chat]
			max_message_chars = 500
			typing_rate_burst = 2
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.chat.max_message_chars, 500);
		assert_eq!(cfg.chat.typing_rate_burst, 2);
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:8080"));
		assert_eq!(cfg.server.auth_hmac_secret.as_ref().map(|s| s.expose()), Some("s3cret"));
	}

	#[test]
	fn blank_strings_are_treated_as_unset() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "  "
			metrics_bind = ""
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.server.metrics_bind.is_none());
	}
}
