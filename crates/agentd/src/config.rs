//! Agent configuration, loaded from a YAML file.

use std::path::{Path, PathBuf};

use miette::{miette, IntoDiagnostic, Result, WrapErr as _};
use serde::Deserialize;

use coffer_proto::tcp_addr;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
	#[serde(default)]
	pub agent: AgentSection,

	/// Whether chunk checksums are verified on reads, writes, and existence
	/// checks. Disabling this trades integrity for speed everywhere at once.
	#[serde(default = "default_true")]
	pub verify_chunk_checksum: bool,

	/// Buffer size for streamed filesystem copies, in bytes.
	#[serde(default = "default_copy_block_size")]
	pub copy_block_size: u64,

	/// Receive timeout for coordinator sockets, in milliseconds.
	#[serde(default = "default_event_probe_timeout")]
	pub event_probe_timeout_ms: i32,

	/// Send/receive timeout for peer data sockets, in milliseconds.
	#[serde(default = "default_failure_timeout")]
	pub failure_timeout_ms: i32,

	#[serde(default)]
	pub tcp: TcpSection,

	/// CurveZMQ keys; when present, all sockets are encrypted.
	#[serde(default)]
	pub curve: Option<CurveSection>,

	pub containers: Vec<ContainerConfig>,

	#[serde(default)]
	pub proxies: Vec<ProxyConfig>,

	#[serde(default)]
	pub log: LogSection,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct AgentSection {
	/// Size of the chunk worker pool.
	#[serde(default = "default_num_workers")]
	pub num_workers: usize,

	/// Bind the data and control sockets on all interfaces instead of `ip`.
	#[serde(default)]
	pub listen_all: bool,

	/// Address of this agent as reachable by proxies and peers.
	#[serde(default = "default_ip")]
	pub ip: String,

	/// Data-plane port.
	#[serde(default = "default_port")]
	pub port: u16,

	/// Control-plane port.
	#[serde(default = "default_cport")]
	pub cport: u16,

	/// Register to the configured proxies on startup.
	#[serde(default = "default_true")]
	pub register_to_proxy: bool,

	/// Flush and sync filesystem chunk files on close.
	#[serde(default)]
	pub flush_on_close: bool,
}

impl Default for AgentSection {
	fn default() -> Self {
		Self {
			num_workers: default_num_workers(),
			listen_all: false,
			ip: default_ip(),
			port: default_port(),
			cport: default_cport(),
			register_to_proxy: true,
			flush_on_close: false,
		}
	}
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TcpSection {
	/// Kernel send/receive buffer size for all sockets, in bytes.
	#[serde(default = "default_tcp_buffer_size")]
	pub buffer_size: i32,

	#[serde(default)]
	pub keepalive: Option<KeepAlive>,
}

impl Default for TcpSection {
	fn default() -> Self {
		Self {
			buffer_size: default_tcp_buffer_size(),
			keepalive: None,
		}
	}
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct KeepAlive {
	pub idle: i32,
	pub interval: i32,
	pub count: i32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CurveSection {
	pub agent_public_key: String,
	pub agent_secret_key: String,
	pub proxy_public_key: String,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerType {
	Fs,
	AwsS3,
	AliOss,
	AzureBlob,
}

impl ContainerType {
	/// Numeric tag used in container summaries on the wire.
	pub fn tag(self) -> u8 {
		match self {
			Self::Fs => 0,
			Self::AwsS3 => 1,
			Self::AliOss => 2,
			Self::AzureBlob => 3,
		}
	}
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
	/// Deployment-unique container id.
	pub id: i32,

	#[serde(rename = "type")]
	pub ctype: ContainerType,

	/// Capacity in bytes. Informational: writes are not rejected on
	/// overflow, admission control is the proxy's job.
	pub capacity: u64,

	/// Directory for filesystem containers.
	#[serde(default)]
	pub path: Option<PathBuf>,

	/// Bucket (S3/OSS) or blob container (Azure) name.
	#[serde(default)]
	pub bucket: Option<String>,

	/// Storage account name (Azure only).
	#[serde(default)]
	pub account: Option<String>,

	/// Secret access key (S3/OSS) or storage account key (Azure).
	#[serde(default)]
	pub key: Option<String>,

	/// Access key id (S3/OSS).
	#[serde(default)]
	pub key_id: Option<String>,

	#[serde(default)]
	pub region: Option<String>,

	/// Service endpoint override (required for OSS).
	#[serde(default)]
	pub endpoint: Option<String>,

	#[serde(default)]
	pub http_proxy: Option<HttpProxy>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpProxy {
	pub ip: String,
	pub port: u16,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
	pub ip: String,
	/// Control-plane port of the proxy coordinator.
	pub cport: u16,
}

impl ProxyConfig {
	pub fn addr(&self) -> String {
		tcp_addr(&self.ip, self.cport)
	}
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
	#[serde(default = "default_log_level")]
	pub level: String,
}

impl Default for LogSection {
	fn default() -> Self {
		Self {
			level: default_log_level(),
		}
	}
}

fn default_true() -> bool {
	true
}

fn default_num_workers() -> usize {
	4
}

fn default_ip() -> String {
	"127.0.0.1".into()
}

fn default_port() -> u16 {
	57002
}

fn default_cport() -> u16 {
	57003
}

fn default_copy_block_size() -> u64 {
	4 << 20
}

fn default_event_probe_timeout() -> i32 {
	5000
}

fn default_failure_timeout() -> i32 {
	30_000
}

fn default_tcp_buffer_size() -> i32 {
	1 << 20
}

fn default_log_level() -> String {
	"info".into()
}

impl Config {
	pub fn load(path: &Path) -> Result<Self> {
		let content = std::fs::read_to_string(path)
			.into_diagnostic()
			.wrap_err_with(|| format!("reading config file {}", path.display()))?;
		Self::from_yaml(&content)
	}

	pub fn from_yaml(content: &str) -> Result<Self> {
		let config: Self = serde_yaml::from_str(content).into_diagnostic()?;
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.agent.num_workers == 0 {
			return Err(miette!("agent.num_workers must be at least 1"));
		}
		if self.containers.is_empty() {
			return Err(miette!("at least one container must be configured"));
		}
		if self.agent.register_to_proxy && self.proxies.is_empty() {
			return Err(miette!(
				"agent.register_to_proxy is set but no proxies are configured"
			));
		}

		let mut seen = std::collections::HashSet::new();
		for c in &self.containers {
			if !seen.insert(c.id) {
				return Err(miette!("duplicate container id {}", c.id));
			}
			match c.ctype {
				ContainerType::Fs => {
					if c.path.is_none() {
						return Err(miette!("fs container {} needs a path", c.id));
					}
				}
				ContainerType::AwsS3 | ContainerType::AliOss => {
					if c.bucket.is_none() || c.key.is_none() || c.key_id.is_none() {
						return Err(miette!(
							"container {} needs bucket, key, and key_id",
							c.id
						));
					}
					if c.ctype == ContainerType::AliOss && c.endpoint.is_none() {
						return Err(miette!("ali-oss container {} needs an endpoint", c.id));
					}
				}
				ContainerType::AzureBlob => {
					if c.bucket.is_none() || c.account.is_none() || c.key.is_none() {
						return Err(miette!(
							"azure-blob container {} needs bucket, account, and key",
							c.id
						));
					}
				}
			}
		}

		Ok(())
	}

	/// IP the agent binds its listening sockets on.
	pub fn listen_ip(&self) -> &str {
		if self.agent.listen_all {
			"0.0.0.0"
		} else {
			&self.agent.ip
		}
	}

	/// Data-plane endpoint as reachable by proxies and peers.
	pub fn data_addr(&self) -> String {
		tcp_addr(&self.agent.ip, self.agent.port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MINIMAL: &str = r#"
containers:
  - { id: 1, type: fs, path: /tmp/c1, capacity: 1048576 }
proxies:
  - { ip: 127.0.0.1, cport: 57101 }
"#;

	#[test]
	fn test_minimal_config_defaults() {
		let config = Config::from_yaml(MINIMAL).unwrap();
		assert_eq!(config.agent.num_workers, 4);
		assert_eq!(config.agent.port, 57002);
		assert_eq!(config.agent.cport, 57003);
		assert!(config.verify_chunk_checksum);
		assert!(config.agent.register_to_proxy);
		assert_eq!(config.copy_block_size, 4 << 20);
		assert_eq!(config.listen_ip(), "127.0.0.1");
		assert_eq!(config.data_addr(), "tcp://127.0.0.1:57002");
		assert_eq!(config.proxies[0].addr(), "tcp://127.0.0.1:57101");
	}

	#[test]
	fn test_listen_all() {
		let yaml = format!("agent: {{ listen_all: true }}\n{MINIMAL}");
		let config = Config::from_yaml(&yaml).unwrap();
		assert_eq!(config.listen_ip(), "0.0.0.0");
	}

	#[test]
	fn test_duplicate_container_ids_rejected() {
		let yaml = r#"
agent: { register_to_proxy: false }
containers:
  - { id: 1, type: fs, path: /tmp/c1, capacity: 1 }
  - { id: 1, type: fs, path: /tmp/c2, capacity: 1 }
"#;
		assert!(Config::from_yaml(yaml).is_err());
	}

	#[test]
	fn test_cloud_containers_require_credentials() {
		let yaml = r#"
agent: { register_to_proxy: false }
containers:
  - { id: 1, type: aws-s3, bucket: b, capacity: 1 }
"#;
		assert!(Config::from_yaml(yaml).is_err());

		let yaml = r#"
agent: { register_to_proxy: false }
containers:
  - { id: 1, type: aws-s3, bucket: b, key: k, key_id: ki, region: us-east-1, capacity: 1 }
"#;
		assert!(Config::from_yaml(yaml).is_ok());
	}

	#[test]
	fn test_oss_requires_endpoint() {
		let yaml = r#"
agent: { register_to_proxy: false }
containers:
  - { id: 1, type: ali-oss, bucket: b, key: k, key_id: ki, capacity: 1 }
"#;
		assert!(Config::from_yaml(yaml).is_err());
	}

	#[test]
	fn test_registration_needs_proxies() {
		let yaml = r#"
containers:
  - { id: 1, type: fs, path: /tmp/c1, capacity: 1 }
"#;
		assert!(Config::from_yaml(yaml).is_err());
	}

	#[test]
	fn test_full_config() {
		let yaml = r#"
agent:
  num_workers: 8
  listen_all: true
  ip: 10.1.2.3
  port: 57012
  cport: 57013
  register_to_proxy: true
  flush_on_close: true
verify_chunk_checksum: false
copy_block_size: 1048576
event_probe_timeout_ms: 1000
failure_timeout_ms: 9000
tcp:
  buffer_size: 262144
  keepalive: { idle: 30, interval: 10, count: 3 }
curve:
  agent_public_key: apk
  agent_secret_key: ask
  proxy_public_key: ppk
containers:
  - { id: 1, type: fs, path: /data/c1, capacity: 1073741824 }
  - { id: 2, type: aws-s3, bucket: b2, region: eu-west-1, key: k, key_id: ki,
      capacity: 1099511627776, http_proxy: { ip: 192.168.0.1, port: 3128 } }
  - { id: 3, type: azure-blob, bucket: c3, account: acct, key: ak, capacity: 1 }
  - { id: 4, type: ali-oss, bucket: b4, key: k, key_id: ki,
      endpoint: "https://oss-cn-hangzhou.aliyuncs.com", capacity: 1 }
proxies:
  - { ip: 127.0.0.1, cport: 57101 }
  - { ip: 127.0.0.2, cport: 57101 }
log:
  level: debug
"#;
		let config = Config::from_yaml(yaml).unwrap();
		assert_eq!(config.agent.num_workers, 8);
		assert!(!config.verify_chunk_checksum);
		assert_eq!(config.containers.len(), 4);
		assert_eq!(config.containers[1].ctype, ContainerType::AwsS3);
		assert_eq!(config.containers[2].ctype.tag(), 3);
		assert_eq!(config.proxies.len(), 2);
		assert!(config.curve.is_some());
		assert_eq!(config.tcp.keepalive.as_ref().unwrap().idle, 30);
	}
}
