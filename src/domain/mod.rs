use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidPort {
        port: u16,
    },
    MissingInbound {
        inbound_id: String,
    },
    MissingClient {
        client_id: String,
    },
    TagConflict {
        tag: String,
    },
    ClientIdentityConflict {
        inbound_id: String,
        identity: String,
    },
    NotRealityInbound {
        inbound_id: String,
    },
    InboundMoved {
        client_id: String,
    },
}

impl DomainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPort { .. } | Self::NotRealityInbound { .. } | Self::InboundMoved { .. } => {
                "invalid_request"
            }
            Self::MissingInbound { .. } | Self::MissingClient { .. } => "not_found",
            Self::TagConflict { .. } | Self::ClientIdentityConflict { .. } => "conflict",
        }
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPort { port } => write!(f, "invalid port: {port}"),
            Self::MissingInbound { inbound_id } => write!(f, "inbound not found: {inbound_id}"),
            Self::MissingClient { client_id } => write!(f, "client not found: {client_id}"),
            Self::TagConflict { tag } => write!(f, "inbound tag already exists: {tag}"),
            Self::ClientIdentityConflict {
                inbound_id,
                identity,
            } => write!(
                f,
                "client identity already exists: inbound_id={inbound_id} identity={identity}"
            ),
            Self::NotRealityInbound { inbound_id } => {
                write!(f, "inbound is not reality-secured: inbound_id={inbound_id}")
            }
            Self::InboundMoved { client_id } => write!(
                f,
                "client cannot move to another inbound: client_id={client_id}"
            ),
        }
    }
}

impl std::error::Error for DomainError {}

pub fn validate_port(port: u16) -> Result<(), DomainError> {
    if port == 0 {
        return Err(DomainError::InvalidPort { port });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vless => "vless",
            Self::Vmess => "vmess",
            Self::Trojan => "trojan",
            Self::Shadowsocks => "shadowsocks",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SsMethod {
    #[serde(rename = "aes-128-gcm")]
    Aes128Gcm,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    Chacha20Poly1305,
    #[serde(rename = "xchacha20-poly1305")]
    Xchacha20Poly1305,
    #[serde(rename = "2022-blake3-aes-128-gcm")]
    Blake3Aes128Gcm,
    #[serde(rename = "2022-blake3-aes-256-gcm")]
    Blake3Aes256Gcm,
    #[serde(rename = "2022-blake3-chacha20-poly1305")]
    Blake3Chacha20Poly1305,
}

impl SsMethod {
    pub const ALL: [SsMethod; 7] = [
        Self::Aes128Gcm,
        Self::Aes256Gcm,
        Self::Chacha20Poly1305,
        Self::Xchacha20Poly1305,
        Self::Blake3Aes128Gcm,
        Self::Blake3Aes256Gcm,
        Self::Blake3Chacha20Poly1305,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Chacha20Poly1305 => "chacha20-poly1305",
            Self::Xchacha20Poly1305 => "xchacha20-poly1305",
            Self::Blake3Aes128Gcm => "2022-blake3-aes-128-gcm",
            Self::Blake3Aes256Gcm => "2022-blake3-aes-256-gcm",
            Self::Blake3Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == raw)
    }

    pub fn is_2022(self) -> bool {
        self.psk_len().is_some()
    }

    /// Raw key length of the 2022 edition methods. Legacy AEAD methods take free-form passwords.
    pub fn psk_len(self) -> Option<usize> {
        match self {
            Self::Blake3Aes128Gcm => Some(16),
            Self::Blake3Aes256Gcm | Self::Blake3Chacha20Poly1305 => Some(32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SsNetwork {
    #[default]
    TcpUdp,
    Tcp,
    Udp,
}

impl SsNetwork {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TcpUdp => "tcp,udp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Fallback {
    pub dest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolSettings {
    Vless,
    Vmess,
    Trojan {
        #[serde(default)]
        fallback: Option<Fallback>,
    },
    Shadowsocks {
        method: SsMethod,
        /// Server-wide key; only meaningful for the 2022 methods.
        #[serde(default)]
        server_psk: String,
        #[serde(default)]
        network: SsNetwork,
    },
}

impl ProtocolSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Vless => Protocol::Vless,
            Self::Vmess => Protocol::Vmess,
            Self::Trojan { .. } => Protocol::Trojan,
            Self::Shadowsocks { .. } => Protocol::Shadowsocks,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TcpHeader {
    #[default]
    None,
    Http {
        path: String,
        #[serde(default)]
        host: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "network", rename_all = "lowercase")]
pub enum TransportSettings {
    Tcp {
        #[serde(default)]
        header: TcpHeader,
    },
    Ws {
        path: String,
        #[serde(default)]
        host: String,
    },
    Grpc {
        service_name: String,
        #[serde(default)]
        multi_mode: bool,
    },
    H2 {
        path: String,
        #[serde(default)]
        hosts: Vec<String>,
    },
    HttpUpgrade {
        path: String,
        #[serde(default)]
        host: String,
    },
    Xhttp {
        path: String,
        #[serde(default)]
        host: String,
        #[serde(default)]
        mode: XhttpMode,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum XhttpMode {
    #[default]
    Auto,
    PacketUp,
    StreamUp,
    StreamOne,
}

impl XhttpMode {
    pub const ALL: [XhttpMode; 4] = [
        Self::Auto,
        Self::PacketUp,
        Self::StreamUp,
        Self::StreamOne,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::PacketUp => "packet-up",
            Self::StreamUp => "stream-up",
            Self::StreamOne => "stream-one",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == raw)
    }
}

impl TransportSettings {
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Ws { .. } => "ws",
            Self::Grpc { .. } => "grpc",
            Self::H2 { .. } => "h2",
            Self::HttpUpgrade { .. } => "httpupgrade",
            Self::Xhttp { .. } => "xhttp",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CertificatePair {
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "security", rename_all = "snake_case")]
pub enum SecuritySettings {
    None,
    Tls {
        #[serde(default)]
        server_name: String,
        #[serde(default)]
        certificate: CertificatePair,
        #[serde(default)]
        alpn: Vec<String>,
        #[serde(default)]
        fingerprint: String,
        /// Tells clients to skip certificate verification (self-signed setups).
        #[serde(default)]
        allow_insecure: bool,
    },
    Reality {
        #[serde(default)]
        dest: String,
        #[serde(default)]
        server_names: Vec<String>,
        #[serde(default)]
        short_ids: Vec<String>,
        #[serde(default)]
        private_key: String,
        #[serde(default)]
        public_key: String,
        #[serde(default = "default_fingerprint")]
        fingerprint: String,
        #[serde(default)]
        spider_x: String,
    },
}

impl SecuritySettings {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tls { .. } => "tls",
            Self::Reality { .. } => "reality",
        }
    }
}

pub fn default_fingerprint() -> String {
    "chrome".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Sniffing {
    pub enabled: bool,
    #[serde(default)]
    pub dest_override: Vec<String>,
    #[serde(default)]
    pub route_only: bool,
}

impl Default for Sniffing {
    fn default() -> Self {
        Self {
            enabled: true,
            dest_override: vec!["http".to_string(), "tls".to_string()],
            route_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AllocateStrategy {
    Always,
    Random,
}

/// Port allocation strategy handed to the engine as is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Allocate {
    pub strategy: AllocateStrategy,
    /// Minutes between reallocations; random strategy only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Inbound {
    pub inbound_id: String,
    pub tag: String,
    #[serde(default)]
    pub remark: String,
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
    pub port: u16,
    pub protocol: ProtocolSettings,
    pub transport: TransportSettings,
    pub security: SecuritySettings,
    #[serde(default)]
    pub sniffing: Sniffing,
    #[serde(default)]
    pub allocate: Option<Allocate>,
}

pub fn default_listen() -> String {
    "0.0.0.0".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Flow {
    #[serde(rename = "xtls-rprx-vision")]
    XtlsRprxVision,
}

impl Flow {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::XtlsRprxVision => "xtls-rprx-vision",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBreach {
    Traffic,
    Expired,
    IpLimit,
}

impl QuotaBreach {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Traffic => "traffic",
            Self::Expired => "expired",
            Self::IpLimit => "ip_limit",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub client_id: String,
    pub inbound_id: String,
    pub label: String,
    /// UUID, password or pre-shared key depending on the inbound protocol.
    pub identity: String,
    #[serde(default)]
    pub flow: Option<Flow>,
    pub enabled: bool,
    /// 0 means unlimited.
    #[serde(default)]
    pub traffic_limit_bytes: u64,
    #[serde(default)]
    pub expiry_at: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    #[serde(default)]
    pub ip_limit: u32,
    pub subscription_token: String,
    #[serde(default)]
    pub disabled_reason: Option<QuotaBreach>,
}

impl Client {
    /// Counter name under which the engine reports this client.
    pub fn stats_tag(&self) -> String {
        client_stats_tag(&self.client_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_at.is_some_and(|at| at <= now)
    }

    pub fn is_over_traffic(&self, used_bytes: u64) -> bool {
        self.traffic_limit_bytes != 0 && used_bytes >= self.traffic_limit_bytes
    }

    /// Whether the client may appear in a compiled document or a subscription.
    pub fn is_eligible_at(&self, now: DateTime<Utc>, used_bytes: u64) -> bool {
        self.enabled && !self.is_expired_at(now) && !self.is_over_traffic(used_bytes)
    }
}

pub fn client_stats_tag(client_id: &str) -> String {
    format!("client:{client_id}")
}

pub fn client_id_from_stats_tag(tag: &str) -> Option<&str> {
    tag.strip_prefix("client:").filter(|id| !id.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientUsage {
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    #[serde(default)]
    pub online_ips: Option<u32>,
    #[serde(default)]
    pub online_observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ClientUsage {
    pub fn total_bytes(&self) -> u64 {
        self.uplink_bytes.saturating_add(self.downlink_bytes)
    }
}

/// Engine routing rule, passed through in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct RoutingRule(pub serde_json::Value);

pub const WHITELIST_RULE_TAG: &str = "whitelist-direct";

impl RoutingRule {
    /// Sends exact matches of `domains` straight out through `direct`.
    pub fn whitelist_direct(domains: &[String]) -> Self {
        let domains: Vec<String> = domains.iter().map(|d| format!("full:{d}")).collect();
        Self(serde_json::json!({
            "type": "field",
            "ruleTag": WHITELIST_RULE_TAG,
            "domain": domains,
            "outboundTag": "direct",
        }))
    }

    pub fn is_whitelist(&self) -> bool {
        self.0.get("ruleTag").and_then(|t| t.as_str()) == Some(WHITELIST_RULE_TAG)
    }
}

/// One domain per line. Blank lines and `#` comments are skipped, duplicates dropped.
pub fn parse_whitelist(text: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_ascii_lowercase()))
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Replaces any earlier whitelist rule with one for `domains`, placed ahead of the rest.
/// An empty list just removes it.
pub fn with_whitelist(rules: &[RoutingRule], domains: &[String]) -> Vec<RoutingRule> {
    let mut out = Vec::with_capacity(rules.len() + 1);
    if !domains.is_empty() {
        out.push(RoutingRule::whitelist_direct(domains));
    }
    out.extend(rules.iter().filter(|r| !r.is_whitelist()).cloned());
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<serde_json::Value>,
    #[serde(default)]
    pub hosts: BTreeMap<String, serde_json::Value>,
}

impl DnsConfig {
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty() && self.hosts.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub block_bittorrent: bool,
    /// Extra outbounds appended after `direct` and `blocked`.
    #[serde(default)]
    pub outbounds: Vec<serde_json::Value>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api_port: default_api_port(),
            block_bittorrent: false,
            outbounds: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "warning".to_string()
}

fn default_api_port() -> u16 {
    10085
}
