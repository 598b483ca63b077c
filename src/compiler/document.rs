//! Serializable mirror of the engine's JSON configuration schema.
//!
//! Only the sections and fields this crate emits are modelled. Struct field order is the
//! emitted key order, which keeps documents byte-stable across compiles.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::Allocate;

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub log: LogSection,
    pub api: ApiSection,
    pub stats: StatsSection,
    pub policy: PolicySection,
    pub inbounds: Vec<InboundObject>,
    pub outbounds: Vec<serde_json::Value>,
    pub routing: RoutingSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSection {
    pub loglevel: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiSection {
    pub tag: &'static str,
    pub services: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSection {}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySection {
    pub levels: BTreeMap<String, LevelPolicy>,
    pub system: SystemPolicy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    pub stats_user_uplink: bool,
    pub stats_user_downlink: bool,
    pub stats_user_online: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemPolicy {
    pub stats_inbound_uplink: bool,
    pub stats_inbound_downlink: bool,
    pub stats_outbound_uplink: bool,
    pub stats_outbound_downlink: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundObject {
    pub tag: String,
    pub listen: String,
    pub port: u16,
    pub protocol: &'static str,
    pub settings: InboundSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<SniffingObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocate: Option<Allocate>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InboundSettings {
    Api {
        address: &'static str,
    },
    Vless {
        clients: Vec<ClientObject>,
        decryption: &'static str,
    },
    Vmess {
        clients: Vec<ClientObject>,
    },
    Trojan {
        clients: Vec<ClientObject>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fallbacks: Vec<FallbackObject>,
    },
    Shadowsocks {
        method: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        network: &'static str,
        clients: Vec<ClientObject>,
    },
}

impl InboundSettings {
    pub fn clients_mut(&mut self) -> Option<&mut Vec<ClientObject>> {
        match self {
            Self::Api { .. } => None,
            Self::Vless { clients, .. }
            | Self::Vmess { clients }
            | Self::Trojan { clients, .. }
            | Self::Shadowsocks { clients, .. } => Some(clients),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<&'static str>,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FallbackObject {
    pub dest: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: &'static str,
    pub security: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httpupgrade_settings: Option<HttpUpgradeObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealityObject>,
}

impl StreamSettings {
    pub fn new(network: &'static str, security: &'static str) -> Self {
        Self {
            network,
            security,
            tcp_settings: None,
            ws_settings: None,
            grpc_settings: None,
            http_settings: None,
            httpupgrade_settings: None,
            xhttp_settings: None,
            tls_settings: None,
            reality_settings: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TcpObject {
    pub header: TcpHeaderObject,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TcpHeaderObject {
    None,
    Http { request: HttpRequestObject },
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpRequestObject {
    pub path: Vec<String>,
    pub headers: BTreeMap<&'static str, Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WsObject {
    pub path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcObject {
    pub service_name: String,
    pub multi_mode: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpObject {
    pub path: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpUpgradeObject {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct XhttpObject {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub mode: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsObject {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    pub certificates: Vec<CertificateObject>,
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateObject {
    pub certificate_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealityObject {
    pub show: bool,
    pub dest: String,
    pub xver: u32,
    pub server_names: Vec<String>,
    pub private_key: String,
    pub short_ids: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub spider_x: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SniffingObject {
    pub enabled: bool,
    pub dest_override: Vec<String>,
    pub route_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSection {
    pub domain_strategy: &'static str,
    pub rules: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DnsSection {
    pub servers: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, serde_json::Value>,
}
