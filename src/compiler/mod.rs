//! Turns a store snapshot into the engine's JSON configuration document.
//!
//! `compile` is pure: identical input yields byte-identical output, and any validation
//! failure rejects the whole snapshot.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::{
    domain::{
        Client, ClientUsage, DnsConfig, EngineSettings, Inbound, Protocol, ProtocolSettings,
        RoutingRule, SecuritySettings, SsMethod, TcpHeader, TransportSettings,
    },
    protocol::validate_client_identity,
    state::JsonSnapshotStore,
};

pub mod document;
pub mod shape;

use document::{
    ApiSection, CertificateObject, ClientObject, DnsSection, Document, FallbackObject,
    GrpcObject, HttpObject, HttpRequestObject, HttpUpgradeObject, InboundObject, InboundSettings,
    LevelPolicy, LogSection, PolicySection, RealityObject, RoutingSection, SniffingObject,
    StatsSection, StreamSettings, SystemPolicy, TcpHeaderObject, TcpObject, TlsObject, WsObject,
    XhttpObject,
};
use shape::ValidatedInbound;

pub const API_TAG: &str = "api";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCKED_TAG: &str = "blocked";

const RESERVED_TAGS: [&str; 3] = [API_TAG, DIRECT_TAG, BLOCKED_TAG];

/// `error` and `none` are valid engine levels but are refused here: they also silence the
/// "started" line the launcher waits for.
pub const LOG_LEVELS: [&str; 3] = ["debug", "info", "warning"];
const ENGINE_LOG_LEVELS: [&str; 5] = ["debug", "info", "warning", "error", "none"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileIssue {
    PortConflict {
        port: u16,
        inbound_ids: [String; 2],
    },
    ReservedPort {
        inbound_id: String,
        port: u16,
    },
    TagConflict {
        tag: String,
        inbound_ids: Vec<String>,
    },
    Field {
        inbound_id: String,
        field: String,
        reason: String,
    },
    Client {
        inbound_id: String,
        client_id: String,
        field: &'static str,
        reason: String,
    },
    Engine {
        field: String,
        reason: String,
    },
}

impl CompileIssue {
    /// Every inbound the issue refers to.
    pub fn inbound_ids(&self) -> Vec<&str> {
        match self {
            Self::PortConflict { inbound_ids, .. } => {
                inbound_ids.iter().map(String::as_str).collect()
            }
            Self::TagConflict { inbound_ids, .. } => {
                inbound_ids.iter().map(String::as_str).collect()
            }
            Self::ReservedPort { inbound_id, .. }
            | Self::Field { inbound_id, .. }
            | Self::Client { inbound_id, .. } => vec![inbound_id.as_str()],
            Self::Engine { .. } => Vec::new(),
        }
    }
}

impl std::fmt::Display for CompileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PortConflict {
                port,
                inbound_ids: [a, b],
            } => write!(f, "port {port} is used by both inbound {a} and inbound {b}"),
            Self::ReservedPort { inbound_id, port } => write!(
                f,
                "inbound {inbound_id}: port {port} is reserved for the stats api"
            ),
            Self::TagConflict { tag, inbound_ids } => {
                write!(f, "tag {tag} is used more than once")?;
                if !inbound_ids.is_empty() {
                    write!(f, " (inbounds: {})", inbound_ids.join(", "))?;
                }
                Ok(())
            }
            Self::Field {
                inbound_id,
                field,
                reason,
            } => write!(f, "inbound {inbound_id}: {field}: {reason}"),
            Self::Client {
                inbound_id,
                client_id,
                field,
                reason,
            } => write!(
                f,
                "inbound {inbound_id} client {client_id}: {field}: {reason}"
            ),
            Self::Engine { field, reason } => write!(f, "engine.{field}: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileErrors(pub Vec<CompileIssue>);

impl CompileErrors {
    pub fn issues(&self) -> &[CompileIssue] {
        &self.0
    }
}

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config rejected with {} issue(s)", self.0.len())?;
        for issue in &self.0 {
            write!(f, "; {issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

/// Full snapshot the compiler works from.
#[derive(Debug, Clone)]
pub struct CompileInput {
    pub inbounds: Vec<Inbound>,
    pub clients: Vec<Client>,
    pub usage: BTreeMap<String, ClientUsage>,
    pub routing_rules: Vec<RoutingRule>,
    pub dns: DnsConfig,
    pub engine: EngineSettings,
    pub now: DateTime<Utc>,
}

impl CompileInput {
    pub fn from_store(store: &JsonSnapshotStore, now: DateTime<Utc>) -> Self {
        let state = store.state();
        Self {
            inbounds: state.inbounds.values().cloned().collect(),
            clients: state.clients.values().cloned().collect(),
            usage: store.usage().clients.clone(),
            routing_rules: state.routing_rules.clone(),
            dns: state.dns.clone(),
            engine: state.engine.clone(),
            now,
        }
    }

    fn used_bytes(&self, client_id: &str) -> u64 {
        self.usage
            .get(client_id)
            .map(ClientUsage::total_bytes)
            .unwrap_or(0)
    }
}

/// Compiled engine configuration plus what the supervisor needs to decide how to apply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDocument {
    bytes: Vec<u8>,
    shape_fingerprint: String,
    client_tags: Vec<String>,
}

impl EngineDocument {
    pub fn from_parts(bytes: Vec<u8>, shape_fingerprint: String, client_tags: Vec<String>) -> Self {
        Self {
            bytes,
            shape_fingerprint,
            client_tags,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Hash over everything except client lists and routing rules. Equal fingerprints mean
    /// an in-place reload is enough; a change means listeners moved and the engine restarts.
    pub fn shape_fingerprint(&self) -> &str {
        &self.shape_fingerprint
    }

    /// Stats tags of every client in the document, sorted.
    pub fn client_tags(&self) -> &[String] {
        &self.client_tags
    }
}

pub fn compile(input: &CompileInput) -> Result<EngineDocument, CompileErrors> {
    let mut issues = Vec::new();

    check_engine_settings(&input.engine, &mut issues);

    let mut inbounds: Vec<&Inbound> = input.inbounds.iter().filter(|i| i.enabled).collect();
    inbounds.sort_by(|a, b| (a.port, &a.inbound_id).cmp(&(b.port, &b.inbound_id)));

    check_ports_and_tags(&inbounds, input.engine.api_port, &mut issues);

    let mut validated = Vec::with_capacity(inbounds.len());
    for inbound in &inbounds {
        match ValidatedInbound::check(inbound) {
            Ok(v) => validated.push(v),
            Err(found) => issues.extend(found),
        }
    }

    let mut by_inbound: BTreeMap<&str, Vec<&Client>> = BTreeMap::new();
    for client in &input.clients {
        if client.is_eligible_at(input.now, input.used_bytes(&client.client_id)) {
            by_inbound
                .entry(client.inbound_id.as_str())
                .or_default()
                .push(client);
        }
    }
    for clients in by_inbound.values_mut() {
        clients.sort_by(|a, b| (&a.identity, &a.client_id).cmp(&(&b.identity, &b.client_id)));
    }

    for v in &validated {
        let clients = by_inbound
            .get(v.inbound().inbound_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        check_clients(v, clients, &mut issues);
    }

    if !issues.is_empty() {
        return Err(CompileErrors(issues));
    }

    let mut client_tags = Vec::new();
    let mut inbound_objects = vec![api_inbound(input.engine.api_port)];
    for v in &validated {
        let clients = by_inbound
            .get(v.inbound().inbound_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        // A multi-user shadowsocks listener without users would fall back to single-user
        // mode keyed by the server secret.
        if clients.is_empty() && v.protocol() == Protocol::Shadowsocks {
            continue;
        }
        client_tags.extend(clients.iter().map(|c| c.stats_tag()));
        inbound_objects.push(build_inbound(v, clients));
    }
    client_tags.sort();

    let document = Document {
        log: LogSection {
            loglevel: input.engine.log_level.trim().to_string(),
        },
        api: ApiSection {
            tag: API_TAG,
            services: vec!["StatsService"],
        },
        stats: StatsSection {},
        policy: policy_section(),
        inbounds: inbound_objects,
        outbounds: outbounds(&input.engine),
        routing: routing_section(input),
        dns: (!input.dns.is_empty()).then(|| DnsSection {
            servers: input.dns.servers.clone(),
            hosts: input.dns.hosts.clone(),
        }),
    };

    // Serialising plain structs and BTreeMap-backed values cannot fail.
    let bytes = serde_json::to_vec_pretty(&document).unwrap_or_default();
    let shape_fingerprint = shape_fingerprint(&document);

    Ok(EngineDocument {
        bytes,
        shape_fingerprint,
        client_tags,
    })
}

/// Compiles the current store contents, as the reconciler and admin checks do.
pub fn compile_store(
    store: &JsonSnapshotStore,
    now: DateTime<Utc>,
) -> Result<EngineDocument, CompileErrors> {
    compile(&CompileInput::from_store(store, now))
}

fn check_engine_settings(engine: &EngineSettings, issues: &mut Vec<CompileIssue>) {
    if engine.api_port == 0 {
        issues.push(CompileIssue::Engine {
            field: "api_port".to_string(),
            reason: "api port must be nonzero".to_string(),
        });
    }
    let level = engine.log_level.trim();
    if !LOG_LEVELS.contains(&level) {
        let reason = if ENGINE_LOG_LEVELS.contains(&level) {
            format!("log level {level} hides the engine start line")
        } else {
            format!("log level must be one of {}", LOG_LEVELS.join(", "))
        };
        issues.push(CompileIssue::Engine {
            field: "log_level".to_string(),
            reason,
        });
    }

    let mut seen: BTreeSet<&str> = RESERVED_TAGS.into_iter().collect();
    for (i, outbound) in engine.outbounds.iter().enumerate() {
        let field = format!("outbounds[{i}].tag");
        match outbound.get("tag").and_then(|t| t.as_str()) {
            None => issues.push(CompileIssue::Engine {
                field,
                reason: "outbound must be an object with a string tag".to_string(),
            }),
            Some(tag) if !seen.insert(tag) => issues.push(CompileIssue::Engine {
                field,
                reason: format!("tag {tag} is already in use"),
            }),
            Some(_) => {}
        }
    }
}

fn check_ports_and_tags(inbounds: &[&Inbound], api_port: u16, issues: &mut Vec<CompileIssue>) {
    let mut ports: BTreeMap<u16, &str> = BTreeMap::new();
    for inbound in inbounds {
        if inbound.port == 0 {
            issues.push(CompileIssue::Field {
                inbound_id: inbound.inbound_id.clone(),
                field: "port".to_string(),
                reason: "port must be nonzero".to_string(),
            });
            continue;
        }
        if inbound.port == api_port {
            issues.push(CompileIssue::ReservedPort {
                inbound_id: inbound.inbound_id.clone(),
                port: inbound.port,
            });
        }
        match ports.get(&inbound.port) {
            Some(first) => issues.push(CompileIssue::PortConflict {
                port: inbound.port,
                inbound_ids: [first.to_string(), inbound.inbound_id.clone()],
            }),
            None => {
                ports.insert(inbound.port, &inbound.inbound_id);
            }
        }
    }

    let mut tags: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for inbound in inbounds {
        tags.entry(inbound.tag.as_str())
            .or_default()
            .push(inbound.inbound_id.clone());
    }
    for (tag, inbound_ids) in tags {
        if inbound_ids.len() > 1 || RESERVED_TAGS.contains(&tag) {
            issues.push(CompileIssue::TagConflict {
                tag: tag.to_string(),
                inbound_ids,
            });
        }
    }
}

fn ss_method(inbound: &Inbound) -> Option<SsMethod> {
    match &inbound.protocol {
        ProtocolSettings::Shadowsocks { method, .. } => Some(*method),
        _ => None,
    }
}

fn check_clients(v: &ValidatedInbound<'_>, clients: &[&Client], issues: &mut Vec<CompileIssue>) {
    let inbound = v.inbound();
    let method = ss_method(inbound);
    let mut identities: BTreeMap<&str, &str> = BTreeMap::new();

    for client in clients {
        let issue = |field: &'static str, reason: String| CompileIssue::Client {
            inbound_id: inbound.inbound_id.clone(),
            client_id: client.client_id.clone(),
            field,
            reason,
        };

        if let Err(reason) = validate_client_identity(v.protocol(), method, &client.identity) {
            issues.push(issue("identity", reason.to_string()));
        }
        if let Some(other) = identities.insert(&client.identity, &client.client_id) {
            issues.push(issue(
                "identity",
                format!("identity is already used by client {other}"),
            ));
        }
        if client.flow.is_some() && !v.supports_vision() {
            issues.push(issue(
                "flow",
                "flow requires vless over raw tcp with tls or reality".to_string(),
            ));
        }
    }
}

fn api_inbound(port: u16) -> InboundObject {
    InboundObject {
        tag: API_TAG.to_string(),
        listen: "127.0.0.1".to_string(),
        port,
        protocol: "dokodemo-door",
        settings: InboundSettings::Api {
            address: "127.0.0.1",
        },
        stream_settings: None,
        sniffing: None,
        allocate: None,
    }
}

fn build_inbound(v: &ValidatedInbound<'_>, clients: &[&Client]) -> InboundObject {
    let inbound = v.inbound();

    let client_objects: Vec<ClientObject> = clients
        .iter()
        .map(|client| {
            let (id, password) = match v.protocol() {
                Protocol::Vless | Protocol::Vmess => (Some(client.identity.clone()), None),
                Protocol::Trojan | Protocol::Shadowsocks => (None, Some(client.identity.clone())),
            };
            ClientObject {
                id,
                password,
                email: client.stats_tag(),
                flow: client.flow.map(|f| f.as_str()),
                level: 0,
            }
        })
        .collect();

    let settings = match &inbound.protocol {
        ProtocolSettings::Vless => InboundSettings::Vless {
            clients: client_objects,
            decryption: "none",
        },
        ProtocolSettings::Vmess => InboundSettings::Vmess {
            clients: client_objects,
        },
        ProtocolSettings::Trojan { fallback } => InboundSettings::Trojan {
            clients: client_objects,
            fallbacks: fallback
                .iter()
                .map(|fb| FallbackObject {
                    dest: fb.dest.trim().to_string(),
                })
                .collect(),
        },
        ProtocolSettings::Shadowsocks {
            method,
            server_psk,
            network,
        } => InboundSettings::Shadowsocks {
            method: method.as_str(),
            password: method.is_2022().then(|| server_psk.clone()),
            network: network.as_str(),
            clients: client_objects,
        },
    };

    InboundObject {
        tag: inbound.tag.clone(),
        listen: inbound.listen.trim().to_string(),
        port: inbound.port,
        protocol: v.protocol().as_str(),
        settings,
        stream_settings: Some(stream_settings(&inbound.transport, &inbound.security)),
        sniffing: Some(SniffingObject {
            enabled: inbound.sniffing.enabled,
            dest_override: inbound.sniffing.dest_override.clone(),
            route_only: inbound.sniffing.route_only,
        }),
        allocate: inbound.allocate.clone(),
    }
}

fn stream_settings(transport: &TransportSettings, security: &SecuritySettings) -> StreamSettings {
    let mut stream = StreamSettings::new(transport.network(), security.mode());

    match transport {
        TransportSettings::Tcp { header } => {
            let header = match header {
                TcpHeader::None => TcpHeaderObject::None,
                TcpHeader::Http { path, host } => TcpHeaderObject::Http {
                    request: HttpRequestObject {
                        path: vec![path.clone()],
                        headers: BTreeMap::from([("Host", non_empty(host))]),
                    },
                },
            };
            stream.tcp_settings = Some(TcpObject { header });
        }
        TransportSettings::Ws { path, host } => {
            let mut headers = BTreeMap::new();
            if !host.is_empty() {
                headers.insert("Host", host.clone());
            }
            stream.ws_settings = Some(WsObject {
                path: path.clone(),
                headers,
            });
        }
        TransportSettings::Grpc {
            service_name,
            multi_mode,
        } => {
            stream.grpc_settings = Some(GrpcObject {
                service_name: service_name.clone(),
                multi_mode: *multi_mode,
            });
        }
        TransportSettings::H2 { path, hosts } => {
            stream.http_settings = Some(HttpObject {
                path: path.clone(),
                host: hosts.clone(),
            });
        }
        TransportSettings::HttpUpgrade { path, host } => {
            stream.httpupgrade_settings = Some(HttpUpgradeObject {
                path: path.clone(),
                host: host.clone(),
            });
        }
        TransportSettings::Xhttp { path, host, mode } => {
            stream.xhttp_settings = Some(XhttpObject {
                path: path.clone(),
                host: host.clone(),
                mode: mode.as_str(),
            });
        }
    }

    match security {
        SecuritySettings::None => {}
        SecuritySettings::Tls {
            server_name,
            certificate,
            alpn,
            allow_insecure,
            ..
        } => {
            stream.tls_settings = Some(TlsObject {
                server_name: server_name.clone(),
                alpn: alpn.clone(),
                certificates: vec![CertificateObject {
                    certificate_file: certificate.cert_file.clone(),
                    key_file: certificate.key_file.clone(),
                }],
                allow_insecure: *allow_insecure,
            });
        }
        SecuritySettings::Reality {
            dest,
            server_names,
            short_ids,
            private_key,
            spider_x,
            ..
        } => {
            stream.reality_settings = Some(RealityObject {
                show: false,
                dest: dest.trim().to_string(),
                xver: 0,
                server_names: server_names.iter().map(|s| s.trim().to_string()).collect(),
                private_key: private_key.trim().to_string(),
                short_ids: short_ids.clone(),
                spider_x: spider_x.clone(),
            });
        }
    }

    stream
}

fn non_empty(value: &str) -> Vec<String> {
    if value.is_empty() {
        Vec::new()
    } else {
        vec![value.to_string()]
    }
}

fn policy_section() -> PolicySection {
    PolicySection {
        levels: BTreeMap::from([(
            "0".to_string(),
            LevelPolicy {
                stats_user_uplink: true,
                stats_user_downlink: true,
                stats_user_online: true,
            },
        )]),
        system: SystemPolicy {
            stats_inbound_uplink: true,
            stats_inbound_downlink: true,
            stats_outbound_uplink: true,
            stats_outbound_downlink: true,
        },
    }
}

fn outbounds(engine: &EngineSettings) -> Vec<serde_json::Value> {
    let mut out = vec![
        serde_json::json!({"tag": DIRECT_TAG, "protocol": "freedom"}),
        serde_json::json!({"tag": BLOCKED_TAG, "protocol": "blackhole"}),
    ];
    out.extend(engine.outbounds.iter().cloned());
    out
}

fn routing_section(input: &CompileInput) -> RoutingSection {
    let mut rules = vec![serde_json::json!({
        "type": "field",
        "inboundTag": [API_TAG],
        "outboundTag": API_TAG,
    })];
    if input.engine.block_bittorrent {
        rules.push(serde_json::json!({
            "type": "field",
            "protocol": ["bittorrent"],
            "outboundTag": BLOCKED_TAG,
        }));
    }
    rules.extend(input.routing_rules.iter().map(|r| r.0.clone()));

    RoutingSection {
        domain_strategy: "AsIs",
        rules,
    }
}

fn shape_fingerprint(document: &Document) -> String {
    let mut shape = document.clone();
    for inbound in &mut shape.inbounds {
        if let Some(clients) = inbound.settings.clients_mut() {
            clients.clear();
        }
    }
    shape.routing.rules.clear();

    let bytes = serde_json::to_vec(&shape).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}
