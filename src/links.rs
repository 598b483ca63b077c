use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Client, Inbound, Protocol, ProtocolSettings, SecuritySettings, SsMethod, TcpHeader,
        TransportSettings,
    },
    protocol::ss2022_password,
    state::JsonSnapshotStore,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    EmptyHost,
    InboundMismatch {
        client_id: String,
        inbound_id: String,
    },
    MissingRealityPublicKey {
        inbound_id: String,
    },
    UnsupportedScheme {
        uri: String,
    },
    Malformed {
        reason: String,
    },
    YamlSerialize {
        reason: String,
    },
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyHost => write!(f, "public host is empty"),
            Self::InboundMismatch {
                client_id,
                inbound_id,
            } => write!(
                f,
                "client does not belong to inbound: client_id={client_id} inbound_id={inbound_id}"
            ),
            Self::MissingRealityPublicKey { inbound_id } => write!(
                f,
                "reality public key is missing: inbound_id={inbound_id}"
            ),
            Self::UnsupportedScheme { uri } => write!(f, "unsupported link scheme: {uri}"),
            Self::Malformed { reason } => write!(f, "malformed link: {reason}"),
            Self::YamlSerialize { reason } => write!(f, "clash yaml serialize error: {reason}"),
        }
    }
}

impl std::error::Error for LinkError {}

fn malformed(reason: impl Into<String>) -> LinkError {
    LinkError::Malformed {
        reason: reason.into(),
    }
}

/// `scheme://identity@host:port?query#remark` form shared by VLESS and Trojan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlLink {
    pub identity: String,
    pub host: String,
    pub port: u16,
    /// Decoded query parameters in emission order.
    pub params: Vec<(String, String)>,
    pub remark: String,
}

impl UrlLink {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// The JSON object carried base64-encoded by a `vmess://` link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmessLink {
    pub v: String,
    pub ps: String,
    pub add: String,
    pub port: String,
    pub id: String,
    pub aid: String,
    #[serde(default)]
    pub scy: String,
    pub net: String,
    #[serde(rename = "type", default)]
    pub header_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub tls: String,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub alpn: String,
    #[serde(default)]
    pub fp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsLink {
    pub method: SsMethod,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub remark: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareLink {
    Vless(UrlLink),
    Trojan(UrlLink),
    Vmess(VmessLink),
    Shadowsocks(SsLink),
}

impl ShareLink {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Vless(_) => Protocol::Vless,
            Self::Trojan(_) => Protocol::Trojan,
            Self::Vmess(_) => Protocol::Vmess,
            Self::Shadowsocks(_) => Protocol::Shadowsocks,
        }
    }

    pub fn remark(&self) -> &str {
        match self {
            Self::Vless(link) | Self::Trojan(link) => &link.remark,
            Self::Vmess(link) => &link.ps,
            Self::Shadowsocks(link) => &link.remark,
        }
    }

    pub fn to_uri(&self) -> String {
        match self {
            Self::Vless(link) => url_link_to_uri("vless", link),
            Self::Trojan(link) => url_link_to_uri("trojan", link),
            Self::Vmess(link) => {
                // Serializing a struct of plain strings cannot fail.
                let json = serde_json::to_string(link).unwrap_or_default();
                format!(
                    "vmess://{}",
                    base64::engine::general_purpose::STANDARD.encode(json)
                )
            }
            Self::Shadowsocks(link) => {
                let userinfo = if link.method.is_2022() {
                    format!(
                        "{}:{}",
                        link.method.as_str(),
                        percent_encode_rfc3986(&link.password)
                    )
                } else {
                    base64::engine::general_purpose::URL_SAFE_NO_PAD
                        .encode(format!("{}:{}", link.method.as_str(), link.password))
                };
                format!(
                    "ss://{userinfo}@{}:{}#{}",
                    format_host(&link.host),
                    link.port,
                    percent_encode_rfc3986(&link.remark)
                )
            }
        }
    }

    pub fn parse(uri: &str) -> Result<Self, LinkError> {
        let uri = uri.trim();
        let Some((scheme, rest)) = uri.split_once("://") else {
            return Err(LinkError::UnsupportedScheme {
                uri: uri.to_string(),
            });
        };
        match scheme {
            "vless" => parse_url_link(rest).map(Self::Vless),
            "trojan" => parse_url_link(rest).map(Self::Trojan),
            "vmess" => {
                let raw = decode_base64_lenient(rest)?;
                serde_json::from_slice::<VmessLink>(&raw)
                    .map(Self::Vmess)
                    .map_err(|e| malformed(format!("vmess json: {e}")))
            }
            "ss" => parse_ss_link(rest).map(Self::Shadowsocks),
            _ => Err(LinkError::UnsupportedScheme {
                uri: uri.to_string(),
            }),
        }
    }
}

/// Share link for one client of one inbound, addressed at `host`.
pub fn share_link(inbound: &Inbound, client: &Client, host: &str) -> Result<ShareLink, LinkError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(LinkError::EmptyHost);
    }
    if client.inbound_id != inbound.inbound_id {
        return Err(LinkError::InboundMismatch {
            client_id: client.client_id.clone(),
            inbound_id: inbound.inbound_id.clone(),
        });
    }
    let remark = link_remark(inbound, client);

    match &inbound.protocol {
        ProtocolSettings::Vless => {
            let mut params = vec![
                ("type".to_string(), inbound.transport.network().to_string()),
                ("security".to_string(), inbound.security.mode().to_string()),
                ("encryption".to_string(), "none".to_string()),
            ];
            if let Some(flow) = client.flow {
                params.push(("flow".to_string(), flow.as_str().to_string()));
            }
            push_security_params(&mut params, inbound)?;
            push_transport_params(&mut params, &inbound.transport);
            Ok(ShareLink::Vless(UrlLink {
                identity: client.identity.clone(),
                host: host.to_string(),
                port: inbound.port,
                params,
                remark,
            }))
        }
        ProtocolSettings::Trojan { .. } => {
            let mut params = vec![
                ("type".to_string(), inbound.transport.network().to_string()),
                ("security".to_string(), inbound.security.mode().to_string()),
            ];
            push_security_params(&mut params, inbound)?;
            push_transport_params(&mut params, &inbound.transport);
            Ok(ShareLink::Trojan(UrlLink {
                identity: client.identity.clone(),
                host: host.to_string(),
                port: inbound.port,
                params,
                remark,
            }))
        }
        ProtocolSettings::Vmess => Ok(ShareLink::Vmess(vmess_link(
            inbound, client, host, remark,
        ))),
        ProtocolSettings::Shadowsocks {
            method, server_psk, ..
        } => {
            let password = if method.is_2022() {
                ss2022_password(server_psk, &client.identity)
            } else {
                client.identity.clone()
            };
            Ok(ShareLink::Shadowsocks(SsLink {
                method: *method,
                password,
                host: host.to_string(),
                port: inbound.port,
                remark,
            }))
        }
    }
}

fn link_remark(inbound: &Inbound, client: &Client) -> String {
    if inbound.remark.trim().is_empty() {
        client.label.clone()
    } else {
        format!("{} | {}", inbound.remark, client.label)
    }
}

fn push_security_params(
    params: &mut Vec<(String, String)>,
    inbound: &Inbound,
) -> Result<(), LinkError> {
    match &inbound.security {
        SecuritySettings::None => {}
        SecuritySettings::Tls {
            server_name,
            alpn,
            fingerprint,
            allow_insecure,
            ..
        } => {
            if !server_name.is_empty() {
                params.push(("sni".to_string(), server_name.clone()));
            }
            if !fingerprint.is_empty() {
                params.push(("fp".to_string(), fingerprint.clone()));
            }
            if !alpn.is_empty() {
                params.push(("alpn".to_string(), alpn.join(",")));
            }
            // v2rayN reads `allowInsecure`, sing-box based clients read `insecure`.
            if *allow_insecure {
                params.push(("allowInsecure".to_string(), "1".to_string()));
                params.push(("insecure".to_string(), "1".to_string()));
            }
        }
        SecuritySettings::Reality {
            server_names,
            short_ids,
            public_key,
            fingerprint,
            spider_x,
            ..
        } => {
            if public_key.is_empty() {
                return Err(LinkError::MissingRealityPublicKey {
                    inbound_id: inbound.inbound_id.clone(),
                });
            }
            params.push(("pbk".to_string(), public_key.clone()));
            if let Some(short_id) = short_ids.first() {
                params.push(("sid".to_string(), short_id.clone()));
            }
            if let Some(server_name) = server_names.first() {
                params.push(("sni".to_string(), server_name.clone()));
            }
            params.push(("fp".to_string(), fingerprint.clone()));
            if !spider_x.is_empty() {
                params.push(("spx".to_string(), spider_x.clone()));
            }
        }
    }
    Ok(())
}

fn push_transport_params(params: &mut Vec<(String, String)>, transport: &TransportSettings) {
    let mut push_nonempty = |key: &str, value: &str| {
        if !value.is_empty() {
            params.push((key.to_string(), value.to_string()));
        }
    };
    match transport {
        TransportSettings::Tcp { header } => {
            if let TcpHeader::Http { path, host } = header {
                push_nonempty("headerType", "http");
                push_nonempty("path", path);
                push_nonempty("host", host);
            }
        }
        TransportSettings::Ws { path, host } | TransportSettings::HttpUpgrade { path, host } => {
            push_nonempty("path", path);
            push_nonempty("host", host);
        }
        TransportSettings::Grpc {
            service_name,
            multi_mode,
        } => {
            push_nonempty("serviceName", service_name);
            if *multi_mode {
                push_nonempty("mode", "multi");
            }
        }
        TransportSettings::H2 { path, hosts } => {
            push_nonempty("path", path);
            push_nonempty("host", &hosts.join(","));
        }
        TransportSettings::Xhttp { path, host, mode } => {
            push_nonempty("path", path);
            push_nonempty("host", host);
            push_nonempty("mode", mode.as_str());
        }
    }
}

fn vmess_link(inbound: &Inbound, client: &Client, host: &str, remark: String) -> VmessLink {
    let (header_type, path, transport_host) = match &inbound.transport {
        TransportSettings::Tcp {
            header: TcpHeader::None,
        } => ("none", String::new(), String::new()),
        TransportSettings::Tcp {
            header: TcpHeader::Http { path, host },
        } => ("http", path.clone(), host.clone()),
        TransportSettings::Ws { path, host } | TransportSettings::HttpUpgrade { path, host } => {
            ("none", path.clone(), host.clone())
        }
        TransportSettings::Grpc {
            service_name,
            multi_mode,
        } => (
            if *multi_mode { "multi" } else { "gun" },
            service_name.clone(),
            String::new(),
        ),
        TransportSettings::H2 { path, hosts } => ("none", path.clone(), hosts.join(",")),
        TransportSettings::Xhttp { path, host, mode } => (mode.as_str(), path.clone(), host.clone()),
    };

    let (tls, sni, alpn, fp) = match &inbound.security {
        SecuritySettings::Tls {
            server_name,
            alpn,
            fingerprint,
            ..
        } => (
            "tls",
            server_name.clone(),
            alpn.join(","),
            fingerprint.clone(),
        ),
        // VMess has no Reality mode; the compiler rejects that combination.
        SecuritySettings::None | SecuritySettings::Reality { .. } => {
            ("", String::new(), String::new(), String::new())
        }
    };

    VmessLink {
        v: "2".to_string(),
        ps: remark,
        add: host.to_string(),
        port: inbound.port.to_string(),
        id: client.identity.clone(),
        aid: "0".to_string(),
        scy: "auto".to_string(),
        net: inbound.transport.network().to_string(),
        header_type: header_type.to_string(),
        host: transport_host,
        path,
        tls: tls.to_string(),
        sni,
        alpn,
        fp,
    }
}

fn url_link_to_uri(scheme: &str, link: &UrlLink) -> String {
    let query = link
        .params
        .iter()
        .map(|(k, v)| format!("{k}={}", percent_encode_rfc3986(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!(
        "{scheme}://{}@{}:{}?{query}#{}",
        percent_encode_rfc3986(&link.identity),
        format_host(&link.host),
        link.port,
        percent_encode_rfc3986(&link.remark)
    )
}

fn parse_url_link(rest: &str) -> Result<UrlLink, LinkError> {
    let (rest, remark) = split_remark(rest)?;
    let (authority, query) = match rest.split_once('?') {
        Some((authority, query)) => (authority, query),
        None => (rest, ""),
    };
    let (identity, host_port) = authority
        .rsplit_once('@')
        .ok_or_else(|| malformed("missing identity"))?;
    let (host, port) = parse_host_port(host_port)?;

    let mut params = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params.push((percent_decode(k)?, percent_decode(v)?));
    }

    Ok(UrlLink {
        identity: percent_decode(identity)?,
        host,
        port,
        params,
        remark,
    })
}

fn parse_ss_link(rest: &str) -> Result<SsLink, LinkError> {
    let (rest, remark) = split_remark(rest)?;
    let (userinfo, host_port) = rest
        .rsplit_once('@')
        .ok_or_else(|| malformed("missing userinfo"))?;
    let (host, port) = parse_host_port(host_port)?;

    // Plain `method:password` userinfo is only emitted for 2022 methods; base64 has no ':'.
    let (method, password) = match userinfo.split_once(':') {
        Some((method, password)) => (method.to_string(), percent_decode(password)?),
        None => {
            let raw = decode_base64_lenient(userinfo)?;
            let text = String::from_utf8(raw).map_err(|_| malformed("userinfo is not utf-8"))?;
            let (method, password) = text
                .split_once(':')
                .ok_or_else(|| malformed("userinfo has no method"))?;
            (method.to_string(), password.to_string())
        }
    };
    let method = SsMethod::parse(&method)
        .ok_or_else(|| malformed(format!("unknown shadowsocks method: {method}")))?;

    Ok(SsLink {
        method,
        password,
        host,
        port,
        remark,
    })
}

fn split_remark(rest: &str) -> Result<(&str, String), LinkError> {
    match rest.split_once('#') {
        Some((rest, remark)) => Ok((rest, percent_decode(remark)?)),
        None => Ok((rest, String::new())),
    }
}

fn parse_host_port(input: &str) -> Result<(String, u16), LinkError> {
    let input = input.trim_end_matches('/');
    let (host, port) = input
        .rsplit_once(':')
        .ok_or_else(|| malformed("missing port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| malformed(format!("invalid port: {port}")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(malformed("missing host"));
    }
    Ok((host.to_string(), port))
}

fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn decode_base64_lenient(input: &str) -> Result<Vec<u8>, LinkError> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    let input = input.trim();
    [STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(input).ok())
        .ok_or_else(|| malformed("invalid base64"))
}

/// Links for every client holding `token` that may currently connect.
pub fn eligible_links_for_token(
    store: &JsonSnapshotStore,
    token: &str,
    host: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ShareLink>, LinkError> {
    let mut pairs = Vec::new();
    for client in store.clients_for_token(token) {
        let Some(inbound) = store.get_inbound(&client.inbound_id) else {
            continue;
        };
        let used = store.get_client_usage(&client.client_id).total_bytes();
        if !inbound.enabled || !client.is_eligible_at(now, used) {
            continue;
        }
        pairs.push((inbound, client));
    }
    pairs.sort_by(|(ia, ca), (ib, cb)| {
        (ia.port, &ia.inbound_id, &ca.client_id).cmp(&(ib.port, &ib.inbound_id, &cb.client_id))
    });

    pairs
        .iter()
        .map(|(inbound, client)| share_link(inbound, client, host))
        .collect()
}

/// Standard base64 of the newline-joined URIs, as subscription clients expect.
pub fn build_subscription_base64(links: &[ShareLink]) -> String {
    let lines: Vec<String> = links.iter().map(ShareLink::to_uri).collect();
    base64::engine::general_purpose::STANDARD.encode(join_lines_with_trailing_newline(&lines))
}

/// Hours between refreshes suggested to subscription clients.
pub const PROFILE_UPDATE_INTERVAL_HOURS: u32 = 12;

/// Traffic and expiry figures a subscription client shows next to the profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub upload: u64,
    pub download: u64,
    /// 0 means unlimited.
    pub total: u64,
    pub expire: Option<DateTime<Utc>>,
}

impl SubscriptionInfo {
    /// Value of the `subscription-userinfo` header.
    pub fn userinfo_header(&self) -> String {
        let mut out = format!(
            "upload={}; download={}; total={}",
            self.upload, self.download, self.total
        );
        if let Some(expire) = self.expire {
            out.push_str(&format!("; expire={}", expire.timestamp().max(0)));
        }
        out
    }
}

/// Usage summed over every client holding `token`, disabled ones included. The limit is
/// unlimited as soon as one client is, and the earliest expiry wins.
pub fn subscription_info(store: &JsonSnapshotStore, token: &str) -> SubscriptionInfo {
    let clients = store.clients_for_token(token);
    let mut info = SubscriptionInfo::default();
    let mut unlimited = clients.is_empty();
    for client in &clients {
        let usage = store.get_client_usage(&client.client_id);
        info.upload = info.upload.saturating_add(usage.uplink_bytes);
        info.download = info.download.saturating_add(usage.downlink_bytes);
        if client.traffic_limit_bytes == 0 {
            unlimited = true;
        }
        info.total = info.total.saturating_add(client.traffic_limit_bytes);
        info.expire = match (info.expire, client.expiry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
    if unlimited {
        info.total = 0;
    }
    info
}

/// Response headers sent with a subscription body.
pub fn subscription_headers(info: &SubscriptionInfo, title: &str) -> Vec<(&'static str, String)> {
    let mut headers = Vec::with_capacity(3);
    if !title.is_empty() {
        headers.push((
            "profile-title",
            format!(
                "base64:{}",
                base64::engine::general_purpose::STANDARD.encode(title)
            ),
        ));
    }
    headers.push(("subscription-userinfo", info.userinfo_header()));
    headers.push((
        "profile-update-interval",
        PROFILE_UPDATE_INTERVAL_HOURS.to_string(),
    ));
    headers
}

pub fn decode_subscription(body: &str) -> Result<Vec<String>, LinkError> {
    let raw = decode_base64_lenient(body)?;
    let text = String::from_utf8(raw).map_err(|_| malformed("subscription is not utf-8"))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn build_clash_yaml(links: &[ShareLink]) -> Result<String, LinkError> {
    let cfg = ClashConfig {
        proxies: links.iter().map(clash_proxy).collect(),
    };
    serde_yaml::to_string(&cfg).map_err(|e| LinkError::YamlSerialize {
        reason: e.to_string(),
    })
}

fn join_lines_with_trailing_newline(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn percent_encode_rfc3986(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &c in input.as_bytes() {
        let is_unreserved =
            matches!(c, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~');
        if is_unreserved {
            out.push(c as char);
        } else {
            out.push_str(&format!("%{c:02X}"));
        }
    }
    out
}

fn percent_decode(input: &str) -> Result<String, LinkError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| malformed("invalid percent escape"))?;
                out.push(hex);
                i += 3;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| malformed("percent-decoded text is not utf-8"))
}

#[derive(Debug, Clone, Serialize)]
struct ClashConfig {
    proxies: Vec<ClashProxy>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashProxy {
    name: String,
    #[serde(rename = "type")]
    proxy_type: &'static str,
    server: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cipher: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    servername: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alpn: Option<Vec<String>>,
    #[serde(
        rename = "client-fingerprint",
        skip_serializing_if = "Option::is_none"
    )]
    client_fingerprint: Option<String>,
    #[serde(rename = "reality-opts", skip_serializing_if = "Option::is_none")]
    reality_opts: Option<ClashRealityOpts>,
    #[serde(rename = "ws-opts", skip_serializing_if = "Option::is_none")]
    ws_opts: Option<ClashWsOpts>,
    #[serde(rename = "grpc-opts", skip_serializing_if = "Option::is_none")]
    grpc_opts: Option<ClashGrpcOpts>,
    #[serde(rename = "h2-opts", skip_serializing_if = "Option::is_none")]
    h2_opts: Option<ClashH2Opts>,
    #[serde(rename = "xhttp-opts", skip_serializing_if = "Option::is_none")]
    xhttp_opts: Option<ClashXhttpOpts>,
    #[serde(rename = "skip-cert-verify", skip_serializing_if = "std::ops::Not::not")]
    skip_cert_verify: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashRealityOpts {
    #[serde(rename = "public-key")]
    public_key: String,
    #[serde(rename = "short-id")]
    short_id: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashWsOpts {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<ClashHostHeader>,
    #[serde(
        rename = "v2ray-http-upgrade",
        skip_serializing_if = "std::ops::Not::not"
    )]
    http_upgrade: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashHostHeader {
    #[serde(rename = "Host")]
    host: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashGrpcOpts {
    #[serde(rename = "grpc-service-name")]
    service_name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashH2Opts {
    path: String,
    host: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ClashXhttpOpts {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    mode: String,
}

impl ClashProxy {
    fn base(name: &str, proxy_type: &'static str, server: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            proxy_type,
            server: server.to_string(),
            port,
            uuid: None,
            password: None,
            cipher: None,
            alter_id: None,
            network: None,
            udp: true,
            tls: None,
            flow: None,
            servername: None,
            sni: None,
            alpn: None,
            client_fingerprint: None,
            reality_opts: None,
            ws_opts: None,
            grpc_opts: None,
            h2_opts: None,
            xhttp_opts: None,
            skip_cert_verify: false,
        }
    }

    /// Applies the transport and security query parameters of a VLESS/Trojan link.
    fn apply_url_params(&mut self, link: &UrlLink, sni_key_is_servername: bool) {
        let param = |key: &str| link.param(key).filter(|v| !v.is_empty()).map(str::to_string);
        let network = link.param("type").unwrap_or("tcp");
        let path = param("path").unwrap_or_else(|| "/".to_string());
        let host_header = param("host").map(|host| ClashHostHeader { host });

        match network {
            "ws" | "httpupgrade" => {
                self.network = Some("ws".to_string());
                self.ws_opts = Some(ClashWsOpts {
                    path,
                    headers: host_header,
                    http_upgrade: network == "httpupgrade",
                });
            }
            "grpc" => {
                self.network = Some("grpc".to_string());
                self.grpc_opts = Some(ClashGrpcOpts {
                    service_name: param("serviceName").unwrap_or_default(),
                });
            }
            "h2" => {
                self.network = Some("h2".to_string());
                self.h2_opts = Some(ClashH2Opts {
                    path,
                    host: param("host")
                        .map(|hosts| hosts.split(',').map(str::to_string).collect())
                        .unwrap_or_default(),
                });
            }
            "xhttp" => {
                self.network = Some("xhttp".to_string());
                self.xhttp_opts = Some(ClashXhttpOpts {
                    path,
                    host: param("host"),
                    mode: param("mode").unwrap_or_else(|| "auto".to_string()),
                });
            }
            _ => self.network = Some("tcp".to_string()),
        }

        let security = link.param("security").unwrap_or("none");
        if security == "none" {
            return;
        }
        self.tls = Some(true);
        if sni_key_is_servername {
            self.servername = param("sni");
        } else {
            self.sni = param("sni");
        }
        self.client_fingerprint = param("fp");
        self.alpn = param("alpn").map(|a| a.split(',').map(str::to_string).collect());
        self.skip_cert_verify = matches!(link.param("allowInsecure"), Some("1" | "true"))
            || matches!(link.param("insecure"), Some("1" | "true"));
        if security == "reality" {
            self.reality_opts = Some(ClashRealityOpts {
                public_key: param("pbk").unwrap_or_default(),
                short_id: param("sid").unwrap_or_default(),
            });
        }
    }
}

fn clash_proxy(link: &ShareLink) -> ClashProxy {
    match link {
        ShareLink::Vless(link) => {
            let mut proxy = ClashProxy::base(&link.remark, "vless", &link.host, link.port);
            proxy.uuid = Some(link.identity.clone());
            proxy.flow = link.param("flow").map(str::to_string);
            proxy.apply_url_params(link, true);
            proxy
        }
        ShareLink::Trojan(link) => {
            let mut proxy = ClashProxy::base(&link.remark, "trojan", &link.host, link.port);
            proxy.password = Some(link.identity.clone());
            proxy.apply_url_params(link, false);
            // Trojan always runs inside TLS in Clash; the flag is implied.
            proxy.tls = None;
            proxy
        }
        ShareLink::Vmess(link) => {
            let port = link.port.parse().unwrap_or_default();
            let mut proxy = ClashProxy::base(&link.ps, "vmess", &link.add, port);
            proxy.uuid = Some(link.id.clone());
            proxy.alter_id = Some(link.aid.parse().unwrap_or_default());
            proxy.cipher = Some(if link.scy.is_empty() {
                "auto".to_string()
            } else {
                link.scy.clone()
            });
            let mut params = vec![
                ("type".to_string(), link.net.clone()),
                (
                    "security".to_string(),
                    if link.tls.is_empty() {
                        "none".to_string()
                    } else {
                        link.tls.clone()
                    },
                ),
                ("sni".to_string(), link.sni.clone()),
                ("fp".to_string(), link.fp.clone()),
                ("alpn".to_string(), link.alpn.clone()),
                ("host".to_string(), link.host.clone()),
                ("path".to_string(), link.path.clone()),
            ];
            if link.net == "grpc" {
                params.push(("serviceName".to_string(), link.path.clone()));
            }
            if link.net == "xhttp" {
                params.push(("mode".to_string(), link.header_type.clone()));
            }
            let as_url = UrlLink {
                identity: link.id.clone(),
                host: link.add.clone(),
                port,
                params,
                remark: link.ps.clone(),
            };
            proxy.apply_url_params(&as_url, true);
            proxy
        }
        ShareLink::Shadowsocks(link) => {
            let mut proxy = ClashProxy::base(&link.remark, "ss", &link.host, link.port);
            proxy.cipher = Some(link.method.as_str().to_string());
            proxy.password = Some(link.password.clone());
            proxy
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        compiler::compile_store,
        domain::{CertificatePair, Flow, Sniffing, SsNetwork, XhttpMode, default_listen},
        state::{
            InboundInput, UsageSample,
            tests::{client_input, reality_input, test_init},
        },
    };
    use pretty_assertions::assert_eq;
    use serde_yaml::Value;

    fn inbound(
        protocol: ProtocolSettings,
        transport: TransportSettings,
        security: SecuritySettings,
    ) -> Inbound {
        Inbound {
            inbound_id: "i1".to_string(),
            tag: "in-1".to_string(),
            remark: "edge".to_string(),
            enabled: true,
            listen: default_listen(),
            port: 443,
            protocol,
            transport,
            security,
            sniffing: Sniffing::default(),
            allocate: None,
        }
    }

    fn client(identity: &str) -> Client {
        Client {
            client_id: "c1".to_string(),
            inbound_id: "i1".to_string(),
            label: "alice phone".to_string(),
            identity: identity.to_string(),
            flow: None,
            enabled: true,
            traffic_limit_bytes: 0,
            expiry_at: None,
            ip_limit: 0,
            subscription_token: "sub_1".to_string(),
            disabled_reason: None,
        }
    }

    fn reality() -> SecuritySettings {
        SecuritySettings::Reality {
            dest: "www.example.com:443".to_string(),
            server_names: vec!["www.example.com".to_string()],
            short_ids: vec!["0123456789abcdef".to_string()],
            private_key: "priv".to_string(),
            public_key: "PUBKEY_x-y".to_string(),
            fingerprint: "chrome".to_string(),
            spider_x: "/".to_string(),
        }
    }

    fn tls() -> SecuritySettings {
        SecuritySettings::Tls {
            server_name: "proxy.example.com".to_string(),
            certificate: Default::default(),
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            fingerprint: "firefox".to_string(),
            allow_insecure: false,
        }
    }

    fn tcp() -> TransportSettings {
        TransportSettings::Tcp {
            header: TcpHeader::None,
        }
    }

    #[test]
    fn vless_reality_vision_link_round_trips() {
        let ib = inbound(ProtocolSettings::Vless, tcp(), reality());
        let mut c = client("11111111-1111-1111-1111-111111111111");
        c.flow = Some(Flow::XtlsRprxVision);

        let link = share_link(&ib, &c, "example.com").unwrap();
        let uri = link.to_uri();
        assert_eq!(
            uri,
            "vless://11111111-1111-1111-1111-111111111111@example.com:443?type=tcp&security=reality&encryption=none&flow=xtls-rprx-vision&pbk=PUBKEY_x-y&sid=0123456789abcdef&sni=www.example.com&fp=chrome&spx=%2F#edge%20%7C%20alice%20phone"
        );
        assert_eq!(ShareLink::parse(&uri).unwrap(), link);
        assert_eq!(link.remark(), "edge | alice phone");
    }

    #[test]
    fn trojan_ws_tls_link_carries_transport_params() {
        let ib = inbound(
            ProtocolSettings::Trojan { fallback: None },
            TransportSettings::Ws {
                path: "/ray ws".to_string(),
                host: "cdn.example.com".to_string(),
            },
            tls(),
        );
        let link = share_link(&ib, &client("pa+ss/word"), "example.com").unwrap();
        let uri = link.to_uri();
        assert!(uri.starts_with("trojan://pa%2Bss%2Fword@example.com:443?type=ws&security=tls"));
        assert!(uri.contains("&alpn=h2%2Chttp%2F1.1"));
        assert!(uri.contains("&path=%2Fray%20ws&host=cdn.example.com"));

        let ShareLink::Trojan(parsed) = ShareLink::parse(&uri).unwrap() else {
            panic!("expected trojan link");
        };
        assert_eq!(parsed.identity, "pa+ss/word");
        assert_eq!(parsed.param("path"), Some("/ray ws"));
        assert_eq!(parsed.param("alpn"), Some("h2,http/1.1"));
    }

    #[test]
    fn grpc_multi_mode_is_flagged() {
        let ib = inbound(
            ProtocolSettings::Vless,
            TransportSettings::Grpc {
                service_name: "tunnel".to_string(),
                multi_mode: true,
            },
            reality(),
        );
        let ShareLink::Vless(link) = share_link(&ib, &client("u"), "h").unwrap() else {
            panic!("expected vless link");
        };
        assert_eq!(link.param("serviceName"), Some("tunnel"));
        assert_eq!(link.param("mode"), Some("multi"));
    }

    #[test]
    fn h2_link_keeps_every_host() {
        let ib = inbound(
            ProtocolSettings::Vless,
            TransportSettings::H2 {
                path: "/h2".to_string(),
                hosts: vec!["a.example.com".to_string(), "b.example.com".to_string()],
            },
            tls(),
        );
        let link = share_link(&ib, &client("u"), "example.com").unwrap();
        let uri = link.to_uri();
        assert!(uri.contains("&path=%2Fh2&host=a.example.com%2Cb.example.com"));
        assert_eq!(ShareLink::parse(&uri).unwrap(), link);

        let yaml = build_clash_yaml(&[link]).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let h2 = &doc["proxies"][0]["h2-opts"];
        assert_eq!(h2["path"], Value::from("/h2"));
        assert_eq!(
            h2["host"],
            Value::from(vec!["a.example.com", "b.example.com"])
        );
    }

    #[test]
    fn httpupgrade_link_round_trips() {
        let ib = inbound(
            ProtocolSettings::Trojan { fallback: None },
            TransportSettings::HttpUpgrade {
                path: "/up".to_string(),
                host: "cdn.example.com".to_string(),
            },
            tls(),
        );
        let link = share_link(&ib, &client("secret"), "example.com").unwrap();
        let uri = link.to_uri();
        assert!(uri.contains("?type=httpupgrade&security=tls"));
        assert!(uri.contains("&path=%2Fup&host=cdn.example.com"));
        assert_eq!(ShareLink::parse(&uri).unwrap(), link);

        let yaml = build_clash_yaml(&[link]).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let ws = &doc["proxies"][0]["ws-opts"];
        assert_eq!(ws["path"], Value::from("/up"));
        assert_eq!(ws["headers"]["Host"], Value::from("cdn.example.com"));
        assert_eq!(ws["v2ray-http-upgrade"], Value::from(true));
    }

    #[test]
    fn xhttp_inbound_compiles_and_links_with_matching_settings() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let ib = store
            .create_inbound(InboundInput {
                transport: TransportSettings::Xhttp {
                    path: "/xh".to_string(),
                    host: "cdn.example.com".to_string(),
                    mode: XhttpMode::StreamUp,
                },
                security: SecuritySettings::Tls {
                    server_name: "edge.example.com".to_string(),
                    certificate: CertificatePair {
                        cert_file: "/etc/ssl/edge.crt".to_string(),
                        key_file: "/etc/ssl/edge.key".to_string(),
                    },
                    alpn: Vec::new(),
                    fingerprint: String::new(),
                    allow_insecure: true,
                },
                ..reality_input(443)
            })
            .unwrap();
        let c = store.create_client(client_input(&ib.inbound_id, "alice")).unwrap();

        let doc = compile_store(&store, Utc::now()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(doc.as_bytes()).unwrap();
        let stream = &value["inbounds"][1]["streamSettings"];
        assert_eq!(stream["network"], "xhttp");
        assert_eq!(stream["tlsSettings"]["allowInsecure"], serde_json::json!(true));
        assert_eq!(value["inbounds"][1]["settings"]["clients"][0]["id"], c.identity);

        let uri = share_link(&ib, &c, "example.com").unwrap().to_uri();
        let ShareLink::Vless(parsed) = ShareLink::parse(&uri).unwrap() else {
            panic!("expected vless link");
        };
        assert_eq!(parsed.identity, c.identity);
        assert_eq!(parsed.param("type"), stream["network"].as_str());
        assert_eq!(parsed.param("path"), stream["xhttpSettings"]["path"].as_str());
        assert_eq!(parsed.param("host"), stream["xhttpSettings"]["host"].as_str());
        assert_eq!(parsed.param("mode"), stream["xhttpSettings"]["mode"].as_str());
        assert_eq!(parsed.param("sni"), Some("edge.example.com"));
        assert_eq!(parsed.param("allowInsecure"), Some("1"));
        assert_eq!(parsed.param("insecure"), Some("1"));

        let yaml = build_clash_yaml(&[ShareLink::Vless(parsed)]).unwrap();
        let proxy: Value = serde_yaml::from_str::<Value>(&yaml).unwrap()["proxies"][0].clone();
        assert_eq!(proxy["network"], Value::from("xhttp"));
        assert_eq!(proxy["xhttp-opts"]["mode"], Value::from("stream-up"));
        assert_eq!(proxy["skip-cert-verify"], Value::from(true));
    }

    #[test]
    fn vmess_xhttp_carries_mode_in_type() {
        let ib = inbound(
            ProtocolSettings::Vmess,
            TransportSettings::Xhttp {
                path: "/xh".to_string(),
                host: String::new(),
                mode: XhttpMode::PacketUp,
            },
            tls(),
        );
        let link = share_link(&ib, &client("22222222-2222-2222-2222-222222222222"), "h").unwrap();
        let ShareLink::Vmess(vmess) = &link else {
            panic!("expected vmess link");
        };
        assert_eq!(vmess.net, "xhttp");
        assert_eq!(vmess.header_type, "packet-up");
        assert_eq!(vmess.path, "/xh");
        assert_eq!(ShareLink::parse(&link.to_uri()).unwrap(), link);
    }

    #[test]
    fn vmess_link_is_base64_json() {
        let ib = inbound(
            ProtocolSettings::Vmess,
            TransportSettings::Tcp {
                header: TcpHeader::Http {
                    path: "/index".to_string(),
                    host: "www.bing.com".to_string(),
                },
            },
            tls(),
        );
        let link = share_link(&ib, &client("22222222-2222-2222-2222-222222222222"), "1.2.3.4")
            .unwrap();
        let uri = link.to_uri();
        let payload = uri.strip_prefix("vmess://").unwrap();
        let json: serde_json::Value = serde_json::from_slice(
            &base64::engine::general_purpose::STANDARD
                .decode(payload)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(json["ps"], "edge | alice phone");
        assert_eq!(json["add"], "1.2.3.4");
        assert_eq!(json["port"], "443");
        assert_eq!(json["aid"], "0");
        assert_eq!(json["net"], "tcp");
        assert_eq!(json["type"], "http");
        assert_eq!(json["path"], "/index");
        assert_eq!(json["tls"], "tls");
        assert_eq!(json["sni"], "proxy.example.com");

        assert_eq!(ShareLink::parse(&uri).unwrap(), link);
    }

    #[test]
    fn shadowsocks_legacy_uses_base64url_userinfo() {
        let ib = inbound(
            ProtocolSettings::Shadowsocks {
                method: SsMethod::Aes256Gcm,
                server_psk: String::new(),
                network: SsNetwork::TcpUdp,
            },
            tcp(),
            SecuritySettings::None,
        );
        let link = share_link(&ib, &client("secret?"), "example.com").unwrap();
        let uri = link.to_uri();
        let expected_userinfo =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("aes-256-gcm:secret?");
        assert_eq!(
            uri,
            format!("ss://{expected_userinfo}@example.com:443#edge%20%7C%20alice%20phone")
        );
        assert_eq!(ShareLink::parse(&uri).unwrap(), link);
    }

    #[test]
    fn shadowsocks_2022_keeps_method_plain_and_encodes_keys() {
        let ib = inbound(
            ProtocolSettings::Shadowsocks {
                method: SsMethod::Blake3Aes128Gcm,
                server_psk: "c2VydmVy+/==".to_string(),
                network: SsNetwork::TcpUdp,
            },
            tcp(),
            SecuritySettings::None,
        );
        let link = share_link(&ib, &client("dXNlcg+/=="), "example.com").unwrap();
        let uri = link.to_uri();
        assert_eq!(
            uri,
            "ss://2022-blake3-aes-128-gcm:c2VydmVy%2B%2F%3D%3D%3AdXNlcg%2B%2F%3D%3D@example.com:443#edge%20%7C%20alice%20phone"
        );
        let ShareLink::Shadowsocks(parsed) = ShareLink::parse(&uri).unwrap() else {
            panic!("expected shadowsocks link");
        };
        assert_eq!(parsed.password, "c2VydmVy+/==:dXNlcg+/==");
        assert_eq!(parsed.method, SsMethod::Blake3Aes128Gcm);
    }

    #[test]
    fn remark_falls_back_to_label_and_ipv6_is_bracketed() {
        let mut ib = inbound(ProtocolSettings::Vless, tcp(), SecuritySettings::None);
        ib.remark = "  ".to_string();
        let link = share_link(&ib, &client("u"), "2001:db8::1").unwrap();
        let uri = link.to_uri();
        assert!(uri.contains("@[2001:db8::1]:443?"));
        assert!(uri.ends_with("#alice%20phone"));

        let ShareLink::Vless(parsed) = ShareLink::parse(&uri).unwrap() else {
            panic!("expected vless link");
        };
        assert_eq!(parsed.host, "2001:db8::1");
    }

    #[test]
    fn link_errors() {
        let ib = inbound(ProtocolSettings::Vless, tcp(), reality());
        assert_eq!(
            share_link(&ib, &client("u"), " ").unwrap_err(),
            LinkError::EmptyHost
        );

        let mut other = client("u");
        other.inbound_id = "i2".to_string();
        assert!(matches!(
            share_link(&ib, &other, "h"),
            Err(LinkError::InboundMismatch { .. })
        ));

        let mut keyless = inbound(ProtocolSettings::Vless, tcp(), reality());
        if let SecuritySettings::Reality { public_key, .. } = &mut keyless.security {
            public_key.clear();
        }
        assert!(matches!(
            share_link(&keyless, &client("u"), "h"),
            Err(LinkError::MissingRealityPublicKey { .. })
        ));

        assert!(matches!(
            ShareLink::parse("http://example.com"),
            Err(LinkError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            ShareLink::parse("vless://u@example.com:notaport?type=tcp"),
            Err(LinkError::Malformed { .. })
        ));
        assert!(matches!(
            ShareLink::parse("ss://bm90LWEtbWV0aG9kOng@example.com:1"),
            Err(LinkError::Malformed { .. })
        ));
    }

    #[test]
    fn subscription_lists_only_eligible_clients() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let ib = store.create_inbound(reality_input(443)).unwrap();
        let first = store.create_client(client_input(&ib.inbound_id, "alice")).unwrap();
        let token = first.subscription_token.clone();
        let now = Utc::now();

        let links = eligible_links_for_token(&store, &token, "example.com", now).unwrap();
        assert_eq!(links.len(), 1);
        let body = build_subscription_base64(&links);
        let lines = decode_subscription(&body).unwrap();
        assert_eq!(lines, vec![links[0].to_uri()]);

        // A second client joining the same subscription adds exactly one line.
        let second_ib = store.create_inbound(reality_input(8443)).unwrap();
        let mut input = client_input(&second_ib.inbound_id, "alice");
        input.subscription_token = Some(token.clone());
        let second = store.create_client(input).unwrap();
        assert_eq!(second.subscription_token, token);

        let links = eligible_links_for_token(&store, &token, "example.com", now).unwrap();
        let lines = decode_subscription(&build_subscription_base64(&links)).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(":443?"));
        assert!(lines[1].contains(":8443?"));

        store.set_inbound_enabled(&second_ib.inbound_id, false).unwrap();
        let links = eligible_links_for_token(&store, &token, "example.com", now).unwrap();
        assert_eq!(links.len(), 1);

        assert!(
            eligible_links_for_token(&store, "sub_unknown", "example.com", now)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn subscription_drops_expired_and_over_quota_clients_until_eligible_again() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let now = Utc::now();
        let a = store.create_inbound(reality_input(443)).unwrap();
        let b = store.create_inbound(reality_input(8443)).unwrap();
        let c = store.create_inbound(reality_input(9443)).unwrap();

        let active = store.create_client(client_input(&a.inbound_id, "alice")).unwrap();
        let token = active.subscription_token.clone();

        let mut expired = client_input(&b.inbound_id, "alice");
        expired.subscription_token = Some(token.clone());
        expired.expiry_at = Some(now - chrono::Duration::hours(1));
        let expired = store.create_client(expired).unwrap();

        let mut capped = client_input(&c.inbound_id, "alice");
        capped.subscription_token = Some(token.clone());
        capped.traffic_limit_bytes = 1_000;
        let capped = store.create_client(capped).unwrap();
        store
            .commit_usage_sample(&UsageSample {
                deltas: BTreeMap::from([(capped.client_id.clone(), (400, 600))]),
                online_ips: BTreeMap::new(),
                observed_at: now,
            })
            .unwrap();

        let lines = |store: &JsonSnapshotStore| {
            let links = eligible_links_for_token(store, &token, "example.com", now).unwrap();
            decode_subscription(&build_subscription_base64(&links)).unwrap()
        };

        // Both are still enabled; eligibility alone keeps them out.
        assert!(store.get_client(&expired.client_id).unwrap().enabled);
        assert!(store.get_client(&capped.client_id).unwrap().enabled);
        let before = lines(&store);
        assert_eq!(before.len(), 1);
        assert!(before[0].contains(":443?"));

        assert!(store.reset_client_usage(&capped.client_id).unwrap());
        let after_reset = lines(&store);
        assert_eq!(after_reset.len(), before.len() + 1);
        assert!(after_reset[1].contains(":9443?"));

        let mut extended = client_input(&b.inbound_id, "alice");
        extended.identity = expired.identity.clone();
        extended.subscription_token = Some(token.clone());
        extended.expiry_at = Some(now + chrono::Duration::days(30));
        store.update_client(&expired.client_id, extended).unwrap();
        let after_extend = lines(&store);
        assert_eq!(after_extend.len(), after_reset.len() + 1);
        assert!(after_extend[1].contains(":8443?"));
    }

    #[test]
    fn subscription_info_sums_usage_limits_and_takes_earliest_expiry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let ib = store.create_inbound(reality_input(443)).unwrap();
        let soon = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut first = client_input(&ib.inbound_id, "alice");
        first.traffic_limit_bytes = 10_000;
        first.expiry_at = Some(soon + chrono::Duration::days(7));
        let first = store.create_client(first).unwrap();
        let token = first.subscription_token.clone();

        let mut second = client_input(&ib.inbound_id, "alice-2");
        second.traffic_limit_bytes = 5_000;
        second.expiry_at = Some(soon);
        second.subscription_token = Some(token.clone());
        let second = store.create_client(second).unwrap();

        store
            .commit_usage_sample(&UsageSample {
                deltas: BTreeMap::from([
                    (first.client_id.clone(), (100, 200)),
                    (second.client_id.clone(), (30, 40)),
                ]),
                online_ips: BTreeMap::new(),
                observed_at: Utc::now(),
            })
            .unwrap();

        let info = subscription_info(&store, &token);
        assert_eq!(
            info,
            SubscriptionInfo {
                upload: 130,
                download: 240,
                total: 15_000,
                expire: Some(soon),
            }
        );
        assert_eq!(
            subscription_headers(&info, "rayd"),
            vec![
                ("profile-title", "base64:cmF5ZA==".to_string()),
                (
                    "subscription-userinfo",
                    "upload=130; download=240; total=15000; expire=1893456000".to_string()
                ),
                ("profile-update-interval", "12".to_string()),
            ]
        );

        // One unlimited client makes the whole subscription unlimited.
        let mut third = client_input(&ib.inbound_id, "alice-3");
        third.subscription_token = Some(token.clone());
        store.create_client(third).unwrap();
        let info = subscription_info(&store, &token);
        assert_eq!(info.total, 0);
        assert_eq!(
            info.userinfo_header(),
            "upload=130; download=240; total=0; expire=1893456000"
        );

        let unknown = subscription_info(&store, "sub_unknown");
        assert_eq!(unknown, SubscriptionInfo::default());
        assert_eq!(
            unknown.userinfo_header(),
            "upload=0; download=0; total=0"
        );
    }

    #[test]
    fn empty_subscription_is_empty_string() {
        assert_eq!(build_subscription_base64(&[]), "");
        assert!(decode_subscription("").unwrap().is_empty());
    }

    #[test]
    fn clash_yaml_describes_each_proxy() {
        let vless = share_link(
            &inbound(ProtocolSettings::Vless, tcp(), reality()),
            &client("11111111-1111-1111-1111-111111111111"),
            "example.com",
        )
        .unwrap();
        let ss = share_link(
            &inbound(
                ProtocolSettings::Shadowsocks {
                    method: SsMethod::Chacha20Poly1305,
                    server_psk: String::new(),
                    network: SsNetwork::TcpUdp,
                },
                tcp(),
                SecuritySettings::None,
            ),
            &client("pw"),
            "example.com",
        )
        .unwrap();

        let yaml = build_clash_yaml(&[vless, ss]).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let proxies = doc["proxies"].as_sequence().unwrap();
        assert_eq!(proxies.len(), 2);

        let v = &proxies[0];
        assert_eq!(v["type"], Value::from("vless"));
        assert_eq!(v["name"], Value::from("edge | alice phone"));
        assert_eq!(v["servername"], Value::from("www.example.com"));
        assert_eq!(v["reality-opts"]["public-key"], Value::from("PUBKEY_x-y"));
        assert_eq!(v["reality-opts"]["short-id"], Value::from("0123456789abcdef"));
        assert_eq!(v["client-fingerprint"], Value::from("chrome"));

        let s = &proxies[1];
        assert_eq!(s["type"], Value::from("ss"));
        assert_eq!(s["cipher"], Value::from("chacha20-poly1305"));
        assert_eq!(s["password"], Value::from("pw"));
        assert!(s.get("tls").is_none());
    }
}
