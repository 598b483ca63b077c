use crate::{
    compiler::CompileIssue,
    domain::{
        Allocate, AllocateStrategy, Inbound, Protocol, ProtocolSettings, SecuritySettings,
        TcpHeader, TransportSettings,
    },
    protocol::{
        reality_keypair_from_private_key, validate_reality_dest, validate_reality_server_name,
        validate_short_id, validate_ss_key,
    },
};

const SNIFF_PROTOCOLS: [&str; 4] = ["http", "tls", "quic", "fakedns"];

/// An inbound whose protocol, transport and security combination has been checked.
///
/// The document builder only accepts this type, so every emitted listener went through
/// the required-field table below.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedInbound<'a> {
    inbound: &'a Inbound,
}

impl<'a> ValidatedInbound<'a> {
    pub fn check(inbound: &'a Inbound) -> Result<Self, Vec<CompileIssue>> {
        let mut issues = Vec::new();
        let mut push = |field: &str, reason: &str| {
            issues.push(CompileIssue::Field {
                inbound_id: inbound.inbound_id.clone(),
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if inbound.listen.trim().is_empty() {
            push("listen", "listen address is required");
        }

        check_transport(&inbound.transport, &mut push);
        check_security(&inbound.security, &mut push);
        check_protocol(inbound, &mut push);
        if let Some(allocate) = &inbound.allocate {
            check_allocate(allocate, &mut push);
        }

        if inbound.sniffing.enabled {
            for (i, proto) in inbound.sniffing.dest_override.iter().enumerate() {
                if !SNIFF_PROTOCOLS.contains(&proto.as_str()) {
                    push(
                        &format!("sniffing.dest_override[{i}]"),
                        "must be one of http, tls, quic, fakedns",
                    );
                }
            }
        }

        if issues.is_empty() {
            Ok(Self { inbound })
        } else {
            Err(issues)
        }
    }

    pub fn inbound(&self) -> &'a Inbound {
        self.inbound
    }

    pub fn protocol(&self) -> Protocol {
        self.inbound.protocol.protocol()
    }

    /// Vision needs the raw TLS stream, so only plain TCP under TLS or Reality carries it.
    pub fn supports_vision(&self) -> bool {
        self.protocol() == Protocol::Vless
            && matches!(
                self.inbound.transport,
                TransportSettings::Tcp {
                    header: TcpHeader::None
                }
            )
            && !matches!(self.inbound.security, SecuritySettings::None)
    }
}

fn check_path(field: &str, path: &str, push: &mut impl FnMut(&str, &str)) {
    if path.is_empty() {
        push(field, "path is required");
    } else if !path.starts_with('/') {
        push(field, "path must start with '/'");
    }
}

fn check_transport(transport: &TransportSettings, push: &mut impl FnMut(&str, &str)) {
    match transport {
        TransportSettings::Tcp { header } => {
            if let TcpHeader::Http { path, .. } = header {
                check_path("transport.header.path", path, push);
            }
        }
        TransportSettings::Ws { path, .. }
        | TransportSettings::HttpUpgrade { path, .. }
        | TransportSettings::Xhttp { path, .. } => {
            check_path("transport.path", path, push);
        }
        TransportSettings::H2 { path, hosts } => {
            check_path("transport.path", path, push);
            if hosts.iter().any(|h| h.trim().is_empty()) {
                push("transport.hosts", "host entries must be non-empty");
            }
        }
        TransportSettings::Grpc { service_name, .. } => {
            if service_name.trim().is_empty() {
                push("transport.service_name", "service name is required");
            } else if service_name.chars().any(char::is_whitespace) {
                push("transport.service_name", "service name must not contain spaces");
            }
        }
    }
}

fn check_allocate(allocate: &Allocate, push: &mut impl FnMut(&str, &str)) {
    match allocate.strategy {
        AllocateStrategy::Always => {
            if allocate.refresh.is_some() || allocate.concurrency.is_some() {
                push("allocate", "refresh and concurrency only apply to the random strategy");
            }
        }
        // Inbounds listen on a single port; random allocation draws from a range.
        AllocateStrategy::Random => push("allocate.strategy", "random allocation needs a port range"),
    }
}

fn check_security(security: &SecuritySettings, push: &mut impl FnMut(&str, &str)) {
    match security {
        SecuritySettings::None => {}
        SecuritySettings::Tls {
            certificate, alpn, ..
        } => {
            if certificate.cert_file.trim().is_empty() {
                push("security.certificate.cert_file", "certificate file is required");
            }
            if certificate.key_file.trim().is_empty() {
                push("security.certificate.key_file", "key file is required");
            }
            if alpn.iter().any(|a| a.trim().is_empty()) {
                push("security.alpn", "alpn entries must be non-empty");
            }
        }
        SecuritySettings::Reality {
            dest,
            server_names,
            short_ids,
            private_key,
            public_key,
            ..
        } => {
            if let Err(reason) = validate_reality_dest(dest) {
                push("security.dest", reason);
            }

            if server_names.is_empty() {
                push("security.server_names", "at least one server name is required");
            }
            for (i, name) in server_names.iter().enumerate() {
                if let Err(reason) = validate_reality_server_name(name) {
                    push(&format!("security.server_names[{i}]"), reason);
                }
            }

            if short_ids.is_empty() {
                push("security.short_ids", "at least one short id is required");
            }
            for (i, short_id) in short_ids.iter().enumerate() {
                if let Err(reason) = validate_short_id(short_id) {
                    push(&format!("security.short_ids[{i}]"), reason);
                }
            }

            if private_key.is_empty() {
                push("security.private_key", "private key is required");
            } else {
                match reality_keypair_from_private_key(private_key) {
                    Ok(derived) if !public_key.is_empty() && derived.public_key != *public_key => {
                        push("security.public_key", "does not match private key");
                    }
                    Ok(_) => {}
                    Err(err) => push("security.private_key", &err.to_string()),
                }
            }
        }
    }
}

fn check_protocol(inbound: &Inbound, push: &mut impl FnMut(&str, &str)) {
    let reality = matches!(inbound.security, SecuritySettings::Reality { .. });

    match &inbound.protocol {
        ProtocolSettings::Vless | ProtocolSettings::Vmess => {}
        ProtocolSettings::Trojan { fallback } => {
            if let Some(fallback) = fallback
                && fallback.dest.trim().is_empty()
            {
                push("protocol.fallback.dest", "fallback destination is required");
            }
        }
        ProtocolSettings::Shadowsocks {
            method, server_psk, ..
        } => {
            if !matches!(inbound.security, SecuritySettings::None) {
                push("security", "shadowsocks does not take a security layer");
            }
            if !matches!(
                inbound.transport,
                TransportSettings::Tcp {
                    header: TcpHeader::None
                }
            ) {
                push("transport", "shadowsocks requires raw tcp transport");
            }
            if method.is_2022()
                && let Err(reason) = validate_ss_key(*method, server_psk)
            {
                push("protocol.server_psk", reason);
            }
        }
    }

    if reality {
        if !matches!(
            inbound.protocol,
            ProtocolSettings::Vless | ProtocolSettings::Trojan { .. }
        ) {
            push("security", "reality requires vless or trojan");
        }
        let transport_ok = matches!(
            inbound.transport,
            TransportSettings::Tcp {
                header: TcpHeader::None
            } | TransportSettings::Grpc { .. }
                | TransportSettings::H2 { .. }
                | TransportSettings::Xhttp { .. }
        );
        if !transport_ok {
            push("transport", "reality requires tcp, grpc, h2 or xhttp transport");
        }
    }
}
