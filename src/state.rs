use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Allocate, Client, ClientUsage, DnsConfig, DomainError, EngineSettings, Flow, Inbound,
        ProtocolSettings, QuotaBreach, RoutingRule, SecuritySettings, Sniffing, SsMethod,
        TransportSettings, default_listen, validate_port,
    },
    id::new_ulid_string,
    protocol::{
        RealityKeypair, generate_client_identity, generate_reality_keypair, generate_short_id,
        generate_ss_key, new_subscription_token,
    },
};

pub const SCHEMA_VERSION: u32 = 1;
pub const USAGE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreInit {
    pub data_dir: PathBuf,
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    Domain(DomainError),
    SchemaVersionMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::Domain(e) => Some(e),
            Self::SchemaVersionMismatch { .. } => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

impl From<DomainError> for StoreError {
    fn from(value: DomainError) -> Self {
        Self::Domain(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub inbounds: BTreeMap<String, Inbound>,
    #[serde(default)]
    pub clients: BTreeMap<String, Client>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            inbounds: BTreeMap::new(),
            clients: BTreeMap::new(),
            routing_rules: Vec::new(),
            dns: DnsConfig::default(),
            engine: EngineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedUsage {
    pub schema_version: u32,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientUsage>,
}

impl PersistedUsage {
    pub fn empty() -> Self {
        Self {
            schema_version: USAGE_SCHEMA_VERSION,
            clients: BTreeMap::new(),
        }
    }
}

/// Administrative input for an inbound. Key material left empty is generated on write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboundInput {
    #[serde(default)]
    pub remark: String,
    #[serde(default = "default_true")]
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

/// Administrative input for a client. An empty identity is generated on write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInput {
    pub inbound_id: String,
    pub label: String,
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub flow: Option<Flow>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub traffic_limit_bytes: u64,
    #[serde(default)]
    pub expiry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip_limit: u32,
    /// Joins an existing subscription; a fresh token is issued when absent.
    #[serde(default)]
    pub subscription_token: Option<String>,
}

fn default_true() -> bool {
    true
}

/// One stats poll worth of counter changes, keyed by client id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSample {
    pub deltas: BTreeMap<String, (u64, u64)>,
    pub online_ips: BTreeMap<String, Option<u32>>,
    pub observed_at: DateTime<Utc>,
}

pub struct JsonSnapshotStore {
    state_path: PathBuf,
    state: PersistedState,
    usage_path: PathBuf,
    usage: PersistedUsage,
}

impl JsonSnapshotStore {
    pub fn load_or_init(init: StoreInit) -> Result<Self, StoreError> {
        fs::create_dir_all(&init.data_dir)?;

        let state_path = init.data_dir.join("state.json");
        let (state, is_new_state) = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            (state, false)
        } else {
            (PersistedState::empty(), true)
        };

        let usage_path = init.data_dir.join("usage.json");
        let usage = if usage_path.exists() {
            let bytes = fs::read(&usage_path)?;
            let usage: PersistedUsage = serde_json::from_slice(&bytes)?;
            if usage.schema_version != USAGE_SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: USAGE_SCHEMA_VERSION,
                    got: usage.schema_version,
                });
            }
            usage
        } else {
            PersistedUsage::empty()
        };

        let store = Self {
            state_path,
            state,
            usage_path,
            usage,
        };

        if is_new_state {
            store.save()?;
        }

        Ok(store)
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn usage(&self) -> &PersistedUsage {
        &self.usage
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.state_path, &bytes)?;
        Ok(())
    }

    /// Writes `state` and only then makes it current. A failed write leaves memory untouched.
    fn commit_state(&mut self, state: PersistedState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&state)?;
        write_atomic(&self.state_path, &bytes)?;
        self.state = state;
        Ok(())
    }

    fn commit_usage(&mut self, usage: PersistedUsage) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&usage)?;
        write_atomic(&self.usage_path, &bytes)?;
        self.usage = usage;
        Ok(())
    }

    pub fn list_inbounds(&self) -> Vec<Inbound> {
        self.state.inbounds.values().cloned().collect()
    }

    pub fn get_inbound(&self, inbound_id: &str) -> Option<Inbound> {
        self.state.inbounds.get(inbound_id).cloned()
    }

    pub fn list_clients(&self) -> Vec<Client> {
        self.state.clients.values().cloned().collect()
    }

    pub fn get_client(&self, client_id: &str) -> Option<Client> {
        self.state.clients.get(client_id).cloned()
    }

    pub fn clients_for_token(&self, subscription_token: &str) -> Vec<Client> {
        self.state
            .clients
            .values()
            .filter(|c| c.subscription_token == subscription_token)
            .cloned()
            .collect()
    }

    pub fn get_client_usage(&self, client_id: &str) -> ClientUsage {
        self.usage
            .clients
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn create_inbound(&mut self, input: InboundInput) -> Result<Inbound, StoreError> {
        validate_port(input.port)?;

        let inbound_id = new_ulid_string();
        let tag = inbound_tag(&input.protocol, &inbound_id);
        if self.state.inbounds.values().any(|i| i.tag == tag) {
            return Err(DomainError::TagConflict { tag }.into());
        }

        let inbound = fill_inbound_defaults(Inbound {
            inbound_id: inbound_id.clone(),
            tag,
            remark: input.remark,
            enabled: input.enabled,
            listen: input.listen,
            port: input.port,
            protocol: input.protocol,
            transport: input.transport,
            security: input.security,
            sniffing: input.sniffing,
            allocate: input.allocate,
        });
        let mut state = self.state.clone();
        state.inbounds.insert(inbound_id, inbound.clone());
        self.commit_state(state)?;
        Ok(inbound)
    }

    pub fn update_inbound(
        &mut self,
        inbound_id: &str,
        input: InboundInput,
    ) -> Result<Option<Inbound>, StoreError> {
        validate_port(input.port)?;

        let Some(existing) = self.state.inbounds.get(inbound_id) else {
            return Ok(None);
        };

        let inbound = fill_inbound_defaults(Inbound {
            inbound_id: existing.inbound_id.clone(),
            tag: existing.tag.clone(),
            remark: input.remark,
            enabled: input.enabled,
            listen: input.listen,
            port: input.port,
            protocol: input.protocol,
            transport: input.transport,
            security: input.security,
            sniffing: input.sniffing,
            allocate: input.allocate,
        });
        let mut state = self.state.clone();
        state.inbounds.insert(inbound_id.to_string(), inbound.clone());
        self.commit_state(state)?;
        Ok(Some(inbound))
    }

    pub fn set_inbound_enabled(
        &mut self,
        inbound_id: &str,
        enabled: bool,
    ) -> Result<Option<Inbound>, StoreError> {
        let mut state = self.state.clone();
        let Some(inbound) = state.inbounds.get_mut(inbound_id) else {
            return Ok(None);
        };
        inbound.enabled = enabled;
        let inbound = inbound.clone();
        self.commit_state(state)?;
        Ok(Some(inbound))
    }

    /// Removes the inbound together with its clients and their counters.
    pub fn delete_inbound(&mut self, inbound_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.clone();
        if state.inbounds.remove(inbound_id).is_none() {
            return Ok(false);
        }
        state.clients.retain(|_, c| c.inbound_id != inbound_id);
        self.commit_state(state)?;

        // Counters of clients that no longer exist.
        let mut usage = self.usage.clone();
        usage
            .clients
            .retain(|client_id, _| self.state.clients.contains_key(client_id));
        if usage.clients.len() != self.usage.clients.len() {
            self.commit_usage(usage)?;
        }
        Ok(true)
    }

    pub fn regenerate_reality_keypair(
        &mut self,
        inbound_id: &str,
    ) -> Result<Option<RealityKeypair>, StoreError> {
        let mut state = self.state.clone();
        let Some(inbound) = state.inbounds.get_mut(inbound_id) else {
            return Ok(None);
        };
        let SecuritySettings::Reality {
            private_key,
            public_key,
            ..
        } = &mut inbound.security
        else {
            return Err(DomainError::NotRealityInbound {
                inbound_id: inbound_id.to_string(),
            }
            .into());
        };

        let mut rng = rand::rngs::OsRng;
        let keypair = generate_reality_keypair(&mut rng);
        *private_key = keypair.private_key.clone();
        *public_key = keypair.public_key.clone();

        self.commit_state(state)?;
        Ok(Some(keypair))
    }

    pub fn create_client(&mut self, input: ClientInput) -> Result<Client, StoreError> {
        let inbound = self
            .state
            .inbounds
            .get(&input.inbound_id)
            .ok_or_else(|| DomainError::MissingInbound {
                inbound_id: input.inbound_id.clone(),
            })?;

        let mut rng = rand::rngs::OsRng;
        let identity = if input.identity.is_empty() {
            generate_client_identity(inbound.protocol.protocol(), ss_method(inbound), &mut rng)
        } else {
            input.identity
        };

        let client_id = new_ulid_string();
        self.ensure_identity_free(&input.inbound_id, &identity, &client_id)?;

        let client = Client {
            client_id: client_id.clone(),
            inbound_id: input.inbound_id,
            label: input.label,
            identity,
            flow: input.flow,
            enabled: input.enabled,
            traffic_limit_bytes: input.traffic_limit_bytes,
            expiry_at: input.expiry_at,
            ip_limit: input.ip_limit,
            subscription_token: input
                .subscription_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| new_subscription_token(&mut rng)),
            disabled_reason: None,
        };
        let mut state = self.state.clone();
        state.clients.insert(client_id, client.clone());
        self.commit_state(state)?;
        Ok(client)
    }

    pub fn update_client(
        &mut self,
        client_id: &str,
        input: ClientInput,
    ) -> Result<Option<Client>, StoreError> {
        let Some(existing) = self.state.clients.get(client_id) else {
            return Ok(None);
        };
        if existing.inbound_id != input.inbound_id {
            return Err(DomainError::InboundMoved {
                client_id: client_id.to_string(),
            }
            .into());
        }

        let identity = if input.identity.is_empty() {
            existing.identity.clone()
        } else {
            input.identity
        };
        self.ensure_identity_free(&input.inbound_id, &identity, client_id)?;

        let existing = existing.clone();
        // Re-enabling by hand clears the enforcement marker.
        let disabled_reason = if input.enabled {
            None
        } else {
            existing.disabled_reason
        };
        let client = Client {
            client_id: existing.client_id,
            inbound_id: input.inbound_id,
            label: input.label,
            identity,
            flow: input.flow,
            enabled: input.enabled,
            traffic_limit_bytes: input.traffic_limit_bytes,
            expiry_at: input.expiry_at,
            ip_limit: input.ip_limit,
            subscription_token: input
                .subscription_token
                .filter(|t| !t.is_empty())
                .unwrap_or(existing.subscription_token),
            disabled_reason,
        };
        let mut state = self.state.clone();
        state.clients.insert(client_id.to_string(), client.clone());
        self.commit_state(state)?;
        Ok(Some(client))
    }

    pub fn delete_client(&mut self, client_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.clone();
        if state.clients.remove(client_id).is_none() {
            return Ok(false);
        }
        self.commit_state(state)?;

        let mut usage = self.usage.clone();
        if usage.clients.remove(client_id).is_some() {
            self.commit_usage(usage)?;
        }
        Ok(true)
    }

    pub fn reset_client_usage(&mut self, client_id: &str) -> Result<bool, StoreError> {
        if !self.state.clients.contains_key(client_id) {
            return Ok(false);
        }
        let mut usage = self.usage.clone();
        let entry = usage.clients.entry(client_id.to_string()).or_default();
        entry.uplink_bytes = 0;
        entry.downlink_bytes = 0;
        self.commit_usage(usage)?;
        Ok(true)
    }

    pub fn set_routing_rules(&mut self, rules: Vec<RoutingRule>) -> Result<(), StoreError> {
        let mut state = self.state.clone();
        state.routing_rules = rules;
        self.commit_state(state)
    }

    pub fn set_dns(&mut self, dns: DnsConfig) -> Result<(), StoreError> {
        let mut state = self.state.clone();
        state.dns = dns;
        self.commit_state(state)
    }

    pub fn set_engine_settings(&mut self, engine: EngineSettings) -> Result<(), StoreError> {
        let mut state = self.state.clone();
        state.engine = engine;
        self.commit_state(state)
    }

    /// Adds one poll worth of deltas. Unknown clients (deleted mid-poll) are ignored.
    /// Nothing changes, in memory or on disk, unless the write succeeds.
    pub fn commit_usage_sample(&mut self, sample: &UsageSample) -> Result<(), StoreError> {
        let mut usage = self.usage.clone();
        for (client_id, (up, down)) in &sample.deltas {
            if !self.state.clients.contains_key(client_id) {
                continue;
            }
            let entry = usage.clients.entry(client_id.clone()).or_default();
            entry.uplink_bytes = entry.uplink_bytes.saturating_add(*up);
            entry.downlink_bytes = entry.downlink_bytes.saturating_add(*down);
            entry.updated_at = Some(sample.observed_at);
        }
        for (client_id, online) in &sample.online_ips {
            if !self.state.clients.contains_key(client_id) {
                continue;
            }
            let entry = usage.clients.entry(client_id.clone()).or_default();
            entry.online_ips = *online;
            entry.online_observed_at = Some(sample.observed_at);
        }

        self.commit_usage(usage)
    }

    /// Disables every listed client that is still enabled, in one write. Returns the ids flipped.
    pub fn disable_clients(
        &mut self,
        breaches: &[(String, QuotaBreach)],
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.clone();
        let mut flipped = Vec::new();
        for (client_id, breach) in breaches {
            let Some(client) = state.clients.get_mut(client_id) else {
                continue;
            };
            if !client.enabled {
                continue;
            }
            client.enabled = false;
            client.disabled_reason = Some(*breach);
            flipped.push(client_id.clone());
        }
        if !flipped.is_empty() {
            self.commit_state(state)?;
        }
        Ok(flipped)
    }

    fn ensure_identity_free(
        &self,
        inbound_id: &str,
        identity: &str,
        client_id: &str,
    ) -> Result<(), DomainError> {
        let taken = self.state.clients.values().any(|c| {
            c.inbound_id == inbound_id && c.identity == identity && c.client_id != client_id
        });
        if taken {
            return Err(DomainError::ClientIdentityConflict {
                inbound_id: inbound_id.to_string(),
                identity: identity.to_string(),
            });
        }
        Ok(())
    }
}

fn ss_method(inbound: &Inbound) -> Option<SsMethod> {
    match &inbound.protocol {
        ProtocolSettings::Shadowsocks { method, .. } => Some(*method),
        _ => None,
    }
}

/// Generates Reality keys, a first short id and a 2022 server key when they were left empty.
fn fill_inbound_defaults(mut inbound: Inbound) -> Inbound {
    let mut rng = rand::rngs::OsRng;

    if let SecuritySettings::Reality {
        private_key,
        public_key,
        short_ids,
        ..
    } = &mut inbound.security
    {
        if private_key.is_empty() {
            let keypair = generate_reality_keypair(&mut rng);
            *private_key = keypair.private_key;
            *public_key = keypair.public_key;
        } else if public_key.is_empty()
            && let Ok(keypair) = crate::protocol::reality_keypair_from_private_key(private_key)
        {
            *public_key = keypair.public_key;
        }
        if short_ids.is_empty() {
            short_ids.push(generate_short_id(&mut rng));
        }
    }

    if let ProtocolSettings::Shadowsocks {
        method, server_psk, ..
    } = &mut inbound.protocol
        && method.is_2022()
        && server_psk.is_empty()
    {
        *server_psk = generate_ss_key(*method, &mut rng);
    }

    inbound
}

fn inbound_tag(protocol: &ProtocolSettings, inbound_id: &str) -> String {
    format!("in-{}-{inbound_id}", protocol.protocol().as_str())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{domain::TcpHeader, id::is_ulid_string};

    pub(crate) fn test_init(tmp_dir: &Path) -> StoreInit {
        StoreInit {
            data_dir: tmp_dir.to_path_buf(),
        }
    }

    pub(crate) fn reality_input(port: u16) -> InboundInput {
        InboundInput {
            remark: "edge".to_string(),
            enabled: true,
            listen: default_listen(),
            port,
            protocol: ProtocolSettings::Vless,
            transport: TransportSettings::Tcp {
                header: TcpHeader::None,
            },
            security: SecuritySettings::Reality {
                dest: "www.example.com:443".to_string(),
                server_names: vec!["www.example.com".to_string()],
                short_ids: Vec::new(),
                private_key: String::new(),
                public_key: String::new(),
                fingerprint: "chrome".to_string(),
                spider_x: String::new(),
            },
            sniffing: Sniffing::default(),
            allocate: None,
        }
    }

    pub(crate) fn client_input(inbound_id: &str, label: &str) -> ClientInput {
        ClientInput {
            inbound_id: inbound_id.to_string(),
            label: label.to_string(),
            identity: String::new(),
            flow: None,
            enabled: true,
            traffic_limit_bytes: 0,
            expiry_at: None,
            ip_limit: 0,
            subscription_token: None,
        }
    }

    #[test]
    fn bootstrap_creates_empty_state_json() {
        let tmp = tempfile::tempdir().unwrap();

        let _store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let state_path = tmp.path().join("state.json");
        assert!(state_path.exists());

        let bytes = fs::read(&state_path).unwrap();
        let state: PersistedState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(state, PersistedState::empty());
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("state.json"),
            br#"{"schema_version": 99}"#,
        )
        .unwrap();

        match JsonSnapshotStore::load_or_init(test_init(tmp.path())) {
            Err(StoreError::SchemaVersionMismatch { expected, got }) => {
                assert_eq!((expected, got), (SCHEMA_VERSION, 99));
            }
            Err(err) => panic!("unexpected error: {err}"),
            Ok(_) => panic!("expected schema mismatch"),
        }
    }

    #[test]
    fn create_inbound_fills_reality_material() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();

        let inbound = store.create_inbound(reality_input(443)).unwrap();
        assert!(is_ulid_string(&inbound.inbound_id));
        assert_eq!(inbound.tag, format!("in-vless-{}", inbound.inbound_id));
        let SecuritySettings::Reality {
            private_key,
            public_key,
            short_ids,
            ..
        } = &inbound.security
        else {
            panic!("expected reality security");
        };
        assert!(!private_key.is_empty());
        assert!(!public_key.is_empty());
        assert_eq!(short_ids.len(), 1);
    }

    #[test]
    fn save_load_roundtrip_persists_entities() {
        let tmp = tempfile::tempdir().unwrap();

        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();
        let client = store
            .create_client(client_input(&inbound.inbound_id, "alice"))
            .unwrap();
        drop(store);

        let store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        assert_eq!(store.get_inbound(&inbound.inbound_id), Some(inbound));
        assert_eq!(store.get_client(&client.client_id), Some(client));
    }

    #[test]
    fn identity_is_unique_per_inbound_only() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let a = store.create_inbound(reality_input(443)).unwrap();
        let b = store.create_inbound(reality_input(8443)).unwrap();

        let first = store.create_client(client_input(&a.inbound_id, "alice")).unwrap();

        let mut dup = client_input(&a.inbound_id, "bob");
        dup.identity = first.identity.clone();
        match store.create_client(dup) {
            Err(StoreError::Domain(DomainError::ClientIdentityConflict { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|c| c.client_id)),
        }

        let mut other_inbound = client_input(&b.inbound_id, "bob");
        other_inbound.identity = first.identity.clone();
        assert!(store.create_client(other_inbound).is_ok());
    }

    #[test]
    fn delete_inbound_cascades_clients_and_usage() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();
        let client = store
            .create_client(client_input(&inbound.inbound_id, "alice"))
            .unwrap();
        store
            .commit_usage_sample(&UsageSample {
                deltas: BTreeMap::from([(client.client_id.clone(), (10, 20))]),
                online_ips: BTreeMap::new(),
                observed_at: Utc::now(),
            })
            .unwrap();

        assert!(store.delete_inbound(&inbound.inbound_id).unwrap());
        assert!(store.get_client(&client.client_id).is_none());
        assert!(!store.usage().clients.contains_key(&client.client_id));
        assert!(!store.delete_inbound(&inbound.inbound_id).unwrap());
    }

    #[test]
    fn usage_sample_accumulates_and_reset_zeroes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();
        let client = store
            .create_client(client_input(&inbound.inbound_id, "alice"))
            .unwrap();

        for _ in 0..2 {
            store
                .commit_usage_sample(&UsageSample {
                    deltas: BTreeMap::from([
                        (client.client_id.clone(), (10, 20)),
                        ("gone".to_string(), (1, 1)),
                    ]),
                    online_ips: BTreeMap::from([(client.client_id.clone(), Some(2))]),
                    observed_at: Utc::now(),
                })
                .unwrap();
        }

        let usage = store.get_client_usage(&client.client_id);
        assert_eq!((usage.uplink_bytes, usage.downlink_bytes), (20, 40));
        assert_eq!(usage.online_ips, Some(2));
        assert!(!store.usage().clients.contains_key("gone"));

        assert!(store.reset_client_usage(&client.client_id).unwrap());
        assert_eq!(store.get_client_usage(&client.client_id).total_bytes(), 0);
    }

    #[test]
    fn disable_clients_is_batched_and_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();
        let a = store.create_client(client_input(&inbound.inbound_id, "a")).unwrap();
        let b = store.create_client(client_input(&inbound.inbound_id, "b")).unwrap();

        let breaches = vec![
            (a.client_id.clone(), QuotaBreach::Traffic),
            (b.client_id.clone(), QuotaBreach::Expired),
        ];
        assert_eq!(store.disable_clients(&breaches).unwrap().len(), 2);
        assert!(store.disable_clients(&breaches).unwrap().is_empty());
        assert_eq!(
            store.get_client(&b.client_id).unwrap().disabled_reason,
            Some(QuotaBreach::Expired)
        );

        let mut enable = client_input(&inbound.inbound_id, "b");
        enable.identity = b.identity.clone();
        let b = store.update_client(&b.client_id, enable).unwrap().unwrap();
        assert!(b.enabled);
        assert_eq!(b.disabled_reason, None);
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();
        let a = store.create_client(client_input(&inbound.inbound_id, "a")).unwrap();
        store
            .commit_usage_sample(&UsageSample {
                deltas: BTreeMap::from([(a.client_id.clone(), (10, 20))]),
                online_ips: BTreeMap::new(),
                observed_at: Utc::now(),
            })
            .unwrap();

        // A directory where the temp file goes makes every write fail.
        let blocker = tmp.path().join("state.json.tmp");
        fs::create_dir(&blocker).unwrap();

        let breaches = vec![(a.client_id.clone(), QuotaBreach::Traffic)];
        assert!(matches!(
            store.disable_clients(&breaches),
            Err(StoreError::Io(_))
        ));
        let unchanged = store.get_client(&a.client_id).unwrap();
        assert!(unchanged.enabled);
        assert_eq!(unchanged.disabled_reason, None);

        let rule = RoutingRule(serde_json::json!({"type": "field", "outboundTag": "blocked"}));
        assert!(store.set_routing_rules(vec![rule]).is_err());
        assert!(store.state().routing_rules.is_empty());
        assert!(store.delete_client(&a.client_id).is_err());
        assert!(store.get_client(&a.client_id).is_some());

        let usage_blocker = tmp.path().join("usage.json.tmp");
        fs::create_dir(&usage_blocker).unwrap();
        assert!(store.reset_client_usage(&a.client_id).is_err());
        assert_eq!(store.get_client_usage(&a.client_id).total_bytes(), 30);

        fs::remove_dir(&blocker).unwrap();
        fs::remove_dir(&usage_blocker).unwrap();
        assert_eq!(store.disable_clients(&breaches).unwrap(), vec![a.client_id.clone()]);
        drop(store);

        let store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        assert!(!store.get_client(&a.client_id).unwrap().enabled);
    }

    #[test]
    fn regenerate_keypair_requires_reality() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = JsonSnapshotStore::load_or_init(test_init(tmp.path())).unwrap();
        let inbound = store.create_inbound(reality_input(443)).unwrap();

        let before = inbound.security.clone();
        let keypair = store
            .regenerate_reality_keypair(&inbound.inbound_id)
            .unwrap()
            .unwrap();
        let after = store.get_inbound(&inbound.inbound_id).unwrap().security;
        assert_ne!(before, after);
        let SecuritySettings::Reality { public_key, .. } = after else {
            panic!("expected reality security");
        };
        assert_eq!(public_key, keypair.public_key);

        let mut plain = reality_input(80);
        plain.security = SecuritySettings::None;
        let plain = store.create_inbound(plain).unwrap();
        assert!(matches!(
            store.regenerate_reality_keypair(&plain.inbound_id),
            Err(StoreError::Domain(DomainError::NotRealityInbound { .. }))
        ));
        assert!(store.regenerate_reality_keypair("missing").unwrap().is_none());
    }
}
