//! Administrative edits: each one commits to the store, checks that the new snapshot
//! still compiles and then schedules a reconcile pass.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    compiler::{CompileErrors, compile_store},
    domain::{
        Client, DnsConfig, EngineSettings, Inbound, RoutingRule, parse_whitelist, with_whitelist,
    },
    links::{
        LinkError, ShareLink, SubscriptionInfo, eligible_links_for_token, share_link,
        subscription_info,
    },
    protocol::RealityKeypair,
    reconcile::ReconcileHandle,
    state::{ClientInput, InboundInput, JsonSnapshotStore, StoreError},
};

#[derive(Debug)]
pub enum AdminError {
    Store(StoreError),
    Link(LinkError),
    NotFound { kind: &'static str, id: String },
    Whitelist { path: PathBuf, source: std::io::Error },
}

impl AdminError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Domain(e)) => e.code(),
            Self::Store(_) => "internal",
            Self::Link(_) | Self::Whitelist { .. } => "invalid_request",
            Self::NotFound { .. } => "not_found",
        }
    }

    fn not_found(kind: &'static str, id: &str) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl std::fmt::Display for AdminError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "{e}"),
            Self::Link(e) => write!(f, "{e}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Whitelist { path, source } => {
                write!(f, "cannot read whitelist {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            Self::Link(e) => Some(e),
            Self::NotFound { .. } => None,
            Self::Whitelist { source, .. } => Some(source),
        }
    }
}

impl From<StoreError> for AdminError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<LinkError> for AdminError {
    fn from(value: LinkError) -> Self {
        Self::Link(value)
    }
}

/// A committed edit. `pending` carries the compile errors that keep it from reaching the
/// engine; the edit itself stays committed either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub pending: Option<CompileErrors>,
}

impl<T> Committed<T> {
    pub fn is_applied_cleanly(&self) -> bool {
        self.pending.is_none()
    }
}

#[derive(Clone)]
pub struct Admin {
    store: Arc<Mutex<JsonSnapshotStore>>,
    reconcile: ReconcileHandle,
}

impl Admin {
    pub fn new(store: Arc<Mutex<JsonSnapshotStore>>, reconcile: ReconcileHandle) -> Self {
        Self { store, reconcile }
    }

    async fn commit<T>(
        &self,
        op: &'static str,
        edit: impl FnOnce(&mut JsonSnapshotStore) -> Result<T, AdminError>,
    ) -> Result<Committed<T>, AdminError> {
        let (value, pending) = {
            let mut store = self.store.lock().await;
            let value = edit(&mut *store)?;
            (value, compile_store(&store, Utc::now()).err())
        };

        match &pending {
            Some(errors) => warn!(op, error = %errors, "edit committed but does not compile"),
            None => info!(op, "edit committed"),
        }
        self.reconcile.request_full();
        Ok(Committed { value, pending })
    }

    pub async fn list_inbounds(&self) -> Vec<Inbound> {
        self.store.lock().await.list_inbounds()
    }

    pub async fn list_clients(&self) -> Vec<Client> {
        self.store.lock().await.list_clients()
    }

    pub async fn create_inbound(
        &self,
        input: InboundInput,
    ) -> Result<Committed<Inbound>, AdminError> {
        self.commit("create_inbound", |store| Ok(store.create_inbound(input)?))
            .await
    }

    pub async fn update_inbound(
        &self,
        inbound_id: &str,
        input: InboundInput,
    ) -> Result<Committed<Inbound>, AdminError> {
        self.commit("update_inbound", |store| {
            store
                .update_inbound(inbound_id, input)?
                .ok_or_else(|| AdminError::not_found("inbound", inbound_id))
        })
        .await
    }

    pub async fn set_inbound_enabled(
        &self,
        inbound_id: &str,
        enabled: bool,
    ) -> Result<Committed<Inbound>, AdminError> {
        self.commit("set_inbound_enabled", |store| {
            store
                .set_inbound_enabled(inbound_id, enabled)?
                .ok_or_else(|| AdminError::not_found("inbound", inbound_id))
        })
        .await
    }

    /// Also removes the inbound's clients and their usage counters.
    pub async fn delete_inbound(&self, inbound_id: &str) -> Result<Committed<()>, AdminError> {
        self.commit("delete_inbound", |store| {
            if store.delete_inbound(inbound_id)? {
                Ok(())
            } else {
                Err(AdminError::not_found("inbound", inbound_id))
            }
        })
        .await
    }

    pub async fn regenerate_reality_keypair(
        &self,
        inbound_id: &str,
    ) -> Result<Committed<RealityKeypair>, AdminError> {
        self.commit("regenerate_reality_keypair", |store| {
            store
                .regenerate_reality_keypair(inbound_id)?
                .ok_or_else(|| AdminError::not_found("inbound", inbound_id))
        })
        .await
    }

    pub async fn create_client(&self, input: ClientInput) -> Result<Committed<Client>, AdminError> {
        self.commit("create_client", |store| Ok(store.create_client(input)?))
            .await
    }

    pub async fn update_client(
        &self,
        client_id: &str,
        input: ClientInput,
    ) -> Result<Committed<Client>, AdminError> {
        self.commit("update_client", |store| {
            store
                .update_client(client_id, input)?
                .ok_or_else(|| AdminError::not_found("client", client_id))
        })
        .await
    }

    pub async fn delete_client(&self, client_id: &str) -> Result<Committed<()>, AdminError> {
        self.commit("delete_client", |store| {
            if store.delete_client(client_id)? {
                Ok(())
            } else {
                Err(AdminError::not_found("client", client_id))
            }
        })
        .await
    }

    pub async fn reset_client_usage(&self, client_id: &str) -> Result<Committed<()>, AdminError> {
        self.commit("reset_client_usage", |store| {
            if store.reset_client_usage(client_id)? {
                Ok(())
            } else {
                Err(AdminError::not_found("client", client_id))
            }
        })
        .await
    }

    pub async fn set_routing_rules(
        &self,
        rules: Vec<RoutingRule>,
    ) -> Result<Committed<()>, AdminError> {
        self.commit("set_routing_rules", |store| Ok(store.set_routing_rules(rules)?))
            .await
    }

    /// Routes every domain listed in `path` to `direct`, replacing an earlier whitelist.
    /// Returns how many domains the rule covers.
    pub async fn apply_whitelist(&self, path: &Path) -> Result<Committed<usize>, AdminError> {
        let text = std::fs::read_to_string(path).map_err(|source| AdminError::Whitelist {
            path: path.to_path_buf(),
            source,
        })?;
        let domains = parse_whitelist(&text);
        self.commit("apply_whitelist", |store| {
            let rules = with_whitelist(&store.state().routing_rules, &domains);
            store.set_routing_rules(rules)?;
            Ok(domains.len())
        })
        .await
    }

    pub async fn set_dns(&self, dns: DnsConfig) -> Result<Committed<()>, AdminError> {
        self.commit("set_dns", |store| Ok(store.set_dns(dns)?)).await
    }

    pub async fn set_engine_settings(
        &self,
        engine: EngineSettings,
    ) -> Result<Committed<()>, AdminError> {
        self.commit("set_engine_settings", |store| {
            Ok(store.set_engine_settings(engine)?)
        })
        .await
    }

    pub async fn client_link(&self, client_id: &str, host: &str) -> Result<ShareLink, AdminError> {
        let store = self.store.lock().await;
        let client = store
            .get_client(client_id)
            .ok_or_else(|| AdminError::not_found("client", client_id))?;
        let inbound = store
            .get_inbound(&client.inbound_id)
            .ok_or_else(|| AdminError::not_found("inbound", &client.inbound_id))?;
        Ok(share_link(&inbound, &client, host)?)
    }

    pub async fn subscription_links(
        &self,
        token: &str,
        host: &str,
    ) -> Result<Vec<ShareLink>, AdminError> {
        let store = self.store.lock().await;
        Ok(eligible_links_for_token(&store, token, host, Utc::now())?)
    }

    pub async fn subscription_info(&self, token: &str) -> SubscriptionInfo {
        subscription_info(&*self.store.lock().await, token)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        compiler::CompileIssue,
        reconcile::ReconcileRequest,
        state::tests::{client_input, reality_input, test_init},
    };

    fn admin(
        tmp: &std::path::Path,
    ) -> (
        Admin,
        Arc<Mutex<JsonSnapshotStore>>,
        mpsc::UnboundedReceiver<ReconcileRequest>,
    ) {
        let store = Arc::new(Mutex::new(
            JsonSnapshotStore::load_or_init(test_init(tmp)).unwrap(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Admin::new(store.clone(), ReconcileHandle::from_sender(tx)),
            store,
            rx,
        )
    }

    #[tokio::test]
    async fn clean_edit_commits_and_requests_reconcile() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, store, mut rx) = admin(tmp.path());

        let inbound = admin.create_inbound(reality_input(443)).await.unwrap();
        assert!(inbound.is_applied_cleanly());
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);

        let client = admin
            .create_client(client_input(&inbound.value.inbound_id, "alice"))
            .await
            .unwrap();
        assert!(client.is_applied_cleanly());
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);

        let stored = store.lock().await.get_client(&client.value.client_id);
        assert_eq!(stored, Some(client.value));
    }

    #[tokio::test]
    async fn invalid_snapshot_stays_committed_but_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, store, mut rx) = admin(tmp.path());

        let first = admin.create_inbound(reality_input(443)).await.unwrap();
        let second = admin.create_inbound(reality_input(443)).await.unwrap();

        let pending = second.pending.expect("duplicate port must not compile");
        assert!(pending.issues().iter().any(|issue| matches!(
            issue,
            CompileIssue::PortConflict { port: 443, .. }
        )));
        assert_eq!(store.lock().await.list_inbounds().len(), 2);
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);

        // Fixing the conflict clears the pending state.
        let mut moved = reality_input(8443);
        moved.remark = "moved".to_string();
        let fixed = admin
            .update_inbound(&second.value.inbound_id, moved)
            .await
            .unwrap();
        assert!(fixed.is_applied_cleanly());
        assert_ne!(fixed.value.inbound_id, first.value.inbound_id);
    }

    #[tokio::test]
    async fn missing_entities_are_not_found_and_do_not_reconcile() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, _store, mut rx) = admin(tmp.path());

        let err = admin.delete_client("nope").await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.to_string(), "client not found: nope");

        let err = admin.set_inbound_enabled("nope", false).await.unwrap_err();
        assert_eq!(err.code(), "not_found");

        let err = admin
            .create_client(client_input("nope", "alice"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_inbound_cascades_and_links_follow_state() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, store, _rx) = admin(tmp.path());

        let inbound = admin.create_inbound(reality_input(443)).await.unwrap().value;
        let client = admin
            .create_client(client_input(&inbound.inbound_id, "alice"))
            .await
            .unwrap()
            .value;

        let link = admin
            .client_link(&client.client_id, "example.com")
            .await
            .unwrap();
        assert!(link.to_uri().starts_with("vless://"));
        let subscription = admin
            .subscription_links(&client.subscription_token, "example.com")
            .await
            .unwrap();
        assert_eq!(subscription, vec![link]);

        admin.delete_inbound(&inbound.inbound_id).await.unwrap();
        assert!(store.lock().await.list_clients().is_empty());
        let err = admin
            .client_link(&client.client_id, "example.com")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn whitelist_file_becomes_a_direct_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, store, mut rx) = admin(tmp.path());
        let ads = RoutingRule(serde_json::json!({
            "type": "field",
            "domain": ["geosite:category-ads"],
            "outboundTag": "blocked"
        }));
        admin.set_routing_rules(vec![ads.clone()]).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);

        let list = tmp.path().join("whitelist.txt");
        std::fs::write(&list, "bank.example\ngov.example\n").unwrap();
        let applied = admin.apply_whitelist(&list).await.unwrap();
        assert!(applied.is_applied_cleanly());
        assert_eq!(applied.value, 2);
        assert_eq!(rx.try_recv().unwrap(), ReconcileRequest::Full);

        let rules = store.lock().await.state().routing_rules.clone();
        assert_eq!(rules.len(), 2);
        assert_eq!(
            rules[0].0["domain"],
            serde_json::json!(["full:bank.example", "full:gov.example"])
        );
        assert_eq!(rules[0].0["outboundTag"], "direct");
        assert_eq!(rules[1], ads);

        let doc = compile_store(&*store.lock().await, Utc::now()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(doc.as_bytes()).unwrap();
        assert_eq!(value["routing"]["rules"][1]["ruleTag"], "whitelist-direct");

        let err = admin
            .apply_whitelist(&tmp.path().join("missing.txt"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn regenerate_keypair_rejects_non_reality_inbound() {
        let tmp = tempfile::tempdir().unwrap();
        let (admin, _store, _rx) = admin(tmp.path());

        let inbound = admin.create_inbound(reality_input(443)).await.unwrap().value;
        let rotated = admin
            .regenerate_reality_keypair(&inbound.inbound_id)
            .await
            .unwrap();
        assert!(rotated.is_applied_cleanly());
        assert_eq!(rotated.value.public_key.len(), 43);

        let mut plain = reality_input(8443);
        plain.security = crate::domain::SecuritySettings::None;
        let plain = admin.create_inbound(plain).await.unwrap().value;
        let err = admin
            .regenerate_reality_keypair(&plain.inbound_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }
}
