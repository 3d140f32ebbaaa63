//! Watch-backed cluster indexes.
//!
//! A single writer task per watched resource applies events to the shared
//! index; readers only take the lock for O(1)-ish map lookups. This is the
//! kube-rs rendition of the informer/indexer pattern the resolver depends
//! on: namespaces by name, namespaces by project id, and service-account
//! token secrets by token value.

use ahash::{AHashMap, AHashSet};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use kube::api::Api;
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::RwLock;
use prometheus_auth_data::Set;
use std::sync::Arc;
use tracing::{debug, warn};

/// Preferred project identity label.
pub const MULTI_PROJECT_KEY_LABEL: &str = "caas.telekom.de/multiprojectkey";
/// Fallback project identity label.
pub const PROJECT_ID_LABEL: &str = "field.cattle.io/projectId";

const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_TOKEN_KEY: &str = "token";

pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug, Default)]
pub struct Index {
    namespaces: AHashMap<String, NamespaceEntry>,
    by_project_id: AHashMap<String, AHashSet<String>>,
    namespace_by_token: AHashMap<String, String>,
}

#[derive(Clone, Debug)]
pub(crate) struct NamespaceEntry {
    pub(crate) project_id: Option<String>,
    pub(crate) terminating: bool,
}

// === impl Index ===

impl Index {
    pub fn shared() -> SharedIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub(crate) fn namespace(&self, name: &str) -> Option<&NamespaceEntry> {
        self.namespaces.get(name)
    }

    /// All live namespaces sharing a project id. Namespaces marked for
    /// deletion are excluded even when they still carry the label.
    pub(crate) fn project_members(&self, project_id: &str) -> Set {
        let mut members = Set::default();
        if let Some(names) = self.by_project_id.get(project_id) {
            for name in names {
                match self.namespaces.get(name) {
                    Some(entry) if !entry.terminating => {
                        members.insert(name.as_str());
                    }
                    _ => {}
                }
            }
        }
        members
    }

    /// Maps a legacy service-account-token secret value to its namespace.
    pub(crate) fn namespace_for_token(&self, token: &str) -> Option<String> {
        self.namespace_by_token.get(token).cloned()
    }

    pub(crate) fn apply_namespace(&mut self, namespace: &Namespace) {
        let name = namespace.name_any();
        let entry = NamespaceEntry {
            project_id: project_id(namespace),
            terminating: namespace.metadata.deletion_timestamp.is_some(),
        };

        if let Some(previous) = self.namespaces.insert(name.clone(), entry.clone()) {
            if previous.project_id != entry.project_id {
                self.unlink_project(previous.project_id.as_deref(), &name);
            }
        }
        if let Some(project_id) = entry.project_id {
            self.by_project_id.entry(project_id).or_default().insert(name);
        }
    }

    pub(crate) fn delete_namespace(&mut self, name: &str) {
        if let Some(entry) = self.namespaces.remove(name) {
            self.unlink_project(entry.project_id.as_deref(), name);
        }
    }

    pub(crate) fn reset_namespaces(&mut self, namespaces: Vec<Namespace>) {
        self.namespaces.clear();
        self.by_project_id.clear();
        for namespace in &namespaces {
            self.apply_namespace(namespace);
        }
    }

    fn unlink_project(&mut self, project_id: Option<&str>, name: &str) {
        if let Some(project_id) = project_id {
            if let Some(members) = self.by_project_id.get_mut(project_id) {
                members.remove(name);
                if members.is_empty() {
                    self.by_project_id.remove(project_id);
                }
            }
        }
    }

    pub(crate) fn apply_secret(&mut self, secret: &Secret) {
        if let Some((token, namespace)) = secret_token(secret) {
            self.namespace_by_token.insert(token, namespace);
        }
    }

    pub(crate) fn delete_secret(&mut self, secret: &Secret) {
        if let Some((token, _)) = secret_token(secret) {
            self.namespace_by_token.remove(&token);
        }
    }

    pub(crate) fn reset_secrets(&mut self, secrets: Vec<Secret>) {
        self.namespace_by_token.clear();
        for secret in &secrets {
            self.apply_secret(secret);
        }
    }
}

/// Runs the namespace watch, keeping the shared index current until the
/// stream ends (it only ends when the client is torn down).
pub async fn watch_namespaces(index: SharedIndex, client: kube::Client) {
    let api = Api::<Namespace>::all(client);
    let mut events = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(namespace)) => index.write().apply_namespace(&namespace),
            Ok(watcher::Event::Deleted(namespace)) => {
                index.write().delete_namespace(&namespace.name_any())
            }
            Ok(watcher::Event::Restarted(namespaces)) => {
                debug!(count = namespaces.len(), "namespace watch synced");
                index.write().reset_namespaces(namespaces)
            }
            Err(error) => warn!(%error, "namespace watch failed"),
        }
    }
}

/// Runs the service-account-token secret watch.
pub async fn watch_secrets(index: SharedIndex, client: kube::Client) {
    let api = Api::<Secret>::all(client);
    let mut events = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(secret)) => index.write().apply_secret(&secret),
            Ok(watcher::Event::Deleted(secret)) => index.write().delete_secret(&secret),
            Ok(watcher::Event::Restarted(secrets)) => {
                debug!(count = secrets.len(), "secret watch synced");
                index.write().reset_secrets(secrets)
            }
            Err(error) => warn!(%error, "secret watch failed"),
        }
    }
}

fn project_id(namespace: &Namespace) -> Option<String> {
    let labels = namespace.metadata.labels.as_ref()?;
    labels
        .get(MULTI_PROJECT_KEY_LABEL)
        .or_else(|| labels.get(PROJECT_ID_LABEL))
        .cloned()
}

fn secret_token(secret: &Secret) -> Option<(String, String)> {
    if secret.type_.as_deref() != Some(SERVICE_ACCOUNT_TOKEN_TYPE) {
        return None;
    }
    let data = secret.data.as_ref()?;
    let token = data.get(SERVICE_ACCOUNT_TOKEN_KEY)?;
    let token = std::str::from_utf8(&token.0).ok()?.trim();
    if token.is_empty() {
        return None;
    }
    Some((token.to_string(), secret.namespace()?))
}
