//! Per-tenant settings with atomic table replacement.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tenancy_core::TenantId;

/// Tenant-scoped configuration data: feature flags, enabled modules and
/// free-form options.
///
/// Read once per pipeline build so composition decisions are keyed by tenant
/// identity rather than by matching tenant names inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    pub features: BTreeSet<String>,
    /// Names of the [`TenantModule`](super::TenantModule)s loaded into the
    /// tenant's shell.
    pub modules: BTreeSet<String>,
    pub values: BTreeMap<String, String>,
}

impl TenantSettings {
    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.modules.contains(module)
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.modules.insert(module.into());
        self
    }

    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

pub type SettingsTable = HashMap<TenantId, Arc<TenantSettings>>;

/// Current settings of every tenant, swappable as a whole.
///
/// Readers get a consistent snapshot without locking; writers replace the
/// full table.
pub struct TenantSettingsStore {
    table: ArcSwap<SettingsTable>,
    defaults: Arc<TenantSettings>,
}

impl TenantSettingsStore {
    #[must_use]
    pub fn new(table: SettingsTable) -> Self {
        Self {
            table: ArcSwap::from_pointee(table),
            defaults: Arc::new(TenantSettings::default()),
        }
    }

    /// Builds a store from plain settings values.
    #[must_use]
    pub fn from_settings(settings: impl IntoIterator<Item = (TenantId, TenantSettings)>) -> Self {
        Self::new(into_table(settings))
    }

    /// Settings for `tenant`, or empty defaults when it has none.
    #[must_use]
    pub fn get(&self, tenant: TenantId) -> Arc<TenantSettings> {
        self.table
            .load()
            .get(&tenant)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.defaults))
    }

    /// Swaps in a new table and returns the tenants whose settings changed,
    /// including tenants added or removed.
    pub fn replace(&self, table: SettingsTable) -> Vec<TenantId> {
        let current = Arc::new(table);
        let previous = self.table.swap(Arc::clone(&current));

        let mut changed: Vec<TenantId> = current
            .iter()
            .filter(|(id, settings)| previous.get(*id) != Some(*settings))
            .map(|(id, _)| *id)
            .collect();
        changed.extend(previous.keys().filter(|id| !current.contains_key(*id)).copied());
        changed.sort();
        changed
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<SettingsTable> {
        self.table.load_full()
    }
}

impl Default for TenantSettingsStore {
    fn default() -> Self {
        Self::new(SettingsTable::new())
    }
}

impl std::fmt::Debug for TenantSettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantSettingsStore")
            .field("tenants", &self.table.load().len())
            .finish()
    }
}

/// Converts plain settings values into a [`SettingsTable`].
pub fn into_table(settings: impl IntoIterator<Item = (TenantId, TenantSettings)>) -> SettingsTable {
    settings
        .into_iter()
        .map(|(id, settings)| (id, Arc::new(settings)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tenant_gets_defaults() {
        let store = TenantSettingsStore::default();
        let settings = store.get(TenantId::new_v4());
        assert!(!settings.has_feature("welcome_page"));
        assert_eq!(settings.value("theme"), None);
    }

    #[test]
    fn replace_reports_changed_added_and_removed() {
        let (foo, bar, baz) = (TenantId::new_v4(), TenantId::new_v4(), TenantId::new_v4());
        let store = TenantSettingsStore::from_settings([
            (foo, TenantSettings::default().with_feature("welcome_page")),
            (bar, TenantSettings::default()),
        ]);

        let changed = store.replace(into_table([
            (foo, TenantSettings::default().with_feature("welcome_page")),
            (bar, TenantSettings::default().with_value("theme", "dark")),
            (baz, TenantSettings::default()),
        ]));
        let mut expected = vec![bar, baz];
        expected.sort();
        assert_eq!(changed, expected);
        assert_eq!(store.get(bar).value("theme"), Some("dark"));

        let removed = store.replace(into_table([(bar, TenantSettings::default())]));
        let mut expected = vec![foo, bar, baz];
        expected.sort();
        assert_eq!(removed, expected);
    }

    #[test]
    fn concurrent_replace_diffs_against_its_own_table() {
        let store = TenantSettingsStore::default();
        let ids = [TenantId::new_v4(), TenantId::new_v4(), TenantId::new_v4()];

        std::thread::scope(|scope| {
            for id in ids {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..500 {
                        let changed = store.replace(into_table([(id, TenantSettings::default())]));
                        assert!(
                            changed.is_empty() || changed.contains(&id),
                            "diff {changed:?} does not describe the installed table"
                        );
                    }
                });
            }
        });
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TenantSettings =
            serde_json::from_str(r#"{"features":["welcome_page"],"modules":["routed"]}"#).unwrap();
        assert!(settings.has_feature("welcome_page"));
        assert!(settings.has_module("routed"));
        assert!(settings.values.is_empty());
    }
}
