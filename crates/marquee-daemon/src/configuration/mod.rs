//! Configuration manager for application-overridable configurables.
//!
//! Applications may override a small set of process-wide configurables (app
//! name, logo, favicon, sidebar tabs). Overrides are scoped to the
//! application id so they can be cleared when the application stops, and the
//! newest override wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use marquee_core::event::Event;
use serde::{Deserialize, Serialize};

/// The overridable configurables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Configurable {
    ApplicationName,
    LogoUrl,
    FaviconUrl,
    SidebarTabs,
}

/// A sidebar tab published by an application page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidebarTabData {
    pub tab_id: String,
    pub application_id: String,
    pub page_id: String,
    pub title: String,
    pub before_tab_id: String,
}

/// Value of a configurable override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurableValue {
    Text(String),
    SidebarTab(SidebarTabData),
}

/// Errors from configurable updates.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("configurable does not accept this value type")]
    TypeMismatch,
}

/// The configuration manager.
pub struct ConfigurationManager {
    overrides: Mutex<HashMap<Configurable, Vec<(String, ConfigurableValue)>>>,
    on_changed: Event<Configurable>,
}

impl ConfigurationManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            overrides: Mutex::new(HashMap::new()),
            on_changed: Event::new(),
        })
    }

    pub fn on_changed(&self) -> &Event<Configurable> {
        &self.on_changed
    }

    /// Set (or replace) the application's override for a configurable.
    pub fn set_configurable(
        &self,
        configurable: Configurable,
        application_id: &str,
        value: ConfigurableValue,
    ) -> Result<bool, ConfigurationError> {
        let type_matches = match configurable {
            Configurable::SidebarTabs => matches!(value, ConfigurableValue::SidebarTab(_)),
            _ => matches!(value, ConfigurableValue::Text(_)),
        };
        if !type_matches {
            return Err(ConfigurationError::TypeMismatch);
        }

        {
            let mut overrides = self.overrides.lock().expect("configurables poisoned");
            let entries = overrides.entry(configurable).or_default();
            entries.retain(|(app, _)| app != application_id);
            entries.push((application_id.to_string(), value));
        }
        self.on_changed.notify(configurable);
        Ok(true)
    }

    /// Clear the application's override for a configurable. Idempotent.
    pub fn reset_configurable(&self, configurable: Configurable, application_id: &str) {
        let removed = {
            let mut overrides = self.overrides.lock().expect("configurables poisoned");
            match overrides.get_mut(&configurable) {
                Some(entries) => {
                    let before = entries.len();
                    entries.retain(|(app, _)| app != application_id);
                    before != entries.len()
                }
                None => false,
            }
        };
        if removed {
            self.on_changed.notify(configurable);
        }
    }

    /// Clear every override the application holds.
    pub fn reset_all_for_application(&self, application_id: &str) {
        let changed: Vec<Configurable> = {
            let mut overrides = self.overrides.lock().expect("configurables poisoned");
            overrides
                .iter_mut()
                .filter_map(|(configurable, entries)| {
                    let before = entries.len();
                    entries.retain(|(app, _)| app != application_id);
                    (before != entries.len()).then_some(*configurable)
                })
                .collect()
        };
        for configurable in changed {
            self.on_changed.notify(configurable);
        }
    }

    /// The effective value: the newest override, if any.
    pub fn effective(&self, configurable: Configurable) -> Option<ConfigurableValue> {
        let overrides = self.overrides.lock().expect("configurables poisoned");
        overrides
            .get(&configurable)
            .and_then(|entries| entries.last())
            .map(|(_, value)| value.clone())
    }

    /// All sidebar tabs currently published, oldest first.
    pub fn sidebar_tabs(&self) -> Vec<SidebarTabData> {
        let overrides = self.overrides.lock().expect("configurables poisoned");
        overrides
            .get(&Configurable::SidebarTabs)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|(_, value)| match value {
                        ConfigurableValue::SidebarTab(tab) => Some(tab.clone()),
                        ConfigurableValue::Text(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self {
            overrides: Mutex::new(HashMap::new()),
            on_changed: Event::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newest_override_wins() {
        let manager = ConfigurationManager::new();
        manager
            .set_configurable(
                Configurable::ApplicationName,
                "app-a",
                ConfigurableValue::Text("Alpha".into()),
            )
            .unwrap();
        manager
            .set_configurable(
                Configurable::ApplicationName,
                "app-b",
                ConfigurableValue::Text("Beta".into()),
            )
            .unwrap();

        assert_eq!(
            manager.effective(Configurable::ApplicationName),
            Some(ConfigurableValue::Text("Beta".into()))
        );

        manager.reset_configurable(Configurable::ApplicationName, "app-b");
        assert_eq!(
            manager.effective(Configurable::ApplicationName),
            Some(ConfigurableValue::Text("Alpha".into()))
        );
    }

    #[tokio::test]
    async fn sidebar_tabs_require_tab_values() {
        let manager = ConfigurationManager::new();
        let err = manager
            .set_configurable(
                Configurable::SidebarTabs,
                "app",
                ConfigurableValue::Text("nope".into()),
            )
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::TypeMismatch));
    }

    #[tokio::test]
    async fn reset_all_clears_every_override() {
        let manager = ConfigurationManager::new();
        manager
            .set_configurable(
                Configurable::LogoUrl,
                "app",
                ConfigurableValue::Text("/logo.png".into()),
            )
            .unwrap();
        manager
            .set_configurable(
                Configurable::FaviconUrl,
                "app",
                ConfigurableValue::Text("/favicon.png".into()),
            )
            .unwrap();

        manager.reset_all_for_application("app");
        assert_eq!(manager.effective(Configurable::LogoUrl), None);
        assert_eq!(manager.effective(Configurable::FaviconUrl), None);
    }
}
