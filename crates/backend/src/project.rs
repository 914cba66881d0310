//! Per-project configuration lookup

use ahash::AHashMap;
use digest_core::Overrides;
use serde::{Deserialize, Serialize};

/// Source of per-project switches and delay overrides
pub trait ProjectConfig: Send + Sync {
    /// Whether digests are delivered for this project
    fn enabled(&self, _project: &str) -> bool {
        true
    }

    /// Delay and capacity overrides for this project
    fn overrides(&self, _project: &str) -> Overrides {
        Overrides::default()
    }
}

/// Every project enabled, no overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct AllProjects;

impl ProjectConfig for AllProjects {}

/// Settings for one project
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub overrides: Overrides,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            overrides: Overrides::default(),
        }
    }
}

/// Fixed table of project settings, typically loaded from a config file
#[derive(Debug, Clone, Default)]
pub struct StaticProjects {
    projects: AHashMap<String, ProjectSettings>,
}

impl StaticProjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one project's settings
    pub fn with(mut self, project: impl Into<String>, settings: ProjectSettings) -> Self {
        self.projects.insert(project.into(), settings);
        self
    }

    pub fn get(&self, project: &str) -> Option<&ProjectSettings> {
        self.projects.get(project)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, ProjectSettings)> for StaticProjects {
    fn from_iter<I: IntoIterator<Item = (K, ProjectSettings)>>(iter: I) -> Self {
        Self {
            projects: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl ProjectConfig for StaticProjects {
    fn enabled(&self, project: &str) -> bool {
        self.projects.get(project).map(|p| p.enabled).unwrap_or(true)
    }

    fn overrides(&self, project: &str) -> Overrides {
        self.projects
            .get(project)
            .map(|p| p.overrides)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_projects_use_defaults() {
        let projects = StaticProjects::new();
        assert!(projects.enabled("42"));
        assert!(projects.overrides("42").is_empty());
    }

    #[test]
    fn test_static_lookup() {
        let projects = StaticProjects::new()
            .with(
                "1",
                ProjectSettings {
                    enabled: false,
                    ..Default::default()
                },
            )
            .with(
                "2",
                ProjectSettings {
                    enabled: true,
                    overrides: Overrides {
                        maximum_delay: Some(60.0),
                        ..Default::default()
                    },
                },
            );

        assert!(!projects.enabled("1"));
        assert!(projects.enabled("2"));
        assert_eq!(projects.overrides("2").maximum_delay, Some(60.0));
        assert_eq!(projects.len(), 2);
    }

    #[test]
    fn test_settings_deserialize_flat() {
        let settings: ProjectSettings =
            serde_json::from_str(r#"{"enabled": false, "increment_delay": 15.0}"#).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.overrides.increment_delay, Some(15.0));
        assert_eq!(settings.overrides.capacity, None);
    }
}
