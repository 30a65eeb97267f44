// ABOUTME: Caller-supplied description of an application to spawn.
// ABOUTME: Serializes positionally into the strings carried by the spawn_application request.

use serde::{Deserialize, Serialize};

/// What to spawn: the application root plus engine/environment parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnOptions {
    /// Root directory of the application.
    pub app_root: String,
    /// Whether the helper should drop to the application's owner before loading it.
    pub lower_privilege: bool,
    /// User to fall back to when lowering privilege to the owner is impossible.
    pub lowest_user: String,
    /// Application environment, e.g. "production".
    pub environment: String,
    /// How the helper loads the application ("smart-lv2", "smart", "conservative").
    pub spawn_method: String,
    /// Application framework type, e.g. "rails" or "rack".
    pub app_type: String,
    /// Idle seconds before the framework spawner exits; -1 keeps the helper default.
    pub framework_spawner_timeout: i64,
    /// Idle seconds before the application spawner exits; -1 keeps the helper default.
    pub app_spawner_timeout: i64,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            app_root: String::new(),
            lower_privilege: true,
            lowest_user: "nobody".to_string(),
            environment: "production".to_string(),
            spawn_method: "smart-lv2".to_string(),
            app_type: "rails".to_string(),
            framework_spawner_timeout: -1,
            app_spawner_timeout: -1,
        }
    }
}

impl SpawnOptions {
    /// Options for `app_root` with every other field at its default.
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            ..Self::default()
        }
    }

    /// Copy of these options pointed at a different application root.
    pub fn for_app(&self, app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            ..self.clone()
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_spawn_method(mut self, spawn_method: impl Into<String>) -> Self {
        self.spawn_method = spawn_method.into();
        self
    }

    pub fn with_app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = app_type.into();
        self
    }

    /// Positional wire form. The application root always comes first.
    pub fn to_vec(&self) -> Vec<String> {
        vec![
            self.app_root.clone(),
            bool_str(self.lower_privilege).to_string(),
            self.lowest_user.clone(),
            self.environment.clone(),
            self.spawn_method.clone(),
            self.app_type.clone(),
            self.framework_spawner_timeout.to_string(),
            self.app_spawner_timeout.to_string(),
        ]
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
