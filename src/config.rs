//! Deployment settings read from the environment. Only the demo binary
//! consumes these; engine behavior never depends on them.

use std::collections::HashMap;

/// Endpoint of the local emulator. Selecting it turns authentication off.
pub const LOCAL_EMULATOR_ENDPOINT: &str = "http://localhost:8080";
pub const DEFAULT_TASK_HUB: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    /// Ambient managed identity / default credential chain.
    DefaultCredential,
}

impl AuthMode {
    fn connection_value(self) -> &'static str {
        match self {
            AuthMode::None => "None",
            AuthMode::DefaultCredential => "DefaultAzure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub endpoint: String,
    /// Endpoint up to the first `;`.
    pub host_address: String,
    pub task_hub: String,
    pub auth: AuthMode,
}

impl ConnectionConfig {
    /// Read `ENDPOINT` and `TASKHUB`, falling back to the local emulator and
    /// the `default` hub.
    pub fn from_env() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let endpoint = vars
            .get("ENDPOINT")
            .cloned()
            .unwrap_or_else(|| LOCAL_EMULATOR_ENDPOINT.to_string());
        let task_hub = vars
            .get("TASKHUB")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TASK_HUB.to_string());
        Self::new(endpoint, task_hub)
    }

    pub fn new(endpoint: impl Into<String>, task_hub: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let host_address = match endpoint.split_once(';') {
            Some((host, _)) => host.to_string(),
            None => endpoint.clone(),
        };
        let auth = if endpoint == LOCAL_EMULATOR_ENDPOINT {
            AuthMode::None
        } else {
            AuthMode::DefaultCredential
        };
        Self {
            endpoint,
            host_address,
            task_hub: task_hub.into(),
            auth,
        }
    }

    pub fn is_local_emulator(&self) -> bool {
        self.auth == AuthMode::None
    }

    pub fn connection_string(&self) -> String {
        format!(
            "Endpoint={};TaskHub={};Authentication={}",
            self.host_address,
            self.task_hub,
            self.auth.connection_value()
        )
    }
}
