//! Name -> handler tables, fixed before the runtime starts. Lookups happen at
//! dispatch time, so an instance that names an unknown handler fails then
//! rather than at scheduling.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::{Codec, Json};
use crate::OrchestrationContext;

/// Immutable, cheaply cloned lookup table.
pub struct Registry<H: ?Sized> {
    handlers: Arc<HashMap<String, Arc<H>>>,
}

impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(HashMap::new()),
        }
    }
}

impl<H: ?Sized> Registry<H> {
    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Collects handlers; the first registration of a name wins and later ones
/// are remembered as errors for [`RegistryBuilder::build_result`].
pub struct RegistryBuilder<H: ?Sized> {
    kind: &'static str,
    handlers: HashMap<String, Arc<H>>,
    duplicates: Vec<String>,
}

impl<H: ?Sized> RegistryBuilder<H> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    fn insert(mut self, name: String, handler: Arc<H>) -> Self {
        if self.handlers.contains_key(&name) {
            tracing::warn!(kind = self.kind, name = %name, "duplicate registration ignored");
            self.duplicates.push(name);
        } else {
            self.handlers.insert(name, handler);
        }
        self
    }

    pub fn build(self) -> Registry<H> {
        Registry {
            handlers: Arc::new(self.handlers),
        }
    }

    /// Like `build`, but fails if any name was registered twice.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.duplicates.is_empty() {
            return Ok(self.build());
        }
        let kind = self.kind;
        Err(self
            .duplicates
            .iter()
            .map(|name| format!("duplicate {kind} registration: {name}"))
            .collect::<Vec<_>>()
            .join("; "))
    }
}

fn decode_input<In: DeserializeOwned>(kind: &str, raw: &str) -> Result<In, String> {
    Json::decode(raw).map_err(|e| format!("invalid {kind} input: {e}"))
}

// ---------------- Orchestrations

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;

impl Registry<dyn OrchestrationHandler> {
    pub fn builder() -> OrchestrationRegistryBuilder {
        RegistryBuilder::new("orchestration")
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        self.names()
    }
}

impl RegistryBuilder<dyn OrchestrationHandler> {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)))
    }

    /// Register an orchestration with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |ctx: OrchestrationContext, raw: String| {
            let f = f.clone();
            async move {
                let input: In = decode_input("orchestration", &raw)?;
                Json::encode(&f(ctx, input).await?)
            }
        })
    }
}

// ---------------- Activities

/// A unit of side-effecting work. Input and output are opaque strings;
/// `Err` becomes an `ActivityFailed` event.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F>(pub F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl Registry<dyn ActivityHandler> {
    /// Start a builder with the system activities behind
    /// `system_now_ms` and `system_new_guid` already registered.
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder::new("activity")
            .register(crate::SYSTEM_NOW_ACTIVITY, |_input: String| async move {
                let now_ms = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis();
                Ok(now_ms.to_string())
            })
            .register(crate::SYSTEM_NEW_GUID_ACTIVITY, |_input: String| async move {
                Ok(uuid::Uuid::new_v4().to_string())
            })
    }
}

impl RegistryBuilder<dyn ActivityHandler> {
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)))
    }

    /// Register an activity with JSON-decoded input and JSON-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |raw: String| {
            let f = f.clone();
            async move {
                let input: In = decode_input("activity", &raw)?;
                Json::encode(&f(input).await?)
            }
        })
    }
}
