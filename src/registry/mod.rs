//! Typed, domain-filterable action registry.
//!
//! Actions are registered with a parameter schema, an async handler, and
//! optional filters; the per-step allowed set is computed from the current
//! page URL, an include list, and done-only enforcement.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::views::{ActionInvocation, ActionResult};
use crate::browser::{BrowserError, BrowserSession};
use crate::filesystem::AgentFileSystem;
use crate::llm::ChatModel;
use crate::utils::sensitive::{SensitiveData, secrets_for_url, substitute_value};
use crate::utils::url::{domain_matches, validate_action_domain_pattern};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<ActionResult, BrowserError>> + Send>>;
pub type ActionHandler = Arc<dyn Fn(Value, ActionContext) -> HandlerFuture + Send + Sync>;
pub type PageFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Everything a handler may need
#[derive(Clone)]
pub struct ActionContext {
    pub browser_session: Arc<dyn BrowserSession>,
    pub page_extraction_llm: Option<Arc<dyn ChatModel>>,
    /// Schema the task's final answer must conform to, if any
    pub extraction_schema: Option<Value>,
    pub sensitive_data: Option<SensitiveData>,
    pub available_file_paths: Vec<String>,
    pub file_system: Arc<Mutex<AgentFileSystem>>,
    pub signal: Option<CancellationToken>,
    /// Opaque user context forwarded verbatim
    pub context: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("action '{0}' is not registered")]
    UnknownAction(String),

    #[error("invalid parameters for '{action}': {message}")]
    InvalidParams { action: String, message: String },

    #[error("invalid action invocation: {0}")]
    InvalidInvocation(String),

    #[error("action '{action}' is not available: {reason}")]
    NotAvailable { action: String, reason: String },

    #[error("{0}")]
    BadDomainPattern(String),
}

/// Registration options; every field defaults off
#[derive(Default)]
pub struct RegisterOptions {
    /// Overrides the registered name
    pub action_name: Option<String>,
    /// URL patterns the action is limited to
    pub domains: Option<Vec<String>>,
    /// Predicate over the current page URL
    pub page_filter: Option<PageFilter>,
    /// Whether the action ends the step's action sequence after running
    pub terminates_sequence: bool,
}

/// A registered action
pub struct RegisteredAction {
    pub name: String,
    pub description: String,
    pub param_schema: Value,
    validate: Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>,
    pub domains: Option<Vec<String>>,
    page_filter: Option<PageFilter>,
    pub terminates_sequence: bool,
    handler: ActionHandler,
}

impl RegisteredAction {
    fn available_for(&self, page_url: Option<&str>) -> bool {
        if let Some(domains) = &self.domains {
            let Some(url) = page_url else {
                return false;
            };
            if !domains.iter().any(|d| domain_matches(d, url)) {
                return false;
            }
        }
        if let Some(filter) = &self.page_filter
            && let Some(url) = page_url
            && !filter(url)
        {
            return false;
        }
        true
    }
}

/// Validator over the filtered action set, handed to the step executor
#[derive(Debug, Clone)]
pub struct ActionModel {
    available_actions: Vec<String>,
}

impl ActionModel {
    pub fn available_actions(&self) -> &[String] {
        &self.available_actions
    }

    pub fn allows(&self, name: &str) -> bool {
        self.available_actions.iter().any(|a| a == name)
    }
}

/// Catalog of named actions
#[derive(Default)]
pub struct ActionRegistry {
    actions: Vec<RegisteredAction>,
    aliases: Vec<(String, String)>,
    excluded: Vec<String>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names excluded from registration (and from alias resolution)
    pub fn with_excluded(mut self, excluded: Vec<String>) -> Self {
        self.excluded = excluded;
        self
    }

    /// Register an action under `name` (`options.action_name` wins).
    /// Excluded names are silently dropped. Domain patterns are validated
    /// against the broadness policy.
    pub fn register<P, F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        options: RegisterOptions,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        P: DeserializeOwned + Serialize + JsonSchema + Send + 'static,
        F: Fn(P, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, BrowserError>> + Send + 'static,
    {
        let name = options.action_name.clone().unwrap_or_else(|| name.to_string());
        if self.excluded.iter().any(|e| e == &name) {
            debug!(action = %name, "Skipping excluded action");
            return Ok(());
        }
        if let Some(domains) = &options.domains {
            for pattern in domains {
                validate_action_domain_pattern(pattern)
                    .map_err(RegistryError::BadDomainPattern)?;
            }
        }

        let schema = schemars::schema_for!(P);
        let param_schema = serde_json::to_value(schema).unwrap_or(Value::Null);

        let validate: Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync> =
            Arc::new(move |raw: &Value| {
                let params: P = serde_json::from_value(raw.clone()).map_err(|e| e.to_string())?;
                serde_json::to_value(&params).map_err(|e| e.to_string())
            });

        let handler: ActionHandler = Arc::new(move |params: Value, context: ActionContext| {
            let typed: Result<P, _> = serde_json::from_value(params);
            match typed {
                Ok(params) => Box::pin(handler(params, context)) as HandlerFuture,
                Err(e) => {
                    let message = format!("parameter deserialization failed: {e}");
                    Box::pin(async move { Err(BrowserError::action(message)) }) as HandlerFuture
                }
            }
        });

        self.actions.retain(|a| a.name != name);
        self.actions.push(RegisteredAction {
            name,
            description: description.to_string(),
            param_schema,
            validate,
            domains: options.domains,
            page_filter: options.page_filter,
            terminates_sequence: options.terminates_sequence,
            handler,
        });
        Ok(())
    }

    /// Register an alias; resolution respects exclusions of the target
    pub fn register_alias(&mut self, alias: &str, target: &str) {
        if self.excluded.iter().any(|e| e == alias) {
            return;
        }
        self.aliases.retain(|(a, _)| a != alias);
        self.aliases.push((alias.to_string(), target.to_string()));
    }

    /// Resolve an alias to its target name (identity for real actions)
    pub fn resolve_name(&self, name: &str) -> String {
        self.aliases
            .iter()
            .find(|(alias, _)| alias == name)
            .map(|(_, target)| target.clone())
            .unwrap_or_else(|| name.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredAction> {
        let resolved = self.resolve_name(name);
        self.actions.iter().find(|a| a.name == resolved)
    }

    pub fn action_names(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.name.clone()).collect()
    }

    /// Whether an action ends the step's sequence after running
    pub fn terminates_sequence(&self, name: &str) -> bool {
        self.get(name).map(|a| a.terminates_sequence).unwrap_or(false)
    }

    /// Catalog rendering filtered by the page URL
    pub fn get_prompt_description(&self, page_url: Option<&str>) -> String {
        let mut sections = Vec::new();
        for action in &self.actions {
            if !action.available_for(page_url) {
                continue;
            }
            let schema = action
                .param_schema
                .get("properties")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new()));
            sections.push(format!(
                "- {}: {}\n  Parameters: {}",
                action.name, action.description, schema
            ));
        }
        sections.join("\n")
    }

    /// Validator accepting exactly one registered key from the filtered set
    pub fn create_action_model(
        &self,
        include_actions: Option<&[String]>,
        page_url: Option<&str>,
    ) -> ActionModel {
        let available_actions = self
            .actions
            .iter()
            .filter(|a| a.available_for(page_url))
            .filter(|a| {
                include_actions
                    .map(|include| include.iter().any(|i| self.resolve_name(i) == a.name))
                    .unwrap_or(true)
            })
            .map(|a| a.name.clone())
            .collect();
        ActionModel { available_actions }
    }

    /// Validate an invocation against the allowed set: shape, name
    /// resolution, and parameter schema. Returns the canonicalized
    /// invocation.
    pub fn validate_invocation(
        &self,
        invocation: &ActionInvocation,
        model: &ActionModel,
    ) -> Result<ActionInvocation, RegistryError> {
        if invocation.is_empty() {
            return Err(RegistryError::InvalidInvocation(
                "action invocation is empty".into(),
            ));
        }
        let resolved = self.resolve_name(&invocation.name);
        let action = self
            .actions
            .iter()
            .find(|a| a.name == resolved)
            .ok_or_else(|| RegistryError::UnknownAction(invocation.name.clone()))?;
        if !model.allows(&resolved) {
            return Err(RegistryError::NotAvailable {
                action: resolved,
                reason: "not permitted in the current step".into(),
            });
        }
        let params =
            (action.validate)(&invocation.params).map_err(|message| {
                RegistryError::InvalidParams {
                    action: action.name.clone(),
                    message,
                }
            })?;
        Ok(ActionInvocation::new(action.name.clone(), params))
    }

    /// Execute an action: validate parameters, substitute sensitive
    /// placeholders scoped to the session URL, then run the handler.
    ///
    /// An already-aborted signal propagates unchanged. Handler errors other
    /// than aborts become a result bearing `error`, preserving any
    /// structured memory the error carried.
    pub async fn execute_action(
        &self,
        name: &str,
        raw_params: Value,
        context: ActionContext,
    ) -> Result<ActionResult, BrowserError> {
        let resolved = self.resolve_name(name);
        let action = self
            .actions
            .iter()
            .find(|a| a.name == resolved)
            .ok_or_else(|| BrowserError::action(format!("unknown action '{name}'")))?;

        let mut params = (action.validate)(&raw_params)
            .map_err(|e| BrowserError::action(format!("invalid parameters for '{resolved}': {e}")))?;

        if let Some(sensitive) = &context.sensitive_data {
            let current_url = context.browser_session.current_url().await.ok();
            let secrets = secrets_for_url(sensitive, current_url.as_deref());
            substitute_value(&mut params, &secrets);
        }

        if let Some(signal) = &context.signal
            && signal.is_cancelled()
        {
            return Err(BrowserError::Aborted);
        }

        match (action.handler)(params, context).await {
            Ok(result) => Ok(result),
            Err(BrowserError::Aborted) => Err(BrowserError::Aborted),
            Err(err) => {
                warn!(action = %resolved, "Action failed: {err}");
                Ok(ActionResult {
                    error: Some(err.to_string()),
                    extracted_content: err.short_term_memory().map(str::to_string),
                    long_term_memory: err.long_term_memory().map(str::to_string),
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, serde::Deserialize, JsonSchema)]
    struct EchoParams {
        text: String,
    }

    fn registry_with_echo() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry
            .register::<EchoParams, _, _>(
                "echo",
                "Echo the given text",
                RegisterOptions::default(),
                |params, _ctx| async move { Ok(ActionResult::content(params.text)) },
            )
            .expect("register echo");
        registry
    }

    #[test]
    fn excluded_actions_are_silently_dropped() {
        let mut registry = ActionRegistry::new().with_excluded(vec!["echo".into()]);
        registry
            .register::<EchoParams, _, _>(
                "echo",
                "Echo",
                RegisterOptions::default(),
                |params, _ctx| async move { Ok(ActionResult::content(params.text)) },
            )
            .expect("register should be ok");
        assert!(registry.get("echo").is_none());
    }

    #[test]
    fn broad_domain_patterns_fail_registration() {
        let mut registry = ActionRegistry::new();
        let result = registry.register::<EchoParams, _, _>(
            "echo",
            "Echo",
            RegisterOptions {
                domains: Some(vec!["*".into()]),
                ..Default::default()
            },
            |params, _ctx| async move { Ok(ActionResult::content(params.text)) },
        );
        assert!(matches!(result, Err(RegistryError::BadDomainPattern(_))));
    }

    #[test]
    fn action_model_filters_by_domain() {
        let mut registry = registry_with_echo();
        registry
            .register::<EchoParams, _, _>(
                "bank_only",
                "Bank-scoped action",
                RegisterOptions {
                    domains: Some(vec!["*.bank.test".into()]),
                    ..Default::default()
                },
                |params, _ctx| async move { Ok(ActionResult::content(params.text)) },
            )
            .expect("register");

        let on_bank = registry.create_action_model(None, Some("https://app.bank.test/login"));
        assert!(on_bank.allows("bank_only"));
        let elsewhere = registry.create_action_model(None, Some("https://other.test/"));
        assert!(!elsewhere.allows("bank_only"));
        assert!(elsewhere.allows("echo"));
    }

    #[test]
    fn aliases_resolve_before_validation() {
        let mut registry = registry_with_echo();
        registry.register_alias("repeat", "echo");
        let model = registry.create_action_model(None, None);
        let invocation = ActionInvocation::new("repeat", json!({"text": "hi"}));
        let validated = registry
            .validate_invocation(&invocation, &model)
            .expect("alias resolves");
        assert_eq!(validated.name, "echo");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let registry = registry_with_echo();
        let model = registry.create_action_model(None, None);
        let invocation = ActionInvocation::new("echo", json!({"wrong": 1}));
        let err = registry
            .validate_invocation(&invocation, &model)
            .expect_err("missing field must fail");
        assert!(matches!(err, RegistryError::InvalidParams { .. }));
    }
}
