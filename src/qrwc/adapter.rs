//! Command adapter: semantic commands over the wire dialect.
//!
//! The adapter accepts a small vocabulary of semantic methods
//! (`Status.Get`, `Component.*`, `Control.*`, `ChangeGroup.*`),
//! validates and coerces values, retries transient failures per command,
//! and keeps the component/control index current as discovery responses
//! pass through it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::core::component::{Component, ControlInfo};
use crate::core::control::{
    coerce_value, normalize_read, ControlMetadata, ControlPath, ControlType, ControlValue,
};
use crate::core::component::ComponentIndex;
use crate::core::error::{ErrorCode, QsysError, Result};
use crate::qrwc::breaker::CircuitBreaker;
use crate::qrwc::supervisor::ConnectionSupervisor;

/// Per-command retry/timeout options.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Retries after the first attempt (transient failures only).
    pub max_retries: u32,

    /// Delay between attempts.
    pub retry_delay: Duration,

    /// Per-frame response deadline.
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Transport seam between the adapter and the supervisor.
///
/// The supervisor is the production implementation; tests script one.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Send one frame and await the result payload.
    async fn send_frame(&self, method: &str, params: Value, timeout: Duration) -> Result<Value>;

    /// Whether commands can currently be sent.
    fn is_connected(&self) -> bool;

    /// The breaker gating calls.
    fn breaker(&self) -> &Arc<CircuitBreaker>;
}

#[async_trait]
impl FrameTransport for ConnectionSupervisor {
    async fn send_frame(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        ConnectionSupervisor::send_frame(self, method, params, timeout).await
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn breaker(&self) -> &Arc<CircuitBreaker> {
        ConnectionSupervisor::breaker(self)
    }
}

/// Change-group methods are delegated through this seam; the registry
/// implements it. Wired once at runtime construction.
#[async_trait]
pub trait ChangeGroupHandler: Send + Sync {
    /// Execute one `ChangeGroup.*` method.
    async fn handle(&self, method: &str, params: Value) -> Result<Value>;
}

/// A normalized control reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReading {
    /// Dotted control name as requested.
    pub name: String,

    /// Normalized value (booleans surface as 0/1).
    pub value: ControlValue,

    /// Display string.
    pub string: String,

    /// Position companion, when the core reported one.
    pub position: Option<f64>,
}

/// Batched control reads, used by the change-group poller.
#[async_trait]
pub trait ControlReader: Send + Sync {
    /// Read current values for the named controls.
    async fn read_controls(&self, names: &[String]) -> Result<Vec<ControlReading>>;

    /// Whether a path resolves against the discovery index.
    fn resolves(&self, path: &ControlPath) -> bool;
}

/// The command adapter.
pub struct CommandAdapter {
    transport: Arc<dyn FrameTransport>,
    index: Arc<ComponentIndex>,
    defaults: SendOptions,
    change_groups: OnceCell<Arc<dyn ChangeGroupHandler>>,
}

impl CommandAdapter {
    /// Create an adapter over the given transport.
    pub fn new(transport: Arc<dyn FrameTransport>, index: Arc<ComponentIndex>) -> Self {
        Self {
            transport,
            index,
            defaults: SendOptions::default(),
            change_groups: OnceCell::new(),
        }
    }

    /// Override the default retry/timeout options.
    #[must_use]
    pub fn with_defaults(mut self, defaults: SendOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Attach the change-group registry. Later calls are ignored.
    pub fn attach_change_groups(&self, handler: Arc<dyn ChangeGroupHandler>) {
        let _ = self.change_groups.set(handler);
    }

    /// The discovery index.
    pub fn index(&self) -> &Arc<ComponentIndex> {
        &self.index
    }

    /// Whether the underlying transport can carry commands right now.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Execute a semantic command with default options.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        self.send_command_with(method, params, self.defaults).await
    }

    /// Execute a semantic command.
    pub async fn send_command_with(
        &self,
        method: &str,
        params: Value,
        opts: SendOptions,
    ) -> Result<Value> {
        if !self.transport.is_connected() {
            return Err(QsysError::connection("Q-SYS Core not connected"));
        }

        if method.starts_with("ChangeGroup.") {
            let handler = self.change_groups.get().ok_or_else(|| {
                QsysError::internal("Change-group registry not attached")
            })?;
            return handler.handle(method, params).await;
        }

        match method {
            "Status.Get" => self.passthrough("Status.Get", Value::Null, opts).await,
            "Component.GetComponents" => self.get_components(opts).await,
            "Component.GetControls" => self.get_controls(params, opts).await,
            "Component.Get" => self.component_get(params, opts).await,
            "Control.Get" | "Control.GetValues" => self.control_get(params, opts).await,
            "Control.Set" | "Control.SetValues" => self.control_set(params, opts).await,
            other => Err(QsysError::unknown_command(other)),
        }
    }

    // === Individual methods ===

    async fn passthrough(&self, method: &str, params: Value, opts: SendOptions) -> Result<Value> {
        self.with_retry(&opts, || {
            self.transport.send_frame(method, params.clone(), opts.timeout)
        })
        .await
    }

    async fn get_components(&self, opts: SendOptions) -> Result<Value> {
        let result = self
            .passthrough("Component.GetComponents", Value::Null, opts)
            .await?;

        if let Ok(components) = serde_json::from_value::<Vec<Component>>(result.clone()) {
            self.index.replace_components(components);
        }
        Ok(result)
    }

    async fn get_controls(&self, params: Value, opts: SendOptions) -> Result<Value> {
        let name = params
            .get("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| QsysError::validation("Component.GetControls requires Name"))?
            .to_string();

        let result = self
            .passthrough("Component.GetControls", params.clone(), opts)
            .await
            .map_err(|e| match e.code {
                ErrorCode::QsysCommandFailed => QsysError::invalid_component(&name),
                _ => e,
            })?;

        self.index_controls(&name, &result);
        Ok(self.normalize_component_controls(&name, result))
    }

    async fn component_get(&self, params: Value, opts: SendOptions) -> Result<Value> {
        let name = params
            .get("Name")
            .and_then(Value::as_str)
            .ok_or_else(|| QsysError::validation("Component.Get requires Name"))?
            .to_string();

        let result = self.passthrough("Component.Get", params, opts).await?;
        Ok(self.normalize_component_controls(&name, result))
    }

    async fn control_get(&self, params: Value, opts: SendOptions) -> Result<Value> {
        let names = parse_names(&params)?;
        if names.is_empty() {
            return Ok(Value::Array(Vec::new()));
        }

        let result = self
            .passthrough(
                "Control.Get",
                serde_json::json!({ "Names": names }),
                opts,
            )
            .await?;

        let entries = result
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|entry| self.normalize_control_entry(entry))
            .collect();
        Ok(Value::Array(entries))
    }

    /// `Control.Set` / `Control.SetValues`: one result per requested
    /// control, in input order. A control that fails validation or
    /// exhausts its retries becomes an error entry; it never fails the
    /// call.
    async fn control_set(&self, params: Value, opts: SendOptions) -> Result<Value> {
        let requests = parse_set_requests(&params)?;
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            let outcome = self.set_one(&request, &opts).await;
            results.push(match outcome {
                Ok(()) => serde_json::json!({
                    "Name": request.name,
                    "Result": "Success",
                }),
                Err(e) => serde_json::json!({
                    "Name": request.name,
                    "Result": "Error",
                    "Error": e.message,
                }),
            });
        }

        Ok(Value::Array(results))
    }

    /// One per-control set with its own retry budget.
    async fn set_one(&self, request: &SetRequest, opts: &SendOptions) -> Result<()> {
        let path = ControlPath::parse(&request.name)?;
        if !self.index.resolves(&path) {
            return Err(QsysError::invalid_control(&request.name));
        }

        let metadata = self.index.control_metadata(&path);
        let value = coerce_value(&request.value, metadata.as_ref())?;

        let mut frame = serde_json::json!({
            "Name": request.name,
            "Value": value.to_wire(),
        });
        if let Some(ramp) = request.ramp {
            frame["Ramp"] = serde_json::json!(ramp);
        }

        self.with_retry(opts, || {
            self.transport
                .send_frame("Control.Set", frame.clone(), opts.timeout)
        })
        .await?;
        Ok(())
    }

    // === Retry loop ===

    /// Retry transient failures, consulting the breaker before every
    /// attempt. An open breaker short-circuits the whole command.
    async fn with_retry<F, Fut>(&self, opts: &SendOptions, call: F) -> Result<Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Value>>,
    {
        let breaker = self.transport.breaker();
        let mut attempt: u32 = 0;

        loop {
            breaker.acquire()?;
            match call().await {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    breaker.record_failure();
                    if attempt >= opts.max_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::debug!(
                        attempt,
                        error = %e,
                        "Retrying transient command failure"
                    );
                    tokio::time::sleep(opts.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // === Normalization & indexing ===

    /// Cache the control list from a `Component.GetControls` response.
    fn index_controls(&self, component: &str, result: &Value) {
        let Some(entries) = result.get("Controls").and_then(Value::as_array) else {
            return;
        };
        let controls = entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("Name")?.as_str()?.to_string();
                let mut metadata = ControlMetadata::default();
                metadata.control_type = entry
                    .get("Type")
                    .and_then(Value::as_str)
                    .and_then(ControlType::from_reported);
                metadata.min = entry.get("ValueMin").and_then(Value::as_f64);
                metadata.max = entry.get("ValueMax").and_then(Value::as_f64);
                Some(ControlInfo {
                    name,
                    metadata,
                    direction: entry
                        .get("Direction")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            })
            .collect();
        self.index.set_controls(component, controls);
    }

    /// Normalize the `Controls` array of a component response.
    fn normalize_component_controls(&self, component: &str, mut result: Value) -> Value {
        if let Some(entries) = result.get_mut("Controls").and_then(Value::as_array_mut) {
            for entry in entries.iter_mut() {
                let metadata = entry
                    .get("Name")
                    .and_then(Value::as_str)
                    .and_then(|control| {
                        ControlPath::parse(&format!("{component}.{control}"))
                            .ok()
                            .and_then(|p| self.index.control_metadata(&p))
                    });
                normalize_entry_in_place(entry, metadata.as_ref());
            }
        }
        result
    }

    /// Normalize one `Control.Get` result entry.
    fn normalize_control_entry(&self, mut entry: Value) -> Value {
        let metadata = entry.get("Name").and_then(Value::as_str).and_then(|name| {
            ControlPath::parse(name)
                .ok()
                .and_then(|p| self.index.control_metadata(&p))
        });
        normalize_entry_in_place(&mut entry, metadata.as_ref());
        entry
    }
}

impl std::fmt::Debug for CommandAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandAdapter")
            .field("connected", &self.transport.is_connected())
            .field("indexed_components", &self.index.len())
            .finish()
    }
}

#[async_trait]
impl ControlReader for CommandAdapter {
    async fn read_controls(&self, names: &[String]) -> Result<Vec<ControlReading>> {
        let result = self
            .send_command("Control.Get", serde_json::json!({ "Names": names }))
            .await?;

        let entries = result.as_array().cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter_map(|entry| {
                let name = entry.get("Name")?.as_str()?.to_string();
                let raw = entry.get("Value").cloned().unwrap_or(Value::Null);
                let metadata = ControlPath::parse(&name)
                    .ok()
                    .and_then(|p| self.index.control_metadata(&p));
                let is_boolean = metadata
                    .as_ref()
                    .and_then(|m| m.control_type)
                    .is_some_and(|t| t.is_boolean());
                let (value, normalized) = normalize_read(&raw, metadata.as_ref());
                let string = if is_boolean {
                    normalized
                } else {
                    entry
                        .get("String")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or(normalized)
                };
                Some(ControlReading {
                    name,
                    value,
                    string,
                    position: entry.get("Position").and_then(Value::as_f64),
                })
            })
            .collect())
    }

    fn resolves(&self, path: &ControlPath) -> bool {
        self.index.resolves(path)
    }
}

/// Rewrite `Value`/`String` on a wire entry per the boolean
/// normalization rules; leave `Position` untouched.
fn normalize_entry_in_place(entry: &mut Value, metadata: Option<&ControlMetadata>) {
    let Some(raw) = entry.get("Value").cloned() else {
        return;
    };
    let (value, string) = normalize_read(&raw, metadata);
    let is_boolean = metadata
        .and_then(|m| m.control_type)
        .is_some_and(|t| t.is_boolean());
    entry["Value"] = value.to_wire();
    if is_boolean || entry.get("String").is_none() {
        entry["String"] = Value::String(string);
    }
}

// === Parameter parsing ===

#[derive(Debug, Clone)]
struct SetRequest {
    name: String,
    value: ControlValue,
    ramp: Option<f64>,
}

/// `{Names:[…]}` or a bare array of names.
fn parse_names(params: &Value) -> Result<Vec<String>> {
    let raw = match params {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("Names")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| QsysError::validation("Control.Get requires Names"))?,
        _ => return Err(QsysError::validation("Control.Get requires Names")),
    };

    raw.into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(QsysError::validation(format!(
                "Control name must be a string, got {other}"
            ))),
        })
        .collect()
}

/// `{Name, Value, Ramp?}` or `{Controls:[{Name, Value, Ramp?}…]}`.
fn parse_set_requests(params: &Value) -> Result<Vec<SetRequest>> {
    let entries: Vec<&Value> = if let Some(controls) = params.get("Controls").and_then(Value::as_array)
    {
        controls.iter().collect()
    } else if params.get("Name").is_some() {
        vec![params]
    } else {
        return Err(QsysError::validation(
            "Control.Set requires Name or Controls",
        ));
    };

    entries
        .into_iter()
        .map(|entry| {
            let name = entry
                .get("Name")
                .and_then(Value::as_str)
                .filter(|n| !n.is_empty())
                .ok_or_else(|| QsysError::validation("Control entry requires a non-empty Name"))?
                .to_string();
            let value = entry
                .get("Value")
                .map(ControlValue::from_wire)
                .ok_or_else(|| QsysError::validation(format!("Control {name} requires Value")))?;
            Ok(SetRequest {
                name,
                value,
                ramp: entry.get("Ramp").and_then(Value::as_f64),
            })
        })
        .collect()
}
