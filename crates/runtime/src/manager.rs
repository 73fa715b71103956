//! Execution manager: validated, time-bounded, pooled capability calls.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capability::{Capability, Declaration, Origin, build, panic_message};
use crate::config::ExecutionConfig;
use crate::error::{CapabilityError, ErrorKind};
use crate::registry::Registry;

/// Outcome of one call. Every path through the manager produces this shape.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub value: Value,
    pub error: Option<String>,
    pub kind: Option<ErrorKind>,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(value: Value, elapsed: Duration) -> Self {
        Self {
            success: true,
            value,
            error: None,
            kind: None,
            elapsed,
        }
    }

    pub fn failure(error: &CapabilityError, elapsed: Duration) -> Self {
        Self {
            success: false,
            value: Value::Null,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
            elapsed,
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(millis(*elapsed))
}

/// A call requested by a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Result of a [`ToolCall`], keyed by its id.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool_call_id: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub capabilities: usize,
}

/// Runs capabilities from a registry on a bounded pool.
pub struct ExecutionManager {
    registry: Arc<Registry>,
    pool: Arc<Semaphore>,
    config: ExecutionConfig,
}

impl ExecutionManager {
    pub fn new(registry: Arc<Registry>, config: ExecutionConfig) -> Self {
        let permits = config.max_concurrent.max(1);
        Self {
            registry,
            pool: Arc::new(Semaphore::new(permits)),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Instantiate a capability, or `None` if it is unknown or fails to build.
    pub fn create_instance(&self, name: &str) -> Option<Arc<dyn Capability>> {
        match self.instantiate(name) {
            Ok(capability) => Some(capability),
            Err(e) => {
                warn!(capability = name, error = %e, "could not create capability instance");
                None
            }
        }
    }

    fn instantiate(&self, name: &str) -> Result<Arc<dyn Capability>, CapabilityError> {
        let factory = self
            .registry
            .lookup(name)
            .ok_or_else(|| CapabilityError::NotFound(name.to_string()))?;
        build(&factory)
    }

    /// Validate and run one capability.
    ///
    /// The configured timeout covers waiting for a pool slot as well as the
    /// call itself. On expiry the call is cancelled and left behind; this
    /// returns immediately without waiting for it.
    #[instrument(skip(self, name, arguments), fields(capability = name))]
    pub async fn execute(&self, name: &str, arguments: Value) -> ExecutionResult {
        let started = Instant::now();

        let capability = match self.instantiate(name) {
            Ok(capability) => capability,
            Err(e) => {
                warn!(error = %e, "capability unavailable");
                return ExecutionResult::failure(&e, started.elapsed());
            }
        };

        match catch_unwind(AssertUnwindSafe(|| capability.validate(&arguments))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "arguments rejected");
                return ExecutionResult::failure(&CapabilityError::Validation(e), started.elapsed());
            }
            Err(panic) => {
                let e = CapabilityError::Execution(format!(
                    "argument validation panicked: {}",
                    panic_message(&*panic)
                ));
                warn!(error = %e, "validation failed");
                return ExecutionResult::failure(&e, started.elapsed());
            }
        }

        // Fires on every exit, including the caller dropping this future.
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let mut task = tokio::spawn(supervise(
            capability,
            arguments,
            cancel.clone(),
            Arc::clone(&self.pool),
            self.config.cancel_grace,
        ));

        let outcome = match tokio::time::timeout(self.config.timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => {
                Err(CapabilityError::Execution("capability panicked".to_string()))
            }
            Ok(Err(e)) => Err(CapabilityError::Execution(e.to_string())),
            Err(_) => {
                cancel.cancel();
                // Dropping the handle detaches the task; whatever it yields is lost.
                drop(task);
                Err(CapabilityError::Timeout(self.config.timeout))
            }
        };

        let elapsed = started.elapsed();
        match outcome {
            Ok(value) => {
                info!(elapsed_ms = millis(elapsed), "capability succeeded");
                ExecutionResult::success(value, elapsed)
            }
            Err(e) => {
                warn!(elapsed_ms = millis(elapsed), error = %e, "capability failed");
                ExecutionResult::failure(&e, elapsed)
            }
        }
    }

    /// Run several calls concurrently. Outcomes come back in input order.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        join_all(calls.iter().map(|call| async move {
            ToolOutcome {
                tool_call_id: call.id.clone(),
                result: self.execute(&call.name, call.input.clone()).await,
            }
        }))
        .await
    }

    pub fn list_available(&self, origin: Option<Origin>) -> Vec<String> {
        match origin {
            Some(origin) => self.registry.list_by_origin(origin),
            None => self.registry.list(),
        }
    }

    /// Declarations for `names`, or for everything registered.
    ///
    /// Unknown names and capabilities that fail to build are left out.
    pub fn to_declaration_list(&self, names: Option<&[String]>) -> Vec<Declaration> {
        let names = match names {
            Some(names) => names.to_vec(),
            None => self.registry.list(),
        };

        names
            .iter()
            .filter_map(|name| self.create_instance(name))
            .map(|capability| capability.to_declaration())
            .collect()
    }

    pub fn health_check(&self) -> HealthReport {
        let capabilities = self.registry.len();
        let status = if self.registry.is_poisoned() || capabilities == 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        HealthReport {
            status,
            capabilities,
        }
    }
}

/// Body of the spawned call task.
async fn supervise(
    capability: Arc<dyn Capability>,
    arguments: Value,
    cancel: CancellationToken,
    pool: Arc<Semaphore>,
    grace: Duration,
) -> Result<Value, CapabilityError> {
    let _permit = tokio::select! {
        permit = Arc::clone(&pool).acquire_owned() => permit
            .map_err(|_| CapabilityError::Execution("execution pool closed".to_string()))?,
        _ = cancel.cancelled() => return Err(CapabilityError::Cancelled),
    };

    let work = capability.execute(arguments, cancel.clone());
    tokio::pin!(work);

    tokio::select! {
        biased;
        result = &mut work => return result,
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(grace, work).await {
        Ok(result) => result,
        Err(_) => {
            debug!(capability = capability.name(), "capability ignored cancellation, dropping it");
            Err(CapabilityError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Factory, factory};
    use crate::schema::{ParamSpec, ParameterSchema};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Echo,
        Sleep(Duration),
        Fail(CapabilityError),
        Panic,
        AwaitCancel(Arc<AtomicBool>),
        Track {
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        },
    }

    struct Probe {
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
        schema: ParameterSchema,
    }

    /// Accepts nothing: its validator panics.
    struct BadValidator;

    #[async_trait]
    impl Capability for BadValidator {
        fn name(&self) -> &str {
            "bad_validator"
        }

        fn description(&self) -> &str {
            "Validator that panics"
        }

        fn parameter_schema(&self) -> &ParameterSchema {
            static EMPTY: std::sync::OnceLock<ParameterSchema> = std::sync::OnceLock::new();
            EMPTY.get_or_init(ParameterSchema::new)
        }

        fn validate(&self, _arguments: &Value) -> Result<(), crate::schema::ValidationError> {
            panic!("validator exploded")
        }

        async fn execute(
            &self,
            _arguments: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, CapabilityError> {
            Ok(Value::Null)
        }
    }

    #[async_trait]
    impl Capability for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn description(&self) -> &str {
            "Test capability"
        }

        fn parameter_schema(&self) -> &ParameterSchema {
            &self.schema
        }

        async fn execute(
            &self,
            arguments: Value,
            cancel: CancellationToken,
        ) -> Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Echo => Ok(arguments),
                Behavior::Sleep(duration) => {
                    tokio::time::sleep(*duration).await;
                    Ok(json!("woke"))
                }
                Behavior::Fail(error) => Err(error.clone()),
                Behavior::Panic => panic!("probe exploded"),
                Behavior::AwaitCancel(observed) => {
                    cancel.cancelled().await;
                    observed.store(true, Ordering::SeqCst);
                    Err(CapabilityError::Cancelled)
                }
                Behavior::Track { in_flight, peak } => {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(now))
                }
            }
        }
    }

    fn register(registry: &Registry, name: &str, behavior: Behavior) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry
            .register(
                name,
                Origin::Builtin,
                factory(move || {
                    Ok(Probe {
                        behavior: behavior.clone(),
                        calls: Arc::clone(&counter),
                        schema: ParameterSchema::new()
                            .param("query", ParamSpec::string("Input").required()),
                    })
                }),
            )
            .unwrap();
        calls
    }

    fn failing(reason: &'static str) -> Factory {
        Arc::new(move || Err(CapabilityError::Instantiation(reason.to_string())))
    }

    fn exploding() -> Factory {
        Arc::new(|| -> Result<Arc<dyn Capability>, CapabilityError> {
            panic!("constructor exploded")
        })
    }

    fn manager(registry: Registry, config: ExecutionConfig) -> ExecutionManager {
        ExecutionManager::new(Arc::new(registry), config)
    }

    #[tokio::test]
    async fn unknown_name_is_not_found() {
        let manager = manager(Registry::new(), ExecutionConfig::default());
        let result = manager.execute("nope", json!({})).await;

        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::NotFound));
        assert_eq!(result.error.as_deref(), Some("tool not found: nope"));
        assert_eq!(result.value, Value::Null);
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_execute() {
        let registry = Registry::new();
        let calls = register(&registry, "probe", Behavior::Echo);
        let manager = manager(registry, ExecutionConfig::default());

        let result = manager.execute("probe", json!({"query": 7})).await;
        assert_eq!(result.kind, Some(ErrorKind::Validation));
        assert!(result.error.unwrap().starts_with("invalid arguments:"));

        let result = manager.execute("probe", json!({})).await;
        assert_eq!(result.kind, Some(ErrorKind::Validation));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_carries_value() {
        let registry = Registry::new();
        register(&registry, "probe", Behavior::Echo);
        let manager = manager(registry, ExecutionConfig::default());

        let result = manager.execute("probe", json!({"query": "hi"})).await;
        assert!(result.success);
        assert_eq!(result.value, json!({"query": "hi"}));
        assert!(result.error.is_none());
        assert!(result.kind.is_none());

        let rendered = serde_json::to_value(&result).unwrap();
        assert!(rendered["elapsed_ms"].is_u64());
    }

    #[tokio::test]
    async fn slow_capability_times_out_promptly() {
        let registry = Registry::new();
        register(&registry, "probe", Behavior::Sleep(Duration::from_secs(10)));
        let config = ExecutionConfig::default()
            .with_timeout(Duration::from_millis(50))
            .with_cancel_grace(Duration::from_millis(10));
        let manager = manager(registry, config);

        let started = std::time::Instant::now();
        let result = manager.execute("probe", json!({"query": "x"})).await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error.as_deref(), Some("timeout after 50ms"));
    }

    #[tokio::test]
    async fn timed_out_capability_sees_cancellation() {
        let registry = Registry::new();
        let observed = Arc::new(AtomicBool::new(false));
        register(&registry, "probe", Behavior::AwaitCancel(Arc::clone(&observed)));
        let manager = manager(
            registry,
            ExecutionConfig::default().with_timeout(Duration::from_millis(30)),
        );

        let result = manager.execute("probe", json!({"query": "x"})).await;
        assert_eq!(result.kind, Some(ErrorKind::Timeout));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn abandoned_call_is_cancelled() {
        let registry = Registry::new();
        let observed = Arc::new(AtomicBool::new(false));
        register(&registry, "probe", Behavior::AwaitCancel(Arc::clone(&observed)));
        let manager = manager(
            registry,
            ExecutionConfig::default().with_timeout(Duration::from_secs(30)),
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            manager.execute("probe", json!({"query": "x"})),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_calls_share_the_pool() {
        let registry = Registry::new();
        register(
            &registry,
            "probe",
            Behavior::Sleep(Duration::from_millis(200)),
        );
        let manager = manager(registry, ExecutionConfig::default().with_max_concurrent(5));

        let calls: Vec<ToolCall> = (0..5)
            .map(|i| ToolCall {
                id: format!("call-{i}"),
                name: "probe".to_string(),
                input: json!({"query": "x"}),
            })
            .collect();

        let started = std::time::Instant::now();
        let outcomes = manager.execute_batch(&calls).await;

        assert!(outcomes.iter().all(|o| o.result.success));
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn pool_bounds_in_flight_calls() {
        let registry = Registry::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        register(
            &registry,
            "probe",
            Behavior::Track {
                in_flight,
                peak: Arc::clone(&peak),
            },
        );
        let manager = manager(registry, ExecutionConfig::default().with_max_concurrent(2));

        let calls: Vec<ToolCall> = (0..6)
            .map(|i| ToolCall {
                id: i.to_string(),
                name: "probe".to_string(),
                input: json!({"query": "x"}),
            })
            .collect();
        let outcomes = manager.execute_batch(&calls).await;

        assert!(outcomes.iter().all(|o| o.result.success));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_preserves_order_and_ids() {
        let registry = Registry::new();
        register(&registry, "probe", Behavior::Echo);
        let manager = manager(registry, ExecutionConfig::default());

        let calls = vec![
            ToolCall {
                id: "a".to_string(),
                name: "probe".to_string(),
                input: json!({"query": "first"}),
            },
            ToolCall {
                id: "b".to_string(),
                name: "missing".to_string(),
                input: json!({}),
            },
            ToolCall {
                id: "c".to_string(),
                name: "probe".to_string(),
                input: json!({"query": "third"}),
            },
        ];
        let outcomes = manager.execute_batch(&calls).await;

        let ids: Vec<&str> = outcomes.iter().map(|o| o.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(outcomes[0].result.value["query"], "first");
        assert_eq!(outcomes[1].result.kind, Some(ErrorKind::NotFound));
        assert_eq!(outcomes[2].result.value["query"], "third");
    }

    #[tokio::test]
    async fn failures_are_categorized() {
        let registry = Registry::new();
        register(
            &registry,
            "broken",
            Behavior::Fail(CapabilityError::Execution("disk full".to_string())),
        );
        register(
            &registry,
            "offline",
            Behavior::Fail(CapabilityError::Transport("connection closed".to_string())),
        );
        register(&registry, "panicky", Behavior::Panic);
        let manager = manager(registry, ExecutionConfig::default());
        let args = json!({"query": "x"});

        let broken = manager.execute("broken", args.clone()).await;
        assert_eq!(broken.kind, Some(ErrorKind::Internal));
        assert_eq!(broken.error.as_deref(), Some("execution failed: disk full"));

        let offline = manager.execute("offline", args.clone()).await;
        assert_eq!(offline.kind, Some(ErrorKind::Transport));

        let panicky = manager.execute("panicky", args).await;
        assert!(!panicky.success);
        assert_eq!(panicky.kind, Some(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn instantiation_failure_is_internal() {
        let registry = Registry::new();
        registry
            .register(
                "fragile",
                Origin::Builtin,
                failing("no config"),
            )
            .unwrap();
        let manager = manager(registry, ExecutionConfig::default());

        let result = manager.execute("fragile", json!({})).await;
        assert_eq!(result.kind, Some(ErrorKind::Internal));
        assert!(manager.create_instance("fragile").is_none());
    }

    #[tokio::test]
    async fn panicking_factory_is_contained() {
        let registry = Registry::new();
        register(&registry, "probe", Behavior::Echo);
        registry
            .register("exploding", Origin::Builtin, exploding())
            .unwrap();
        let manager = manager(registry, ExecutionConfig::default());

        let result = manager.execute("exploding", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Internal));
        assert!(result.error.unwrap().contains("factory panicked"));
        assert!(manager.create_instance("exploding").is_none());

        let calls = vec![
            ToolCall {
                id: "a".to_string(),
                name: "exploding".to_string(),
                input: json!({}),
            },
            ToolCall {
                id: "b".to_string(),
                name: "probe".to_string(),
                input: json!({"query": "still here"}),
            },
        ];
        let outcomes = manager.execute_batch(&calls).await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result.kind, Some(ErrorKind::Internal));
        assert_eq!(outcomes[1].result.value["query"], "still here");

        let declarations = manager.to_declaration_list(None);
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].function.name, "probe");
    }

    #[tokio::test]
    async fn panicking_validator_is_contained() {
        let registry = Registry::new();
        registry
            .register("bad_validator", Origin::Builtin, factory(|| Ok(BadValidator)))
            .unwrap();
        let manager = manager(registry, ExecutionConfig::default());

        let result = manager.execute("bad_validator", json!({})).await;
        assert!(!result.success);
        assert_eq!(result.kind, Some(ErrorKind::Internal));
        assert!(result.error.unwrap().contains("validator exploded"));
    }

    #[test]
    fn elapsed_millis_saturate() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn declarations_skip_unknown_and_broken() {
        let registry = Registry::new();
        register(&registry, "probe", Behavior::Echo);
        registry
            .register(
                "fragile",
                Origin::Remote,
                failing("gone"),
            )
            .unwrap();
        let manager = manager(registry, ExecutionConfig::default());

        assert_eq!(manager.to_declaration_list(None).len(), 1);

        let names = vec!["probe".to_string(), "ghost".to_string()];
        let declarations = manager.to_declaration_list(Some(&names));
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].function.parameters["required"], json!(["query"]));

        assert_eq!(manager.list_available(Some(Origin::Remote)), vec!["fragile"]);
        assert_eq!(manager.list_available(None), vec!["fragile", "probe"]);
    }

    #[test]
    fn health_reflects_registry() {
        let empty = manager(Registry::new(), ExecutionConfig::default());
        assert_eq!(empty.health_check().status, HealthStatus::Degraded);

        let registry = Registry::new();
        register(&registry, "probe", Behavior::Echo);
        let report = manager(registry, ExecutionConfig::default()).health_check();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.capabilities, 1);
    }
}
