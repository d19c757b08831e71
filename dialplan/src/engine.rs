use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::{AppResult, ApplicationRegistry};
use crate::args::split_args;
use crate::builtins;
use crate::call::{Call, CallState};
use crate::channel::Channel;
use crate::config::Config;
use crate::error::{DialplanError, Result};
use crate::expression::{ArithmeticEvaluator, ExpressionEvaluator};
use crate::function::FunctionRegistry;
use crate::hint::{
    DeviceStateProvider, ExtensionState, HintSubsystem, StateCallback, UnknownDevices,
    WatcherId,
};
use crate::interpreter::{self, CallOutcome};
use crate::pattern::MatchAction;
use crate::priority::{GotoTarget, PriorityTarget, PRIORITY_HINT};
use crate::registry::Registry;
use crate::resolver::{Found, Lookup, Request, Resolution, Resolver};
use crate::substitution::{Expander, HintSource};
use crate::switch::SwitchRegistry;
use crate::variables::GlobalVariables;

struct EngineInner {
    config: Config,
    system_name: String,
    registry: Registry,
    hints: Arc<HintSubsystem>,
    applications: ApplicationRegistry,
    functions: FunctionRegistry,
    switches: SwitchRegistry,
    globals: GlobalVariables,
    evaluator: Arc<dyn ExpressionEvaluator>,
    active_calls: AtomicUsize,
}

/// One dialplan: its contexts, registries, hints and running calls.
/// Cloning shares the same engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder {
    config: Config,
    devices: Arc<dyn DeviceStateProvider>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    builtins: bool,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        EngineBuilder {
            config,
            devices: Arc::new(UnknownDevices),
            evaluator: Arc::new(ArithmeticEvaluator),
            builtins: true,
        }
    }

    pub fn device_states(mut self, provider: Arc<dyn DeviceStateProvider>) -> Self {
        self.devices = provider;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Start with empty application and function registries.
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    pub fn build(self) -> Engine {
        let system_name = self
            .config
            .system_name
            .clone()
            .or_else(nebula_utils::get_hostname)
            .unwrap_or_default();
        let hints = Arc::new(HintSubsystem::new(self.devices));
        let engine = Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                system_name,
                registry: Registry::new(hints.clone()),
                hints,
                applications: ApplicationRegistry::new(),
                functions: FunctionRegistry::new(),
                switches: SwitchRegistry::new(),
                globals: GlobalVariables::new(),
                evaluator: self.evaluator,
                active_calls: AtomicUsize::new(0),
            }),
        };
        if self.builtins {
            if let Err(err) = builtins::register(&engine) {
                warn!("builtin registration failed: {err}");
            }
        }
        engine
    }
}

/// Holds one admission slot; the slot is given back on drop.
pub struct CallSlot {
    engine: Engine,
}

impl Drop for CallSlot {
    fn drop(&mut self) {
        self.engine.inner.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

fn load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n >= 1).then(|| loads[0])
}

impl Engine {
    pub fn new(config: Config) -> Engine {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn system_name(&self) -> &str {
        &self.inner.system_name
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn hints(&self) -> &Arc<HintSubsystem> {
        &self.inner.hints
    }

    pub fn applications(&self) -> &ApplicationRegistry {
        &self.inner.applications
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.inner.functions
    }

    pub fn switches(&self) -> &SwitchRegistry {
        &self.inner.switches
    }

    pub fn globals(&self) -> &GlobalVariables {
        &self.inner.globals
    }

    pub fn active_calls(&self) -> usize {
        self.inner.active_calls.load(Ordering::SeqCst)
    }

    pub fn expander<'a>(&'a self, call: Option<&'a CallState>) -> Expander<'a> {
        Expander {
            call,
            globals: &self.inner.globals,
            functions: &self.inner.functions,
            evaluator: self.inner.evaluator.as_ref(),
            hints: Some(self),
            system_name: &self.inner.system_name,
            limit: self.inner.config.substitution_limit,
        }
    }

    pub fn substitute(&self, call: Option<&CallState>, template: &str) -> String {
        self.expander(call).expand(template)
    }

    pub fn resolve(&self, call: Option<&CallState>, request: &Request<'_>) -> Resolution {
        let expander = self.expander(call);
        Resolver {
            registry: &self.inner.registry,
            switches: &self.inner.switches,
            expander: Some(&expander),
            call,
            max_depth: self.inner.config.max_include_depth,
        }
        .resolve(request)
    }

    fn probe(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
        lookup: Lookup<'_>,
        callerid: Option<&str>,
        action: MatchAction,
    ) -> Resolution {
        self.resolve(
            call,
            &Request {
                bypass: None,
                context,
                exten,
                lookup,
                callerid,
                action,
            },
        )
    }

    pub fn exists(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        self.probe(call, context, exten, Lookup::Priority(priority), callerid, MatchAction::Exists)
            .is_found()
    }

    /// Whether `exten` matches now or could with more digits.
    pub fn canmatch(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        self.probe(
            call,
            context,
            exten,
            Lookup::Priority(priority),
            callerid,
            MatchAction::CanMatch,
        )
        .is_found()
    }

    /// Whether more digits could still lead somewhere.
    pub fn matchmore(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
        priority: i32,
        callerid: Option<&str>,
    ) -> bool {
        self.probe(
            call,
            context,
            exten,
            Lookup::Priority(priority),
            callerid,
            MatchAction::MatchMore,
        )
        .is_found()
    }

    pub fn findlabel(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
        label: &str,
        callerid: Option<&str>,
    ) -> Option<i32> {
        self.probe(call, context, exten, Lookup::Label(label), callerid, MatchAction::FindLabel)
            .extension()
            .map(|hit| hit.priority.priority)
    }

    /// Runs the step the call is at. The registry is released before the
    /// application starts.
    pub async fn exec_extension(&self, call: &mut Call) -> AppResult {
        let context = call.state.context.clone();
        let exten = call.state.exten.clone();
        let priority = call.state.priority;
        let found = self
            .probe(
                Some(&call.state),
                &context,
                &exten,
                Lookup::Priority(priority),
                call.state.callerid(),
                MatchAction::Exec,
            )
            .found;

        match found {
            Some(Found::Extension(hit)) => {
                let Some(app) = self.inner.applications.find(&hit.priority.app) else {
                    warn!(
                        channel = %call.name(),
                        "no application '{}' for extension {exten}@{context}:{priority}",
                        hit.priority.app
                    );
                    return AppResult::Fail;
                };
                let data = self.substitute(Some(&call.state), &hit.priority.data);
                info!(
                    channel = %call.name(),
                    "executing [{exten}@{}:{priority}] {}(\"{data}\")",
                    hit.context,
                    hit.priority.app
                );
                app.exec(call, &split_args(&data)).await
            }
            Some(Found::Switch(hit)) => {
                info!(
                    channel = %call.name(),
                    "executing [{exten}@{context}:{priority}] through switch {}/{}",
                    hit.name,
                    hit.data
                );
                hit.switch
                    .exec(call, &hit.context, &exten, priority, &hit.data)
                    .await
            }
            None => AppResult::Fail,
        }
    }

    /// Moves the call to `target`. Missing parts default to where the call
    /// is now; labels are looked up in the target extension.
    pub fn goto(&self, call: &mut CallState, target: &GotoTarget) -> Result<()> {
        let context = target.context.clone().unwrap_or_else(|| call.context.clone());
        let exten = target.exten.clone().unwrap_or_else(|| call.exten.clone());
        let priority = match &target.priority {
            PriorityTarget::Label(label) => self
                .findlabel(Some(&*call), &context, &exten, label, call.callerid())
                .ok_or_else(|| DialplanError::InvalidGoto(format!("{context},{exten},{label}")))?,
            numeric => numeric.numeric(call.priority).unwrap_or(0),
        };
        if priority < 1 {
            return Err(DialplanError::InvalidPriority(format!(
                "{} from {}",
                target.priority, call.priority
            )));
        }
        info!(
            channel = %call.channel_name,
            "goto {context},{exten},{priority}"
        );
        call.jump(&context, &exten, priority);
        Ok(())
    }

    /// `(devices, name)` of the hint for `exten`, found like any other
    /// priority so patterns and includes apply.
    pub fn get_hint(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
    ) -> Option<(String, String)> {
        self.hint_match(call, context, exten)
            .map(|(_, _, devices, name)| (devices, name))
    }

    fn hint_match(
        &self,
        call: Option<&CallState>,
        context: &str,
        exten: &str,
    ) -> Option<(String, String, String, String)> {
        let resolution = self.probe(
            call,
            context,
            exten,
            Lookup::Priority(PRIORITY_HINT),
            call.and_then(|c| c.callerid()),
            MatchAction::Exists,
        );
        resolution.extension().map(|hit| {
            (
                hit.context.clone(),
                hit.exten.clone(),
                hit.priority.app.clone(),
                hit.priority.data.clone(),
            )
        })
    }

    /// Current aggregate state of the hint behind `exten`.
    pub fn extension_state(&self, context: &str, exten: &str) -> Result<ExtensionState> {
        let (_, _, devices, _) = self
            .hint_match(None, context, exten)
            .ok_or_else(|| DialplanError::NoSuchHint {
                context: context.to_string(),
                exten: exten.to_string(),
            })?;
        Ok(self.inner.hints.state_of(&devices))
    }

    /// Watches the hint behind `exten` in `context`.
    pub fn add_state_watcher(
        &self,
        context: &str,
        exten: &str,
        callback: StateCallback,
    ) -> Result<WatcherId> {
        let (hint_context, hint_exten, _, _) = self
            .hint_match(None, context, exten)
            .ok_or_else(|| DialplanError::NoSuchHint {
                context: context.to_string(),
                exten: exten.to_string(),
            })?;
        self.inner
            .hints
            .add_hint_watcher(&hint_context, &hint_exten, callback)
    }

    /// Watches every hint.
    pub fn add_global_watcher(&self, callback: StateCallback) -> WatcherId {
        self.inner.hints.add_global_watcher(callback)
    }

    pub fn remove_state_watcher(&self, id: WatcherId) -> Result<()> {
        self.inner.hints.remove_watcher(id)
    }

    /// Takes an admission slot, or refuses when the engine is at its call
    /// or load ceiling.
    pub fn admit(&self) -> Result<CallSlot> {
        if let Some(max) = self.inner.config.max_load {
            if let Some(load) = load_average() {
                if load > max {
                    return Err(DialplanError::LoadLimitExceeded { load, max });
                }
            }
        }
        let counter = &self.inner.active_calls;
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if let Some(max) = self.inner.config.max_calls {
                if current >= max {
                    return Err(DialplanError::CallLimitExceeded(max));
                }
            }
            match counter.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(CallSlot {
            engine: self.clone(),
        })
    }

    /// Spawns the interpreter for a new call. Nothing is spawned when
    /// admission is refused.
    pub fn start_call(
        &self,
        channel: Arc<dyn Channel>,
        state: CallState,
    ) -> Result<JoinHandle<CallOutcome>> {
        let slot = self.admit()?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            interpreter::run(engine, channel, state, slot).await
        }))
    }

    /// Runs the interpreter for a call on the current task.
    pub async fn run_call(
        &self,
        channel: Arc<dyn Channel>,
        state: CallState,
    ) -> Result<CallOutcome> {
        let slot = self.admit()?;
        Ok(interpreter::run(self.clone(), channel, state, slot).await)
    }

    /// Destroys every context, telling hint watchers, and clears globals.
    pub fn teardown(&self) {
        let contexts = self.inner.registry.destroy_context(None, None);
        self.inner.globals.clear();
        info!("dialplan torn down, {contexts} contexts destroyed");
    }
}

impl HintSource for Engine {
    fn hint_for(&self, context: &str, exten: &str) -> Option<(String, String)> {
        self.get_hint(None, context, exten)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::application::app_fn;
    use crate::call::CallerId;
    use crate::channel::testing::ScriptedChannel;
    use crate::hint::{DeviceState, StateChange};
    use crate::registry::NewExtension;

    fn engine(config: Config) -> Engine {
        let engine = Engine::new(config);
        engine.registry().create_context("office", "test").unwrap();
        engine
    }

    fn add(engine: &Engine, new: NewExtension) {
        engine.registry().add_extension("office", new, false).unwrap();
    }

    #[test]
    fn probes() {
        let engine = engine(Config::default());
        add(&engine, NewExtension::new("_2XX", 1, "NoOp", ""));
        add(&engine, NewExtension::new("_2XX", 5, "NoOp", "").label("five"));
        assert!(engine.exists(None, "office", "200", 1, None));
        assert!(!engine.exists(None, "office", "200", 2, None));
        assert!(engine.canmatch(None, "office", "2", 1, None));
        assert!(engine.matchmore(None, "office", "20", 1, None));
        assert!(!engine.matchmore(None, "office", "200", 1, None));
        assert_eq!(Some(5), engine.findlabel(None, "office", "234", "five", None));
        assert_eq!(None, engine.findlabel(None, "office", "234", "six", None));
    }

    #[test]
    fn goto_defaults_and_labels() {
        let engine = engine(Config::default());
        add(&engine, NewExtension::new("100", 1, "NoOp", ""));
        add(&engine, NewExtension::new("200", 3, "NoOp", "").label("three"));
        let mut call = CallState::new("office", "100", 1);

        engine.goto(&mut call, &"200,three".parse().unwrap()).unwrap();
        assert_eq!(
            ("office", "200", 3),
            (call.context.as_str(), call.exten.as_str(), call.priority)
        );
        engine.goto(&mut call, &"+2".parse().unwrap()).unwrap();
        assert_eq!(5, call.priority);
        engine.goto(&mut call, &"-1".parse().unwrap()).unwrap();
        assert_eq!(4, call.priority);
        assert!(engine.goto(&mut call, &"-9".parse().unwrap()).is_err());
        assert!(engine.goto(&mut call, &"200,missing".parse().unwrap()).is_err());
        engine.goto(&mut call, &"home,s,1".parse().unwrap()).unwrap();
        assert_eq!("home", call.context);

        call.in_loop = true;
        engine.goto(&mut call, &"office,100,1".parse().unwrap()).unwrap();
        assert_eq!(0, call.priority);
    }

    #[test]
    fn hints_resolve_through_patterns() {
        let engine = engine(Config::default());
        engine.registry().create_context("phones", "test").unwrap();
        engine
            .registry()
            .add_extension("phones", NewExtension::hint("_1XX", "SIP/${EXTEN}", "Phones"), false)
            .unwrap();
        engine.registry().add_include("office", "phones", "test").unwrap();
        add(&engine, NewExtension::hint("200", "SIP/200&SIP/201", "Sales"));

        assert_eq!(
            Some(("SIP/200&SIP/201".to_string(), "Sales".to_string())),
            engine.get_hint(None, "office", "200")
        );
        assert_eq!(
            Some("Phones".to_string()),
            engine.get_hint(None, "office", "150").map(|(_, name)| name)
        );
        assert!(engine.get_hint(None, "office", "300").is_none());

        let mut call = CallState::new("office", "200", 1);
        call.channel_name = "SIP/alice".to_string();
        assert_eq!("SIP/200&SIP/201,Sales", engine.substitute(Some(&call), "${HINT},${HINTNAME}"));
    }

    #[test]
    fn state_watchers() {
        let engine = engine(Config::default());
        add(&engine, NewExtension::hint("200", "SIP/200", ""));
        assert_eq!(
            ExtensionState::NotInUse,
            engine.extension_state("office", "200").unwrap()
        );
        assert!(engine.extension_state("office", "300").is_err());

        let (tx, rx) = crossbeam::channel::unbounded();
        let id = engine
            .add_state_watcher(
                "office",
                "200",
                Arc::new(move |change: &StateChange| {
                    let _ = tx.send(change.clone());
                }),
            )
            .unwrap();
        engine.hints().device_state_changed("SIP/200", DeviceState::Busy);
        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(("200", ExtensionState::Busy), (change.exten.as_str(), change.state));
        assert_eq!(ExtensionState::Busy, engine.extension_state("office", "200").unwrap());

        engine.teardown();
        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(ExtensionState::Deactivated, change.state);
        assert!(engine.remove_state_watcher(id).is_err());
        assert!(engine.registry().contexts().is_empty());
    }

    #[test]
    fn admission_limit() {
        let engine = Engine::new(Config {
            max_calls: Some(2),
            ..Default::default()
        });
        let first = engine.admit().unwrap();
        let _second = engine.admit().unwrap();
        assert!(matches!(engine.admit(), Err(DialplanError::CallLimitExceeded(2))));
        assert_eq!(2, engine.active_calls());
        drop(first);
        assert_eq!(1, engine.active_calls());
        assert!(engine.admit().is_ok());
    }

    #[tokio::test]
    async fn start_call_refuses_over_limit() {
        let engine = Engine::new(Config {
            max_calls: Some(1),
            ..Default::default()
        });
        let _slot = engine.admit().unwrap();
        let channel = Arc::new(ScriptedChannel::new("SIP/late"));
        let result = engine.start_call(channel.clone(), CallState::new("office", "100", 1));
        assert!(matches!(result, Err(DialplanError::CallLimitExceeded(1))));
        assert!(!channel.answered.load(Ordering::SeqCst));
        assert_eq!(None, *channel.hangup_cause.lock());
        assert_eq!(1, engine.active_calls());
    }

    #[tokio::test]
    async fn exec_substitutes_and_splits_arguments() {
        let engine = engine(Config::default());
        let (tx, rx) = crossbeam::channel::unbounded();
        engine
            .applications()
            .register(
                "Record",
                app_fn(move |_call, args| {
                    let _ = tx.send(args.to_vec());
                    AppResult::Continue
                }),
                "",
                "",
                "",
            )
            .unwrap();
        add(&engine, NewExtension::new("100", 1, "Record", "${CALLERIDNUM},b|c"));
        add(&engine, NewExtension::new("100", 2, "Missing", ""));

        let channel = Arc::new(ScriptedChannel::new("SIP/alice"));
        let state = CallState::new("office", "100", 1).with_caller(CallerId::new("5551234", ""));
        let mut call = Call::new(engine.clone(), channel, state);
        assert_eq!(AppResult::Continue, engine.exec_extension(&mut call).await);
        assert_eq!(vec!["5551234", "b", "c"], rx.recv().unwrap());

        call.state.priority = 2;
        assert_eq!(AppResult::Fail, engine.exec_extension(&mut call).await);
        call.state.priority = 3;
        assert_eq!(AppResult::Fail, engine.exec_extension(&mut call).await);
    }
}
