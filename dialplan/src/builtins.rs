//! Applications and functions every engine starts with.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::application::{app_fn, AppResult, Application};
use crate::args::check_condition;
use crate::call::{Call, CallState};
use crate::channel::{Indication, NORMAL_CLEARING};
use crate::engine::Engine;
use crate::error::Result;
use crate::function::{DialplanFunction, FunctionScope};
use crate::interpreter::{collect_digits, route_input, Input};
use crate::priority::GotoTarget;
use crate::timing::TimeSpec;
use crate::variables::GlobalVariables;

/// How long `Busy` and `Congestion` hold the line without an argument.
const INDICATION_HOLD: Duration = Duration::from_secs(86_400);

pub(crate) fn register(engine: &Engine) -> Result<()> {
    let apps = engine.applications();
    apps.register(
        "Answer",
        Arc::new(Answer),
        "Answer a channel if ringing",
        "Answer()",
        "Answers the channel and continues.",
    )?;
    apps.register(
        "Ringing",
        Arc::new(Indicate(Indication::Ringing)),
        "Indicate ringing tone",
        "Ringing()",
        "",
    )?;
    apps.register(
        "Progress",
        Arc::new(Indicate(Indication::Progress)),
        "Indicate progress",
        "Progress()",
        "Signals in-band progress without answering.",
    )?;
    apps.register(
        "Busy",
        Arc::new(HoldIndication(Indication::Busy)),
        "Indicate busy condition and stop",
        "Busy([timeout])",
        "Signals busy, then waits for the caller to hang up or for timeout seconds.",
    )?;
    apps.register(
        "Congestion",
        Arc::new(HoldIndication(Indication::Congestion)),
        "Indicate congestion and stop",
        "Congestion([timeout])",
        "Signals congestion, then waits for the caller to hang up or for timeout seconds.",
    )?;
    apps.register(
        "NoOp",
        app_fn(|call, args| {
            debug!(channel = %call.name(), "NoOp({})", args.join(","));
            AppResult::Continue
        }),
        "No operation",
        "NoOp([text])",
        "Does nothing. The substituted argument shows up in the debug log.",
    )?;
    apps.register(
        "KeepAlive",
        app_fn(|_, _| AppResult::KeepAlive),
        "Leave the channel up",
        "KeepAlive()",
        "Ends dialplan execution without hanging up.",
    )?;
    apps.register(
        "Hangup",
        app_fn(hangup),
        "Hang up the calling channel",
        "Hangup([cause])",
        "Ends the call with the given cause code, normal clearing by default.",
    )?;
    apps.register(
        "Goto",
        app_fn(goto),
        "Jump to a particular priority, extension, or context",
        "Goto([[context,]extension,]priority)",
        "The priority may be a number, +n, -n or a label.",
    )?;
    apps.register(
        "GotoIf",
        app_fn(goto_if),
        "Conditional goto",
        "GotoIf(condition?[iftrue][:iffalse])",
        "Each branch is a goto target. An empty or zero condition is false.",
    )?;
    apps.register(
        "GotoIfTime",
        app_fn(goto_if_time),
        "Conditional goto on the current time",
        "GotoIfTime(times,weekdays,mdays,months[,tz]?[[context,]extension,]priority)",
        "Jumps when the current time falls inside the restriction.",
    )?;
    apps.register(
        "Set",
        app_fn(set),
        "Set channel or global variables and functions",
        "Set(name1=value1[,name2=value2][,g])",
        "Names ending in ')' are written through the function. Option g sets globals.",
    )?;
    apps.register(
        "Wait",
        Arc::new(Wait),
        "Waits for some time",
        "Wait(seconds)",
        "Fractional seconds are allowed.",
    )?;
    apps.register(
        "WaitExten",
        Arc::new(WaitExten),
        "Waits for an extension to be entered",
        "WaitExten([seconds])",
        "Routes the digits like the dialplan does when an extension runs out.",
    )?;

    let functions = engine.functions();
    functions.register(
        "LEN",
        Arc::new(Len),
        "Length of a string",
        "LEN(string)",
        "Counts characters.",
    )?;
    functions.register(
        "GLOBAL",
        Arc::new(Global),
        "Get or set a global variable",
        "GLOBAL(name)",
        "",
    )?;
    functions.register(
        "TIMEOUT",
        Arc::new(Timeout {
            response: engine.config().response_timeout(),
            digit: engine.config().digit_timeout(),
        }),
        "Response and digit timeouts of the call",
        "TIMEOUT(response|digit)",
        "Seconds, fractional allowed.",
    )?;
    info!(
        "registered {} builtin applications and {} functions",
        apps.list().len(),
        functions.list().len()
    );
    Ok(())
}

fn seconds(arg: Option<&String>) -> Option<Duration> {
    let secs = arg?.trim().parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

struct Answer;

#[async_trait]
impl Application for Answer {
    async fn exec(&self, call: &mut Call, _args: &[String]) -> AppResult {
        match call.channel().answer().await {
            Ok(()) => AppResult::Continue,
            Err(err) => {
                warn!(channel = %call.name(), "answer failed: {err}");
                AppResult::Fail
            }
        }
    }
}

struct Indicate(Indication);

#[async_trait]
impl Application for Indicate {
    async fn exec(&self, call: &mut Call, _args: &[String]) -> AppResult {
        match call.channel().indicate(self.0).await {
            Ok(()) => AppResult::Continue,
            Err(err) => {
                warn!(channel = %call.name(), "indicate {} failed: {err}", self.0);
                AppResult::Fail
            }
        }
    }
}

/// Signals a final condition and waits for the caller to give up.
struct HoldIndication(Indication);

#[async_trait]
impl Application for HoldIndication {
    async fn exec(&self, call: &mut Call, args: &[String]) -> AppResult {
        if let Err(err) = call.channel().indicate(self.0).await {
            warn!(channel = %call.name(), "indicate {} failed: {err}", self.0);
        }
        let hold = seconds(args.first()).unwrap_or(INDICATION_HOLD);
        call.channel().sleep(hold).await;
        AppResult::Fail
    }
}

struct Wait;

#[async_trait]
impl Application for Wait {
    async fn exec(&self, call: &mut Call, args: &[String]) -> AppResult {
        let duration = seconds(args.first()).unwrap_or_default();
        if call.channel().sleep(duration).await {
            AppResult::Continue
        } else {
            AppResult::Fail
        }
    }
}

struct WaitExten;

#[async_trait]
impl Application for WaitExten {
    async fn exec(&self, call: &mut Call, args: &[String]) -> AppResult {
        let engine = call.engine().clone();
        let first = seconds(args.first())
            .filter(|d| !d.is_zero())
            .or(call.state.response_timeout)
            .unwrap_or_else(|| engine.config().response_timeout());
        let input = collect_digits(&engine, call, first).await;
        if input == Input::Hangup {
            return AppResult::Fail;
        }
        if !route_input(&engine, call, &input) {
            debug!(channel = %call.name(), "WaitExten: nowhere to go for {input:?}");
        }
        AppResult::Continue
    }
}

fn hangup(call: &mut Call, args: &[String]) -> AppResult {
    call.state.hangup_cause = args
        .first()
        .and_then(|cause| cause.trim().parse::<u32>().ok())
        .filter(|cause| *cause > 0)
        .unwrap_or(NORMAL_CLEARING);
    AppResult::Fail
}

fn jump_to(call: &mut Call, target: &str) -> AppResult {
    let engine = call.engine().clone();
    let result = target
        .parse::<GotoTarget>()
        .and_then(|target| engine.goto(&mut call.state, &target));
    match result {
        Ok(()) => AppResult::Continue,
        Err(err) => {
            warn!(channel = %call.name(), "goto {target} failed: {err}");
            AppResult::Fail
        }
    }
}

fn goto(call: &mut Call, args: &[String]) -> AppResult {
    jump_to(call, &args.join(","))
}

fn goto_if(call: &mut Call, args: &[String]) -> AppResult {
    let data = args.join(",");
    let Some((condition, branches)) = data.split_once('?') else {
        warn!(channel = %call.name(), "GotoIf requires condition?label, got {data}");
        return AppResult::Fail;
    };
    let (when_true, when_false) = branches.split_once(':').unwrap_or((branches, ""));
    let branch = if check_condition(condition) {
        when_true
    } else {
        when_false
    };
    match branch.trim() {
        "" => AppResult::Continue,
        target => jump_to(call, target),
    }
}

fn goto_if_time(call: &mut Call, args: &[String]) -> AppResult {
    let data = args.join(",");
    let Some((timing, target)) = data.split_once('?') else {
        warn!(channel = %call.name(), "GotoIfTime requires timing?label, got {data}");
        return AppResult::Fail;
    };
    match timing.parse::<TimeSpec>() {
        Ok(spec) if spec.is_active() => jump_to(call, target),
        Ok(_) => AppResult::Continue,
        Err(err) => {
            warn!(channel = %call.name(), "{err}");
            AppResult::Fail
        }
    }
}

fn set(call: &mut Call, args: &[String]) -> AppResult {
    let global = args.len() > 1 && args.last().map(|a| a.trim()) == Some("g");
    let engine = call.engine().clone();
    for arg in args {
        let Some((name, value)) = arg.split_once('=') else {
            continue;
        };
        let name = name.trim().trim_start_matches('_');
        if name.is_empty() {
            warn!(channel = %call.name(), "Set without a variable name: {arg}");
            continue;
        }
        if name.ends_with(')') {
            if let Err(err) =
                engine
                    .functions()
                    .write(name, &mut call.state, engine.globals(), value)
            {
                warn!(channel = %call.name(), "Set {name} failed: {err}");
            }
        } else if global {
            engine.globals().set(name, value);
        } else {
            call.state.variables.set(name, value);
        }
    }
    AppResult::Continue
}

struct Len;

impl DialplanFunction for Len {
    fn read(&self, _scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String> {
        Ok(args.join(",").chars().count().to_string())
    }
}

struct Global;

impl DialplanFunction for Global {
    fn read(&self, scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String> {
        let name = args.first().ok_or_else(|| anyhow!("GLOBAL needs a name"))?;
        Ok(scope.globals.get(name.trim()).unwrap_or_default())
    }

    fn write(
        &self,
        _call: &mut CallState,
        globals: &GlobalVariables,
        args: &[String],
        value: &str,
    ) -> anyhow::Result<()> {
        let name = args.first().ok_or_else(|| anyhow!("GLOBAL needs a name"))?;
        globals.set(name.trim(), value);
        Ok(())
    }
}

struct Timeout {
    response: Duration,
    digit: Duration,
}

impl DialplanFunction for Timeout {
    fn read(&self, scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String> {
        let call = scope.call.ok_or_else(|| anyhow!("TIMEOUT needs a call"))?;
        let timeout = match args.first().map(|a| a.trim().to_lowercase()).as_deref() {
            Some("response") => call.response_timeout.unwrap_or(self.response),
            Some("digit") => call.digit_timeout.unwrap_or(self.digit),
            other => bail!("unknown timeout {other:?}"),
        };
        Ok(timeout.as_secs_f64().to_string())
    }

    fn write(
        &self,
        call: &mut CallState,
        _globals: &GlobalVariables,
        args: &[String],
        value: &str,
    ) -> anyhow::Result<()> {
        let secs: f64 = value.trim().parse()?;
        let timeout = match Duration::try_from_secs_f64(secs) {
            Ok(timeout) => Some(timeout),
            Err(_) => bail!("invalid timeout {value}"),
        };
        match args.first().map(|a| a.trim().to_lowercase()).as_deref() {
            Some("response") => call.response_timeout = timeout,
            Some("digit") => call.digit_timeout = timeout,
            other => bail!("unknown timeout {other:?}"),
        }
        Ok(())
    }
}
