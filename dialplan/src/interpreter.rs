//! The per-call execution loop.
//!
//! A call starts at its context, extension and priority, runs priorities
//! one after another, collects digits when an extension runs out, and
//! finishes with one pass through the `h` extension unless an application
//! asked to keep the channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::application::AppResult;
use crate::call::{Call, CallState};
use crate::channel::{Channel, DigitEvent, NORMAL_CLEARING};
use crate::engine::{CallSlot, Engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The loop ended and the channel was hung up.
    Hangup,
    /// An application took over the channel.
    KeepAlive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Executing,
    WaitingForExtension,
    Terminal(CallOutcome),
}

/// What the caller keyed while the dialplan waited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Input {
    Digits(String),
    Timeout,
    Hangup,
}

pub(crate) async fn run(
    engine: Engine,
    channel: Arc<dyn Channel>,
    state: CallState,
    slot: CallSlot,
) -> CallOutcome {
    let mut call = Call::new(engine.clone(), channel, state);
    info!(
        channel = %call.name(),
        "starting dialplan at {}@{}:{}",
        call.state.exten,
        call.state.context,
        call.state.priority
    );

    let mut state = State::Start;
    let outcome = loop {
        state = match state {
            State::Start => start(&engine, &mut call),
            State::Executing => execute(&engine, &mut call).await,
            State::WaitingForExtension => wait_for_extension(&engine, &mut call).await,
            State::Terminal(outcome) => break outcome,
        };
    };

    if outcome == CallOutcome::Hangup {
        run_hangup_extension(&engine, &mut call).await;
        if !call.channel().is_hangup() {
            let cause = match call.state.hangup_cause {
                0 => NORMAL_CLEARING,
                cause => cause,
            };
            call.channel().hangup(cause).await;
        }
    }
    drop(slot);
    info!(channel = %call.name(), "dialplan finished: {outcome:?}");
    outcome
}

fn exists(engine: &Engine, call: &CallState, context: &str, exten: &str, priority: i32) -> bool {
    engine.exists(Some(call), context, exten, priority, call.callerid())
}

fn start(engine: &Engine, call: &mut Call) -> State {
    let state = &call.state;
    if exists(engine, state, &state.context, &state.exten, state.priority) {
        return State::Executing;
    }
    let context = state.context.clone();
    if exists(engine, state, &context, "s", 1) {
        info!(
            channel = %call.name(),
            "starting {}@{context} at s instead",
            state.exten
        );
        call.state.jump(&context, "s", 1);
        return State::Executing;
    }
    if exists(engine, state, "default", "s", 1) {
        info!(
            channel = %call.name(),
            "starting {}@{context} at s@default instead",
            state.exten
        );
        call.state.jump("default", "s", 1);
        return State::Executing;
    }
    warn!(
        channel = %call.name(),
        "no place to start: {}@{context} has no s extension and neither has default",
        state.exten
    );
    State::Terminal(CallOutcome::Hangup)
}

async fn execute(engine: &Engine, call: &mut Call) -> State {
    loop {
        let (context, exten, priority) = (
            call.state.context.clone(),
            call.state.exten.clone(),
            call.state.priority,
        );
        if !exists(engine, &call.state, &context, &exten, priority) {
            break;
        }
        if call.channel().is_hangup() {
            debug!(channel = %call.name(), "hung up at {exten}@{context}:{priority}");
            return State::Terminal(CallOutcome::Hangup);
        }

        call.state.in_loop = true;
        let result = engine.exec_extension(call).await;
        call.state.in_loop = false;

        match result {
            AppResult::Continue => {
                if !step(&mut call.state) {
                    break;
                }
            }
            AppResult::KeepAlive => {
                info!(
                    channel = %call.name(),
                    "keeping channel alive at {exten}@{context}:{priority}"
                );
                return State::Terminal(CallOutcome::KeepAlive);
            }
            AppResult::Fail => {
                info!(
                    channel = %call.name(),
                    "extension {exten}@{context}:{priority} exited non-zero"
                );
                return State::Terminal(CallOutcome::Hangup);
            }
            AppResult::Digit(digit) => {
                let target = call
                    .state
                    .variables
                    .get("EXITCONTEXT")
                    .filter(|c| !c.is_empty())
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| call.state.context.clone());
                let digit = digit.to_string();
                if exists(engine, &call.state, &target, &digit, 1) {
                    info!(channel = %call.name(), "digit {digit} goes to {digit}@{target}");
                    call.state.jump(&target, &digit, 1);
                } else if !step(&mut call.state) {
                    break;
                }
            }
        }
    }

    let (context, exten) = (call.state.context.clone(), call.state.exten.clone());
    if !exists(engine, &call.state, &context, &exten, 1) {
        return if route_invalid(engine, call, &exten) {
            State::Executing
        } else {
            State::Terminal(CallOutcome::Hangup)
        };
    }
    if engine.config().autofallthrough {
        debug!(channel = %call.name(), "{exten}@{context} fell through");
        return State::Terminal(CallOutcome::Hangup);
    }
    State::WaitingForExtension
}

async fn wait_for_extension(engine: &Engine, call: &mut Call) -> State {
    let first = call
        .state
        .response_timeout
        .unwrap_or_else(|| engine.config().response_timeout());
    let input = collect_digits(engine, call, first).await;
    if input == Input::Hangup {
        return State::Terminal(CallOutcome::Hangup);
    }
    if route_input(engine, call, &input) {
        State::Executing
    } else {
        State::Terminal(CallOutcome::Hangup)
    }
}

/// Reads digits until `#`, a timeout, or nothing longer could match. The
/// first digit gets `first`, later ones the call's digit timeout.
pub(crate) async fn collect_digits(engine: &Engine, call: &Call, first: Duration) -> Input {
    let between = call
        .state
        .digit_timeout
        .unwrap_or_else(|| engine.config().digit_timeout());
    let mut digits = String::new();
    let mut timeout = first;
    loop {
        match call.channel().wait_for_digit(timeout).await {
            DigitEvent::Hangup => return Input::Hangup,
            DigitEvent::Timeout | DigitEvent::Digit('#') => break,
            DigitEvent::Digit(digit) => {
                digits.push(digit);
                timeout = between;
                let state = &call.state;
                if !engine.matchmore(Some(state), &state.context, &digits, 1, state.callerid()) {
                    break;
                }
            }
        }
    }
    if digits.is_empty() {
        Input::Timeout
    } else {
        Input::Digits(digits)
    }
}

/// Sends the call where collected input leads: the dialled extension,
/// `i` for something invalid, `t` for nothing at all. False when there is
/// nowhere to go.
pub(crate) fn route_input(engine: &Engine, call: &mut Call, input: &Input) -> bool {
    let context = call.state.context.clone();
    match input {
        Input::Digits(digits) => {
            if exists(engine, &call.state, &context, digits, 1) {
                call.state.jump(&context, digits, 1);
                true
            } else {
                route_invalid(engine, call, digits)
            }
        }
        Input::Timeout => {
            if exists(engine, &call.state, &context, "t", 1) {
                info!(channel = %call.name(), "timeout in {context}, going to t");
                call.state.jump(&context, "t", 1);
                true
            } else {
                warn!(channel = %call.name(), "timeout in {context} and no t extension to go to");
                false
            }
        }
        Input::Hangup => false,
    }
}

fn route_invalid(engine: &Engine, call: &mut Call, exten: &str) -> bool {
    let context = call.state.context.clone();
    if exists(engine, &call.state, &context, "i", 1) {
        info!(channel = %call.name(), "invalid extension {exten} in {context}, going to i");
        call.state.variables.set("INVALID_EXTEN", exten);
        call.state.jump(&context, "i", 1);
        true
    } else {
        warn!(
            channel = %call.name(),
            "invalid extension {exten} in {context} and no i extension to go to"
        );
        false
    }
}

async fn run_hangup_extension(engine: &Engine, call: &mut Call) {
    let context = call.state.context.clone();
    if !exists(engine, &call.state, &context, "h", 1) {
        return;
    }
    debug!(channel = %call.name(), "running h extension in {context}");
    call.state.jump(&context, "h", 1);
    loop {
        let state = &call.state;
        if !exists(engine, state, &state.context, &state.exten, state.priority) {
            break;
        }
        call.state.in_loop = true;
        let result = engine.exec_extension(call).await;
        call.state.in_loop = false;
        if result != AppResult::Continue || !step(&mut call.state) {
            break;
        }
    }
}

/// Moves to the next priority; false when there is none to move to.
fn step(call: &mut CallState) -> bool {
    match call.priority.checked_add(1) {
        Some(next) => {
            call.priority = next;
            true
        }
        None => false,
    }
}
