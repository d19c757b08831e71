use std::{sync::Arc, time::Duration};

use crate::channel::Channel;
use crate::engine::Engine;
use crate::variables::Variables;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerId {
    pub num: Option<String>,
    pub name: Option<String>,
    pub ani: Option<String>,
    pub rdnis: Option<String>,
    pub dnid: Option<String>,
}

impl CallerId {
    pub fn new(num: &str, name: &str) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        CallerId {
            num: non_empty(num),
            name: non_empty(name),
            ..Default::default()
        }
    }

    /// `"name" <num>`, or whichever half is known.
    pub fn all(&self) -> String {
        match (&self.name, &self.num) {
            (Some(name), Some(num)) => format!("\"{name}\" <{num}>"),
            (Some(name), None) => name.clone(),
            (None, Some(num)) => num.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Per-call dialplan state: where the call is, who is calling and the
/// call's own variables.
#[derive(Debug, Clone)]
pub struct CallState {
    pub channel_name: String,
    pub unique_id: String,
    pub context: String,
    pub exten: String,
    pub priority: i32,
    pub caller: CallerId,
    pub language: String,
    pub account_code: String,
    pub hangup_cause: u32,
    pub variables: Variables,
    pub response_timeout: Option<Duration>,
    pub digit_timeout: Option<Duration>,
    pub(crate) in_loop: bool,
}

impl CallState {
    pub fn new(context: &str, exten: &str, priority: i32) -> Self {
        CallState {
            channel_name: String::new(),
            unique_id: nebula_utils::uuid(),
            context: context.to_string(),
            exten: exten.to_string(),
            priority,
            caller: CallerId::default(),
            language: "en".to_string(),
            account_code: String::new(),
            hangup_cause: 0,
            variables: Variables::new(),
            response_timeout: None,
            digit_timeout: None,
            in_loop: false,
        }
    }

    pub fn with_caller(mut self, caller: CallerId) -> Self {
        self.caller = caller;
        self
    }

    pub fn callerid(&self) -> Option<&str> {
        self.caller.num.as_deref()
    }

    /// Move the call. Inside the interpreter the priority is stored one
    /// short because the loop steps forward after the application returns.
    pub fn jump(&mut self, context: &str, exten: &str, priority: i32) {
        self.context = context.to_string();
        self.exten = exten.to_string();
        self.priority = if self.in_loop {
            priority.saturating_sub(1)
        } else {
            priority
        };
    }
}

/// A call being interpreted: its state, its channel and the engine that
/// runs it.
pub struct Call {
    pub state: CallState,
    channel: Arc<dyn Channel>,
    engine: Engine,
}

impl Call {
    pub fn new(engine: Engine, channel: Arc<dyn Channel>, mut state: CallState) -> Self {
        if state.channel_name.is_empty() {
            state.channel_name = channel.name().to_string();
        }
        Call {
            state,
            channel,
            engine,
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn name(&self) -> &str {
        &self.state.channel_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callerid_all() {
        assert_eq!("\"Alice\" <1000>", CallerId::new("1000", "Alice").all());
        assert_eq!("1000", CallerId::new("1000", "").all());
        assert_eq!("", CallerId::default().all());
    }

    #[test]
    fn jump_inside_loop_lands_after_step() {
        let mut state = CallState::new("default", "s", 1);
        state.jump("sales", "100", 3);
        assert_eq!(3, state.priority);
        state.in_loop = true;
        state.jump("sales", "100", 3);
        assert_eq!(2, state.priority);
        assert_eq!("sales", state.context);
    }
}
