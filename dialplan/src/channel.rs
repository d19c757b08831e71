//! The media side of a call as the interpreter sees it.
//!
//! Signalling and media live elsewhere; the dialplan only needs to answer,
//! signal progress, wait for keypad digits and hang up. Every wait observes
//! hangup so a call torn down mid-application unwinds promptly.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitEvent {
    Digit(char),
    Timeout,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Indication {
    #[strum(serialize = "ringing")]
    Ringing,
    #[strum(serialize = "progress")]
    Progress,
    #[strum(serialize = "busy")]
    Busy,
    #[strum(serialize = "congestion")]
    Congestion,
}

/// Q.850 cause used when the dialplan ends a call on its own.
pub const NORMAL_CLEARING: u32 = 16;

#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    fn is_hangup(&self) -> bool;

    async fn answer(&self) -> Result<()>;

    async fn indicate(&self, indication: Indication) -> Result<()>;

    /// Wait up to `timeout` for one keypad digit.
    async fn wait_for_digit(&self, timeout: Duration) -> DigitEvent;

    /// Sleep unless the channel hangs up first; false on hangup.
    async fn sleep(&self, duration: Duration) -> bool;

    async fn hangup(&self, cause: u32);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};

    /// Channel fed from a digit script. Once the script is drained it
    /// either hangs up or times out, depending on `hangup_when_idle`.
    pub(crate) struct ScriptedChannel {
        name: String,
        digits_tx: mpsc::UnboundedSender<char>,
        digits: AsyncMutex<mpsc::UnboundedReceiver<char>>,
        hangup: AtomicBool,
        hangup_notify: Notify,
        hangup_when_idle: AtomicBool,
        pub(crate) answered: AtomicBool,
        pub(crate) indications: Mutex<Vec<Indication>>,
        pub(crate) hangup_cause: Mutex<Option<u32>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(name: &str) -> Self {
            let (digits_tx, digits) = mpsc::unbounded_channel();
            Self {
                name: name.to_string(),
                digits_tx,
                digits: AsyncMutex::new(digits),
                hangup: AtomicBool::new(false),
                hangup_notify: Notify::new(),
                hangup_when_idle: AtomicBool::new(true),
                answered: AtomicBool::new(false),
                indications: Mutex::new(Vec::new()),
                hangup_cause: Mutex::new(None),
            }
        }

        pub(crate) fn with_digits(name: &str, digits: &str) -> Self {
            let channel = Self::new(name);
            channel.push_digits(digits);
            channel
        }

        pub(crate) fn push_digits(&self, digits: &str) {
            for digit in digits.chars() {
                let _ = self.digits_tx.send(digit);
            }
        }

        pub(crate) fn wait_when_idle(&self) {
            self.hangup_when_idle.store(false, Ordering::SeqCst);
        }

        pub(crate) fn hangup_now(&self) {
            self.hangup.store(true, Ordering::SeqCst);
            self.hangup_notify.notify_one();
        }
    }

    #[async_trait]
    impl Channel for ScriptedChannel {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_hangup(&self) -> bool {
            self.hangup.load(Ordering::SeqCst)
        }

        async fn answer(&self) -> Result<()> {
            self.answered.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn indicate(&self, indication: Indication) -> Result<()> {
            self.indications.lock().push(indication);
            Ok(())
        }

        async fn wait_for_digit(&self, timeout: Duration) -> DigitEvent {
            if self.is_hangup() {
                return DigitEvent::Hangup;
            }
            let mut digits = self.digits.lock().await;
            if let Ok(digit) = digits.try_recv() {
                return DigitEvent::Digit(digit);
            }
            if self.hangup_when_idle.load(Ordering::SeqCst) {
                self.hangup.store(true, Ordering::SeqCst);
                return DigitEvent::Hangup;
            }
            tokio::select! {
                Some(digit) = digits.recv() => DigitEvent::Digit(digit),
                _ = tokio::time::sleep(timeout) => DigitEvent::Timeout,
                _ = self.hangup_notify.notified() => DigitEvent::Hangup,
            }
        }

        async fn sleep(&self, duration: Duration) -> bool {
            if self.is_hangup() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(duration) => true,
                _ = self.hangup_notify.notified() => false,
            }
        }

        async fn hangup(&self, cause: u32) {
            *self.hangup_cause.lock() = Some(cause);
            self.hangup.store(true, Ordering::SeqCst);
        }
    }
}
