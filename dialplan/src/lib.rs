//! # Dialplan Module
//!
//! The dialplan decides what happens to a call once signalling hands it
//! over: which applications run, in which order, and where the call goes
//! when the caller keys digits.
//!
//! ## Core Components
//!
//! - **registry**: contexts, extensions, priorities, includes, switches and
//!   ignore patterns, swapped in atomically per loader generation
//! - **pattern**: `_NXX.` style extension patterns
//! - **resolver**: the recursive search through contexts and includes
//! - **substitution** / **expression**: `${VAR}`, `${FUNC(args)}` and
//!   `$[expr]` expansion
//! - **hint**: extension state from device state, with watchers
//! - **interpreter**: the per-call execution loop
//! - **builtins**: the applications and functions every engine carries
//! - **loader**: TOML dialplan documents
//!
//! ## Usage
//!
//! ```rust,no_run
//! use nebula_dialplan::{loader, Config, Engine};
//!
//! let engine = Engine::new(Config::default());
//! let file = loader::DialplanFile::from_file("/etc/nebula/extensions.toml")?;
//! loader::load(&engine, &file, "extensions")?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod application;
pub mod args;
mod builtins;
pub mod call;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod function;
pub mod hint;
pub mod interpreter;
pub mod loader;
pub mod pattern;
pub mod priority;
pub mod registry;
pub mod resolver;
pub mod substitution;
pub mod switch;
pub mod timing;
pub mod variables;

pub use application::{AppResult, Application, ApplicationRegistry};
pub use call::{Call, CallState, CallerId};
pub use channel::{Channel, DigitEvent, Indication};
pub use config::Config;
pub use engine::{Engine, EngineBuilder};
pub use error::{DialplanError, Result};
pub use hint::{DeviceState, DeviceStateProvider, ExtensionState, StateChange};
pub use interpreter::CallOutcome;
pub use registry::{Context, Generation, NewExtension, Registry};
