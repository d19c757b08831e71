use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DialplanError {
    #[error("context {0} already exists")]
    ContextExists(String),
    #[error("no such context {0}")]
    NoSuchContext(String),
    #[error("extension {exten} priority {priority} already exists in {context}")]
    ExtensionExists {
        context: String,
        exten: String,
        priority: i32,
    },
    #[error("label {label} already used by extension {exten} in {context}")]
    DuplicateLabel {
        context: String,
        exten: String,
        label: String,
    },
    #[error("no such extension {exten} in {context}")]
    NoSuchExtension { context: String, exten: String },
    #[error("include {include} already exists in {context}")]
    IncludeExists { context: String, include: String },
    #[error("no such include {include} in {context}")]
    NoSuchInclude { context: String, include: String },
    #[error("switch {switch} already exists in {context}")]
    SwitchExists { context: String, switch: String },
    #[error("no such switch {switch} in {context}")]
    NoSuchSwitch { context: String, switch: String },
    #[error("ignore pattern {pattern} already exists in {context}")]
    IgnorePatternExists { context: String, pattern: String },
    #[error("no such ignore pattern {pattern} in {context}")]
    NoSuchIgnorePattern { context: String, pattern: String },
    #[error("application {0} already registered")]
    ApplicationExists(String),
    #[error("no such application {0}")]
    NoSuchApplication(String),
    #[error("function {0} already registered")]
    FunctionExists(String),
    #[error("no such function {0}")]
    NoSuchFunction(String),
    #[error("switch type {0} already registered")]
    SwitchTypeExists(String),
    #[error("no such switch type {0}")]
    NoSuchSwitchType(String),
    #[error("no hint for {exten}@{context}")]
    NoSuchHint { context: String, exten: String },
    #[error("no such watcher {0}")]
    NoSuchWatcher(u64),
    #[error("invalid timing {0}")]
    InvalidTiming(String),
    #[error("invalid priority {0}")]
    InvalidPriority(String),
    #[error("invalid goto {0}")]
    InvalidGoto(String),
    #[error("active call limit {0} exceeded")]
    CallLimitExceeded(usize),
    #[error("load average {load:.2} above ceiling {max:.2}")]
    LoadLimitExceeded { load: f64, max: f64 },
    #[error("expression error: {0}")]
    Expression(String),
}

pub type Result<T, E = DialplanError> = std::result::Result<T, E>;
