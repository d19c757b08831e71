use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tracing::warn;

use crate::args::split_args;
use crate::call::CallState;
use crate::error::{DialplanError, Result};
use crate::variables::GlobalVariables;

/// What a function sees when it is read from `${NAME(args)}`.
pub struct FunctionScope<'a> {
    pub call: Option<&'a CallState>,
    pub globals: &'a GlobalVariables,
}

pub trait DialplanFunction: Send + Sync {
    fn read(&self, scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String>;

    fn write(
        &self,
        _call: &mut CallState,
        _globals: &GlobalVariables,
        _args: &[String],
        _value: &str,
    ) -> anyhow::Result<()> {
        Err(anyhow!("function is read-only"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub synopsis: String,
    pub syntax: String,
    pub description: String,
}

struct Registered {
    info: FunctionInfo,
    function: Arc<dyn DialplanFunction>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: RwLock<HashMap<String, Registered>>,
}

/// Splits `NAME(args)` into the name and its arguments.
pub fn parse_call(expr: &str) -> Option<(&str, Vec<String>)> {
    let open = expr.find('(')?;
    let close = expr.rfind(')')?;
    if close < open {
        return None;
    }
    Some((&expr[..open], split_args(&expr[open + 1..close])))
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        function: Arc<dyn DialplanFunction>,
        synopsis: &str,
        syntax: &str,
        description: &str,
    ) -> Result<()> {
        let key = name.to_uppercase();
        let mut functions = self.functions.write();
        if functions.contains_key(&key) {
            return Err(DialplanError::FunctionExists(name.to_string()));
        }
        functions.insert(
            key,
            Registered {
                info: FunctionInfo {
                    name: name.to_string(),
                    synopsis: synopsis.to_string(),
                    syntax: syntax.to_string(),
                    description: description.to_string(),
                },
                function,
            },
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.functions
            .write()
            .remove(&name.to_uppercase())
            .map(|_| ())
            .ok_or_else(|| DialplanError::NoSuchFunction(name.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn DialplanFunction>> {
        self.functions
            .read()
            .get(&name.to_uppercase())
            .map(|r| r.function.clone())
    }

    pub fn list(&self) -> Vec<FunctionInfo> {
        let mut infos: Vec<FunctionInfo> = self
            .functions
            .read()
            .values()
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Evaluates `NAME(args)`. Unknown functions and read errors are logged
    /// and read as empty.
    pub fn read(&self, expr: &str, scope: &FunctionScope<'_>) -> String {
        let Some((name, args)) = parse_call(expr) else {
            warn!("function {expr} has no argument list");
            return String::new();
        };
        let Some(function) = self.find(name) else {
            warn!("function {name} not registered");
            return String::new();
        };
        match function.read(scope, &args) {
            Ok(value) => value,
            Err(err) => {
                warn!("function {name} read failed: {err}");
                String::new()
            }
        }
    }

    /// Assigns `value` to `NAME(args)`.
    pub fn write(
        &self,
        expr: &str,
        call: &mut CallState,
        globals: &GlobalVariables,
        value: &str,
    ) -> anyhow::Result<()> {
        let (name, args) =
            parse_call(expr).ok_or_else(|| anyhow!("{expr} is not a function call"))?;
        let function = self
            .find(name)
            .ok_or_else(|| DialplanError::NoSuchFunction(name.to_string()))?;
        function.write(call, globals, &args, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl DialplanFunction for Upper {
        fn read(&self, _scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String> {
            Ok(args.join(",").to_uppercase())
        }
    }

    #[test]
    fn parses_calls() {
        let (name, args) = parse_call("CUT(a,b,(c,d))").unwrap();
        assert_eq!("CUT", name);
        assert_eq!(vec!["a", "b", "(c,d)"], args);
        assert!(parse_call("PLAIN").is_none());
    }

    #[test]
    fn read_dispatches_by_name() {
        let registry = FunctionRegistry::new();
        registry
            .register("UPPER", Arc::new(Upper), "upper case", "UPPER(text)", "")
            .unwrap();
        assert!(registry
            .register("upper", Arc::new(Upper), "", "", "")
            .is_err());
        let globals = GlobalVariables::new();
        let scope = FunctionScope {
            call: None,
            globals: &globals,
        };
        assert_eq!("AB,C", registry.read("upper(ab,c)", &scope));
        assert_eq!("", registry.read("MISSING(x)", &scope));

        let mut call = CallState::new("default", "s", 1);
        assert!(registry.write("UPPER(x)", &mut call, &globals, "1").is_err());
        registry.unregister("Upper").unwrap();
        assert_eq!(0, registry.list().len());
    }
}
