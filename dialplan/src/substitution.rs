//! `${...}` and `$[...]` expansion.

use chrono::{Local, Utc};
use tracing::{debug, warn};

use crate::call::CallState;
use crate::expression::ExpressionEvaluator;
use crate::function::{FunctionRegistry, FunctionScope};
use crate::variables::GlobalVariables;

/// Looks up the hint registered for an extension, as `(devices, name)`.
pub trait HintSource {
    fn hint_for(&self, context: &str, exten: &str) -> Option<(String, String)>;
}

/// One expansion pass over a template. Built per use from the engine's
/// shared state and, when there is one, the call being served.
pub struct Expander<'a> {
    pub call: Option<&'a CallState>,
    pub globals: &'a GlobalVariables,
    pub functions: &'a FunctionRegistry,
    pub evaluator: &'a dyn ExpressionEvaluator,
    pub hints: Option<&'a dyn HintSource>,
    pub system_name: &'a str,
    /// Output longer than this many bytes is cut.
    pub limit: usize,
}

impl<'a> Expander<'a> {
    pub fn expand(&self, template: &str) -> String {
        if !template.contains('$') {
            let mut out = template.to_string();
            truncate(&mut out, self.limit);
            return out;
        }

        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(pos) = find_reference(rest) {
            out.push_str(&rest[..pos]);
            let is_var = rest.as_bytes()[pos + 1] == b'{';
            let (open, close) = if is_var { ('{', '}') } else { ('[', ']') };
            let body_start = pos + 2;
            let (body, needsub, consumed) = scan(&rest[body_start..], open, close);

            let inner = if needsub {
                self.expand(body)
            } else {
                body.to_string()
            };
            if is_var {
                out.push_str(&self.reference(&inner));
            } else {
                out.push_str(&self.expression(&inner));
            }

            rest = &rest[body_start + consumed..];
            if out.len() > self.limit {
                break;
            }
        }
        out.push_str(rest);
        truncate(&mut out, self.limit);
        out
    }

    /// The value of one `${...}` body, after any slice is applied.
    fn reference(&self, inner: &str) -> String {
        let (name, offset, length) = parse_slice(inner);
        let value = if name.contains('(') && name.ends_with(')') {
            let scope = FunctionScope {
                call: self.call,
                globals: self.globals,
            };
            self.functions.read(name, &scope)
        } else {
            self.variable(name).unwrap_or_default()
        };
        match offset {
            Some(offset) => substring(&value, offset, length),
            None => value,
        }
    }

    fn expression(&self, inner: &str) -> String {
        match self.evaluator.evaluate(inner) {
            Ok(value) => value,
            Err(err) => {
                warn!("error in expression $[{inner}]: {err}");
                String::new()
            }
        }
    }

    /// Per-call builtins, then call variables, then engine-wide builtins,
    /// then globals.
    pub fn variable(&self, name: &str) -> Option<String> {
        if let Some(call) = self.call {
            if let Some(value) = self.call_builtin(call, name) {
                return Some(value);
            }
            if let Some(value) = call.variables.get(name) {
                return Some(value.to_string());
            }
        }
        if let Some(value) = self.global_builtin(name) {
            return Some(value);
        }
        self.globals.get(name)
    }

    fn call_builtin(&self, call: &CallState, name: &str) -> Option<String> {
        let caller = &call.caller;
        let field = |value: &Option<String>| value.clone().unwrap_or_default();
        let value = match name {
            "CALLERID" => caller.all(),
            "CALLERIDNUM" => field(&caller.num),
            "CALLERIDNAME" => field(&caller.name),
            "CALLERANI" => field(&caller.ani),
            "DNID" => field(&caller.dnid),
            "RDNIS" => field(&caller.rdnis),
            "EXTEN" => call.exten.clone(),
            "CONTEXT" => call.context.clone(),
            "PRIORITY" => call.priority.to_string(),
            "CHANNEL" => call.channel_name.clone(),
            "UNIQUEID" => call.unique_id.clone(),
            "HANGUPCAUSE" => call.hangup_cause.to_string(),
            "LANGUAGE" => call.language.clone(),
            "ACCOUNTCODE" => call.account_code.clone(),
            "HINT" | "HINTNAME" => {
                let hint = self
                    .hints
                    .and_then(|hints| hints.hint_for(&call.context, &call.exten));
                match hint {
                    Some((devices, _)) if name == "HINT" => devices,
                    Some((_, hint_name)) => hint_name,
                    None => String::new(),
                }
            }
            _ => return None,
        };
        Some(value)
    }

    fn global_builtin(&self, name: &str) -> Option<String> {
        let value = match name {
            "EPOCH" => Utc::now().timestamp().to_string(),
            "DATETIME" => Local::now().format("%d%m%Y-%H:%M:%S").to_string(),
            "TIMESTAMP" => Local::now().format("%Y%m%d-%H%M%S").to_string(),
            "SYSTEMNAME" => self.system_name.to_string(),
            _ => return None,
        };
        Some(value)
    }
}

/// Byte index of the next `${` or `$[`.
fn find_reference(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    s.match_indices('$')
        .map(|(i, _)| i)
        .find(|&i| matches!(bytes.get(i + 1), Some(b'{') | Some(b'[')))
}

/// Finds the close matching an already consumed `open`. Returns the body,
/// whether it holds nested references, and how many bytes were consumed
/// including the close. An unterminated body runs to the end of input.
fn scan(s: &str, open: char, close: char) -> (&str, bool, usize) {
    let mut depth = 1;
    let mut needsub = false;
    let mut prev = '\0';
    for (i, c) in s.char_indices() {
        if prev == '$' && (c == '{' || c == '[') {
            needsub = true;
        }
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return (&s[..i], needsub, i + c.len_utf8());
            }
        }
        prev = c;
    }
    warn!("missing '{close}' in substitution, using rest of string");
    (s, needsub, s.len())
}

/// Splits `name[:offset[:length]]`, ignoring colons inside parentheses.
fn parse_slice(inner: &str) -> (&str, Option<i64>, Option<i64>) {
    let mut depth = 0i32;
    let mut colons = Vec::with_capacity(2);
    for (i, c) in inner.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ':' if depth == 0 => {
                colons.push(i);
                if colons.len() == 2 {
                    break;
                }
            }
            _ => {}
        }
    }
    let number = |s: &str| -> Option<i64> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        Some(s.parse().unwrap_or_else(|_| {
            debug!("non-numeric substring bound {s:?}");
            0
        }))
    };
    match colons.as_slice() {
        [] => (inner, None, None),
        [first] => (&inner[..*first], Some(number(&inner[first + 1..]).unwrap_or(0)), None),
        [first, second, ..] => (
            &inner[..*first],
            Some(number(&inner[first + 1..*second]).unwrap_or(0)),
            number(&inner[second + 1..]),
        ),
    }
}

/// Character slice with negative offsets counted from the end. Bounds
/// clamp; nothing here fails.
pub fn substring(value: &str, offset: i64, length: Option<i64>) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len() as i64;
    let start = if offset < 0 {
        (len + offset).max(0)
    } else {
        offset.min(len)
    };
    let end = match length {
        None => len,
        Some(length) if length < 0 => (len + length).max(start),
        Some(length) => start.saturating_add(length).min(len),
    };
    chars[start as usize..end as usize].iter().collect()
}

fn truncate(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    let mut cut = limit;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!("substitution truncated to {cut} bytes");
    s.truncate(cut);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::call::CallerId;
    use crate::expression::ArithmeticEvaluator;
    use crate::function::DialplanFunction;

    struct Upper;

    impl DialplanFunction for Upper {
        fn read(&self, _scope: &FunctionScope<'_>, args: &[String]) -> anyhow::Result<String> {
            Ok(args.join(",").to_uppercase())
        }
    }

    struct Hints;

    impl HintSource for Hints {
        fn hint_for(&self, context: &str, exten: &str) -> Option<(String, String)> {
            (context == "office" && exten == "100")
                .then(|| ("SIP/100&SIP/101".to_string(), "Reception".to_string()))
        }
    }

    struct Fixture {
        globals: GlobalVariables,
        functions: FunctionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let functions = FunctionRegistry::new();
            functions
                .register("UPPER", Arc::new(Upper), "", "", "")
                .unwrap();
            Fixture {
                globals: GlobalVariables::new(),
                functions,
            }
        }

        fn expander<'a>(&'a self, call: Option<&'a CallState>) -> Expander<'a> {
            Expander {
                call,
                globals: &self.globals,
                functions: &self.functions,
                evaluator: &ArithmeticEvaluator,
                hints: Some(&Hints),
                system_name: "pbx1",
                limit: 8192,
            }
        }
    }

    #[test]
    fn unset_variable_is_empty() {
        let fixture = Fixture::new();
        assert_eq!("[]", fixture.expander(None).expand("[${FOO}]"));
    }

    #[test]
    fn substrings() {
        let fixture = Fixture::new();
        fixture.globals.set("FOO", "abcdef");
        let expander = fixture.expander(None);
        assert_eq!("cdef", expander.expand("${FOO:2}"));
        assert_eq!("ef", expander.expand("${FOO:-2}"));
        assert_eq!("cde", expander.expand("${FOO:2:3}"));
        assert_eq!("", expander.expand("${FOO:10}"));
        assert_eq!("abcdef", expander.expand("${FOO:-10}"));
        assert_eq!("bcde", expander.expand("${FOO:1:-1}"));
        assert_eq!("cdef", expander.expand("${FOO:2:100}"));
    }

    #[test]
    fn lookup_order() {
        let fixture = Fixture::new();
        fixture.globals.set("COLOR", "blue");
        fixture.globals.set("EXTEN", "global");
        let mut call = CallState::new("office", "100", 3)
            .with_caller(CallerId::new("5551234", "Alice"));
        call.channel_name = "SIP/alice-0001".to_string();
        call.variables.set("exten", "shadowed");
        let expander = fixture.expander(Some(&call));
        assert_eq!("blue", expander.expand("${COLOR}"));
        assert_eq!("100", expander.expand("${EXTEN}"));
        assert_eq!("shadowed", expander.expand("${exten}"));
        assert_eq!("\"Alice\" <5551234>", expander.expand("${CALLERID}"));
        assert_eq!("office/3", expander.expand("${CONTEXT}/${PRIORITY}"));
        assert_eq!("SIP/alice-0001", expander.expand("${CHANNEL}"));
        assert_eq!("SIP/100&SIP/101 Reception", expander.expand("${HINT} ${HINTNAME}"));
        assert_eq!("pbx1", expander.expand("${SYSTEMNAME}"));

        let mut call = call;
        call.variables.set("COLOR", "red");
        assert_eq!("red", fixture.expander(Some(&call)).expand("${COLOR}"));
        assert_eq!("blue", fixture.expander(None).expand("${COLOR}"));
    }

    #[test]
    fn nested_references() {
        let fixture = Fixture::new();
        fixture.globals.set("WHICH", "TARGET");
        fixture.globals.set("TARGET", "found");
        fixture.globals.set("N", "2");
        let expander = fixture.expander(None);
        assert_eq!("found", expander.expand("${${WHICH}}"));
        assert_eq!("x3y", expander.expand("x$[1 + ${N}]y"));
        assert_eq!("6", expander.expand("$[$[1+2] * ${N}]"));
    }

    #[test]
    fn functions_and_slices() {
        let fixture = Fixture::new();
        fixture.globals.set("NAME", "bob");
        let expander = fixture.expander(None);
        assert_eq!("BOB", expander.expand("${UPPER(${NAME})}"));
        assert_eq!("OB", expander.expand("${UPPER(bob):1}"));
        assert_eq!("A:B", expander.expand("${UPPER(a:b)}"));
        assert_eq!("", expander.expand("${NOSUCH(x)}"));
    }

    #[test]
    fn literal_text_and_errors() {
        let fixture = Fixture::new();
        fixture.globals.set("FOO", "abc");
        let expander = fixture.expander(None);
        assert_eq!("cost $5 {x}", expander.expand("cost $5 {x}"));
        assert_eq!("xabc", expander.expand("x${FOO"));
        assert_eq!("", expander.expand("$[1 / 0]"));
        assert!(!expander.expand("${EPOCH}").is_empty());
    }

    #[test]
    fn output_is_bounded() {
        let fixture = Fixture::new();
        fixture.globals.set("FOO", "abcdef");
        let mut expander = fixture.expander(None);
        expander.limit = 4;
        assert_eq!("abcd", expander.expand("${FOO}${FOO}"));
        assert_eq!("1234", expander.expand("123456"));
        expander.limit = 2;
        assert_eq!("é", expander.expand("éa"));
    }
}
