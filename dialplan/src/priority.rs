use std::{fmt, str::FromStr};

use crate::args::split_args;
use crate::error::DialplanError;

/// Priority reserved for hint metadata; never executed.
pub const PRIORITY_HINT: i32 = -1;

/// Where a jump lands inside an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityTarget {
    Absolute(i32),
    RelativeForward(i32),
    RelativeBackward(i32),
    Label(String),
}

impl PriorityTarget {
    /// Absolute priority for numeric forms, given where the call is now.
    /// `None` for labels and for jumps past the `i32` range.
    pub fn numeric(&self, current: i32) -> Option<i32> {
        match self {
            PriorityTarget::Absolute(n) => Some(*n),
            PriorityTarget::RelativeForward(n) => current.checked_add(*n),
            PriorityTarget::RelativeBackward(n) => current.checked_sub(*n),
            PriorityTarget::Label(_) => None,
        }
    }
}

impl FromStr for PriorityTarget {
    type Err = DialplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(DialplanError::InvalidPriority(s.to_string()));
        }
        let relative = |digits: &str| -> Result<i32, DialplanError> {
            digits
                .parse::<i32>()
                .map_err(|_| DialplanError::InvalidPriority(s.to_string()))
        };
        if let Some(rest) = s.strip_prefix('+') {
            return Ok(PriorityTarget::RelativeForward(relative(rest)?));
        }
        if let Some(rest) = s.strip_prefix('-') {
            return Ok(PriorityTarget::RelativeBackward(relative(rest)?));
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            let n = relative(s)?;
            if n < 1 {
                return Err(DialplanError::InvalidPriority(s.to_string()));
            }
            return Ok(PriorityTarget::Absolute(n));
        }
        Ok(PriorityTarget::Label(s.to_string()))
    }
}

impl fmt::Display for PriorityTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityTarget::Absolute(n) => write!(f, "{n}"),
            PriorityTarget::RelativeForward(n) => write!(f, "+{n}"),
            PriorityTarget::RelativeBackward(n) => write!(f, "-{n}"),
            PriorityTarget::Label(label) => write!(f, "{label}"),
        }
    }
}

/// `[[context,]exten,]priority`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GotoTarget {
    pub context: Option<String>,
    pub exten: Option<String>,
    pub priority: PriorityTarget,
}

impl FromStr for GotoTarget {
    type Err = DialplanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = split_args(s.trim());
        let (context, exten, priority) = match parts.as_slice() {
            [priority] => (None, None, priority),
            [exten, priority] => (None, Some(exten), priority),
            [context, exten, priority] => (Some(context), Some(exten), priority),
            _ => return Err(DialplanError::InvalidGoto(s.to_string())),
        };
        let non_empty = |v: Option<&String>| {
            v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        };
        Ok(GotoTarget {
            context: non_empty(context),
            exten: non_empty(exten),
            priority: priority.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_priority_forms() {
        assert_eq!(PriorityTarget::Absolute(5), "5".parse().unwrap());
        assert_eq!(PriorityTarget::RelativeForward(2), "+2".parse().unwrap());
        assert_eq!(PriorityTarget::RelativeBackward(1), "-1".parse().unwrap());
        assert_eq!(
            PriorityTarget::Label("start".to_string()),
            "start".parse().unwrap()
        );
        assert!("0".parse::<PriorityTarget>().is_err());
        assert!("+x".parse::<PriorityTarget>().is_err());
        assert!("".parse::<PriorityTarget>().is_err());
    }

    #[test]
    fn numeric_resolution() {
        assert_eq!(Some(7), PriorityTarget::RelativeForward(2).numeric(5));
        assert_eq!(Some(4), PriorityTarget::RelativeBackward(1).numeric(5));
        assert_eq!(None, PriorityTarget::Label("x".into()).numeric(5));
        assert_eq!(None, PriorityTarget::RelativeForward(i32::MAX).numeric(5));
        assert_eq!(None, PriorityTarget::RelativeBackward(i32::MAX).numeric(-5));
        let target: GotoTarget = "+2147483647".parse().unwrap();
        assert_eq!(None, target.priority.numeric(5));
    }

    #[test]
    fn parses_goto_targets() {
        let target: GotoTarget = "sales,100,2".parse().unwrap();
        assert_eq!(Some("sales".to_string()), target.context);
        assert_eq!(Some("100".to_string()), target.exten);
        assert_eq!(PriorityTarget::Absolute(2), target.priority);

        let target: GotoTarget = "200|top".parse().unwrap();
        assert_eq!(None, target.context);
        assert_eq!(Some("200".to_string()), target.exten);
        assert_eq!(PriorityTarget::Label("top".into()), target.priority);

        assert!("a,b,c,d".parse::<GotoTarget>().is_err());
    }
}
