//! Finding the extension, priority or switch that answers a request.
//!
//! Contexts are found by name, not ranked: the first context whose name
//! matches is searched, then its switches, then its includes in order. The
//! first acceptable hit anywhere in that walk wins, even when a context
//! reached later holds a more specific match.

use std::sync::Arc;

use tracing::warn;

use crate::call::CallState;
use crate::pattern::{match_extension, matches, MatchAction};
use crate::registry::{Context, Extension, Priority, Registry};
use crate::substitution::Expander;
use crate::switch::{Switch, SwitchQuery, SwitchRegistry};

/// How far a resolution got. Later variants are further along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolveStatus {
    NoContext,
    NoExtension,
    NoPriority,
    NoLabel,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Priority(i32),
    Label(&'a str),
}

pub struct Request<'a> {
    /// Search this context instead of looking `context` up by name.
    pub bypass: Option<&'a Arc<Context>>,
    pub context: &'a str,
    pub exten: &'a str,
    pub lookup: Lookup<'a>,
    pub callerid: Option<&'a str>,
    pub action: MatchAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionMatch {
    /// Context the hit was found in, which may be an included one.
    pub context: String,
    /// The matching extension pattern.
    pub exten: String,
    pub priority: Priority,
}

#[derive(Clone)]
pub struct SwitchMatch {
    pub context: String,
    pub name: String,
    /// Switch data, already substituted when the switch asks for it.
    pub data: String,
    pub switch: Arc<dyn Switch>,
}

#[derive(Clone)]
pub enum Found {
    Extension(ExtensionMatch),
    Switch(SwitchMatch),
}

pub struct Resolution {
    pub status: ResolveStatus,
    pub found: Option<Found>,
}

impl Resolution {
    pub fn is_found(&self) -> bool {
        self.found.is_some()
    }

    pub fn extension(&self) -> Option<&ExtensionMatch> {
        match &self.found {
            Some(Found::Extension(m)) => Some(m),
            _ => None,
        }
    }
}

struct Walk {
    status: ResolveStatus,
    visited: Vec<String>,
    found: Option<Found>,
    early: Option<Found>,
}

impl Walk {
    fn advance(&mut self, status: ResolveStatus) {
        self.status = self.status.max(status);
    }
}

pub struct Resolver<'a> {
    pub registry: &'a Registry,
    pub switches: &'a SwitchRegistry,
    /// Used on switch data flagged for substitution.
    pub expander: Option<&'a Expander<'a>>,
    pub call: Option<&'a CallState>,
    pub max_depth: usize,
}

impl<'a> Resolver<'a> {
    /// Runs one resolution. The registry stays read-locked for the walk
    /// and is released before this returns.
    pub fn resolve(&self, request: &Request<'_>) -> Resolution {
        let mut walk = Walk {
            status: ResolveStatus::NoContext,
            visited: Vec::new(),
            found: None,
            early: None,
        };
        {
            let contexts = self.registry.read();
            self.search(&contexts, request, request.context, request.bypass, &mut walk);
        }

        let found = walk.found.or(walk.early);
        let status = if found.is_some() {
            ResolveStatus::Success
        } else {
            walk.status
        };
        if found.is_none() && request.action == MatchAction::Exec {
            self.log_failure(request, status);
        }
        Resolution { status, found }
    }

    fn search(
        &self,
        contexts: &[Arc<Context>],
        request: &Request<'_>,
        name: &str,
        bypass: Option<&Arc<Context>>,
        walk: &mut Walk,
    ) -> bool {
        if walk.visited.len() >= self.max_depth {
            warn!(
                "include depth {} exceeded looking for {}@{name}",
                self.max_depth, request.exten
            );
            return false;
        }
        if walk.visited.iter().any(|v| v == name) {
            return false;
        }
        let Some(context) = bypass.or_else(|| contexts.iter().find(|c| c.name() == name)) else {
            return false;
        };
        walk.advance(ResolveStatus::NoExtension);
        walk.visited.push(context.name().to_string());

        let (includes, switches) = {
            let body = context.body.read_recursive();
            for extension in &body.extensions {
                let grade = match_extension(request.exten, &extension.exten);
                if !request.action.accepts(grade)
                    || !callerid_matches(extension, request.callerid)
                {
                    continue;
                }
                let hit = match request.lookup {
                    Lookup::Priority(priority) => {
                        walk.advance(ResolveStatus::NoPriority);
                        extension.find_priority(priority)
                    }
                    Lookup::Label(label) => {
                        walk.advance(ResolveStatus::NoLabel);
                        extension.find_label(label)
                    }
                };
                if request.action.defers(grade) {
                    if walk.early.is_none() {
                        if let Some(priority) = hit.or_else(|| extension.priorities().first()) {
                            walk.early = Some(found(context, extension, priority));
                        }
                    }
                    continue;
                }
                if let Some(priority) = hit {
                    walk.found = Some(found(context, extension, priority));
                    return true;
                }
            }
            (body.includes.clone(), body.switches.clone())
        };

        for decl in &switches {
            let Some(switch) = self.switches.find(&decl.name) else {
                warn!("no such switch type {} in {}", decl.name, context.name());
                continue;
            };
            let data = match (decl.eval, self.expander) {
                (true, Some(expander)) => expander.expand(&decl.data),
                _ => decl.data.clone(),
            };
            let query = SwitchQuery {
                call: self.call,
                context: context.name(),
                exten: request.exten,
                priority: match request.lookup {
                    Lookup::Priority(priority) => priority,
                    Lookup::Label(_) => 0,
                },
                callerid: request.callerid,
                data: &data,
            };
            let hit = match request.action {
                MatchAction::CanMatch => switch.canmatch(&query),
                MatchAction::MatchMore => switch.matchmore(&query),
                _ => switch.exists(&query),
            };
            if hit {
                walk.found = Some(Found::Switch(SwitchMatch {
                    context: context.name().to_string(),
                    name: decl.name.clone(),
                    data,
                    switch,
                }));
                return true;
            }
        }

        includes
            .iter()
            .filter(|include| include.is_active())
            .any(|include| self.search(contexts, request, &include.name, None, walk))
    }

    fn log_failure(&self, request: &Request<'_>, status: ResolveStatus) {
        let channel = self.call.map(|c| c.channel_name.as_str()).unwrap_or("");
        let (context, exten) = (request.context, request.exten);
        match (status, request.lookup) {
            (ResolveStatus::NoContext, _) => {
                warn!(channel, "cannot find extension context '{context}'")
            }
            (ResolveStatus::NoExtension, _) => {
                warn!(channel, "cannot find extension '{exten}' in context '{context}'")
            }
            (_, Lookup::Label(label)) => warn!(
                channel,
                "no such label '{label}' in extension '{exten}' in context '{context}'"
            ),
            (_, Lookup::Priority(priority)) => warn!(
                channel,
                "no such priority {priority} in extension '{exten}' in context '{context}'"
            ),
        }
    }
}

fn found(context: &Context, extension: &Extension, priority: &Priority) -> Found {
    Found::Extension(ExtensionMatch {
        context: context.name().to_string(),
        exten: extension.exten.clone(),
        priority: priority.clone(),
    })
}

/// No filter always passes. Without a caller id only an empty filter
/// passes.
fn callerid_matches(extension: &Extension, callerid: Option<&str>) -> bool {
    match (&extension.cidmatch, callerid.filter(|c| !c.is_empty())) {
        (None, _) => true,
        (Some(pattern), None) => pattern.is_empty(),
        (Some(pattern), Some(callerid)) => matches(callerid, pattern),
    }
}
