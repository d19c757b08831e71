//! Contexts and everything they hold.
//!
//! The registry owns the context list behind one lock and every context
//! guards its own body with another. Locks are always taken in that order,
//! then the hint table's.

use std::cmp::Ordering;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::error::{DialplanError, Result};
use crate::hint::{HintChange, HintSubsystem};
use crate::pattern::{is_pattern, matches};
use crate::priority::PRIORITY_HINT;
use crate::timing::TimeSpec;

#[derive(Debug, Clone, PartialEq)]
pub struct Priority {
    pub priority: i32,
    pub label: Option<String>,
    pub app: String,
    pub data: String,
    pub registrar: String,
}

/// One extension pattern and its priorities, kept in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct Extension {
    pub exten: String,
    pub cidmatch: Option<String>,
    priorities: Vec<Priority>,
}

impl Extension {
    pub fn priorities(&self) -> &[Priority] {
        &self.priorities
    }

    pub fn find_priority(&self, priority: i32) -> Option<&Priority> {
        self.priorities.iter().find(|p| p.priority == priority)
    }

    pub fn find_label(&self, label: &str) -> Option<&Priority> {
        self.priorities
            .iter()
            .find(|p| p.label.as_deref() == Some(label))
    }

    pub fn hint(&self) -> Option<&Priority> {
        self.find_priority(PRIORITY_HINT)
    }

    fn same_root(&self, exten: &str, cidmatch: Option<&str>) -> bool {
        self.exten == exten
            && match (self.cidmatch.as_deref(), cidmatch) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
    }
}

/// Literal extensions first, then patterns, each by name. Roots without a
/// caller id filter come before filtered ones.
fn root_order(exten: &str, cidmatch: Option<&str>, other: &Extension) -> Ordering {
    is_pattern(exten)
        .cmp(&is_pattern(&other.exten))
        .then_with(|| exten.cmp(&other.exten))
        .then_with(|| cidmatch.is_some().cmp(&other.cidmatch.is_some()))
        .then_with(|| {
            let a = cidmatch.unwrap_or_default().to_lowercase();
            let b = other.cidmatch.as_deref().unwrap_or_default().to_lowercase();
            a.cmp(&b)
        })
}

/// Arguments to [`Registry::add_extension`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewExtension {
    pub exten: String,
    pub priority: i32,
    pub label: Option<String>,
    pub cidmatch: Option<String>,
    pub app: String,
    pub data: String,
    pub registrar: String,
}

impl NewExtension {
    pub fn new(exten: &str, priority: i32, app: &str, data: &str) -> Self {
        NewExtension {
            exten: exten.to_string(),
            priority,
            label: None,
            cidmatch: None,
            app: app.to_string(),
            data: data.to_string(),
            registrar: String::new(),
        }
    }

    /// A hint: `devices` joined by `&`, and an optional display name.
    pub fn hint(exten: &str, devices: &str, name: &str) -> Self {
        Self::new(exten, PRIORITY_HINT, devices, name)
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string()).filter(|l| !l.is_empty());
        self
    }

    pub fn cidmatch(mut self, cidmatch: &str) -> Self {
        self.cidmatch = Some(cidmatch.to_string());
        self
    }

    pub fn registrar(mut self, registrar: &str) -> Self {
        self.registrar = registrar.to_string();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    /// Target context.
    pub name: String,
    /// The include as written, restriction included.
    pub value: String,
    pub timing: Option<TimeSpec>,
    pub registrar: String,
}

impl Include {
    /// Parses `context` or `context,times,weekdays,mdays,months[,tz]`.
    pub fn parse(value: &str, registrar: &str) -> Result<Include> {
        let (name, timing) = match value.find([',', '|']) {
            Some(split) => {
                let timing = &value[split + 1..];
                (&value[..split], Some(timing.parse::<TimeSpec>()?))
            }
            None => (value, None),
        };
        Ok(Include {
            name: name.trim().to_string(),
            value: value.to_string(),
            timing,
            registrar: registrar.to_string(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.timing.as_ref().map_or(true, |t| t.is_active())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchDecl {
    pub name: String,
    pub data: String,
    /// Substitute variables into `data` before each use.
    pub eval: bool,
    pub registrar: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnorePattern {
    pub pattern: String,
    pub registrar: String,
}

#[derive(Debug, Default)]
pub(crate) struct ContextBody {
    pub(crate) extensions: Vec<Extension>,
    pub(crate) includes: Vec<Include>,
    pub(crate) ignore_patterns: Vec<IgnorePattern>,
    pub(crate) switches: Vec<SwitchDecl>,
}

#[derive(Debug)]
pub struct Context {
    name: String,
    registrar: String,
    pub(crate) body: RwLock<ContextBody>,
}

fn owned_by(registrar: Option<&str>, owner: &str) -> bool {
    registrar.map_or(true, |r| r == owner)
}

impl Context {
    fn new(name: &str, registrar: &str) -> Self {
        Context {
            name: name.to_string(),
            registrar: registrar.to_string(),
            body: RwLock::new(ContextBody::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registrar(&self) -> &str {
        &self.registrar
    }

    pub fn extensions(&self) -> Vec<Extension> {
        self.body.read_recursive().extensions.clone()
    }

    pub fn includes(&self) -> Vec<Include> {
        self.body.read_recursive().includes.clone()
    }

    pub fn switches(&self) -> Vec<SwitchDecl> {
        self.body.read_recursive().switches.clone()
    }

    pub fn ignore_patterns(&self) -> Vec<IgnorePattern> {
        self.body.read_recursive().ignore_patterns.clone()
    }

    fn hint_extens(&self) -> Vec<(String, String, String)> {
        self.body
            .read_recursive()
            .extensions
            .iter()
            .filter_map(|e| {
                e.hint()
                    .map(|h| (e.exten.clone(), h.app.clone(), h.data.clone()))
            })
            .collect()
    }

    fn add_extension(&self, new: NewExtension, replace: bool) -> Result<Option<HintChange>> {
        if new.priority < 1 && new.priority != PRIORITY_HINT {
            return Err(DialplanError::InvalidPriority(new.priority.to_string()));
        }
        let mut body = self.body.write();
        let exists = || DialplanError::ExtensionExists {
            context: self.name.clone(),
            exten: new.exten.clone(),
            priority: new.priority,
        };
        let priority = Priority {
            priority: new.priority,
            label: new.label.clone(),
            app: new.app.clone(),
            data: new.data.clone(),
            registrar: new.registrar.clone(),
        };

        let cidmatch = new.cidmatch.as_deref();
        let root = body
            .extensions
            .iter()
            .position(|e| e.same_root(&new.exten, cidmatch));
        let replaced = match root {
            Some(index) => {
                let root = &mut body.extensions[index];
                if let Some(label) = &new.label {
                    if root
                        .priorities
                        .iter()
                        .any(|p| p.priority != new.priority && p.label.as_ref() == Some(label))
                    {
                        return Err(DialplanError::DuplicateLabel {
                            context: self.name.clone(),
                            exten: new.exten.clone(),
                            label: label.clone(),
                        });
                    }
                }
                match root
                    .priorities
                    .binary_search_by_key(&new.priority, |p| p.priority)
                {
                    Ok(_) if !replace => return Err(exists()),
                    Ok(index) => {
                        root.priorities[index] = priority;
                        true
                    }
                    Err(index) => {
                        root.priorities.insert(index, priority);
                        false
                    }
                }
            }
            None => {
                let index = body
                    .extensions
                    .iter()
                    .position(|e| root_order(&new.exten, cidmatch, e) == Ordering::Less)
                    .unwrap_or(body.extensions.len());
                body.extensions.insert(
                    index,
                    Extension {
                        exten: new.exten.clone(),
                        cidmatch: new.cidmatch.clone(),
                        priorities: vec![priority],
                    },
                );
                false
            }
        };
        drop(body);

        if new.priority != PRIORITY_HINT {
            return Ok(None);
        }
        let (context, exten, devices, name) =
            (self.name.clone(), new.exten, new.app, new.data);
        Ok(Some(if replaced {
            HintChange::Changed {
                context,
                exten,
                devices,
                name,
            }
        } else {
            HintChange::Added {
                context,
                exten,
                devices,
                name,
            }
        }))
    }

    /// Priority 0 removes every priority of the extension.
    fn remove_extension(
        &self,
        exten: &str,
        priority: i32,
        registrar: Option<&str>,
    ) -> Result<Option<HintChange>> {
        let mut body = self.body.write();
        let mut removed = false;
        let mut hint_removed = false;
        for root in body.extensions.iter_mut().filter(|e| e.exten == exten) {
            root.priorities.retain(|p| {
                let hit = (priority == 0 || p.priority == priority)
                    && owned_by(registrar, &p.registrar);
                if hit {
                    removed = true;
                    hint_removed |= p.priority == PRIORITY_HINT;
                }
                !hit
            });
        }
        if !removed {
            return Err(DialplanError::NoSuchExtension {
                context: self.name.clone(),
                exten: exten.to_string(),
            });
        }
        body.extensions.retain(|e| !e.priorities.is_empty());
        // another caller id variant may still carry a hint
        let hint_left = body
            .extensions
            .iter()
            .any(|e| e.exten == exten && e.hint().is_some());
        Ok((hint_removed && !hint_left).then(|| HintChange::Removed {
            context: self.name.clone(),
            exten: exten.to_string(),
        }))
    }

    fn add_include(&self, value: &str, registrar: &str) -> Result<()> {
        let include = Include::parse(value, registrar)?;
        let mut body = self.body.write();
        if body.includes.iter().any(|i| i.name == include.name) {
            return Err(DialplanError::IncludeExists {
                context: self.name.clone(),
                include: include.name,
            });
        }
        body.includes.push(include);
        Ok(())
    }

    fn remove_include(&self, name: &str, registrar: Option<&str>) -> Result<()> {
        let mut body = self.body.write();
        let index = body
            .includes
            .iter()
            .position(|i| i.name == name && owned_by(registrar, &i.registrar))
            .ok_or_else(|| DialplanError::NoSuchInclude {
                context: self.name.clone(),
                include: name.to_string(),
            })?;
        body.includes.remove(index);
        Ok(())
    }

    fn add_switch(&self, switch: SwitchDecl) -> Result<()> {
        let mut body = self.body.write();
        if body
            .switches
            .iter()
            .any(|s| s.name.eq_ignore_ascii_case(&switch.name) && s.data == switch.data)
        {
            return Err(DialplanError::SwitchExists {
                context: self.name.clone(),
                switch: format!("{}/{}", switch.name, switch.data),
            });
        }
        body.switches.push(switch);
        Ok(())
    }

    fn remove_switch(&self, name: &str, data: &str, registrar: Option<&str>) -> Result<()> {
        let mut body = self.body.write();
        let index = body
            .switches
            .iter()
            .position(|s| {
                s.name.eq_ignore_ascii_case(name)
                    && s.data == data
                    && owned_by(registrar, &s.registrar)
            })
            .ok_or_else(|| DialplanError::NoSuchSwitch {
                context: self.name.clone(),
                switch: format!("{name}/{data}"),
            })?;
        body.switches.remove(index);
        Ok(())
    }

    fn add_ignorepattern(&self, pattern: &str, registrar: &str) -> Result<()> {
        let mut body = self.body.write();
        if body.ignore_patterns.iter().any(|p| p.pattern == pattern) {
            return Err(DialplanError::IgnorePatternExists {
                context: self.name.clone(),
                pattern: pattern.to_string(),
            });
        }
        body.ignore_patterns.push(IgnorePattern {
            pattern: pattern.to_string(),
            registrar: registrar.to_string(),
        });
        Ok(())
    }

    fn remove_ignorepattern(&self, pattern: &str, registrar: Option<&str>) -> Result<()> {
        let mut body = self.body.write();
        let index = body
            .ignore_patterns
            .iter()
            .position(|p| p.pattern == pattern && owned_by(registrar, &p.registrar))
            .ok_or_else(|| DialplanError::NoSuchIgnorePattern {
                context: self.name.clone(),
                pattern: pattern.to_string(),
            })?;
        body.ignore_patterns.remove(index);
        Ok(())
    }
}

/// Contexts built off to the side and swapped in by
/// [`Registry::merge_generation`]. Hints are only registered at merge time.
pub struct Generation {
    registrar: String,
    contexts: Vec<Arc<Context>>,
}

impl Generation {
    pub fn new(registrar: &str) -> Self {
        Generation {
            registrar: registrar.to_string(),
            contexts: Vec::new(),
        }
    }

    pub fn registrar(&self) -> &str {
        &self.registrar
    }

    pub fn contexts(&self) -> &[Arc<Context>] {
        &self.contexts
    }

    pub fn create_context(&mut self, name: &str) -> Result<Arc<Context>> {
        if self.find_context(name).is_some() {
            return Err(DialplanError::ContextExists(name.to_string()));
        }
        let context = Arc::new(Context::new(name, &self.registrar));
        self.contexts.push(context.clone());
        Ok(context)
    }

    pub fn find_or_create_context(&mut self, name: &str) -> Arc<Context> {
        if let Some(context) = self.find_context(name) {
            return context;
        }
        let context = Arc::new(Context::new(name, &self.registrar));
        self.contexts.push(context.clone());
        context
    }

    pub fn find_context(&self, name: &str) -> Option<Arc<Context>> {
        self.contexts.iter().find(|c| c.name == name).cloned()
    }

    fn context(&self, name: &str) -> Result<Arc<Context>> {
        self.find_context(name)
            .ok_or_else(|| DialplanError::NoSuchContext(name.to_string()))
    }

    pub fn add_extension(&self, context: &str, new: NewExtension, replace: bool) -> Result<()> {
        self.context(context)?.add_extension(new, replace).map(|_| ())
    }

    pub fn add_include(&self, context: &str, value: &str) -> Result<()> {
        self.context(context)?.add_include(value, &self.registrar)
    }

    pub fn add_switch(&self, context: &str, name: &str, data: &str, eval: bool) -> Result<()> {
        self.context(context)?.add_switch(SwitchDecl {
            name: name.to_string(),
            data: data.to_string(),
            eval,
            registrar: self.registrar.clone(),
        })
    }

    pub fn add_ignorepattern(&self, context: &str, pattern: &str) -> Result<()> {
        self.context(context)?
            .add_ignorepattern(pattern, &self.registrar)
    }
}

pub struct Registry {
    contexts: RwLock<Vec<Arc<Context>>>,
    hints: Arc<HintSubsystem>,
}

impl Registry {
    pub fn new(hints: Arc<HintSubsystem>) -> Self {
        Registry {
            contexts: RwLock::new(Vec::new()),
            hints,
        }
    }

    /// Read access to the context list for one resolution.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Context>>> {
        self.contexts.read_recursive()
    }

    pub fn contexts(&self) -> Vec<Arc<Context>> {
        self.read().clone()
    }

    pub fn create_context(&self, name: &str, registrar: &str) -> Result<Arc<Context>> {
        let mut contexts = self.contexts.write();
        if contexts.iter().any(|c| c.name == name) {
            return Err(DialplanError::ContextExists(name.to_string()));
        }
        let context = Arc::new(Context::new(name, registrar));
        contexts.push(context.clone());
        debug!("context {name} created for {registrar}");
        Ok(context)
    }

    pub fn find_or_create_context(&self, name: &str, registrar: &str) -> Arc<Context> {
        let mut contexts = self.contexts.write();
        if let Some(context) = contexts.iter().find(|c| c.name == name) {
            return context.clone();
        }
        let context = Arc::new(Context::new(name, registrar));
        contexts.push(context.clone());
        context
    }

    pub fn find_context(&self, name: &str) -> Option<Arc<Context>> {
        self.read().iter().find(|c| c.name == name).cloned()
    }

    fn context(&self, name: &str) -> Result<Arc<Context>> {
        self.find_context(name)
            .ok_or_else(|| DialplanError::NoSuchContext(name.to_string()))
    }

    /// Removes every context matching both filters; `None` matches
    /// anything. Hints inside go away and their watchers are told.
    pub fn destroy_context(&self, name: Option<&str>, registrar: Option<&str>) -> usize {
        let mut contexts = self.contexts.write();
        let mut removed = Vec::new();
        contexts.retain(|c| {
            let hit = name.map_or(true, |n| c.name == n) && owned_by(registrar, &c.registrar);
            if hit {
                removed.push(c.clone());
            }
            !hit
        });
        for context in &removed {
            for (exten, _, _) in context.hint_extens() {
                self.hints.apply(HintChange::Removed {
                    context: context.name.clone(),
                    exten,
                });
            }
            debug!("context {} destroyed", context.name);
        }
        removed.len()
    }

    pub fn add_extension(&self, context: &str, new: NewExtension, replace: bool) -> Result<()> {
        let _contexts = self.read();
        let context = self.context(context)?;
        if let Some(change) = context.add_extension(new, replace)? {
            self.hints.apply(change);
        }
        Ok(())
    }

    pub fn remove_extension(
        &self,
        context: &str,
        exten: &str,
        priority: i32,
        registrar: Option<&str>,
    ) -> Result<()> {
        let _contexts = self.read();
        let context = self.context(context)?;
        if let Some(change) = context.remove_extension(exten, priority, registrar)? {
            self.hints.apply(change);
        }
        Ok(())
    }

    pub fn add_include(&self, context: &str, value: &str, registrar: &str) -> Result<()> {
        self.context(context)?.add_include(value, registrar)
    }

    pub fn remove_include(&self, context: &str, name: &str, registrar: Option<&str>) -> Result<()> {
        self.context(context)?.remove_include(name, registrar)
    }

    pub fn add_switch(
        &self,
        context: &str,
        name: &str,
        data: &str,
        eval: bool,
        registrar: &str,
    ) -> Result<()> {
        self.context(context)?.add_switch(SwitchDecl {
            name: name.to_string(),
            data: data.to_string(),
            eval,
            registrar: registrar.to_string(),
        })
    }

    pub fn remove_switch(
        &self,
        context: &str,
        name: &str,
        data: &str,
        registrar: Option<&str>,
    ) -> Result<()> {
        self.context(context)?.remove_switch(name, data, registrar)
    }

    pub fn add_ignorepattern(&self, context: &str, pattern: &str, registrar: &str) -> Result<()> {
        self.context(context)?.add_ignorepattern(pattern, registrar)
    }

    pub fn remove_ignorepattern(
        &self,
        context: &str,
        pattern: &str,
        registrar: Option<&str>,
    ) -> Result<()> {
        self.context(context)?
            .remove_ignorepattern(pattern, registrar)
    }

    /// Whether `digits` hits one of the context's ignore patterns.
    pub fn ignore_pattern(&self, context: &str, digits: &str) -> bool {
        let Some(context) = self.find_context(context) else {
            return false;
        };
        let body = context.body.read_recursive();
        body.ignore_patterns
            .iter()
            .any(|p| matches(digits, &p.pattern))
    }

    /// Swaps in `generation`: contexts the same registrar owned before are
    /// dropped, the new ones go first in lookup order, and hint watchers
    /// move to the hints that replace theirs.
    pub fn merge_generation(&self, generation: Generation) {
        let Generation {
            registrar,
            contexts: fresh,
        } = generation;
        let mut contexts = self.contexts.write();

        let keys: Vec<(String, String)> = contexts
            .iter()
            .filter(|c| c.registrar == registrar)
            .flat_map(|c| {
                c.hint_extens()
                    .into_iter()
                    .map(move |(exten, _, _)| (c.name.clone(), exten))
            })
            .collect();
        let detached = self.hints.detach(&keys);

        let before = contexts.len();
        contexts.retain(|c| c.registrar != registrar);
        let dropped = before - contexts.len();

        for context in fresh.iter().rev() {
            if contexts.iter().any(|c| c.name == context.name) {
                warn!(
                    "context {} from {registrar} shadows an existing context of the same name",
                    context.name
                );
            }
            contexts.insert(0, context.clone());
        }

        for context in &fresh {
            for (exten, devices, name) in context.hint_extens() {
                self.hints.apply(HintChange::Added {
                    context: context.name.clone(),
                    exten,
                    devices,
                    name,
                });
            }
        }
        self.hints.reattach(detached);
        info!(
            registrar = %registrar,
            "merged {} contexts, replaced {}",
            fresh.len(),
            dropped
        );
    }
}
