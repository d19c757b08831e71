//! Alternative switches: named dynamic resolvers a context falls back to
//! when none of its own extensions match.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::AppResult;
use crate::call::{Call, CallState};
use crate::error::{DialplanError, Result};

pub struct SwitchQuery<'a> {
    pub call: Option<&'a CallState>,
    pub context: &'a str,
    pub exten: &'a str,
    pub priority: i32,
    pub callerid: Option<&'a str>,
    pub data: &'a str,
}

#[async_trait]
pub trait Switch: Send + Sync {
    fn exists(&self, query: &SwitchQuery<'_>) -> bool;

    fn canmatch(&self, query: &SwitchQuery<'_>) -> bool;

    fn matchmore(&self, query: &SwitchQuery<'_>) -> bool;

    async fn exec(
        &self,
        call: &mut Call,
        context: &str,
        exten: &str,
        priority: i32,
        data: &str,
    ) -> AppResult;
}

#[derive(Default)]
pub struct SwitchRegistry {
    switches: RwLock<HashMap<String, Arc<dyn Switch>>>,
}

impl SwitchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, switch: Arc<dyn Switch>) -> Result<()> {
        let mut switches = self.switches.write();
        let key = name.to_lowercase();
        if switches.contains_key(&key) {
            return Err(DialplanError::SwitchTypeExists(name.to_string()));
        }
        switches.insert(key, switch);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.switches
            .write()
            .remove(&name.to_lowercase())
            .map(|_| ())
            .ok_or_else(|| DialplanError::NoSuchSwitchType(name.to_string()))
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Switch>> {
        self.switches.read().get(&name.to_lowercase()).cloned()
    }
}
