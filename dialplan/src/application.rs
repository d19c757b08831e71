use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::call::Call;
use crate::error::{DialplanError, Result};

/// Integer result asking the interpreter to stop without hanging up.
pub const PBX_KEEPALIVE: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppResult {
    /// Step to the next priority.
    Continue,
    /// Error or hangup, the interpreter heads for the `h` extension.
    Fail,
    /// Jump to the single digit extension named by the key.
    Digit(char),
    /// Stop interpreting and leave the channel up.
    KeepAlive,
}

pub fn is_dtmf(c: char) -> bool {
    matches!(c, '0'..='9' | '*' | '#' | 'A'..='D')
}

impl AppResult {
    /// Maps the integer convention used by collaborators: 0 continues,
    /// negative fails, a DTMF character code jumps, `PBX_KEEPALIVE` stops.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => AppResult::Continue,
            PBX_KEEPALIVE => AppResult::KeepAlive,
            code if code < 0 => AppResult::Fail,
            code => match char::from_u32(code as u32) {
                Some(c) if is_dtmf(c) => AppResult::Digit(c),
                _ => AppResult::Fail,
            },
        }
    }
}

#[async_trait]
pub trait Application: Send + Sync {
    async fn exec(&self, call: &mut Call, args: &[String]) -> AppResult;
}

struct FnApplication<F>(F);

#[async_trait]
impl<F> Application for FnApplication<F>
where
    F: Fn(&mut Call, &[String]) -> AppResult + Send + Sync,
{
    async fn exec(&self, call: &mut Call, args: &[String]) -> AppResult {
        (self.0)(call, args)
    }
}

/// Wraps a synchronous closure as an application.
pub fn app_fn<F>(f: F) -> Arc<dyn Application>
where
    F: Fn(&mut Call, &[String]) -> AppResult + Send + Sync + 'static,
{
    Arc::new(FnApplication(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AppHandle(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub synopsis: String,
    pub syntax: String,
    pub description: String,
}

struct Registered {
    handle: AppHandle,
    info: AppInfo,
    app: Arc<dyn Application>,
}

#[derive(Default)]
pub struct ApplicationRegistry {
    apps: RwLock<HashMap<String, Registered>>,
    next_handle: AtomicU64,
}

impl ApplicationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        app: Arc<dyn Application>,
        synopsis: &str,
        syntax: &str,
        description: &str,
    ) -> Result<AppHandle> {
        let key = name.to_lowercase();
        let mut apps = self.apps.write();
        if apps.contains_key(&key) {
            return Err(DialplanError::ApplicationExists(name.to_string()));
        }
        let handle = AppHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        apps.insert(
            key,
            Registered {
                handle,
                info: AppInfo {
                    name: name.to_string(),
                    synopsis: synopsis.to_string(),
                    syntax: syntax.to_string(),
                    description: description.to_string(),
                },
                app,
            },
        );
        debug!("registered application {name}");
        Ok(handle)
    }

    pub fn unregister(&self, handle: AppHandle) -> Result<()> {
        let mut apps = self.apps.write();
        let key = apps
            .iter()
            .find(|(_, r)| r.handle == handle)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| DialplanError::NoSuchApplication(format!("{handle:?}")))?;
        if let Some(removed) = apps.remove(&key) {
            info!("unregistered application {}", removed.info.name);
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Application>> {
        self.apps
            .read()
            .get(&name.to_lowercase())
            .map(|r| r.app.clone())
    }

    pub fn info(&self, name: &str) -> Option<AppInfo> {
        self.apps
            .read()
            .get(&name.to_lowercase())
            .map(|r| r.info.clone())
    }

    pub fn list(&self) -> Vec<AppInfo> {
        let mut infos: Vec<AppInfo> =
            self.apps.read().values().map(|r| r.info.clone()).collect();
        infos.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes() {
        assert_eq!(AppResult::Continue, AppResult::from_code(0));
        assert_eq!(AppResult::Fail, AppResult::from_code(-1));
        assert_eq!(AppResult::Digit('5'), AppResult::from_code('5' as i32));
        assert_eq!(AppResult::Digit('#'), AppResult::from_code('#' as i32));
        assert_eq!(AppResult::KeepAlive, AppResult::from_code(PBX_KEEPALIVE));
        assert_eq!(AppResult::Fail, AppResult::from_code('z' as i32));
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ApplicationRegistry::new();
        let noop = app_fn(|_, _| AppResult::Continue);
        let handle = registry
            .register("Echo", noop.clone(), "echo", "Echo()", "")
            .unwrap();
        assert_eq!(
            Err(DialplanError::ApplicationExists("ECHO".to_string())),
            registry
                .register("ECHO", noop.clone(), "", "", "")
                .map(|_| ())
        );
        assert!(registry.find("echo").is_some());
        assert_eq!("echo", registry.info("Echo").unwrap().synopsis);

        registry.unregister(handle).unwrap();
        assert!(registry.find("Echo").is_none());
        assert!(registry.unregister(handle).is_err());
        assert!(registry.register("Echo", noop, "", "", "").is_ok());
    }
}
