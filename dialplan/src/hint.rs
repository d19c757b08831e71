//! Hints: extensions registered at the hint priority whose application
//! field names the devices behind them (`SIP/100&SIP/101`). The subsystem
//! keeps the aggregate state of every hint and tells watchers when it moves.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use nebula_task::ThreadPool;
use parking_lot::Mutex;
use strum_macros::{Display, EnumString};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{DialplanError, Result};

/// State of one device as reported by the device state source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DeviceState {
    NotInUse,
    InUse,
    Busy,
    Ringing,
    Unavailable,
    Invalid,
    Unknown,
}

/// Aggregate state of a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ExtensionState {
    /// The hint went away during a reload.
    Removed,
    /// The hint extension was deleted.
    Deactivated,
    NotInUse,
    InUse,
    Busy,
    Unavailable,
    Ringing,
    InUseRinging,
}

/// Combines the states of a hint's devices.
pub fn aggregate_state<I>(states: I) -> ExtensionState
where
    I: IntoIterator<Item = DeviceState>,
{
    let mut all_unavailable = true;
    let mut all_busy = true;
    let mut all_free = true;
    let mut busy = false;
    let mut in_use = false;
    let mut ring = false;

    for state in states {
        match state {
            DeviceState::NotInUse => {
                all_unavailable = false;
                all_busy = false;
            }
            DeviceState::InUse => {
                in_use = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Ringing => {
                ring = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Busy => {
                busy = true;
                all_unavailable = false;
                all_free = false;
            }
            DeviceState::Unavailable | DeviceState::Invalid => {
                all_busy = false;
                all_free = false;
            }
            DeviceState::Unknown => {
                all_unavailable = false;
                all_busy = false;
                all_free = false;
            }
        }
    }

    if in_use && ring {
        ExtensionState::InUseRinging
    } else if ring {
        ExtensionState::Ringing
    } else if in_use {
        ExtensionState::InUse
    } else if all_free {
        ExtensionState::NotInUse
    } else if all_busy {
        ExtensionState::Busy
    } else if all_unavailable {
        ExtensionState::Unavailable
    } else if busy {
        ExtensionState::InUse
    } else {
        ExtensionState::NotInUse
    }
}

/// Source of device states for devices that have not reported through
/// [`HintSubsystem::device_state_changed`]. Never called with the hint
/// table locked, so a source may report changes while holding its own lock.
pub trait DeviceStateProvider: Send + Sync {
    fn query(&self, device: &str) -> DeviceState;
}

/// Knows nothing about any device.
#[derive(Debug, Default)]
pub struct UnknownDevices;

impl DeviceStateProvider for UnknownDevices {
    fn query(&self, _device: &str) -> DeviceState {
        DeviceState::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub context: String,
    pub exten: String,
    pub state: ExtensionState,
}

pub type StateCallback = Arc<dyn Fn(&StateChange) + Send + Sync>;

pub type WatcherId = u64;

/// A change to the hint table produced by a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintChange {
    Added {
        context: String,
        exten: String,
        devices: String,
        name: String,
    },
    Changed {
        context: String,
        exten: String,
        devices: String,
        name: String,
    },
    Removed {
        context: String,
        exten: String,
    },
}

/// Read-only view of one hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintInfo {
    pub context: String,
    pub exten: String,
    pub devices: String,
    pub name: String,
    pub last_state: ExtensionState,
    pub watchers: usize,
}

#[derive(Clone)]
struct Watcher {
    id: WatcherId,
    callback: StateCallback,
}

struct Hint {
    context: String,
    exten: String,
    devices: String,
    name: String,
    last_state: ExtensionState,
    watchers: Vec<Watcher>,
}

impl Hint {
    fn is(&self, context: &str, exten: &str) -> bool {
        self.context == context && self.exten == exten
    }

    fn has_device(&self, device: &str) -> bool {
        self.devices
            .split('&')
            .any(|d| d.trim().eq_ignore_ascii_case(device))
    }
}

/// Watchers and last state of a hint taken out during a reload.
pub(crate) struct DetachedHint {
    context: String,
    exten: String,
    last_state: ExtensionState,
    watchers: Vec<Watcher>,
}

#[derive(Default)]
struct HintTable {
    hints: Vec<Hint>,
    global_watchers: Vec<Watcher>,
    devices: HashMap<String, DeviceState>,
}

impl HintTable {
    fn device(&self, device: &str) -> Option<DeviceState> {
        self.devices.get(&device.to_lowercase()).copied()
    }

    /// Aggregate from reported states alone, when every device has one.
    fn reported_state(&self, devices: &str) -> Option<ExtensionState> {
        let states: Option<Vec<DeviceState>> =
            device_names(devices).map(|d| self.device(d)).collect();
        states.map(aggregate_state)
    }
}

fn device_names(devices: &str) -> impl Iterator<Item = &str> {
    devices.split('&').map(str::trim).filter(|d| !d.is_empty())
}

struct Notification {
    change: StateChange,
    callbacks: Vec<StateCallback>,
}

pub struct HintSubsystem {
    table: Mutex<HintTable>,
    provider: Arc<dyn DeviceStateProvider>,
    next_id: AtomicU64,
    // a single worker keeps every notification in order
    dispatcher: ThreadPool,
}

impl HintSubsystem {
    pub fn new(provider: Arc<dyn DeviceStateProvider>) -> Self {
        HintSubsystem {
            table: Mutex::new(HintTable::default()),
            provider,
            next_id: AtomicU64::new(1),
            dispatcher: ThreadPool::with_workers("hint", 1),
        }
    }

    /// Aggregate state of a `&` separated device list. Devices nobody has
    /// reported are asked of the provider after the table is unlocked.
    pub fn state_of(&self, devices: &str) -> ExtensionState {
        let names: Vec<&str> = device_names(devices).collect();
        let known: Vec<Option<DeviceState>> = {
            let table = self.table.lock();
            names.iter().map(|d| table.device(d)).collect()
        };
        aggregate_state(
            names
                .iter()
                .zip(known)
                .map(|(d, state)| state.unwrap_or_else(|| self.provider.query(d))),
        )
    }

    pub(crate) fn apply(&self, change: HintChange) {
        match change {
            HintChange::Added {
                context,
                exten,
                devices,
                name,
            }
            | HintChange::Changed {
                context,
                exten,
                devices,
                name,
            } => self.set_hint(context, exten, devices, name),
            HintChange::Removed { context, exten } => self.remove_hint(&context, &exten),
        }
    }

    fn set_hint(&self, context: String, exten: String, devices: String, name: String) {
        let queried = self.state_of(&devices);
        let mut table = self.table.lock();
        let state = table.reported_state(&devices).unwrap_or(queried);
        let notification = match table.hints.iter().position(|h| h.is(&context, &exten)) {
            Some(index) => {
                let hint = &mut table.hints[index];
                hint.devices = devices;
                hint.name = name;
                if hint.last_state == state {
                    None
                } else {
                    hint.last_state = state;
                    Some(index)
                }
            }
            None => {
                debug!("hint {exten}@{context} added for {devices}");
                table.hints.push(Hint {
                    context,
                    exten,
                    devices,
                    name,
                    last_state: state,
                    watchers: Vec::new(),
                });
                None
            }
        };
        if let Some(index) = notification {
            let notification = Self::notification(&table, index, state);
            drop(table);
            self.dispatch(vec![notification]);
        }
    }

    fn remove_hint(&self, context: &str, exten: &str) {
        let mut table = self.table.lock();
        let Some(index) = table.hints.iter().position(|h| h.is(context, exten)) else {
            return;
        };
        let hint = table.hints.remove(index);
        drop(table);
        debug!("hint {exten}@{context} removed");
        self.dispatch(vec![Notification {
            change: StateChange {
                context: hint.context,
                exten: hint.exten,
                state: ExtensionState::Deactivated,
            },
            callbacks: hint.watchers.into_iter().map(|w| w.callback).collect(),
        }]);
    }

    /// Takes hints out of the table, keeping what their watchers need.
    pub(crate) fn detach(&self, keys: &[(String, String)]) -> Vec<DetachedHint> {
        let mut table = self.table.lock();
        let mut detached = Vec::new();
        table.hints.retain_mut(|hint| {
            if !keys.iter().any(|(c, e)| hint.is(c, e)) {
                return true;
            }
            detached.push(DetachedHint {
                context: hint.context.clone(),
                exten: hint.exten.clone(),
                last_state: hint.last_state,
                watchers: std::mem::take(&mut hint.watchers),
            });
            false
        });
        detached
    }

    /// Hands detached watchers to the hints that replaced theirs. Watchers
    /// whose hint did not come back are told it was removed.
    pub(crate) fn reattach(&self, detached: Vec<DetachedHint>) {
        let mut table = self.table.lock();
        let mut notifications = Vec::new();
        for old in detached {
            match table.hints.iter().position(|h| h.is(&old.context, &old.exten)) {
                Some(index) => {
                    let hint = &mut table.hints[index];
                    let current = hint.last_state;
                    hint.watchers.extend(old.watchers);
                    if current != old.last_state {
                        notifications.push(Self::notification(&table, index, current));
                    }
                }
                None => {
                    if old.watchers.is_empty() {
                        continue;
                    }
                    notifications.push(Notification {
                        change: StateChange {
                            context: old.context,
                            exten: old.exten,
                            state: ExtensionState::Removed,
                        },
                        callbacks: old.watchers.into_iter().map(|w| w.callback).collect(),
                    });
                }
            }
        }
        drop(table);
        self.dispatch(notifications);
    }

    /// Called for every hint that changes state, before its own watchers.
    pub fn add_global_watcher(&self, callback: StateCallback) -> WatcherId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .lock()
            .global_watchers
            .push(Watcher { id, callback });
        id
    }

    /// Watches the hint stored under exactly `(context, exten)`.
    pub(crate) fn add_hint_watcher(
        &self,
        context: &str,
        exten: &str,
        callback: StateCallback,
    ) -> Result<WatcherId> {
        let mut table = self.table.lock();
        let hint = table
            .hints
            .iter_mut()
            .find(|h| h.is(context, exten))
            .ok_or_else(|| DialplanError::NoSuchHint {
                context: context.to_string(),
                exten: exten.to_string(),
            })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        hint.watchers.push(Watcher { id, callback });
        Ok(id)
    }

    pub fn remove_watcher(&self, id: WatcherId) -> Result<()> {
        let mut table = self.table.lock();
        if let Some(index) = table.global_watchers.iter().position(|w| w.id == id) {
            table.global_watchers.remove(index);
            return Ok(());
        }
        for hint in table.hints.iter_mut() {
            if let Some(index) = hint.watchers.iter().position(|w| w.id == id) {
                hint.watchers.remove(index);
                return Ok(());
            }
        }
        Err(DialplanError::NoSuchWatcher(id))
    }

    /// Records a device state report and notifies watchers of every hint
    /// whose aggregate state moved.
    pub fn device_state_changed(&self, device: &str, state: DeviceState) {
        let affected: Vec<(String, String, String)> = {
            let mut table = self.table.lock();
            table.devices.insert(device.to_lowercase(), state);
            table
                .hints
                .iter()
                .filter(|h| h.has_device(device))
                .map(|h| (h.context.clone(), h.exten.clone(), h.devices.clone()))
                .collect()
        };
        let queried: Vec<ExtensionState> = affected
            .iter()
            .map(|(_, _, devices)| self.state_of(devices))
            .collect();

        let mut table = self.table.lock();
        let mut notifications = Vec::new();
        for ((context, exten, devices), queried) in affected.into_iter().zip(queried) {
            let Some(index) = table
                .hints
                .iter()
                .position(|h| h.is(&context, &exten) && h.devices == devices)
            else {
                continue;
            };
            let aggregate = table.reported_state(&devices).unwrap_or(queried);
            if aggregate == table.hints[index].last_state {
                continue;
            }
            table.hints[index].last_state = aggregate;
            notifications.push(Self::notification(&table, index, aggregate));
        }
        drop(table);
        if !notifications.is_empty() {
            info!(device, %state, "device state changed, {} hints updated", notifications.len());
        }
        self.dispatch(notifications);
    }

    /// Feeds `(device, state)` events from a device state source.
    pub fn subscribe(
        self: &Arc<Self>,
        mut events: Receiver<(String, DeviceState)>,
    ) -> JoinHandle<()> {
        let hints = self.clone();
        tokio::spawn(async move {
            while let Some((device, state)) = events.recv().await {
                hints.device_state_changed(&device, state);
            }
            debug!("device state feed closed");
        })
    }

    /// Last known state of the hint stored under `(context, exten)`.
    pub fn hint_state(&self, context: &str, exten: &str) -> Option<ExtensionState> {
        self.table
            .lock()
            .hints
            .iter()
            .find(|h| h.is(context, exten))
            .map(|h| h.last_state)
    }

    pub fn hints(&self) -> Vec<HintInfo> {
        self.table
            .lock()
            .hints
            .iter()
            .map(|h| HintInfo {
                context: h.context.clone(),
                exten: h.exten.clone(),
                devices: h.devices.clone(),
                name: h.name.clone(),
                last_state: h.last_state,
                watchers: h.watchers.len(),
            })
            .collect()
    }

    fn notification(table: &HintTable, index: usize, state: ExtensionState) -> Notification {
        let hint = &table.hints[index];
        Notification {
            change: StateChange {
                context: hint.context.clone(),
                exten: hint.exten.clone(),
                state,
            },
            callbacks: table
                .global_watchers
                .iter()
                .chain(hint.watchers.iter())
                .map(|w| w.callback.clone())
                .collect(),
        }
    }

    fn dispatch(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            if notification.callbacks.is_empty() {
                continue;
            }
            self.dispatcher.spawn(move || {
                let change = &notification.change;
                for callback in &notification.callbacks {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                        warn!(
                            "state watcher panicked on {}@{} {}",
                            change.exten, change.context, change.state
                        );
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam::channel::{unbounded, Receiver};

    use super::*;
    use DeviceState::*;

    fn recorder() -> (StateCallback, Receiver<StateChange>) {
        let (tx, rx) = unbounded();
        let callback: StateCallback = Arc::new(move |change: &StateChange| {
            let _ = tx.send(change.clone());
        });
        (callback, rx)
    }

    fn next(rx: &Receiver<StateChange>) -> StateChange {
        rx.recv_timeout(Duration::from_secs(2)).unwrap()
    }

    fn added(exten: &str, devices: &str) -> HintChange {
        HintChange::Added {
            context: "office".to_string(),
            exten: exten.to_string(),
            devices: devices.to_string(),
            name: String::new(),
        }
    }

    #[test]
    fn aggregates() {
        assert_eq!(ExtensionState::Ringing, aggregate_state([Ringing, NotInUse]));
        assert_eq!(ExtensionState::InUseRinging, aggregate_state([InUse, Ringing]));
        assert_eq!(ExtensionState::Busy, aggregate_state([Busy, Busy]));
        assert_eq!(ExtensionState::InUse, aggregate_state([InUse, Unavailable]));
        assert_eq!(ExtensionState::NotInUse, aggregate_state([NotInUse, NotInUse]));
        assert_eq!(ExtensionState::Unavailable, aggregate_state([Unavailable, Invalid]));
        assert_eq!(ExtensionState::InUse, aggregate_state([Busy, NotInUse]));
        assert_eq!(ExtensionState::NotInUse, aggregate_state([Unknown]));
    }

    #[test]
    fn device_state_parses() {
        assert_eq!(InUse, "inuse".parse::<DeviceState>().unwrap());
        assert_eq!("NotInUse", NotInUse.to_string());
    }

    #[test]
    fn globals_fire_before_hint_watchers() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        hints.apply(added("100", "SIP/100&SIP/101"));
        let (tx, rx) = unbounded();
        let global_tx = tx.clone();
        hints.add_global_watcher(Arc::new(move |c: &StateChange| {
            let _ = global_tx.send(("global", c.state));
        }));
        hints
            .add_hint_watcher(
                "office",
                "100",
                Arc::new(move |c: &StateChange| {
                    let _ = tx.send(("hint", c.state));
                }),
            )
            .unwrap();

        hints.device_state_changed("sip/100", InUse);
        hints.device_state_changed("SIP/101", Ringing);
        let got: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(
            vec![
                ("global", ExtensionState::InUse),
                ("hint", ExtensionState::InUse),
                ("global", ExtensionState::InUseRinging),
                ("hint", ExtensionState::InUseRinging),
            ],
            got
        );
        assert_eq!(
            Some(ExtensionState::InUseRinging),
            hints.hint_state("office", "100")
        );
    }

    #[test]
    fn unchanged_aggregate_is_silent() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        hints.apply(added("100", "SIP/100&SIP/101"));
        let (callback, rx) = recorder();
        hints.add_hint_watcher("office", "100", callback).unwrap();
        hints.device_state_changed("SIP/100", InUse);
        assert_eq!(ExtensionState::InUse, next(&rx).state);
        hints.device_state_changed("SIP/101", NotInUse);
        hints.device_state_changed("SIP/999", Busy);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn removal_deactivates_watchers() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        hints.apply(added("100", "SIP/100"));
        let (callback, rx) = recorder();
        let id = hints.add_hint_watcher("office", "100", callback).unwrap();
        hints.apply(HintChange::Removed {
            context: "office".to_string(),
            exten: "100".to_string(),
        });
        assert_eq!(ExtensionState::Deactivated, next(&rx).state);
        assert!(hints.hints().is_empty());
        assert_eq!(Err(DialplanError::NoSuchWatcher(id)), hints.remove_watcher(id));
    }

    #[test]
    fn watchers_survive_reattach() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        hints.apply(added("100", "SIP/100"));
        hints.apply(added("200", "SIP/200"));
        let (kept, kept_rx) = recorder();
        let (dropped, dropped_rx) = recorder();
        hints.add_hint_watcher("office", "100", kept).unwrap();
        hints.add_hint_watcher("office", "200", dropped).unwrap();

        let keys = vec![
            ("office".to_string(), "100".to_string()),
            ("office".to_string(), "200".to_string()),
        ];
        let detached = hints.detach(&keys);
        assert_eq!(2, detached.len());
        hints.apply(added("100", "SIP/100"));
        hints.reattach(detached);

        assert_eq!(ExtensionState::Removed, next(&dropped_rx).state);
        assert_eq!(1, hints.hints()[0].watchers);
        hints.device_state_changed("SIP/100", Busy);
        assert_eq!(ExtensionState::Busy, next(&kept_rx).state);
    }

    #[test]
    fn missing_hint_and_watcher() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        let (callback, _rx) = recorder();
        assert!(hints.add_hint_watcher("office", "100", callback).is_err());
        assert!(hints.remove_watcher(42).is_err());
    }

    #[derive(Default)]
    struct LockedSource {
        lock: Mutex<()>,
    }

    impl DeviceStateProvider for LockedSource {
        fn query(&self, _device: &str) -> DeviceState {
            let _guard = self.lock.lock();
            NotInUse
        }
    }

    #[test]
    fn source_may_report_while_holding_its_lock() {
        let source = Arc::new(LockedSource::default());
        let hints = Arc::new(HintSubsystem::new(source.clone()));
        hints.apply(added("100", "SIP/100"));

        let guard = source.lock.lock();
        let (done_tx, done_rx) = unbounded();
        let reader = {
            let hints = hints.clone();
            std::thread::spawn(move || {
                let _ = done_tx.send(hints.state_of("SIP/unknown"));
            })
        };
        // the reader is now blocked inside the source
        std::thread::sleep(Duration::from_millis(100));
        hints.device_state_changed("SIP/100", InUse);
        drop(guard);

        assert_eq!(
            ExtensionState::NotInUse,
            done_rx.recv_timeout(Duration::from_secs(2)).unwrap()
        );
        reader.join().unwrap();
        assert_eq!(Some(ExtensionState::InUse), hints.hint_state("office", "100"));
    }

    #[test]
    fn panicking_watcher_does_not_stop_the_batch() {
        let hints = HintSubsystem::new(Arc::new(UnknownDevices));
        hints.apply(added("100", "SIP/100"));
        hints.add_global_watcher(Arc::new(|_: &StateChange| panic!("watcher failed")));
        let (callback, rx) = recorder();
        hints.add_hint_watcher("office", "100", callback).unwrap();

        hints.device_state_changed("SIP/100", InUse);
        assert_eq!(ExtensionState::InUse, next(&rx).state);
        hints.device_state_changed("SIP/100", Busy);
        assert_eq!(ExtensionState::Busy, next(&rx).state);
    }

    #[tokio::test]
    async fn subscription_feeds_state_changes() {
        let hints = Arc::new(HintSubsystem::new(Arc::new(UnknownDevices)));
        hints.apply(added("100", "SIP/100"));
        let (callback, rx) = recorder();
        hints.add_hint_watcher("office", "100", callback).unwrap();
        let (tx, events) = tokio::sync::mpsc::channel(8);
        let feed = hints.subscribe(events);
        tx.send(("SIP/100".to_string(), Ringing)).await.unwrap();
        drop(tx);
        feed.await.unwrap();
        assert_eq!(ExtensionState::Ringing, next(&rx).state);
    }
}
