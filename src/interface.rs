//! Interface-data cache with debounced change notifications.
//!
//! The OS layer reports "something changed on interface X"; the record's
//! debounce timer coalesces bursts, re-reads the OS data once it fires and
//! notifies the listener chain only when the snapshot actually differs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::rc::Rc;

use log::{debug, warn};

use crate::sys::ifinfo;
use crate::timer::{Timer, TimerClass, TimerWheel};

/// Debounce interval between an OS change event and the data refresh.
const CHANGE_INTERVAL_MS: u64 = 100;

/// Snapshot of one interface as the OS reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceData {
    pub index: u32,
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_linklocal: Option<Ipv6Addr>,
    pub mac: [u8; 6],
    pub up: bool,
}

/// Change callback: new data, old data.
pub type InterfaceProcess = Rc<dyn Fn(&InterfaceData, &InterfaceData)>;

/// A registered interface listener.
pub struct InterfaceListener {
    /// Interface name; `None` listens to every known interface.
    pub name: Option<String>,
    /// Whether this listener uses the interface for mesh traffic.
    pub mesh: bool,
    pub process: Option<InterfaceProcess>,
}

/// Handle returned by [`Interfaces::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    idx: usize,
}

struct IfRecord {
    data: InterfaceData,
    usage: u32,
    mesh: u32,
    timer: Timer,
    mesh_state: ifinfo::MeshState,
}

struct IfInner {
    records: Vec<Option<IfRecord>>,
    record_free: Vec<usize>,
    by_name: HashMap<String, usize>,
    listeners: Vec<Option<InterfaceListener>>,
    listener_free: Vec<usize>,
    class: TimerClass,
    timers: TimerWheel,
}

/// Shared handle to the interface subsystem.
#[derive(Clone)]
pub struct Interfaces {
    inner: Rc<RefCell<IfInner>>,
}

impl Interfaces {
    pub fn new(timers: &TimerWheel) -> Interfaces {
        let inner = Rc::new(RefCell::new(IfInner {
            records: Vec::new(),
            record_free: Vec::new(),
            by_name: HashMap::new(),
            listeners: Vec::new(),
            listener_free: Vec::new(),
            class: TimerClass::PLACEHOLDER,
            timers: timers.clone(),
        }));
        let interfaces = Interfaces { inner };

        let class = {
            let weak = Rc::downgrade(&interfaces.inner);
            timers.add_class(
                "interface change",
                false,
                Rc::new(move |_, record| {
                    if let Some(inner) = weak.upgrade() {
                        Interfaces { inner }.change_fired(record);
                    }
                }),
            )
        };
        interfaces.inner.borrow_mut().class = class;
        interfaces
    }

    /// Register a listener. For a named listener the interface record is
    /// created on demand; the first mesh user triggers the OS mesh setup.
    pub fn add_listener(&self, listener: InterfaceListener) -> ListenerHandle {
        if let Some(name) = listener.name.clone() {
            self.acquire_record(&name, listener.mesh);
        }

        let mut inner = self.inner.borrow_mut();
        let idx = match inner.listener_free.pop() {
            Some(idx) => {
                inner.listeners[idx] = Some(listener);
                idx
            }
            None => {
                inner.listeners.push(Some(listener));
                inner.listeners.len() - 1
            }
        };
        ListenerHandle { idx }
    }

    /// Remove a listener; idempotent. The record is dropped when its last
    /// user goes away.
    pub fn remove_listener(&self, handle: ListenerHandle) {
        let listener = {
            let mut inner = self.inner.borrow_mut();
            let listener = inner.listeners.get_mut(handle.idx).and_then(Option::take);
            if listener.is_some() {
                inner.listener_free.push(handle.idx);
            }
            listener
        };
        let Some(listener) = listener else {
            return;
        };
        if let Some(name) = &listener.name {
            self.release_record(name, listener.mesh);
        }
    }

    /// Snapshot of a known interface.
    pub fn get_data(&self, name: &str) -> Option<InterfaceData> {
        let inner = self.inner.borrow();
        let id = *inner.by_name.get(&name.to_ascii_lowercase())?;
        inner.records[id].as_ref().map(|r| r.data.clone())
    }

    /// Called by the OS layer on a potential interface change; debounced.
    pub fn trigger_change(&self, name: &str) {
        let inner = self.inner.borrow();
        let Some(&id) = inner.by_name.get(&name.to_ascii_lowercase()) else {
            return;
        };
        let Some(record) = inner.records[id].as_ref() else {
            return;
        };
        debug!("interface {} triggered change", name);
        inner.timers.set(record.timer, CHANGE_INTERVAL_MS);
    }

    /// Drop all records, restoring mesh settings.
    pub fn close(&self) {
        let names: Vec<String> = self.inner.borrow().by_name.keys().cloned().collect();
        for name in names {
            // Force the refcounts down.
            loop {
                let inner = self.inner.borrow();
                let Some(&id) = inner.by_name.get(&name) else {
                    break;
                };
                let mesh = inner.records[id].as_ref().map_or(0, |r| r.mesh) > 0;
                drop(inner);
                self.release_record(&name, mesh);
            }
        }
        let inner = self.inner.borrow();
        let timers = inner.timers.clone();
        let class = inner.class;
        drop(inner);
        timers.remove_class(class);
    }

    fn acquire_record(&self, name: &str, mesh: bool) {
        let key = name.to_ascii_lowercase();
        let mut inner = self.inner.borrow_mut();

        let id = match inner.by_name.get(&key) {
            Some(&id) => id,
            None => {
                let data = ifinfo::read_interface_data(name).unwrap_or_else(|err| {
                    warn!("cannot read interface data of {}: {}", name, err);
                    InterfaceData {
                        name: name.to_string(),
                        ..InterfaceData::default()
                    }
                });
                let id = match inner.record_free.pop() {
                    Some(id) => id,
                    None => {
                        inner.records.push(None);
                        inner.records.len() - 1
                    }
                };
                let timer = inner.timers.create(inner.class, 0, id);
                inner.records[id] = Some(IfRecord {
                    data,
                    usage: 0,
                    mesh: 0,
                    timer,
                    mesh_state: ifinfo::MeshState::default(),
                });
                inner.by_name.insert(key, id);
                id
            }
        };

        let record = inner.records[id].as_mut().expect("live interface record");
        record.usage += 1;
        let needs_mesh_init = mesh && {
            record.mesh += 1;
            record.mesh == 1
        };
        let timer = record.timer;
        if needs_mesh_init {
            record.mesh_state = ifinfo::init_mesh_if(name);
        }
        // Refresh the data shortly after a new user appears.
        inner.timers.set(timer, CHANGE_INTERVAL_MS);
    }

    fn release_record(&self, name: &str, mesh: bool) {
        let key = name.to_ascii_lowercase();
        let mut inner = self.inner.borrow_mut();
        let Some(&id) = inner.by_name.get(&key) else {
            return;
        };
        let Some(record) = inner.records[id].as_mut() else {
            return;
        };

        record.usage = record.usage.saturating_sub(1);
        let mut mesh_cleanup = None;
        if mesh {
            record.mesh = record.mesh.saturating_sub(1);
            if record.mesh == 0 {
                mesh_cleanup = Some(record.mesh_state);
                record.mesh_state = ifinfo::MeshState::default();
            }
        }
        let drop_record = record.usage == 0;
        let timer = record.timer;

        if drop_record {
            inner.timers.destroy(timer);
            inner.records[id] = None;
            inner.record_free.push(id);
            inner.by_name.remove(&key);
        }
        drop(inner);

        if let Some(state) = mesh_cleanup {
            ifinfo::cleanup_mesh_if(name, state);
        }
    }

    fn change_fired(&self, id: usize) {
        let (name, timer, old) = {
            let inner = self.inner.borrow();
            let Some(record) = inner.records.get(id).and_then(Option::as_ref) else {
                return;
            };
            (record.data.name.clone(), record.timer, record.data.clone())
        };

        let new = match ifinfo::read_interface_data(&name) {
            Ok(new) => new,
            Err(err) => {
                // Try again shortly.
                debug!("interface refresh of {} failed: {}", name, err);
                let inner = self.inner.borrow();
                inner.timers.set(timer, CHANGE_INTERVAL_MS);
                return;
            }
        };

        if new == old {
            return;
        }
        debug!("interface {} changed", name);

        {
            let mut inner = self.inner.borrow_mut();
            if let Some(record) = inner.records.get_mut(id).and_then(Option::as_mut) {
                record.data = new.clone();
            }
        }

        let callbacks: Vec<InterfaceProcess> = {
            let inner = self.inner.borrow();
            inner
                .listeners
                .iter()
                .flatten()
                .filter(|listener| {
                    listener
                        .name
                        .as_ref()
                        .map_or(true, |n| n.eq_ignore_ascii_case(&name))
                })
                .filter_map(|listener| listener.process.clone())
                .collect()
        };
        for process in callbacks {
            process(&new, &old);
        }
    }
}

impl std::fmt::Debug for Interfaces {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Interfaces")
            .field("records", &inner.by_name.len())
            .field("listeners", &inner.listeners.iter().flatten().count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    fn wheel() -> TimerWheel {
        TimerWheel::new(Clock::new().unwrap())
    }

    #[test]
    fn records_are_refcounted() {
        let timers = wheel();
        let interfaces = Interfaces::new(&timers);

        let a = interfaces.add_listener(InterfaceListener {
            name: Some("mesh0".to_string()),
            mesh: false,
            process: None,
        });
        let b = interfaces.add_listener(InterfaceListener {
            name: Some("MESH0".to_string()),
            mesh: false,
            process: None,
        });

        assert!(interfaces.get_data("mesh0").is_some());

        interfaces.remove_listener(a);
        assert!(interfaces.get_data("mesh0").is_some());

        interfaces.remove_listener(b);
        assert!(interfaces.get_data("mesh0").is_none());

        // Removing twice is a no-op.
        interfaces.remove_listener(b);
    }

    #[test]
    fn unknown_interface_change_is_ignored() {
        let timers = wheel();
        let interfaces = Interfaces::new(&timers);
        interfaces.trigger_change("does-not-exist");
    }

    #[test]
    fn listener_for_all_interfaces() {
        let timers = wheel();
        let interfaces = Interfaces::new(&timers);
        let handle = interfaces.add_listener(InterfaceListener {
            name: None,
            mesh: false,
            process: Some(Rc::new(|_, _| {})),
        });
        interfaces.remove_listener(handle);
    }
}
