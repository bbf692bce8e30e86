//! Purpose: Port storage abstraction plus the shared in-memory table and `MemoryStore`.
//! Exports: `PortStore`, `MemoryStore`.
//! Role: Write target of the bulk consumer and backing store of the HTTP gateway.
//! Invariants: Slugs are unique and non-empty; ids are assigned once and never reused.
//! Invariants: Upserts key on slug and keep the existing id.
//! Invariants: `bulk_upsert` validates the whole batch before applying any of it.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::error::{Error, ErrorKind};
use super::port::{Port, PortId, PortPatch};

pub trait PortStore: Send + Sync {
    /// All ports ordered by id.
    fn list(&self) -> Result<Vec<Port>, Error>;
    fn fetch(&self, id: &PortId) -> Result<Port, Error>;
    /// Inserts a new port; fails with `AlreadyExists` when the slug is taken.
    fn create(&self, port: Port) -> Result<Port, Error>;
    fn upsert(&self, port: Port) -> Result<Port, Error>;
    /// Upserts every port in one step; returns how many were written.
    fn bulk_upsert(&self, ports: Vec<Port>) -> Result<usize, Error>;
    fn update(&self, id: &PortId, patch: PortPatch) -> Result<Port, Error>;
    fn delete(&self, id: &PortId) -> Result<Port, Error>;
}

/// Id- and slug-indexed port table shared by the store implementations.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "TableSnapshot", into = "TableSnapshot")]
pub(crate) struct PortTable {
    by_id: BTreeMap<i64, Port>,
    by_slug: HashMap<String, i64>,
    next_id: i64,
}

#[derive(Serialize, Deserialize)]
struct TableSnapshot {
    next_id: i64,
    ports: Vec<Port>,
}

impl From<TableSnapshot> for PortTable {
    fn from(snapshot: TableSnapshot) -> Self {
        let mut table = PortTable {
            next_id: snapshot.next_id,
            ..PortTable::default()
        };
        for port in snapshot.ports {
            table.next_id = table.next_id.max(port.id);
            table.by_slug.insert(port.slug.clone(), port.id);
            table.by_id.insert(port.id, port);
        }
        table
    }
}

impl From<PortTable> for TableSnapshot {
    fn from(table: PortTable) -> Self {
        TableSnapshot {
            next_id: table.next_id,
            ports: table.by_id.into_values().collect(),
        }
    }
}

impl PortTable {
    pub(crate) fn list(&self) -> Vec<Port> {
        self.by_id.values().cloned().collect()
    }

    fn resolve(&self, id: &PortId) -> Result<i64, Error> {
        let found = match id {
            PortId::Id(id) => self.by_id.contains_key(id).then_some(*id),
            PortId::Slug(slug) => self.by_slug.get(slug).copied(),
        };
        found.ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message(format!("port not found: {id}"))
                .with_hint("Use `portload list` to see stored ports.")
        })
    }

    pub(crate) fn fetch(&self, id: &PortId) -> Result<Port, Error> {
        let id = self.resolve(id)?;
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("port index out of sync"))
    }

    pub(crate) fn create(&mut self, port: Port) -> Result<Port, Error> {
        check_slug(&port)?;
        if self.by_slug.contains_key(&port.slug) {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("port already exists: {}", port.slug))
                .with_hint("Use PUT to update an existing port."));
        }
        Ok(self.insert_new(port))
    }

    pub(crate) fn upsert(&mut self, port: Port) -> Result<Port, Error> {
        check_slug(&port)?;
        Ok(self.apply_upsert(port))
    }

    pub(crate) fn bulk_upsert(&mut self, ports: Vec<Port>) -> Result<usize, Error> {
        for port in &ports {
            check_slug(port)?;
        }
        let count = ports.len();
        for port in ports {
            self.apply_upsert(port);
        }
        Ok(count)
    }

    pub(crate) fn update(&mut self, id: &PortId, patch: PortPatch) -> Result<Port, Error> {
        let id = self.resolve(id)?;
        let port = self
            .by_id
            .get_mut(&id)
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("port index out of sync"))?;
        patch.apply(port);
        Ok(port.clone())
    }

    pub(crate) fn delete(&mut self, id: &PortId) -> Result<Port, Error> {
        let id = self.resolve(id)?;
        let port = self
            .by_id
            .remove(&id)
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("port index out of sync"))?;
        self.by_slug.remove(&port.slug);
        Ok(port)
    }

    fn apply_upsert(&mut self, port: Port) -> Port {
        match self.by_slug.get(&port.slug).and_then(|id| self.by_id.get_mut(id)) {
            Some(existing) => {
                existing.overwrite_from(port);
                existing.clone()
            }
            None => self.insert_new(port),
        }
    }

    fn insert_new(&mut self, mut port: Port) -> Port {
        self.next_id += 1;
        port.id = self.next_id;
        self.by_slug.insert(port.slug.clone(), port.id);
        self.by_id.insert(port.id, port.clone());
        port
    }
}

fn check_slug(port: &Port) -> Result<(), Error> {
    if port.slug.trim().is_empty() {
        return Err(Error::new(ErrorKind::Invalid).with_message("port slug must not be empty"));
    }
    Ok(())
}

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<PortTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, PortTable>, Error> {
        self.table
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("port table lock poisoned"))
    }
}

impl PortStore for MemoryStore {
    fn list(&self) -> Result<Vec<Port>, Error> {
        Ok(self.lock()?.list())
    }

    fn fetch(&self, id: &PortId) -> Result<Port, Error> {
        self.lock()?.fetch(id)
    }

    fn create(&self, port: Port) -> Result<Port, Error> {
        self.lock()?.create(port)
    }

    fn upsert(&self, port: Port) -> Result<Port, Error> {
        self.lock()?.upsert(port)
    }

    fn bulk_upsert(&self, ports: Vec<Port>) -> Result<usize, Error> {
        self.lock()?.bulk_upsert(ports)
    }

    fn update(&self, id: &PortId, patch: PortPatch) -> Result<Port, Error> {
        self.lock()?.update(id, patch)
    }

    fn delete(&self, id: &PortId) -> Result<Port, Error> {
        self.lock()?.delete(id)
    }
}
