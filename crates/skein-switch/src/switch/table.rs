//! Variable and port tables owned by a switch

use crate::error::{Result, SwitchError};
use crate::stream::ByteStream;
use crate::var::{Payload, VarId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::Notify;

enum Slot {
    Bound(Payload),
    Taken,
}

/// Single-assignment variable table.
///
/// Binding happens under the mutex and wakes every waiter after the lock is
/// released; waiters register with the `Notify` before checking the table, so
/// a bind can never slip between the check and the sleep.
pub(crate) struct VarTable {
    declared: HashSet<VarId>,
    slots: Mutex<HashMap<VarId, Slot>>,
    changed: Notify,
}

impl VarTable {
    pub(crate) fn new(declared: HashSet<VarId>) -> Self {
        Self {
            declared,
            slots: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub(crate) fn bind(&self, id: VarId, payload: Payload) -> Result<()> {
        if !self.declared.contains(&id) {
            return Err(SwitchError::UnknownVariable(id));
        }
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&id) {
                return Err(SwitchError::AlreadyBound(id));
            }
            slots.insert(id, Slot::Bound(payload));
        }
        self.changed.notify_waiters();
        Ok(())
    }

    pub(crate) fn is_bound(&self, id: VarId) -> bool {
        self.slots.lock().contains_key(&id)
    }

    /// Take every payload in `ids` if all are bound, otherwise leave the
    /// table untouched.
    fn try_take(&self, ids: &[VarId]) -> Result<Option<Vec<Payload>>> {
        let mut slots = self.slots.lock();
        for id in ids {
            if !self.declared.contains(id) {
                return Err(SwitchError::UnknownVariable(*id));
            }
            match slots.get(id) {
                None => return Ok(None),
                Some(Slot::Taken) => return Err(SwitchError::StreamConsumed(*id)),
                Some(Slot::Bound(_)) => {}
            }
        }

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let shared = match slots.get(id) {
                Some(Slot::Bound(payload)) => payload.share(),
                _ => None,
            };
            match shared {
                Some(copy) => out.push(copy),
                None => match slots.insert(*id, Slot::Taken) {
                    Some(Slot::Bound(payload)) => out.push(payload),
                    _ => return Err(SwitchError::StreamConsumed(*id)),
                },
            }
        }
        Ok(Some(out))
    }

    pub(crate) async fn wait(&self, ids: &[VarId]) -> Result<Vec<Payload>> {
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(dup) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(SwitchError::InvalidPlan(format!(
                "{} is requested more than once",
                dup
            )));
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payloads) = self.try_take(ids)? {
                return Ok(payloads);
            }
            notified.await;
        }
    }

    /// Drop every stream that was bound but never taken
    pub(crate) fn close_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut closed = 0;
        for slot in slots.values_mut() {
            if matches!(slot, Slot::Bound(Payload::Stream(_))) {
                *slot = Slot::Taken;
                closed += 1;
            }
        }
        closed
    }
}

/// Direction of a port relative to the switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum PortDir {
    /// Delivered from outside (driver write or network receive)
    Inbound,
    /// Handed to the outside (driver read or network fetch)
    Outbound,
}

enum PortSlot {
    Ready(ByteStream),
    Taken,
}

/// Single-assignment stream hand-off slots between a switch and the world
/// outside it
pub(crate) struct PortTable {
    slots: Mutex<HashMap<(PortDir, VarId), PortSlot>>,
    changed: Notify,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    pub(crate) fn put(&self, dir: PortDir, var: VarId, stream: ByteStream) -> Result<()> {
        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&(dir, var)) {
                return Err(SwitchError::AlreadyBound(var));
            }
            slots.insert((dir, var), PortSlot::Ready(stream));
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn try_take(&self, dir: PortDir, var: VarId) -> Result<Option<ByteStream>> {
        let mut slots = self.slots.lock();
        match slots.get(&(dir, var)) {
            None => Ok(None),
            Some(PortSlot::Taken) => Err(SwitchError::StreamConsumed(var)),
            Some(PortSlot::Ready(_)) => match slots.insert((dir, var), PortSlot::Taken) {
                Some(PortSlot::Ready(stream)) => Ok(Some(stream)),
                _ => Err(SwitchError::StreamConsumed(var)),
            },
        }
    }

    pub(crate) async fn take(&self, dir: PortDir, var: VarId) -> Result<ByteStream> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(stream) = self.try_take(dir, var)? {
                return Ok(stream);
            }
            notified.await;
        }
    }

    pub(crate) fn close_all(&self) -> usize {
        let mut slots = self.slots.lock();
        let mut closed = 0;
        for slot in slots.values_mut() {
            if matches!(slot, PortSlot::Ready(_)) {
                *slot = PortSlot::Taken;
                closed += 1;
            }
        }
        closed
    }
}
