use std::collections::BTreeMap;

use nt_api::{Handle, NtResult, NtStatus};

/// What a handle refers to. Both kinds are named by their id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Object {
    Thread(u32),
    Process(u32),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandleEntry {
    pub object: Object,
    /// Raw access mask, as a `ThreadAccess` or `ProcessAccess` depending on
    /// the object.
    pub access: u32,
}

/// A per-process handle table. Values are multiples of 4 starting at 4 and
/// are not reused while the table lives.
#[derive(Debug)]
pub struct HandleTable {
    next: u64,
    entries: BTreeMap<u64, HandleEntry>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: 4,
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, object: Object, access: u32) -> Handle {
        let value = self.next;
        self.next += 4;
        self.entries.insert(value, HandleEntry { object, access });
        Handle::from_raw(value)
    }

    pub fn get(&self, handle: Handle) -> NtResult<HandleEntry> {
        self.entries
            .get(&handle.to_raw())
            .copied()
            .ok_or(NtStatus::INVALID_HANDLE)
    }

    pub fn remove(&mut self, handle: Handle) -> NtResult<HandleEntry> {
        self.entries
            .remove(&handle.to_raw())
            .ok_or(NtStatus::INVALID_HANDLE)
    }

    /// All entries, in handle order.
    pub fn into_entries(self) -> impl Iterator<Item = HandleEntry> {
        self.entries.into_values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_values() {
        let mut table = HandleTable::new();
        let a = table.insert(Object::Thread(8), 1);
        let b = table.insert(Object::Process(4), 2);
        assert_eq!(a.to_raw(), 4);
        assert_eq!(b.to_raw(), 8);
        assert_eq!(table.get(b).unwrap().object, Object::Process(4));

        table.remove(a).unwrap();
        assert_eq!(table.get(a), Err(NtStatus::INVALID_HANDLE));
        assert_eq!(table.remove(a), Err(NtStatus::INVALID_HANDLE));
        // not reused
        assert_eq!(table.insert(Object::Thread(12), 1).to_raw(), 12);
        assert_eq!(table.len(), 2);
    }
}
