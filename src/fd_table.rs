//! Guest file-descriptor table.
//!
//! Every open guest descriptor maps to a host descriptor; the table keeps
//! the two indices in agreement and remembers enough (kind, path, guest open
//! flags) to service `dup`, `fcntl64`, virtual-file cleanup and the trace.
//! Guest fds 0/1/2 are installed at creation, map to the host standard
//! streams, and survive a guest `close`.

use crate::log::LogLevel::LogDebug;
use std::cell::RefCell;
use std::rc::Rc;

pub type FdTableSharedPtr = Rc<RefCell<FdTable>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FdKind {
    /// stdin/stdout/stderr; never closed on the host.
    Std,
    Regular,
    /// Emulator-generated file backed by a host temp file that is unlinked
    /// when the guest closes it (e.g. a `/proc/self/maps` snapshot).
    Virtual,
    Pipe,
    Socket,
}

#[derive(Clone, Debug)]
pub struct FileDesc {
    pub guest_fd: i32,
    pub host_fd: i32,
    pub kind: FdKind,
    /// Empty for pipes and sockets.
    pub path: String,
    /// Open flags, guest encoding.
    pub flags: i32,
}

pub struct FdTable {
    entries: Vec<Option<FileDesc>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut table = FdTable {
            entries: Vec::new(),
        };
        for fd in 0..3 {
            table.entries.push(Some(FileDesc {
                guest_fd: fd,
                host_fd: fd,
                kind: FdKind::Std,
                path: String::new(),
                flags: 0,
            }));
        }
        table
    }

    pub fn shared(self) -> FdTableSharedPtr {
        Rc::new(RefCell::new(self))
    }

    /// Allocate the lowest free guest fd for a new entry.
    pub fn new_entry(&mut self, kind: FdKind, host_fd: i32, path: &str, flags: i32) -> &FileDesc {
        let guest_fd = match self.entries.iter().position(|e| e.is_none()) {
            Some(free) => free,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };
        self.entries[guest_fd] = Some(FileDesc {
            guest_fd: guest_fd as i32,
            host_fd,
            kind,
            path: path.to_string(),
            flags,
        });
        self.entries[guest_fd].as_ref().unwrap()
    }

    pub fn entry_get(&self, guest_fd: i32) -> Option<&FileDesc> {
        if guest_fd < 0 {
            return None;
        }
        self.entries.get(guest_fd as usize)?.as_ref()
    }

    pub fn entry_get_mut(&mut self, guest_fd: i32) -> Option<&mut FileDesc> {
        if guest_fd < 0 {
            return None;
        }
        self.entries.get_mut(guest_fd as usize)?.as_mut()
    }

    /// Remove an entry. A `Virtual` entry's backing host file is deleted
    /// here; the host fd itself is the caller's business (the `close`
    /// handler never closes host fds 0..2).
    pub fn entry_free(&mut self, guest_fd: i32) -> Option<FileDesc> {
        if guest_fd < 0 || guest_fd as usize >= self.entries.len() {
            return None;
        }
        let entry = self.entries[guest_fd as usize].take()?;
        if entry.kind == FdKind::Virtual {
            log!(
                LogDebug,
                "virtual file '{}' deleted with guest fd {}",
                entry.path,
                guest_fd
            );
            let _ = std::fs::remove_file(&entry.path);
        }
        Some(entry)
    }

    pub fn host_fd_of(&self, guest_fd: i32) -> Option<i32> {
        self.entry_get(guest_fd).map(|e| e.host_fd)
    }

    pub fn guest_fd_of(&self, host_fd: i32) -> Option<i32> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.host_fd == host_fd)
            .map(|e| e.guest_fd)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy for a no-`CLONE_FILES` clone. Host descriptors other than the
    /// standard streams are `dup`ed so that either table can close its
    /// entries without pulling descriptors out from under the other.
    pub fn duplicate(&self) -> FdTable {
        let mut entries = Vec::with_capacity(self.entries.len());
        for slot in &self.entries {
            entries.push(slot.as_ref().map(|e| {
                let host_fd = if e.host_fd > 2 {
                    unsafe { libc::dup(e.host_fd) }
                } else {
                    e.host_fd
                };
                FileDesc {
                    host_fd,
                    ..e.clone()
                }
            }));
        }
        FdTable { entries }
    }
}

impl Default for FdTable {
    fn default() -> FdTable {
        FdTable::new()
    }
}
