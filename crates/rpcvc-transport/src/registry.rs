//! Fixed-capacity table mapping small integer descriptors to live objects.
//!
//! Descriptors start at [`FD_BASE`] so they never collide with the host's
//! standard streams. Allocation scans forward from the slot after the last
//! one handed out and wraps once, which keeps freshly released descriptors
//! from being reused immediately.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{Result, TransportError};
pub use crate::fd::Fd;
use crate::pipe::Pipe;
use crate::socket::Socket;

/// First descriptor number handed out.
pub const FD_BASE: i32 = 32;

/// Default number of slots.
pub const FD_CAPACITY: usize = 512;

/// The object a descriptor resolves to.
#[derive(Clone)]
pub enum Resource {
    Socket(Arc<Socket>),
    Pipe(Arc<Pipe>),
}

impl Resource {
    /// Identity comparison.
    pub fn same(&self, other: &Resource) -> bool {
        match (self, other) {
            (Resource::Socket(a), Resource::Socket(b)) => Arc::ptr_eq(a, b),
            (Resource::Pipe(a), Resource::Pipe(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Socket(_) => "socket",
            Resource::Pipe(_) => "pipe",
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

struct Table {
    slots: Vec<Option<Resource>>,
    next: usize,
}

impl Table {
    fn find_free(&self) -> Option<usize> {
        let cap = self.slots.len();
        (self.next..cap)
            .chain(0..self.next.min(cap))
            .find(|&i| self.slots[i].is_none())
    }

    fn place(&mut self, res: Resource) -> Option<usize> {
        let idx = self.find_free()?;
        self.slots[idx] = Some(res);
        self.next = idx + 1;
        Some(idx)
    }
}

/// The descriptor table.
pub struct Registry {
    table: Mutex<Table>,
    capacity: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::with_capacity(FD_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: Mutex::new(Table {
                slots: vec![None; capacity],
                next: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One past the highest descriptor this table can produce.
    pub fn max_fd(&self) -> i32 {
        FD_BASE + self.capacity as i32
    }

    fn index(&self, fd: Fd) -> Option<usize> {
        let idx = fd.raw().checked_sub(FD_BASE)?;
        usize::try_from(idx).ok().filter(|&i| i < self.capacity)
    }

    fn to_fd(idx: usize) -> Fd {
        Fd::from_raw(FD_BASE + idx as i32)
    }

    /// Place an object in the first free slot at or after the cursor.
    pub fn assign(&self, res: Resource) -> Result<Fd> {
        let mut table = self.table.lock();
        let kind = res.kind();
        let idx = table.place(res).ok_or(TransportError::Exhausted {
            capacity: self.capacity,
        })?;
        let fd = Self::to_fd(idx);
        trace!(%fd, kind, "descriptor assigned");
        Ok(fd)
    }

    /// Free `fd` if it still holds `res`.
    ///
    /// A mismatch leaves the slot untouched and returns `false`.
    pub fn release(&self, fd: Fd, res: &Resource) -> bool {
        let Some(idx) = self.index(fd) else {
            error!(%fd, "release of descriptor outside the table");
            return false;
        };
        let mut table = self.table.lock();
        let matches = matches!(&table.slots[idx], Some(current) if current.same(res));
        if !matches {
            error!(%fd, occupant = ?table.slots[idx], releasing = ?res, "release does not match slot occupant");
            return false;
        }
        if let Some(Resource::Socket(sock)) = table.slots[idx].take() {
            sock.teardown();
        }
        trace!(%fd, "descriptor released");
        true
    }

    pub fn lookup(&self, fd: Fd) -> Option<Resource> {
        let idx = self.index(fd)?;
        self.table.lock().slots[idx].clone()
    }

    pub fn lookup_socket(&self, fd: Fd) -> Option<Arc<Socket>> {
        match self.lookup(fd)? {
            Resource::Socket(sock) => Some(sock),
            Resource::Pipe(_) => None,
        }
    }

    pub fn lookup_pipe(&self, fd: Fd) -> Option<Arc<Pipe>> {
        match self.lookup(fd)? {
            Resource::Pipe(pipe) => Some(pipe),
            Resource::Socket(_) => None,
        }
    }

    /// Move `listener` to a new descriptor and install `replacement` in its
    /// old slot, atomically.
    pub fn split(&self, fd: Fd, listener: &Arc<Pipe>, replacement: Arc<Pipe>) -> Result<Fd> {
        let idx = self.index(fd).ok_or(TransportError::BadHandle(fd))?;
        let mut table = self.table.lock();
        match &table.slots[idx] {
            Some(Resource::Pipe(current)) if Arc::ptr_eq(current, listener) => {}
            _ => return Err(TransportError::BadHandle(fd)),
        }
        let new_idx = table
            .place(Resource::Pipe(Arc::clone(listener)))
            .ok_or(TransportError::Exhausted {
                capacity: self.capacity,
            })?;
        table.slots[idx] = Some(Resource::Pipe(replacement));
        let new_fd = Self::to_fd(new_idx);
        trace!(listening = %fd, connected = %new_fd, "pipe descriptor split");
        Ok(new_fd)
    }

    /// Number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.table.lock().slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("capacity", &self.capacity)
            .field("occupied", &self.occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> Resource {
        Resource::Pipe(Arc::new(Pipe::unbound()))
    }

    #[test]
    fn first_descriptor_is_base() {
        let reg = Registry::new();
        assert_eq!(reg.assign(pipe()).unwrap(), Fd::from_raw(FD_BASE));
        assert_eq!(reg.max_fd(), FD_BASE + FD_CAPACITY as i32);
    }

    #[test]
    fn allocation_is_monotonic_until_wrap() {
        let reg = Registry::with_capacity(4);
        let a = pipe();
        let fa = reg.assign(a.clone()).unwrap();
        let fb = reg.assign(pipe()).unwrap();
        assert!(reg.release(fa, &a));
        // The freed slot is behind the cursor and is not reused yet.
        let fc = reg.assign(pipe()).unwrap();
        assert_eq!(fc.raw(), fb.raw() + 1);
        let fd = reg.assign(pipe()).unwrap();
        assert_eq!(fd.raw(), fc.raw() + 1);
        // Now the cursor wraps.
        assert_eq!(reg.assign(pipe()).unwrap(), fa);
    }

    #[test]
    fn full_table_is_exhausted() {
        let reg = Registry::with_capacity(2);
        reg.assign(pipe()).unwrap();
        reg.assign(pipe()).unwrap();
        let err = reg.assign(pipe()).unwrap_err();
        assert!(matches!(err, TransportError::Exhausted { capacity: 2 }));
        assert!(err.is_exhaustion());
    }

    #[test]
    fn release_requires_matching_occupant() {
        let reg = Registry::new();
        let a = pipe();
        let fd = reg.assign(a.clone()).unwrap();
        assert!(!reg.release(fd, &pipe()));
        assert!(reg.lookup(fd).is_some());
        assert!(reg.release(fd, &a));
        assert!(reg.lookup(fd).is_none());
        assert!(!reg.release(fd, &a));
    }

    #[test]
    fn out_of_range_descriptors_do_not_resolve() {
        let reg = Registry::with_capacity(8);
        assert!(reg.lookup(Fd::from_raw(0)).is_none());
        assert!(reg.lookup(Fd::from_raw(FD_BASE - 1)).is_none());
        assert!(reg.lookup(Fd::from_raw(FD_BASE + 8)).is_none());
        assert!(!reg.release(Fd::from_raw(-1), &pipe()));
    }

    #[test]
    fn split_moves_listener_and_installs_replacement() {
        let reg = Registry::new();
        let listener = Arc::new(Pipe::unbound());
        let fd = reg.assign(Resource::Pipe(Arc::clone(&listener))).unwrap();
        let replacement = Arc::new(Pipe::unbound());

        let new_fd = reg.split(fd, &listener, Arc::clone(&replacement)).unwrap();
        assert_ne!(new_fd, fd);
        assert!(Arc::ptr_eq(&reg.lookup_pipe(new_fd).unwrap(), &listener));
        assert!(Arc::ptr_eq(&reg.lookup_pipe(fd).unwrap(), &replacement));
        assert_eq!(reg.occupied(), 2);
    }

    #[test]
    fn split_on_full_table_leaves_slot_untouched() {
        let reg = Registry::with_capacity(1);
        let listener = Arc::new(Pipe::unbound());
        let fd = reg.assign(Resource::Pipe(Arc::clone(&listener))).unwrap();
        let err = reg.split(fd, &listener, Arc::new(Pipe::unbound())).unwrap_err();
        assert!(err.is_exhaustion());
        assert!(Arc::ptr_eq(&reg.lookup_pipe(fd).unwrap(), &listener));
    }
}
