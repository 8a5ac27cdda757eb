//! In-process named pipe host.
//!
//! Instances live in a namespace owned by the host value; every
//! descriptor table that shares the host sees the same pipe names.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::pipe::{Completion, NativePipe, OpenError, PipeHost, WriteFault};
use super::{Event, PIPE_PREFIX};

const ERROR_INVALID_PARAMETER: i32 = 87;
const ERROR_PIPE_NOT_CONNECTED: i32 = 233;

/// Named pipe host backed by in-memory message queues.
#[derive(Debug, Clone, Default)]
pub struct LocalPipeHost {
    ns: Arc<Namespace>,
}

impl LocalPipeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live server instances registered under `name`.
    pub fn instances(&self, name: &str) -> usize {
        self.ns.names.lock().get(name).map_or(0, Vec::len)
    }
}

#[derive(Debug, Default)]
struct Namespace {
    names: Mutex<HashMap<String, Vec<Arc<Instance>>>>,
    available: Condvar,
}

#[derive(Debug)]
struct Instance {
    name: String,
    state: Mutex<InstanceState>,
}

#[derive(Debug, Default)]
struct InstanceState {
    client_pid: Option<u32>,
    server_open: bool,
    client_open: bool,
    accept_waiter: Option<Arc<Event>>,
    to_server: Channel,
    to_client: Channel,
}

impl InstanceState {
    fn inbound(&mut self, side: Side) -> &mut Channel {
        match side {
            Side::Server => &mut self.to_server,
            Side::Client => &mut self.to_client,
        }
    }

    fn outbound(&mut self, side: Side) -> &mut Channel {
        match side {
            Side::Server => &mut self.to_client,
            Side::Client => &mut self.to_server,
        }
    }

    fn peer_gone(&self, side: Side) -> bool {
        match side {
            Side::Server => self.client_pid.is_some() && !self.client_open,
            Side::Client => !self.server_open,
        }
    }
}

#[derive(Debug, Default)]
struct Channel {
    messages: VecDeque<Vec<u8>>,
    reader: Option<Arc<Event>>,
}

impl Channel {
    /// Move the front message into `buf`, keeping any remainder queued.
    fn take_into(&mut self, buf: &mut [u8]) -> Option<Completion> {
        let msg = self.messages.pop_front()?;
        if msg.len() <= buf.len() {
            buf[..msg.len()].copy_from_slice(&msg);
            return Some(Completion::Done(msg.len()));
        }
        buf.copy_from_slice(&msg[..buf.len()]);
        self.messages.push_front(msg[buf.len()..].to_vec());
        Some(Completion::MoreData(buf.len()))
    }

    fn wake(&self) {
        if let Some(ev) = &self.reader {
            ev.set();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

#[derive(Debug)]
enum Op {
    Accept(Arc<Event>),
    Read(Arc<Event>),
}

struct LocalPipeEnd {
    ns: Arc<Namespace>,
    inst: Arc<Instance>,
    side: Side,
    op: Option<Op>,
}

impl NativePipe for LocalPipeEnd {
    fn start_accept(&mut self, event: &Arc<Event>) -> Completion {
        if self.side != Side::Server {
            return Completion::Failed(ERROR_INVALID_PARAMETER);
        }
        let mut st = self.inst.state.lock();
        if st.client_pid.is_some() {
            return Completion::Connected;
        }
        event.reset();
        st.accept_waiter = Some(Arc::clone(event));
        self.op = Some(Op::Accept(Arc::clone(event)));
        Completion::Pending
    }

    fn start_read(&mut self, buf: &mut [u8], event: &Arc<Event>) -> Completion {
        let side = self.side;
        let mut st = self.inst.state.lock();
        if let Some(done) = st.inbound(side).take_into(buf) {
            return done;
        }
        if st.peer_gone(side) {
            return Completion::Closed;
        }
        event.reset();
        st.inbound(side).reader = Some(Arc::clone(event));
        self.op = Some(Op::Read(Arc::clone(event)));
        Completion::Pending
    }

    fn overlapped_result(&mut self, buf: &mut [u8], wait: bool) -> Completion {
        let side = self.side;
        let (accepting, event) = match &self.op {
            None => return Completion::Failed(ERROR_INVALID_PARAMETER),
            Some(Op::Accept(ev)) => (true, Arc::clone(ev)),
            Some(Op::Read(ev)) => (false, Arc::clone(ev)),
        };
        loop {
            {
                let mut st = self.inst.state.lock();
                if accepting {
                    if st.client_pid.is_some() {
                        st.accept_waiter = None;
                        self.op = None;
                        return Completion::Done(0);
                    }
                } else {
                    let chan = st.inbound(side);
                    if let Some(done) = chan.take_into(buf) {
                        chan.reader = None;
                        self.op = None;
                        return done;
                    }
                    if st.peer_gone(side) {
                        st.inbound(side).reader = None;
                        self.op = None;
                        return Completion::Closed;
                    }
                }
            }
            if !wait {
                return Completion::Pending;
            }
            if event.wait(-1).is_err() {
                return Completion::Failed(ERROR_INVALID_PARAMETER);
            }
            // The event stays set until the next operation resets it; clear it
            // here so the retry below does not spin.
            event.reset();
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, WriteFault> {
        let side = self.side;
        let mut st = self.inst.state.lock();
        if st.peer_gone(side) {
            return Err(WriteFault::Broken);
        }
        if side == Side::Server && st.client_pid.is_none() {
            return Err(WriteFault::Other(ERROR_PIPE_NOT_CONNECTED));
        }
        let chan = st.outbound(side);
        chan.messages.push_back(buf.to_vec());
        chan.wake();
        Ok(buf.len())
    }

    fn client_process_id(&self) -> Option<u32> {
        match self.side {
            Side::Server => self.inst.state.lock().client_pid,
            Side::Client => None,
        }
    }
}

impl Drop for LocalPipeEnd {
    fn drop(&mut self) {
        if self.side == Side::Server {
            let mut names = self.ns.names.lock();
            if let Some(list) = names.get_mut(&self.inst.name) {
                list.retain(|i| !Arc::ptr_eq(i, &self.inst));
                if list.is_empty() {
                    names.remove(&self.inst.name);
                }
            }
        }
        let side = self.side;
        let mut st = self.inst.state.lock();
        match side {
            Side::Server => st.server_open = false,
            Side::Client => st.client_open = false,
        }
        st.inbound(side).reader = None;
        if side == Side::Server {
            st.accept_waiter = None;
        }
        st.outbound(side).wake();
        trace!(pipe = %self.inst.name, ?side, "pipe end closed");
    }
}

impl PipeHost for LocalPipeHost {
    fn create_instance(&self, name: &str) -> Result<Box<dyn NativePipe>, i32> {
        if !name.starts_with(PIPE_PREFIX) {
            return Err(ERROR_INVALID_PARAMETER);
        }
        let inst = Arc::new(Instance {
            name: name.to_string(),
            state: Mutex::new(InstanceState {
                server_open: true,
                ..InstanceState::default()
            }),
        });
        self.ns
            .names
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(Arc::clone(&inst));
        self.ns.available.notify_all();
        Ok(Box::new(LocalPipeEnd {
            ns: Arc::clone(&self.ns),
            inst,
            side: Side::Server,
            op: None,
        }))
    }

    fn open(&self, name: &str) -> Result<Box<dyn NativePipe>, OpenError> {
        let names = self.ns.names.lock();
        let list = names.get(name).ok_or(OpenError::NotFound)?;
        for inst in list {
            let mut st = inst.state.lock();
            if st.client_pid.is_some() || !st.server_open {
                continue;
            }
            st.client_pid = Some(std::process::id());
            st.client_open = true;
            if let Some(ev) = st.accept_waiter.take() {
                ev.set();
            }
            return Ok(Box::new(LocalPipeEnd {
                ns: Arc::clone(&self.ns),
                inst: Arc::clone(inst),
                side: Side::Client,
                op: None,
            }));
        }
        Err(OpenError::Busy)
    }

    fn wait_available(&self, name: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut names = self.ns.names.lock();
        loop {
            let Some(list) = names.get(name) else {
                return false;
            };
            let free = list.iter().any(|inst| {
                let st = inst.state.lock();
                st.server_open && st.client_pid.is_none()
            });
            if free {
                return true;
            }
            if self.ns.available.wait_until(&mut names, deadline).timed_out() {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: &str = r"\\.\pipe\local-test";

    fn event() -> Arc<Event> {
        Arc::new(Event::new().unwrap())
    }

    #[test]
    fn accept_completes_when_client_opens() {
        let host = LocalPipeHost::new();
        let mut server = host.create_instance(NAME).unwrap();
        let ev = event();
        assert_eq!(server.start_accept(&ev), Completion::Pending);
        assert!(!ev.is_set());

        let _client = host.open(NAME).unwrap();
        assert!(ev.is_set());
        assert_eq!(server.overlapped_result(&mut [], false), Completion::Done(0));
        assert_eq!(server.client_process_id(), Some(std::process::id()));
    }

    #[test]
    fn second_client_sees_busy_then_not_found() {
        let host = LocalPipeHost::new();
        let _server = host.create_instance(NAME).unwrap();
        let _client = host.open(NAME).unwrap();
        assert_eq!(host.open(NAME).err(), Some(OpenError::Busy));
        assert!(!host.wait_available(NAME, Duration::from_millis(10)));
        assert_eq!(host.open(r"\\.\pipe\missing").err(), Some(OpenError::NotFound));
    }

    #[test]
    fn messages_keep_boundaries_and_split_on_small_buffer() {
        let host = LocalPipeHost::new();
        let mut server = host.create_instance(NAME).unwrap();
        let mut client = host.open(NAME).unwrap();

        client.write(b"hello").unwrap();
        client.write(b"world!").unwrap();

        let ev = event();
        let mut buf = [0u8; 4];
        assert_eq!(server.start_read(&mut buf, &ev), Completion::MoreData(4));
        assert_eq!(&buf, b"hell");
        assert_eq!(server.start_read(&mut buf, &ev), Completion::Done(1));
        assert_eq!(buf[0], b'o');
        let mut big = [0u8; 16];
        assert_eq!(server.start_read(&mut big, &ev), Completion::Done(6));
        assert_eq!(&big[..6], b"world!");
    }

    #[test]
    fn pending_read_wakes_on_write_and_on_close() {
        let host = LocalPipeHost::new();
        let mut server = host.create_instance(NAME).unwrap();
        let mut client = host.open(NAME).unwrap();

        let ev = event();
        let mut buf = [0u8; 8];
        assert_eq!(server.start_read(&mut buf, &ev), Completion::Pending);
        client.write(b"ping").unwrap();
        assert!(ev.is_set());
        assert_eq!(server.overlapped_result(&mut buf, false), Completion::Done(4));

        assert_eq!(server.start_read(&mut buf, &ev), Completion::Pending);
        drop(client);
        assert!(ev.is_set());
        assert_eq!(server.overlapped_result(&mut buf, false), Completion::Closed);
        assert_eq!(server.write(b"late"), Err(WriteFault::Broken));
    }

    #[test]
    fn closing_server_removes_instance() {
        let host = LocalPipeHost::new();
        let server = host.create_instance(NAME).unwrap();
        assert_eq!(host.instances(NAME), 1);
        drop(server);
        assert_eq!(host.instances(NAME), 0);
    }
}
