bitflags::bitflags! {
    /// Readiness bits shared by `poll` requests, results and the sticky
    /// per-descriptor state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Ready: u16 {
        /// Data (or a completed accept) is available.
        const IN = 0x0001;
        /// Urgent data.
        const PRI = 0x0002;
        /// Writing will not block.
        const OUT = 0x0004;
        /// An error is pending.
        const ERR = 0x0008;
        /// The peer hung up.
        const HUP = 0x0010;
        /// The descriptor cannot be waited on.
        const NVAL = 0x0020;
    }
}

impl Ready {
    /// Bits reported whether or not they were requested.
    pub const ALWAYS: Ready = Ready::ERR.union(Ready::HUP).union(Ready::NVAL);

    /// Requested bits widened with the unconditional ones.
    pub fn reportable(self) -> Ready {
        self | Ready::ALWAYS
    }

    #[cfg(unix)]
    pub(crate) fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(Ready::IN) {
            events |= libc::POLLIN;
        }
        if self.contains(Ready::PRI) {
            events |= libc::POLLPRI;
        }
        if self.contains(Ready::OUT) {
            events |= libc::POLLOUT;
        }
        events
    }

    #[cfg(unix)]
    pub(crate) fn from_poll_events(revents: libc::c_short) -> Ready {
        let mut ready = Ready::empty();
        if revents & libc::POLLIN != 0 {
            ready |= Ready::IN;
        }
        if revents & libc::POLLPRI != 0 {
            ready |= Ready::PRI;
        }
        if revents & libc::POLLOUT != 0 {
            ready |= Ready::OUT;
        }
        if revents & libc::POLLERR != 0 {
            ready |= Ready::ERR;
        }
        if revents & libc::POLLHUP != 0 {
            ready |= Ready::HUP;
        }
        if revents & libc::POLLNVAL != 0 {
            ready |= Ready::NVAL;
        }
        ready
    }
}
