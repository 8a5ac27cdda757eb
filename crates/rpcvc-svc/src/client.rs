use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rpcvc_record::{RecordConfig, RecordError, RecordReader, RecordWriter};
use rpcvc_transport::{DescriptorStream, Descriptors, Fd, SockAddr};
use tracing::debug;

use crate::codec::{CallMessage, HeaderCodec, MessageCodec};
use crate::config::DEFAULT_READ_TIMEOUT;
use crate::error::{Result, SvcError};

/// A blocking caller on one connection.
///
/// Calls are sent one record each; replies with a stale transaction id
/// are skipped.
#[derive(Debug)]
pub struct Client {
    reader: RecordReader<DescriptorStream>,
    record: RecordConfig,
    codec: Arc<dyn MessageCodec>,
    timeout: Duration,
    next_xid: u32,
}

impl Client {
    pub fn connect(io: &Descriptors, addr: &SockAddr) -> Result<Self> {
        let mut stream = DescriptorStream::connect(io, addr)?;
        stream.set_read_timeout(Some(DEFAULT_READ_TIMEOUT));
        debug!(fd = %stream.fd(), %addr, "client connected");
        let record = RecordConfig::default();
        Ok(Self {
            reader: RecordReader::with_config(stream, record.clone()),
            record,
            codec: Arc::new(HeaderCodec),
            timeout: DEFAULT_READ_TIMEOUT,
            next_xid: 1,
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// How long `call` waits for its reply.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.reader.get_mut().set_read_timeout(Some(timeout));
    }

    pub fn fd(&self) -> Fd {
        self.reader.get_ref().fd()
    }

    /// Send `body` under a fresh transaction id and wait for the reply body.
    pub fn call(&mut self, body: &[u8]) -> Result<Bytes> {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1);
        self.call_with_xid(xid, body)
    }

    pub fn call_with_xid(&mut self, xid: u32, body: &[u8]) -> Result<Bytes> {
        self.send(xid, body)?;
        self.receive(xid)
    }

    /// Send one call without waiting.
    pub fn send(&mut self, xid: u32, body: &[u8]) -> Result<()> {
        let mut msg = BytesMut::new();
        self.codec.encode_call(
            &CallMessage {
                xid,
                body: Bytes::copy_from_slice(body),
            },
            &mut msg,
        );
        RecordWriter::with_config(self.reader.get_mut(), self.record.clone()).send_record(&msg)?;
        Ok(())
    }

    /// Wait for the reply to `xid`.
    pub fn receive(&mut self, xid: u32) -> Result<Bytes> {
        loop {
            let record = match self.reader.read_record() {
                Ok(record) => record,
                Err(RecordError::Io(e)) if e.kind() == ErrorKind::TimedOut => {
                    return Err(SvcError::Timeout(self.timeout))
                }
                Err(e) => return Err(e.into()),
            };
            let reply = self.codec.decode_reply(record)?;
            if reply.xid == xid {
                return Ok(reply.body);
            }
            debug!(expected = xid, got = reply.xid, "skipping stale reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::table::XprtTable;
    use crate::xprt::Xprt;
    use rpcvc_transport::Domain;

    fn served(io: &Descriptors, name: &str) -> (Client, Connection) {
        let addr = SockAddr::local(name).unwrap();
        let lfd = io.socket(Domain::Local).unwrap();
        io.bind(lfd, &addr).unwrap();
        io.listen(lfd, 4).unwrap();
        let client = Client::connect(io, &addr).unwrap();
        let (sfd, _) = io.accept(lfd).unwrap();
        io.close(lfd).unwrap();
        (client, Connection::from_fd(io, sfd, 0, 0).unwrap())
    }

    #[test]
    fn stale_replies_are_skipped() {
        let io = Descriptors::in_process();
        let (mut client, mut conn) = served(&io, "client-stale");
        let mut table = XprtTable::new();

        client.send(5, b"old").unwrap();
        client.send(6, b"new").unwrap();
        conn.recv(&mut table).unwrap();
        conn.reply(b"reply to 5").unwrap();
        conn.recv(&mut table).unwrap();
        conn.reply(b"reply to 6").unwrap();

        assert_eq!(client.receive(6).unwrap().as_ref(), b"reply to 6");
    }

    #[test]
    fn missing_reply_times_out() {
        let io = Descriptors::in_process();
        let (mut client, _conn) = served(&io, "client-timeout");
        client.set_timeout(Duration::from_millis(30));
        assert!(matches!(
            client.call(b"anyone?"),
            Err(SvcError::Timeout(t)) if t == Duration::from_millis(30)
        ));
    }

    #[test]
    fn xids_advance_per_call() {
        let io = Descriptors::in_process();
        let (mut client, mut conn) = served(&io, "client-xid");
        let handle = std::thread::spawn(move || {
            let mut table = XprtTable::new();
            let mut xids = Vec::new();
            for _ in 0..2 {
                let call = conn.recv(&mut table).unwrap();
                xids.push(call.xid);
                conn.reply(&call.body).unwrap();
            }
            xids
        });
        assert_eq!(client.call(b"a").unwrap().as_ref(), b"a");
        assert_eq!(client.call(b"b").unwrap().as_ref(), b"b");
        assert_eq!(handle.join().unwrap(), vec![1, 2]);
    }
}
