//! Inbound TCP connections.
//!
//! A connection carries a sequence of DNS messages, each preceded by its
//! length as a 16 bit big-endian integer. Connections from relays in the
//! `proxy_protocol_from` list start with a proxy protocol header instead.
//! The [`StreamFramer`] turns the bytes read from a connection into these
//! frames. It is a plain state machine that never touches a socket and
//! always says how many bytes it wants next, so that a reader never takes
//! bytes belonging to a later message off the socket early.
//!
//! A [`TcpConnection`] bundles the socket with its framer and with the
//! book keeping needed to limit the number of queries in flight.

use core::cell::{Ref, RefCell, RefMut};
use core::fmt;

use std::collections::HashMap;
use std::io::{self, IoSlice, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use super::proxy::{parse_header, Parsed, ProxyHeader, ProxyValue, MIN_HEADER_SIZE};
use crate::metrics::Counters;

//------------ ReadState -----------------------------------------------------

/// What a connection is currently reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadState {
    /// The proxy protocol header.
    ProxyHeader,

    /// The first octet of a length prefix.
    LengthByte0,

    /// The second octet of a length prefix.
    LengthByte1,

    /// The message itself.
    ReadingBody,
}

//------------ Frame ---------------------------------------------------------

/// A complete unit read from a connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    /// A proxy protocol header.
    Proxy(ProxyHeader),

    /// A DNS message without its length prefix.
    Message(Vec<u8>),
}

//------------ StreamFramer --------------------------------------------------

/// Splits the bytes of a connection into frames.
#[derive(Clone, Debug)]
pub struct StreamFramer {
    state: ReadState,
    buf: Vec<u8>,

    /// Octets still needed to complete the proxy header as known so far.
    proxy_need: usize,

    /// The largest acceptable proxy header.
    proxy_max: usize,

    /// The length of the message being read.
    len: usize,
}

impl StreamFramer {
    /// Creates a framer for a new connection.
    pub fn new(expect_proxy: bool, proxy_max: usize) -> Self {
        StreamFramer {
            state: if expect_proxy {
                ReadState::ProxyHeader
            } else {
                ReadState::LengthByte0
            },
            buf: Vec::new(),
            proxy_need: MIN_HEADER_SIZE,
            proxy_max,
            len: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Returns the number of octets to read next.
    pub fn wanted(&self) -> usize {
        match self.state {
            ReadState::ProxyHeader => self.proxy_need,
            ReadState::LengthByte0 => 2,
            ReadState::LengthByte1 => 1,
            ReadState::ReadingBody => self.len - self.buf.len(),
        }
    }

    /// Feeds octets into the framer.
    ///
    /// Takes at most [`wanted`][Self::wanted] octets from `data`. Returns
    /// how many were taken and the frame they completed, if any.
    pub fn feed(
        &mut self,
        data: &[u8],
    ) -> Result<(usize, Option<Frame>), FrameError> {
        let take = data.len().min(self.wanted());
        let data = &data[..take];
        let frame = match self.state {
            ReadState::ProxyHeader => {
                self.buf.extend_from_slice(data);
                self.proxy_need -= take;
                if self.proxy_need > 0 {
                    None
                } else {
                    self.proxy_step()?
                }
            }
            ReadState::LengthByte0 => match *data {
                [b0, b1] => self.start_body(u16::from_be_bytes([b0, b1]))?,
                [b0] => {
                    self.buf.push(b0);
                    self.state = ReadState::LengthByte1;
                    None
                }
                _ => None,
            },
            ReadState::LengthByte1 => match *data {
                [b1] => {
                    let b0 = self.buf[0];
                    self.buf.clear();
                    self.start_body(u16::from_be_bytes([b0, b1]))?
                }
                _ => None,
            },
            ReadState::ReadingBody => {
                self.buf.extend_from_slice(data);
                if self.buf.len() == self.len {
                    self.state = ReadState::LengthByte0;
                    Some(Frame::Message(core::mem::take(&mut self.buf)))
                } else {
                    None
                }
            }
        };
        Ok((take, frame))
    }

    fn proxy_step(&mut self) -> Result<Option<Frame>, FrameError> {
        match parse_header(&self.buf) {
            Parsed::NeedMore(more) => {
                if self.buf.len() + more > self.proxy_max {
                    return Err(FrameError::ProxyTooLarge);
                }
                self.proxy_need = more;
                Ok(None)
            }
            Parsed::Invalid => Err(FrameError::ProxyInvalid),
            Parsed::Complete(header) => {
                if header.consumed > self.proxy_max {
                    return Err(FrameError::ProxyTooLarge);
                }
                self.buf.clear();
                self.state = ReadState::LengthByte0;
                Ok(Some(Frame::Proxy(header)))
            }
        }
    }

    fn start_body(&mut self, len: u16) -> Result<Option<Frame>, FrameError> {
        if len == 0 {
            return Err(FrameError::EmptyMessage);
        }
        self.len = usize::from(len);
        self.buf = Vec::with_capacity(self.len);
        self.state = ReadState::ReadingBody;
        Ok(None)
    }
}

//------------ FrameError ----------------------------------------------------

/// A connection sent something that cannot be framed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameError {
    /// The proxy protocol header is invalid.
    ProxyInvalid,

    /// The proxy protocol header is larger than allowed.
    ProxyTooLarge,

    /// A message has a length of zero.
    EmptyMessage,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::ProxyInvalid => {
                f.write_str("invalid proxy protocol header")
            }
            FrameError::ProxyTooLarge => {
                f.write_str("proxy protocol header too large")
            }
            FrameError::EmptyMessage => f.write_str("zero length message"),
        }
    }
}

impl std::error::Error for FrameError {}

//------------ ClientCounts --------------------------------------------------

/// The number of open connections per client address of one thread.
pub(crate) type ClientCounts = Rc<RefCell<HashMap<IpAddr, usize>>>;

/// Accounts for one open connection until dropped.
struct ClientSlot {
    counts: ClientCounts,
    addr: IpAddr,
    counters: Arc<Counters>,
}

impl ClientSlot {
    fn new(counts: ClientCounts, addr: IpAddr, counters: Arc<Counters>) -> Self {
        *counts.borrow_mut().entry(addr).or_default() += 1;
        counters.tcp_connection_opened();
        ClientSlot {
            counts,
            addr,
            counters,
        }
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        let mut counts = self.counts.borrow_mut();
        if let Some(count) = counts.get_mut(&self.addr) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.addr);
            }
        }
        self.counters.tcp_connection_closed();
    }
}

//------------ TcpConnection -------------------------------------------------

/// An inbound TCP connection.
///
/// The socket is closed once the last reference is gone, i.e., once it is
/// neither registered with the multiplexer nor used by a task answering
/// one of its queries.
pub struct TcpConnection {
    stream: TcpStream,
    fd: RawFd,
    remote: SocketAddr,
    local: SocketAddr,
    state: RefCell<ConnectionState>,
    _slot: ClientSlot,
}

/// The mutable part of a connection.
#[derive(Debug)]
pub struct ConnectionState {
    /// The framer of the incoming bytes.
    pub framer: StreamFramer,

    /// The effective client address.
    pub source: SocketAddr,

    /// The effective local address.
    pub destination: SocketAddr,

    /// The values of the proxy protocol header.
    pub proxy_values: Vec<ProxyValue>,

    /// The number of queries currently being answered.
    pub in_flight: usize,

    /// The number of queries answered so far.
    pub queries_answered: u64,

    /// Whether the connection has been terminated.
    pub closed: bool,
}

impl TcpConnection {
    pub(crate) fn new(
        stream: TcpStream,
        remote: SocketAddr,
        framer: StreamFramer,
        counts: ClientCounts,
        counters: Arc<Counters>,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;
        let fd = stream.as_raw_fd();
        Ok(TcpConnection {
            stream,
            fd,
            remote,
            local,
            state: RefCell::new(ConnectionState {
                framer,
                source: remote,
                destination: local,
                proxy_values: Vec::new(),
                in_flight: 0,
                queries_answered: 0,
                closed: false,
            }),
            _slot: ClientSlot::new(counts, remote.ip(), counters),
        })
    }

    /// Returns the descriptor of the socket.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns the address of the peer.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Returns the local address of the socket.
    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Returns the mutable state.
    pub fn state(&self) -> Ref<'_, ConnectionState> {
        self.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, ConnectionState> {
        self.state.borrow_mut()
    }

    /// Reads what is available into `buf`.
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    /// Writes a length prefixed response in one go.
    ///
    /// Writing only part of the response is an error.
    pub(crate) fn send_response(&self, msg: &[u8]) -> io::Result<()> {
        let len = u16::try_from(msg.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "response too long")
        })?;
        let prefix = len.to_be_bytes();
        let bufs = [IoSlice::new(&prefix), IoSlice::new(msg)];
        let written = loop {
            match (&self.stream).write_vectored(&bufs) {
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                res => break res?,
            }
        };
        if written != msg.len() + 2 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "partial answer sent ({} of {} bytes)",
                    written,
                    msg.len() + 2
                ),
            ));
        }
        Ok(())
    }
}

//--- Debug

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("fd", &self.fd)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("state", &self.state)
            .finish()
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::net::server::proxy::compose_header;

    /// Feeds `data` in chunks of `chunk` octets, collecting frames.
    fn feed_all(
        framer: &mut StreamFramer,
        data: &[u8],
        chunk: usize,
    ) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        for piece in data.chunks(chunk) {
            let mut piece = piece;
            while !piece.is_empty() {
                let (used, frame) = framer.feed(piece)?;
                piece = &piece[used..];
                frames.extend(frame);
            }
        }
        Ok(frames)
    }

    fn framed(msgs: &[&[u8]]) -> Vec<u8> {
        let mut res = Vec::new();
        for msg in msgs {
            res.extend_from_slice(&(msg.len() as u16).to_be_bytes());
            res.extend_from_slice(msg);
        }
        res
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(3)]
    #[case(7)]
    #[case(1000)]
    fn reassembles_pipelined_messages(#[case] chunk: usize) {
        let first: Vec<u8> = (0..=255).cycle().take(300).collect();
        let second = b"second message".to_vec();
        let mut framer = StreamFramer::new(false, 512);
        let frames =
            feed_all(&mut framer, &framed(&[&first, &second]), chunk).unwrap();
        assert_eq!(
            frames,
            vec![Frame::Message(first), Frame::Message(second)]
        );
        assert_eq!(framer.state(), ReadState::LengthByte0);
    }

    #[test]
    fn single_length_byte_is_remembered() {
        let mut framer = StreamFramer::new(false, 512);
        assert_eq!(framer.feed(&[0]).unwrap(), (1, None));
        assert_eq!(framer.state(), ReadState::LengthByte1);
        assert_eq!(framer.wanted(), 1);
        assert_eq!(framer.feed(&[3, 1, 2, 3]).unwrap(), (1, None));
        assert_eq!(framer.state(), ReadState::ReadingBody);
        assert_eq!(framer.wanted(), 3);
        assert_eq!(
            framer.feed(&[1, 2, 3]).unwrap(),
            (3, Some(Frame::Message(vec![1, 2, 3])))
        );
    }

    #[test]
    fn zero_length_is_an_error() {
        let mut framer = StreamFramer::new(false, 512);
        assert_eq!(framer.feed(&[0, 0]), Err(FrameError::EmptyMessage));
    }

    #[rstest]
    #[case(1)]
    #[case(16)]
    #[case(100)]
    fn proxy_header_precedes_messages(#[case] chunk: usize) {
        let header = compose_header(
            "192.0.2.1:4000".parse().unwrap(),
            "192.0.2.53:53".parse().unwrap(),
            true,
            &[],
        )
        .unwrap();
        let mut data = header.clone();
        data.extend_from_slice(&framed(&[b"query"]));
        let mut framer = StreamFramer::new(true, 512);
        assert_eq!(framer.state(), ReadState::ProxyHeader);
        let frames = feed_all(&mut framer, &data, chunk).unwrap();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Proxy(proxy) => assert_eq!(proxy.consumed, header.len()),
            _ => panic!("expected proxy header"),
        }
        assert_eq!(frames[1], Frame::Message(b"query".to_vec()));
    }

    #[test]
    fn proxy_errors() {
        let mut framer = StreamFramer::new(true, 512);
        assert_eq!(
            feed_all(&mut framer, &[0xAA; 16], 16),
            Err(FrameError::ProxyInvalid)
        );

        let header = compose_header(
            "192.0.2.1:4000".parse().unwrap(),
            "192.0.2.53:53".parse().unwrap(),
            true,
            &[crate::net::server::proxy::ProxyValue {
                kind: 1,
                content: vec![0; 100],
            }],
        )
        .unwrap();
        let mut framer = StreamFramer::new(true, 64);
        assert_eq!(
            feed_all(&mut framer, &header, 1),
            Err(FrameError::ProxyTooLarge)
        );
    }
}
