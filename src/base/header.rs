//! The header of a DNS message.
//!
//! Each DNS message starts with a twelve octet long header section. The
//! core only ever looks at a handful of its fields: the message ID used to
//! correlate answers, the QR flag and opcode used to reject unsuitable
//! queries, and the question count.
//!
//! The layout of the first four octets is:
//!
//! ```text
//!                                 1  1  1  1  1  1
//!   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA|Z |AD|CD|   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```

use super::ParseError;

/// The length of the header section in octets.
pub const HEADER_LEN: usize = 12;

//------------ Rcode ---------------------------------------------------------

/// Response codes used by the core when it answers on its own.
pub mod rcode {
    /// No error condition.
    pub const NOERROR: u8 = 0;

    /// The server was unable to interpret the query.
    pub const FORMERR: u8 = 1;

    /// The server was unable to process the query.
    pub const SERVFAIL: u8 = 2;

    /// The server does not support the requested kind of query.
    pub const NOTIMP: u8 = 4;

    /// The server refuses to perform the operation.
    pub const REFUSED: u8 = 5;
}

//------------ Header --------------------------------------------------------

/// A copy of the header section of a DNS message.
///
/// The value keeps the twelve octets in wire representation and decodes the
/// fields on access.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Header {
    inner: [u8; HEADER_LEN],
}

impl Header {
    /// Copies the header from the start of a message.
    pub fn from_message(msg: &[u8]) -> Result<Self, ParseError> {
        let mut inner = [0u8; HEADER_LEN];
        inner.copy_from_slice(
            msg.get(..HEADER_LEN).ok_or(ParseError::ShortMessage)?,
        );
        Ok(Header { inner })
    }

    /// Returns the header as wire format octets.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Returns the message ID.
    pub fn id(&self) -> u16 {
        u16::from_be_bytes([self.inner[0], self.inner[1]])
    }

    /// Sets the message ID.
    pub fn set_id(&mut self, id: u16) {
        self.inner[..2].copy_from_slice(&id.to_be_bytes())
    }

    /// Returns whether the QR flag is set, i.e. the message is a response.
    pub fn qr(&self) -> bool {
        self.inner[2] & 0x80 != 0
    }

    /// Returns the opcode.
    pub fn opcode(&self) -> u8 {
        (self.inner[2] >> 3) & 0x0F
    }

    /// Returns whether the RD flag is set.
    pub fn rd(&self) -> bool {
        self.inner[2] & 0x01 != 0
    }

    /// Returns whether the TC flag is set.
    pub fn tc(&self) -> bool {
        self.inner[2] & 0x02 != 0
    }

    /// Returns whether the CD flag is set.
    pub fn cd(&self) -> bool {
        self.inner[3] & 0x10 != 0
    }

    /// Returns the response code.
    pub fn rcode(&self) -> u8 {
        self.inner[3] & 0x0F
    }

    /// Returns the number of entries in the question section.
    pub fn qdcount(&self) -> u16 {
        u16::from_be_bytes([self.inner[4], self.inner[5]])
    }

    /// Returns the number of records in the answer section.
    pub fn ancount(&self) -> u16 {
        u16::from_be_bytes([self.inner[6], self.inner[7]])
    }

    /// Returns the number of records in the additional section.
    pub fn arcount(&self) -> u16 {
        u16::from_be_bytes([self.inner[10], self.inner[11]])
    }

    /// Sets the flags and response code of a response to this header.
    ///
    /// QR and RA are set, AA and TC are cleared, RD, CD and the opcode are
    /// kept. All section counts are zeroed.
    pub(crate) fn make_response(&mut self, rcode: u8) {
        self.inner[2] = 0x80 | (self.inner[2] & 0x79);
        self.inner[3] = 0x80 | (self.inner[3] & 0x10) | (rcode & 0x0F);
        self.inner[4..].fill(0);
    }
}

//------------ Message ID helpers --------------------------------------------

/// Returns the message ID of a message if it is long enough to have one.
pub fn message_id(msg: &[u8]) -> Option<u16> {
    match msg {
        [a, b, ..] => Some(u16::from_be_bytes([*a, *b])),
        _ => None,
    }
}

/// Overwrites the message ID of a message.
///
/// Does nothing if the message is too short to contain an ID.
pub fn set_message_id(msg: &mut [u8], id: u16) {
    if let Some(octets) = msg.get_mut(..2) {
        octets.copy_from_slice(&id.to_be_bytes())
    }
}

//============ Tests =========================================================
