//! Basics.
//!
//! The network core treats DNS messages as opaque octet sequences almost
//! everywhere. This module provides the little bit of wire format access it
//! does need: the [header] fields used for sanity checks and correlation,
//! the first [question] used for matching responses and chaining, and a few
//! helpers to build queries and minimal error responses.

use core::fmt;
use core::hash::Hasher;

use siphasher::sip::SipHasher24;

pub mod header;
pub mod question;

pub use self::header::{message_id, rcode, set_message_id, Header, HEADER_LEN};
pub use self::question::{question_end, Question};

//------------ Message helpers -----------------------------------------------

/// Builds a query message with a single question.
pub fn build_query(
    id: u16,
    question: &Question,
    rd: bool,
) -> Result<Vec<u8>, ParseError> {
    let mut msg = Vec::with_capacity(HEADER_LEN + question.qname().len() + 6);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.push(if rd { 0x01 } else { 0x00 });
    msg.push(0);
    msg.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    question.compose(&mut msg)?;
    Ok(msg)
}

/// Builds a minimal response to `query` carrying only `rcode`.
///
/// The response repeats the question if the query has one and is empty
/// otherwise.
pub fn error_response(query: &[u8], rcode: u8) -> Result<Vec<u8>, ParseError> {
    let mut header = Header::from_message(query)?;
    let question = if header.qdcount() > 0 {
        Some(&query[HEADER_LEN..question_end(query)?])
    } else {
        None
    };
    header.make_response(rcode);
    let mut msg = header.as_slice().to_vec();
    if let Some(question) = question {
        msg[5] = 1;
        msg.extend_from_slice(question);
    }
    Ok(msg)
}

/// Hashes the first question of a message.
///
/// The query name is folded to lowercase so that names differing only in
/// case hash equally. The message ID and everything after the question are
/// ignored. Messages whose question cannot be located are hashed in full
/// after the header.
pub fn question_hash(key: (u64, u64), msg: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(key.0, key.1);
    let end = question_end(msg).unwrap_or(msg.len());
    for octet in msg.get(HEADER_LEN..end).unwrap_or_default() {
        hasher.write_u8(octet.to_ascii_lowercase());
    }
    hasher.finish()
}

//------------ ParseError ----------------------------------------------------

/// A message could not be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// The message ended prematurely.
    ShortMessage,

    /// The message does not contain a question.
    NoQuestion,

    /// The query name uses name compression.
    CompressedName,

    /// A label is too long or malformed.
    BadLabel,

    /// The domain name is longer than 255 octets.
    LongName,
}

//--- Display and Error

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::ShortMessage => f.write_str("unexpected end of message"),
            ParseError::NoQuestion => f.write_str("message has no question"),
            ParseError::CompressedName => {
                f.write_str("compressed name in question")
            }
            ParseError::BadLabel => f.write_str("invalid label"),
            ParseError::LongName => f.write_str("domain name too long"),
        }
    }
}

impl std::error::Error for ParseError {}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_through_parsing() {
        let question = Question::new("example.net", 16, 1).unwrap();
        let query = build_query(4711, &question, true).unwrap();
        let header = Header::from_message(&query).unwrap();
        assert_eq!(header.id(), 4711);
        assert!(header.rd());
        assert!(!header.qr());
        assert_eq!(Question::from_message(&query).unwrap().0, question);
    }

    #[test]
    fn error_response_repeats_question() {
        let question = Question::new("example.net", 16, 1).unwrap();
        let mut query = build_query(9, &question, true).unwrap();
        // Trailing data such as an OPT record is not copied.
        query.extend_from_slice(&[0, 0, 41, 2, 0, 0, 0, 0, 0, 0, 0]);
        query[11] = 1;

        let response = error_response(&query, rcode::NOTIMP).unwrap();
        let header = Header::from_message(&response).unwrap();
        assert_eq!(header.id(), 9);
        assert!(header.qr());
        assert_eq!(header.rcode(), rcode::NOTIMP);
        assert_eq!(header.qdcount(), 1);
        assert_eq!(header.arcount(), 0);
        assert_eq!(Question::from_message(&response).unwrap().0, question);
    }

    #[test]
    fn error_response_without_question_is_header_only() {
        let query = [0, 3, 0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let response = error_response(&query, rcode::NOTIMP).unwrap();
        assert_eq!(response.len(), HEADER_LEN);
    }

    #[test]
    fn question_hash_ignores_id_and_case() {
        let key = (1, 2);
        let a = build_query(1, &Question::new("a.example", 1, 1).unwrap(), true)
            .unwrap();
        let mut b = a.clone();
        set_message_id(&mut b, 2);
        b[13] = b'A';
        assert_eq!(question_hash(key, &a), question_hash(key, &b));

        let c = build_query(1, &Question::new("a.example", 2, 1).unwrap(), true)
            .unwrap();
        assert_ne!(question_hash(key, &a), question_hash(key, &c));
        assert_ne!(question_hash(key, &a), question_hash((3, 4), &a));
    }
}
