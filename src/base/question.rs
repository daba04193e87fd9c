//! The first question of a DNS message.
//!
//! Query names are kept as text in a canonical form: ASCII letters are
//! lowercased, the name ends in a dot, and label octets that are not
//! letters, digits, hyphens, underscores or asterisks are escaped as
//! `\DDD`. Two names that are equal in the DNS sense therefore compare
//! equal as strings.

use core::fmt;

use super::header::{Header, HEADER_LEN};
use super::ParseError;

/// The maximum length of a domain name in wire format.
const MAX_NAME_LEN: usize = 255;

/// The maximum length of a single label.
const MAX_LABEL_LEN: usize = 63;

//------------ Question ------------------------------------------------------

/// A question: a query name, type and class.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Question {
    qname: String,
    qtype: u16,
    qclass: u16,
}

impl Question {
    /// Creates a question from a textual query name.
    ///
    /// The name is brought into canonical form. Fails if the name cannot be
    /// encoded in wire format.
    pub fn new(
        qname: &str,
        qtype: u16,
        qclass: u16,
    ) -> Result<Self, ParseError> {
        let wire = name_to_wire(qname)?;
        let mut canonical = String::new();
        read_name(&wire, 0, &mut canonical)?;
        Ok(Question {
            qname: canonical,
            qtype,
            qclass,
        })
    }

    /// Parses the first question of a message.
    ///
    /// Returns the question and the offset of the first octet after it.
    pub fn from_message(msg: &[u8]) -> Result<(Self, usize), ParseError> {
        if Header::from_message(msg)?.qdcount() == 0 {
            return Err(ParseError::NoQuestion);
        }
        let mut qname = String::new();
        let pos = read_name(msg, HEADER_LEN, &mut qname)?;
        let tail = msg.get(pos..pos + 4).ok_or(ParseError::ShortMessage)?;
        Ok((
            Question {
                qname,
                qtype: u16::from_be_bytes([tail[0], tail[1]]),
                qclass: u16::from_be_bytes([tail[2], tail[3]]),
            },
            pos + 4,
        ))
    }

    /// Returns the canonical query name.
    pub fn qname(&self) -> &str {
        &self.qname
    }

    /// Returns the query type.
    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    /// Returns the query class.
    pub fn qclass(&self) -> u16 {
        self.qclass
    }

    /// Appends the wire format of the question to `target`.
    pub fn compose(&self, target: &mut Vec<u8>) -> Result<(), ParseError> {
        target.extend_from_slice(&name_to_wire(&self.qname)?);
        target.extend_from_slice(&self.qtype.to_be_bytes());
        target.extend_from_slice(&self.qclass.to_be_bytes());
        Ok(())
    }
}

//--- Display

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.qname, self.qclass, self.qtype)
    }
}

//------------ Question section helpers --------------------------------------

/// Returns the end offset of the first question of a message.
///
/// Only the raw label structure is walked, nothing is decoded.
pub fn question_end(msg: &[u8]) -> Result<usize, ParseError> {
    let mut pos = HEADER_LEN;
    loop {
        let len = *msg.get(pos).ok_or(ParseError::ShortMessage)? as usize;
        if len & 0xC0 != 0 {
            return Err(ParseError::CompressedName);
        }
        pos += 1 + len;
        if len == 0 {
            break;
        }
    }
    if msg.len() < pos + 4 {
        return Err(ParseError::ShortMessage);
    }
    Ok(pos + 4)
}

//------------ Name helpers --------------------------------------------------

/// Reads an uncompressed name starting at `pos` and appends its canonical
/// text to `target`.
///
/// Returns the offset of the first octet after the name.
fn read_name(
    msg: &[u8],
    mut pos: usize,
    target: &mut String,
) -> Result<usize, ParseError> {
    let start = pos;
    loop {
        let len = *msg.get(pos).ok_or(ParseError::ShortMessage)? as usize;
        if len & 0xC0 == 0xC0 {
            return Err(ParseError::CompressedName);
        }
        if len > MAX_LABEL_LEN {
            return Err(ParseError::BadLabel);
        }
        pos += 1;
        if len == 0 {
            break;
        }
        let label =
            msg.get(pos..pos + len).ok_or(ParseError::ShortMessage)?;
        for &octet in label {
            push_octet(octet, target);
        }
        target.push('.');
        pos += len;
        if pos - start > MAX_NAME_LEN {
            return Err(ParseError::LongName);
        }
    }
    if target.is_empty() {
        target.push('.');
    }
    Ok(pos)
}

fn push_octet(octet: u8, target: &mut String) {
    match octet {
        b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'*' => {
            target.push(octet as char)
        }
        b'A'..=b'Z' => target.push(octet.to_ascii_lowercase() as char),
        _ => {
            target.push('\\');
            target.push_str(&format!("{:03}", octet));
        }
    }
}

/// Converts a textual name into wire format.
///
/// Understands `\DDD` and `\X` escapes. A missing final dot is accepted.
fn name_to_wire(name: &str) -> Result<Vec<u8>, ParseError> {
    let mut wire = Vec::with_capacity(name.len() + 2);
    let mut label = Vec::new();
    let mut octets = name.bytes();
    while let Some(octet) = octets.next() {
        match octet {
            b'.' => {
                if label.is_empty() {
                    // Only the root name may consist of a lone dot.
                    if wire.is_empty() && name == "." {
                        break;
                    }
                    return Err(ParseError::BadLabel);
                }
                push_label(&mut wire, &label)?;
                label.clear();
            }
            b'\\' => {
                let first = octets.next().ok_or(ParseError::BadLabel)?;
                if first.is_ascii_digit() {
                    let second = octets.next().ok_or(ParseError::BadLabel)?;
                    let third = octets.next().ok_or(ParseError::BadLabel)?;
                    if !second.is_ascii_digit() || !third.is_ascii_digit() {
                        return Err(ParseError::BadLabel);
                    }
                    let value = u16::from(first - b'0') * 100
                        + u16::from(second - b'0') * 10
                        + u16::from(third - b'0');
                    label.push(
                        u8::try_from(value)
                            .map_err(|_| ParseError::BadLabel)?,
                    );
                } else {
                    label.push(first);
                }
            }
            _ => label.push(octet),
        }
    }
    if !label.is_empty() {
        push_label(&mut wire, &label)?;
    }
    wire.push(0);
    if wire.len() > MAX_NAME_LEN {
        return Err(ParseError::LongName);
    }
    Ok(wire)
}

fn push_label(wire: &mut Vec<u8>, label: &[u8]) -> Result<(), ParseError> {
    if label.len() > MAX_LABEL_LEN {
        return Err(ParseError::BadLabel);
    }
    wire.push(label.len() as u8);
    wire.extend_from_slice(label);
    Ok(())
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn message(name: &[u8]) -> Vec<u8> {
        let mut msg = vec![0, 7, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(name);
        msg.extend_from_slice(&[0, 28, 0, 1]);
        msg
    }

    #[test]
    fn parses_and_lowercases() {
        let msg = message(b"\x03WwW\x07ExAmple\x03com\x00");
        let (question, end) = Question::from_message(&msg).unwrap();
        assert_eq!(question.qname(), "www.example.com.");
        assert_eq!(question.qtype(), 28);
        assert_eq!(question.qclass(), 1);
        assert_eq!(end, msg.len());
        assert_eq!(question_end(&msg), Ok(msg.len()));
    }

    #[test]
    fn escapes_odd_octets() {
        let msg = message(b"\x03a.b\x02\x00z\x00");
        let (question, _) = Question::from_message(&msg).unwrap();
        assert_eq!(question.qname(), "a\\046b.\\000z.");

        let mut wire = Vec::new();
        question.compose(&mut wire).unwrap();
        assert_eq!(&wire[..], &msg[12..]);
    }

    #[test]
    fn root_name() {
        let msg = message(b"\x00");
        let (question, _) = Question::from_message(&msg).unwrap();
        assert_eq!(question.qname(), ".");
        assert_eq!(Question::new(".", 2, 1).unwrap(), question_with(".", 2));
    }

    fn question_with(name: &str, qtype: u16) -> Question {
        Question {
            qname: name.into(),
            qtype,
            qclass: 1,
        }
    }

    #[rstest]
    #[case("Example.COM", "example.com.")]
    #[case("example.com.", "example.com.")]
    #[case("x\\065y.org", "xay.org.")]
    fn new_canonicalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(Question::new(input, 1, 1).unwrap().qname(), expected);
    }

    #[rstest]
    #[case(b"\xC0\x0C".as_slice(), ParseError::CompressedName)]
    #[case(b"\x05abc".as_slice(), ParseError::ShortMessage)]
    fn rejects_bad_names(#[case] name: &[u8], #[case] err: ParseError) {
        let mut msg = vec![0, 7, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        msg.extend_from_slice(name);
        assert_eq!(Question::from_message(&msg), Err(err));
    }

    #[test]
    fn rejects_missing_question() {
        let msg = [0u8; 12];
        assert_eq!(Question::from_message(&msg), Err(ParseError::NoQuestion));
        assert!(Question::new("a..b", 1, 1).is_err());
    }
}
