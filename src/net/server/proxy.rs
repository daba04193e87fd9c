//! The PROXY protocol, version 2.
//!
//! A relay in front of the resolver can prepend a binary header to a
//! datagram or to the start of a TCP connection that conveys the addresses
//! of the original client. The header starts with a fixed signature,
//! followed by version and command, address family and transport, and the
//! length of the rest of the header. The rest holds the addresses and
//! ports followed by type-length-value entries.
//!
//! Headers are only accepted from sources listed in the
//! `proxy_protocol_from` setting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// The signature every header starts with.
const SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";

/// The size of the fixed part of the header.
pub const MIN_HEADER_SIZE: usize = 16;

/// The only supported version in the upper nibble of the version octet.
const VERSION: u8 = 0x20;

/// Commands in the lower nibble of the version octet.
const CMD_LOCAL: u8 = 0x00;
const CMD_PROXY: u8 = 0x01;

/// Address families in the upper nibble of the family octet.
const AF_UNSPEC: u8 = 0x00;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

/// Transports in the lower nibble of the family octet.
const PROTO_STREAM: u8 = 0x01;
const PROTO_DGRAM: u8 = 0x02;

//------------ Parsed --------------------------------------------------------

/// The outcome of parsing the start of a buffer as a header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Parsed {
    /// A complete header was found.
    Complete(ProxyHeader),

    /// At least this many more octets are needed.
    NeedMore(usize),

    /// The buffer does not start with a valid header.
    Invalid,
}

//------------ ProxyHeader ---------------------------------------------------

/// A parsed header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyHeader {
    /// The number of octets the header occupies.
    pub consumed: usize,

    /// Whether the relay talked to the client over a stream transport.
    pub stream: bool,

    /// The address of the original client.
    ///
    /// `None` for the LOCAL command which states that the connection was
    /// made by the relay itself.
    pub source: Option<SocketAddr>,

    /// The address the original client connected to.
    pub destination: Option<SocketAddr>,

    /// The type-length-value entries of the header.
    pub values: Vec<ProxyValue>,
}

/// A type-length-value entry of a header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyValue {
    /// The type of the entry.
    pub kind: u8,

    /// The value of the entry.
    pub content: Vec<u8>,
}

//------------ parse_header --------------------------------------------------

/// Parses the header at the start of `buf`.
pub fn parse_header(buf: &[u8]) -> Parsed {
    if buf.len() < MIN_HEADER_SIZE {
        // A prefix of the signature may still become a header.
        let have = buf.len().min(SIGNATURE.len());
        if buf[..have] != SIGNATURE[..have] {
            return Parsed::Invalid;
        }
        return Parsed::NeedMore(MIN_HEADER_SIZE - buf.len());
    }
    if buf[..SIGNATURE.len()] != SIGNATURE {
        return Parsed::Invalid;
    }
    let version = buf[12] & 0xF0;
    let command = buf[12] & 0x0F;
    if version != VERSION || (command != CMD_LOCAL && command != CMD_PROXY) {
        return Parsed::Invalid;
    }
    let family = buf[13] & 0xF0;
    let protocol = buf[13] & 0x0F;
    let len = usize::from(u16::from_be_bytes([buf[14], buf[15]]));
    let total = MIN_HEADER_SIZE + len;
    if buf.len() < total {
        return Parsed::NeedMore(total - buf.len());
    }
    let body = &buf[MIN_HEADER_SIZE..total];

    if command == CMD_LOCAL {
        return Parsed::Complete(ProxyHeader {
            consumed: total,
            stream: protocol == PROTO_STREAM,
            source: None,
            destination: None,
            values: Vec::new(),
        });
    }

    if protocol != PROTO_STREAM && protocol != PROTO_DGRAM {
        return Parsed::Invalid;
    }
    let (source, destination, rest) = match family {
        AF_INET if body.len() >= 12 => {
            let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
            let sport = u16::from_be_bytes([body[8], body[9]]);
            let dport = u16::from_be_bytes([body[10], body[11]]);
            (
                SocketAddr::new(src.into(), sport),
                SocketAddr::new(dst.into(), dport),
                &body[12..],
            )
        }
        AF_INET6 if body.len() >= 36 => {
            let mut src = [0; 16];
            let mut dst = [0; 16];
            src.copy_from_slice(&body[..16]);
            dst.copy_from_slice(&body[16..32]);
            let sport = u16::from_be_bytes([body[32], body[33]]);
            let dport = u16::from_be_bytes([body[34], body[35]]);
            (
                SocketAddr::new(Ipv6Addr::from(src).into(), sport),
                SocketAddr::new(Ipv6Addr::from(dst).into(), dport),
                &body[36..],
            )
        }
        _ => return Parsed::Invalid,
    };
    let Some(values) = parse_values(rest) else {
        return Parsed::Invalid;
    };
    Parsed::Complete(ProxyHeader {
        consumed: total,
        stream: protocol == PROTO_STREAM,
        source: Some(source),
        destination: Some(destination),
        values,
    })
}

/// Parses type-length-value entries that have to fill `buf` exactly.
fn parse_values(mut buf: &[u8]) -> Option<Vec<ProxyValue>> {
    let mut values = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([buf[1], buf[2]]));
        let content = buf.get(3..3 + len)?;
        values.push(ProxyValue {
            kind: buf[0],
            content: content.to_vec(),
        });
        buf = &buf[3 + len..];
    }
    Some(values)
}

//------------ compose_header ------------------------------------------------

/// Builds a PROXY command header.
///
/// Returns `None` if the addresses are of different families or the
/// header would be too long.
pub fn compose_header(
    source: SocketAddr,
    destination: SocketAddr,
    stream: bool,
    values: &[ProxyValue],
) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let family = match (source.ip(), destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            body.extend_from_slice(&src.octets());
            body.extend_from_slice(&dst.octets());
            AF_INET
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            body.extend_from_slice(&src.octets());
            body.extend_from_slice(&dst.octets());
            AF_INET6
        }
        _ => return None,
    };
    body.extend_from_slice(&source.port().to_be_bytes());
    body.extend_from_slice(&destination.port().to_be_bytes());
    for value in values {
        let len = u16::try_from(value.content.len()).ok()?;
        body.push(value.kind);
        body.extend_from_slice(&len.to_be_bytes());
        body.extend_from_slice(&value.content);
    }
    let len = u16::try_from(body.len()).ok()?;

    let mut header = Vec::with_capacity(MIN_HEADER_SIZE + body.len());
    header.extend_from_slice(&SIGNATURE);
    header.push(VERSION | CMD_PROXY);
    header.push(family | if stream { PROTO_STREAM } else { PROTO_DGRAM });
    header.extend_from_slice(&len.to_be_bytes());
    header.extend_from_slice(&body);
    Some(header)
}

/// Builds a LOCAL command header without addresses.
pub fn compose_local_header() -> Vec<u8> {
    let mut header = SIGNATURE.to_vec();
    header.extend_from_slice(&[VERSION | CMD_LOCAL, AF_UNSPEC, 0, 0]);
    header
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn v4_header() -> Vec<u8> {
        compose_header(
            "192.0.2.1:5300".parse().unwrap(),
            "198.51.100.1:53".parse().unwrap(),
            true,
            &[ProxyValue {
                kind: 0xE0,
                content: b"tag".to_vec(),
            }],
        )
        .unwrap()
    }

    #[test]
    fn parses_v4_with_values() {
        let mut buf = v4_header();
        buf.extend_from_slice(b"payload");
        let Parsed::Complete(header) = parse_header(&buf) else {
            panic!("header should be complete");
        };
        assert_eq!(header.consumed, buf.len() - 7);
        assert!(header.stream);
        assert_eq!(header.source, Some("192.0.2.1:5300".parse().unwrap()));
        assert_eq!(
            header.destination,
            Some("198.51.100.1:53".parse().unwrap())
        );
        assert_eq!(header.values.len(), 1);
        assert_eq!(header.values[0].content, b"tag");
    }

    #[test]
    fn parses_v6() {
        let buf = compose_header(
            "[2001:db8::1]:4000".parse().unwrap(),
            "[2001:db8::53]:53".parse().unwrap(),
            false,
            &[],
        )
        .unwrap();
        let Parsed::Complete(header) = parse_header(&buf) else {
            panic!("header should be complete");
        };
        assert_eq!(header.consumed, MIN_HEADER_SIZE + 36);
        assert!(!header.stream);
        assert_eq!(
            header.source,
            Some("[2001:db8::1]:4000".parse().unwrap())
        );
    }

    #[test]
    fn local_command_has_no_addresses() {
        let Parsed::Complete(header) = parse_header(&compose_local_header())
        else {
            panic!("header should be complete");
        };
        assert_eq!(header.consumed, MIN_HEADER_SIZE);
        assert_eq!(header.source, None);
    }

    #[rstest]
    #[case(0, MIN_HEADER_SIZE)]
    #[case(5, MIN_HEADER_SIZE - 5)]
    #[case(16, 12 + 3 + 3)]
    #[case(30, 4)]
    fn short_input_needs_more(#[case] have: usize, #[case] more: usize) {
        let buf = v4_header();
        assert_eq!(parse_header(&buf[..have]), Parsed::NeedMore(more));
    }

    #[test]
    fn bad_headers_are_invalid() {
        assert_eq!(parse_header(b"\r\n\r\nX"), Parsed::Invalid);

        let mut buf = v4_header();
        buf[12] = 0x11;
        assert_eq!(parse_header(&buf), Parsed::Invalid);

        let mut buf = v4_header();
        buf[13] = 0x31;
        assert_eq!(parse_header(&buf), Parsed::Invalid);

        // A value claiming more content than the header holds.
        let mut buf = v4_header();
        let last = buf.len() - 4;
        buf[last] = 0x10;
        assert_eq!(parse_header(&buf), Parsed::Invalid);
    }
}
