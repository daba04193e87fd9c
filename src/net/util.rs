use std::io;
use std::string::String;

//----------- to_pcap_text() -------------------------------------------------

/// Formats octets the way `text2pcap` expects them.
///
/// Used for trace level dumps of messages so they can be turned into a
/// packet capture for closer inspection.
pub(crate) fn to_pcap_text<T: AsRef<[u8]>>(
    bytes: T,
    num_bytes: usize,
) -> String {
    let bytes = bytes.as_ref();
    let mut formatted = String::from("000000");
    for octet in &bytes[..num_bytes.min(bytes.len())] {
        formatted.push_str(&format!(" {:02x}", octet));
    }
    formatted
}

//----------- is_os_limit() --------------------------------------------------

/// Returns whether an error means the process ran out of a local resource.
///
/// Running out of descriptors and having no route to the network are
/// local conditions the remote server cannot be blamed for.
pub(crate) fn is_os_limit(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENETUNREACH)
    )
}

//============ Tests =========================================================
