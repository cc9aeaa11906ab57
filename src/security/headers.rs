//! Hop-by-hop header rules.
//!
//! Connection-management headers only mean something to one transport hop.
//! They are stripped from device requests before forwarding, and from
//! upstream responses before they are copied back to the device.

/// Removed from inbound device requests.
pub const REQUEST_HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// Never copied from an upstream response. The device-facing layer sets
/// these itself.
pub const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "transfer-encoding",
    "content-length",
    "content-type",
    "connection",
    "keep-alive",
    "host",
];

fn contains_ignore_case(list: &[&str], name: &str) -> bool {
    list.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// True if `name` must not be forwarded upstream.
pub fn is_request_hop_by_hop(name: &str) -> bool {
    contains_ignore_case(REQUEST_HOP_BY_HOP, name)
}

/// True if `name` must not be relayed back to the device.
pub fn is_response_hop_by_hop(name: &str) -> bool {
    contains_ignore_case(RESPONSE_HOP_BY_HOP, name)
}
