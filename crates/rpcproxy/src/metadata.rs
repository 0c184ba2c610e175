use std::net::SocketAddr;

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

/// Metadata key carrying the chain of caller addresses, one entry per hop.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers owned by the HTTP/2 and gRPC framing of each leg.
///
/// These are set by tonic itself on the leg they belong to and must not leak
/// from one leg to the other.
const TRANSPORT_HEADERS: &[&str] = &[
    "te",
    "content-type",
    "grpc-encoding",
    "grpc-accept-encoding",
    "grpc-status",
    "grpc-message",
    "grpc-status-details-bin",
];

/// Build the outgoing metadata for a backend call from the inbound call.
///
/// All application metadata is copied (never moved) and the caller's IP is
/// appended to [`FORWARDED_FOR`], after any entries earlier hops added. When
/// the peer address is unknown the copy is returned without a forwarded entry.
pub fn propagate(incoming: &MetadataMap, peer: Option<SocketAddr>) -> MetadataMap {
    let mut outgoing = incoming.clone();
    strip_transport_headers(&mut outgoing);

    if let Some(value) = peer.and_then(forwarded_value) {
        outgoing.append(FORWARDED_FOR, value);
    }

    outgoing
}

/// Drop the per-leg transport headers from a metadata map.
pub(crate) fn strip_transport_headers(metadata: &mut MetadataMap) {
    let mut headers = std::mem::take(metadata).into_headers();
    for key in TRANSPORT_HEADERS {
        headers.remove(*key);
    }
    *metadata = MetadataMap::from_headers(headers);
}

// The IP literal only; the port is meaningless past this hop. IPv4-mapped
// IPv6 peers are reported in their IPv4 form.
fn forwarded_value(peer: SocketAddr) -> Option<AsciiMetadataValue> {
    peer.ip().to_canonical().to_string().parse().ok()
}
