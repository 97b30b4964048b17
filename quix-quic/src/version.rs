//! Version negotiation (draft-12 Section 4.3).

use crate::error::{Error, QuicError, Result};
use crate::packet::Header;
use crate::ConnectionId;

/// The wire version this endpoint speaks: draft-12.
pub const VERSION_DRAFT_12: u32 = 0xff00_000c;

/// Versions offered in Version Negotiation packets, preferred first.
pub const SUPPORTED_VERSIONS: [u32; 1] = [VERSION_DRAFT_12];

pub fn is_supported(version: u32) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// Pick the version to continue with after Version Negotiation.
///
/// The highest version present in both the peer's list and ours wins.
/// (Comparing 4-byte versions numerically matches the byte-wise ordering
/// of the source implementation; the IETF defines no ordering, and real
/// deployments should follow the peer's preference order instead.)
pub fn select_version(peer_list: &[u32]) -> Result<u32> {
    peer_list
        .iter()
        .copied()
        .filter(|v| is_supported(*v))
        .max()
        .ok_or(Error::Quic(QuicError::VersionNegotiationError))
}

/// Build a Version Negotiation packet echoing the client's IDs.
pub fn negotiation_packet(client_scid: ConnectionId, client_dcid: ConnectionId) -> Result<Vec<u8>> {
    // Source and destination swap roles on the way back.
    let header =
        Header::version_negotiation(client_scid, client_dcid, SUPPORTED_VERSIONS.to_vec());
    let mut out = Vec::new();
    header.encode(&mut out)?;
    Ok(out)
}
