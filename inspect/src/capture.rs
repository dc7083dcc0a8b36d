//! SCO capture files.
//!
//! A capture holds the received SCO packets of one call, extracted from a
//! btsnoop dump. Each packet is stored as:
//!
//! ```text
//! byte 0   0x01
//! byte 1   (hci_status << 4) | 0x01
//! byte 2   data length
//! byte 3.. data
//! ```

use anyhow::{bail, Context, Result};
use sco::PacketStatus;
use std::path::Path;
use tracing::info;

/// First byte of every stored packet.
pub const CAPTURE_PACKET_MARKER: u8 = 0x01;

/// Bytes in front of each packet's data.
pub const CAPTURE_HEADER_LEN: usize = 3;

/// One received SCO packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedPacket {
    // ---
    /// HCI receive status reported with the packet
    pub status: PacketStatus,

    /// Packet payload as it came off the link
    pub data: Vec<u8>,
}

/// Parses a whole capture.
///
/// # Errors
///
/// Returns error on a malformed header or a packet cut short by the end
/// of the file.
pub fn parse_capture(bytes: &[u8]) -> Result<Vec<CapturedPacket>> {
    // ---
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let header = bytes
            .get(pos..pos + CAPTURE_HEADER_LEN)
            .with_context(|| format!("truncated packet header at offset {pos}"))?;
        if header[0] != CAPTURE_PACKET_MARKER || header[1] & 0x0f != 0x01 {
            bail!(
                "bad packet header {:02x} {:02x} at offset {pos}",
                header[0],
                header[1]
            );
        }

        let len = usize::from(header[2]);
        let start = pos + CAPTURE_HEADER_LEN;
        let data = bytes
            .get(start..start + len)
            .with_context(|| format!("packet at offset {pos} truncated, wants {len} bytes"))?;

        packets.push(CapturedPacket {
            status: PacketStatus(header[1] >> 4),
            data: data.to_vec(),
        });
        pos = start + len;
    }

    Ok(packets)
}

/// Reads and parses a capture file.
pub fn read_capture<P: AsRef<Path>>(path: P) -> Result<Vec<CapturedPacket>> {
    // ---
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read capture: {}", path.display()))?;
    let packets =
        parse_capture(&bytes).with_context(|| format!("invalid capture: {}", path.display()))?;

    let flagged = packets.iter().filter(|p| p.status.is_bad()).count();
    info!(
        "Loaded {} packets from {} ({} with erroneous status)",
        packets.len(),
        path.display(),
        flagged
    );
    Ok(packets)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn stored(status: u8, data: &[u8]) -> Vec<u8> {
        // ---
        let mut out = vec![CAPTURE_PACKET_MARKER, (status << 4) | 0x01, data.len() as u8];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parses_status_and_data() {
        // ---
        let mut bytes = stored(0, &[1, 2, 3]);
        bytes.extend(stored(1, &[9; 60]));

        let packets = parse_capture(&bytes).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].data, vec![1, 2, 3]);
        assert!(!packets[0].status.is_bad());
        assert_eq!(packets[1].status, PacketStatus(1));
        assert_eq!(packets[1].data.len(), 60);
    }

    #[test]
    fn empty_capture_is_valid() {
        assert!(parse_capture(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_header() {
        // ---
        let err = parse_capture(&[0x02, 0x01, 0x00]).unwrap_err();
        assert!(err.to_string().contains("bad packet header"));
        assert!(parse_capture(&[0x01, 0x00, 0x00]).is_err());
    }

    #[test]
    fn rejects_truncation() {
        // ---
        let mut bytes = stored(0, &[5; 10]);
        bytes.truncate(8);
        assert!(parse_capture(&bytes).is_err());
        assert!(parse_capture(&[0x01, 0x01]).is_err());
    }
}
