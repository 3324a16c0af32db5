//! Payload extraction from captured frames.
//!
//! Reports mirrored to the CPU port arrive as whole Ethernet frames. The
//! NetCache header is the UDP or TCP payload of that frame.

use crate::error::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const UDP_HEADER_LEN: usize = 8;
const MIN_TCP_HEADER_LEN: usize = 20;

/// Return the transport payload of an Ethernet II / IPv4 / (UDP | TCP) frame.
pub fn extract_payload(frame: &[u8]) -> Result<&[u8]> {
    let mut offset = ETHERNET_HEADER_LEN;
    let mut ethertype = read_u16(frame, 12)?;
    if ethertype == ETHERTYPE_VLAN {
        ethertype = read_u16(frame, 16)?;
        offset += VLAN_TAG_LEN;
    }
    if ethertype != ETHERTYPE_IPV4 {
        return Err(Error::Format(format!(
            "unsupported ethertype {:#06x}",
            ethertype
        )));
    }

    let ip = frame
        .get(offset..)
        .filter(|ip| ip.len() >= 20)
        .ok_or_else(|| truncated("IPv4 header"))?;
    if ip[0] >> 4 != 4 {
        return Err(Error::Format("not an IPv4 packet".into()));
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    let protocol = ip[9];
    let transport = ip.get(ihl..).ok_or_else(|| truncated("IPv4 options"))?;

    match protocol {
        IPPROTO_UDP => transport
            .get(UDP_HEADER_LEN..)
            .ok_or_else(|| truncated("UDP header")),
        IPPROTO_TCP => {
            if transport.len() < MIN_TCP_HEADER_LEN {
                return Err(truncated("TCP header"));
            }
            let data_offset = ((transport[12] >> 4) as usize) * 4;
            transport
                .get(data_offset..)
                .ok_or_else(|| truncated("TCP options"))
        }
        other => Err(Error::Format(format!(
            "unsupported IP protocol {}",
            other
        ))),
    }
}

fn read_u16(frame: &[u8], at: usize) -> Result<u16> {
    frame
        .get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| truncated("Ethernet header"))
}

fn truncated(what: &str) -> Error {
    Error::Format(format!("frame truncated in {}", what))
}
