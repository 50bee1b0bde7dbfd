//! Minimal DNS wire format handling.
//!
//! Only what the proxy needs: read the first question of a query and
//! synthesise an NXDOMAIN answer for it. Queries never use name compression,
//! so a pointer in the question is treated as malformed.

use super::error::DnsError;

/// Size of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

const MAX_NAME_LEN: usize = 255;
const FLAG_QR: u8 = 0x80;
const FLAG_RD: u8 = 0x01;
const MASK_OPCODE: u8 = 0x78;
const FLAG_RA: u8 = 0x80;
const RCODE_NXDOMAIN: u8 = 0x03;

/// The first question of a DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    /// Transaction ID.
    pub id: u16,
    /// Lowercased name without the trailing dot.
    pub name: String,
    /// Query type (1 = A, 28 = AAAA, ...).
    pub qtype: u16,
    /// Query class.
    pub qclass: u16,
    /// Offset one past the end of the question in the datagram.
    pub end: usize,
}

fn read_u16(packet: &[u8], offset: usize, what: &'static str) -> Result<u16, DnsError> {
    packet
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated(what))
}

/// Parse the header and first question of a query datagram.
pub fn parse_query(packet: &[u8]) -> Result<DnsQuestion, DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Truncated("header"));
    }
    if packet[2] & FLAG_QR != 0 {
        return Err(DnsError::NotAQuery);
    }

    let id = read_u16(packet, 0, "header")?;
    if read_u16(packet, 4, "header")? == 0 {
        return Err(DnsError::NoQuestion);
    }

    let mut offset = HEADER_LEN;
    let mut labels: Vec<String> = Vec::new();
    let mut name_len = 0usize;
    loop {
        let len = *packet.get(offset).ok_or(DnsError::Truncated("question name"))? as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return Err(DnsError::CompressedName);
        }
        let label = packet
            .get(offset..offset + len)
            .ok_or(DnsError::Truncated("question label"))?;
        name_len += len + 1;
        if name_len > MAX_NAME_LEN {
            return Err(DnsError::NameTooLong);
        }
        labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
        offset += len;
    }

    let qtype = read_u16(packet, offset, "question type")?;
    let qclass = read_u16(packet, offset + 2, "question class")?;

    Ok(DnsQuestion {
        id,
        name: labels.join("."),
        qtype,
        qclass,
        end: offset + 4,
    })
}

/// Build an NXDOMAIN response to `query`.
///
/// The transaction ID, the OPCODE and RD bits and the first question are
/// copied from the query. QDCOUNT is 1; all other counts are zero.
pub fn nxdomain(query: &[u8], question: &DnsQuestion) -> Vec<u8> {
    let mut response = Vec::with_capacity(question.end);
    response.extend_from_slice(&query[0..2]);
    response.push(FLAG_QR | (query[2] & (MASK_OPCODE | FLAG_RD)));
    response.push(FLAG_RA | RCODE_NXDOMAIN);
    response.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    response.extend_from_slice(&query[HEADER_LEN..question.end]);
    response
}

/// Human-readable name for common query types.
pub fn qtype_name(qtype: u16) -> String {
    match qtype {
        1 => "A".to_string(),
        5 => "CNAME".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        65 => "HTTPS".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
pub(crate) fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // RD
    packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet
}
