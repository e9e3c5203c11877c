//! IPv4 header helpers

use etherparse::Ipv4HeaderSlice;
use std::net::Ipv4Addr;

/// Destination address of an IPv4 packet, `None` if the header is invalid
pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
    Ipv4HeaderSlice::from_slice(packet)
        .ok()
        .map(|header| header.destination_addr())
}

/// Source address of an IPv4 packet, `None` if the header is invalid
pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
    Ipv4HeaderSlice::from_slice(packet)
        .ok()
        .map(|header| header.source_addr())
}

#[cfg(test)]
pub(crate) fn build(source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let builder =
        etherparse::PacketBuilder::ipv4(source.octets(), destination.octets(), 64).udp(4000, 5000);
    let mut packet = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut packet, payload)
        .expect("writing to a Vec cannot fail");
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addresses() {
        let packet = build(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 3), b"hello");

        assert_eq!(source(&packet), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(destination(&packet), Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_invalid_header() {
        assert_eq!(destination(&[]), None);
        assert_eq!(destination(&[0x60, 0, 0, 0]), None);
        assert_eq!(source(&[0x45; 8]), None);
    }
}
