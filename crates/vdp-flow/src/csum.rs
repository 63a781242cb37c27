//! Incremental internet checksum updates
//!
//! RFC 1624 form: for every 16-bit word rewritten from `m` to `m'`, add
//! `~m + m'` into an accumulator, then fold the accumulator into the old
//! checksum as `HC' = ~(~HC + acc)`. All words are the big-endian values as
//! they sit on the wire. NAT keeps two accumulators: address edits feed
//! both the IP header checksum and the transport pseudo-header checksum,
//! port edits feed the transport checksum only.

use crate::ipv4;

/// Reserved diagnostic checksum; headers carrying it are never updated
pub const DIAG_IP_CSUM: u16 = 0xffff;

#[inline(always)]
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Accumulate a 16-bit word rewrite into `acc`
#[inline(always)]
pub fn diff16(acc: u32, old: u16, new: u16) -> u32 {
    acc + (!old) as u32 + new as u32
}

/// Accumulate a 32-bit field rewrite (two 16-bit words) into `acc`
#[inline(always)]
pub fn diff32(acc: u32, old: u32, new: u32) -> u32 {
    let acc = diff16(acc, (old >> 16) as u16, (new >> 16) as u16);
    diff16(acc, old as u16, new as u16)
}

/// Fold an accumulated difference into an existing checksum
#[inline(always)]
pub fn update(csum: u16, acc: u32) -> u16 {
    !fold((!csum) as u32 + acc)
}

/// Apply accumulated NAT differences to an IPv4 packet
///
/// `ip_acc` updates the IP header checksum, `transport_acc` the TCP/UDP
/// checksum when one is present. A UDP checksum of zero means "not
/// computed" and stays zero. The caller has already excluded fragment
/// continuations.
pub fn update_packet(header: &mut [u8], ip_acc: u32, transport_acc: u32) {
    let old = ipv4::checksum(header);
    ipv4::set_checksum(header, update(old, ip_acc));

    let proto = ipv4::protocol(header);
    let csum_off = match proto {
        ipv4::PROTO_TCP => 16,
        ipv4::PROTO_UDP => 6,
        _ => return,
    };

    let t = ipv4::transport_mut(header);
    if t.len() < csum_off + 2 {
        return;
    }
    let old = u16::from_be_bytes([t[csum_off], t[csum_off + 1]]);
    if proto == ipv4::PROTO_UDP && old == 0 {
        return;
    }
    t[csum_off..csum_off + 2].copy_from_slice(&update(old, transport_acc).to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(src: [u8; 4], dst: [u8; 4]) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[0] = 0x45;
        h[2] = 0x00;
        h[3] = 40;
        h[8] = 64;
        h[9] = ipv4::PROTO_TCP;
        h[12..16].copy_from_slice(&src);
        h[16..20].copy_from_slice(&dst);
        let c = ipv4::compute_checksum(&h);
        h[10..12].copy_from_slice(&c.to_be_bytes());
        h
    }

    #[test]
    fn test_incremental_matches_recompute() {
        let mut h = header([10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(ipv4::header_sum(&h), 0xffff);

        let old = ipv4::src(&h);
        let new = u32::from_be_bytes([172, 16, 5, 9]);
        let acc = diff32(0, old, new);
        ipv4::set_src(&mut h, new);
        let updated = update(ipv4::checksum(&h), acc);
        ipv4::set_checksum(&mut h, updated);

        assert_eq!(ipv4::header_sum(&h), 0xffff);
    }

    #[test]
    fn test_diff16_port_rewrite() {
        let mut h = header([10, 0, 0, 1], [10, 0, 0, 2]);
        // no IP field change: zero accumulator leaves checksum valid
        let updated = update(ipv4::checksum(&h), 0);
        ipv4::set_checksum(&mut h, updated);
        assert_eq!(ipv4::header_sum(&h), 0xffff);
    }

    #[cfg(test)]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn incremental_update_preserves_validity(
                src in any::<u32>(),
                dst in any::<u32>(),
                new_src in any::<u32>(),
                new_dst in any::<u32>(),
            ) {
                let mut h = header(src.to_be_bytes(), dst.to_be_bytes());
                prop_assert_eq!(ipv4::header_sum(&h), 0xffff);

                let mut acc = 0u32;
                acc = diff32(acc, ipv4::src(&h), new_src);
                ipv4::set_src(&mut h, new_src);
                acc = diff32(acc, ipv4::dst(&h), new_dst);
                ipv4::set_dst(&mut h, new_dst);

                let updated = update(ipv4::checksum(&h), acc);
                ipv4::set_checksum(&mut h, updated);
                prop_assert_eq!(ipv4::header_sum(&h), 0xffff);
            }
        }
    }
}
