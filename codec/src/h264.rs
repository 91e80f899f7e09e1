//! FU-A fragmentation for H.264 NAL units that exceed the MTU
//! (RFC 6184 section 5.8).

/// Fragment one NAL unit into FU-A payloads of at most `mtu` fragment
/// bytes each. The caller sends NALs that fit in a single packet as-is.
pub fn fragment(nal: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let nal_type = nal[0] & 0x1f;
    let nri = nal[0] & 0xe0;
    let indicator = nri | 28;

    let mut payloads = Vec::new();
    let mut chunks = nal[1..].chunks(mtu).enumerate().peekable();
    while let Some((i, chunk)) = chunks.next() {
        let mut fu_header = nal_type;
        if i == 0 {
            fu_header = 0x80 | nal_type;
        }
        if chunks.peek().is_none() {
            fu_header = 0x40 | nal_type;
        }
        let mut payload = vec![indicator, fu_header];
        payload.extend_from_slice(chunk);
        payloads.push(payload);
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_three_pieces() {
        let mut nal = vec![0x65u8]; // NRI=3, type 5 (IDR)
        nal.extend(std::iter::repeat(0xab).take(2500));
        let payloads = fragment(&nal, 1200);
        assert_eq!(payloads.len(), 3);

        // indicator: original NRI with type 28
        for payload in &payloads {
            assert_eq!(payload[0], 0x60 | 28);
        }
        assert_eq!(payloads[0][1], 0x80 | 5);
        assert_eq!(payloads[1][1], 5);
        assert_eq!(payloads[2][1], 0x40 | 5);

        assert_eq!(payloads[0].len(), 1202);
        assert_eq!(payloads[1].len(), 1202);
        assert_eq!(payloads[2].len(), 102);

        // the fragments concatenate back to the NAL payload
        let rebuilt: Vec<u8> = payloads
            .iter()
            .flat_map(|p| p[2..].iter().copied())
            .collect();
        assert_eq!(rebuilt, nal[1..]);
    }

    #[test]
    fn test_fragment_single_piece_is_marked_last() {
        let nal = vec![0x41u8, 1, 2, 3];
        let payloads = fragment(&nal, 1200);
        assert_eq!(payloads.len(), 1);
        // a lone fragment carries the end bit, not the start bit
        assert_eq!(payloads[0][1], 0x40 | 1);
    }
}
