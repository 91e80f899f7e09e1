//! FU fragmentation for H.265 NAL units (RFC 7798 section 4.4.3).
//! The 2-byte NAL header is copied with its type rewritten to 49 and a
//! third FU header byte carries the original type plus start/end bits.

pub fn fragment(nal: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let nal_type = (nal[0] >> 1) & 0x3f;
    let header0 = (nal[0] & 0x81) | (49 << 1);
    let header1 = nal[1];

    let mut payloads = Vec::new();
    let mut chunks = nal[2..].chunks(mtu).enumerate().peekable();
    while let Some((i, chunk)) = chunks.next() {
        let mut fu_header = nal_type;
        if i == 0 {
            fu_header = 0x80 | nal_type;
        }
        if chunks.peek().is_none() {
            fu_header = 0x40 | nal_type;
        }
        let mut payload = vec![header0, header1, fu_header];
        payload.extend_from_slice(chunk);
        payloads.push(payload);
    }
    payloads
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_trail_r() {
        // single 3000-byte NAL, type 1 (TRAIL_R)
        let mut nal = vec![1u8 << 1, 0x01];
        nal.extend(std::iter::repeat(0x55).take(2998));
        let payloads = fragment(&nal, 1200);
        assert_eq!(payloads.len(), 3);

        for payload in &payloads {
            // type field rewritten to 49, layer/TID bits preserved
            assert_eq!((payload[0] >> 1) & 0x3f, 49);
            assert_eq!(payload[1], 0x01);
            assert!(payload.len() <= 1203);
        }
        assert_eq!(payloads[0][2], 0x80 | 1);
        assert_eq!(payloads[1][2], 1);
        assert_eq!(payloads[2][2], 0x40 | 1);

        let rebuilt: Vec<u8> = payloads
            .iter()
            .flat_map(|p| p[3..].iter().copied())
            .collect();
        assert_eq!(rebuilt, nal[2..]);
    }

    #[test]
    fn test_fragment_preserves_forbidden_and_tid_bits() {
        let mut nal = vec![(19u8 << 1) | 0x01, 0x3f];
        nal.extend(std::iter::repeat(0).take(1500));
        let payloads = fragment(&nal, 1200);
        assert_eq!(payloads[0][0] & 0x81, 0x01);
        assert_eq!(payloads[0][2], 0x80 | 19);
        assert_eq!(payloads[1][2], 0x40 | 19);
    }
}
