use byteorder::{ByteOrder, LittleEndian};

/// SipHash-2-4 over a 16-byte key. Hash keys are mixed exactly once per
/// key; Integer keys skip the mixer and hash to themselves.
pub fn siphash24(data: &[u8], key: &[u8; 16]) -> u64 {
    let k0 = LittleEndian::read_u64(&key[0..8]);
    let k1 = LittleEndian::read_u64(&key[8..16]);

    let mut v0 = k0 ^ 0x736f6d6570736575;
    let mut v1 = k1 ^ 0x646f72616e646f6d;
    let mut v2 = k0 ^ 0x6c7967656e657261;
    let mut v3 = k1 ^ 0x7465646279746573;

    macro_rules! sipround {
        () => {
            v0 = v0.wrapping_add(v1);
            v1 = v1.rotate_left(13);
            v1 ^= v0;
            v0 = v0.rotate_left(32);
            v2 = v2.wrapping_add(v3);
            v3 = v3.rotate_left(16);
            v3 ^= v2;
            v0 = v0.wrapping_add(v3);
            v3 = v3.rotate_left(21);
            v3 ^= v0;
            v2 = v2.wrapping_add(v1);
            v1 = v1.rotate_left(17);
            v1 ^= v2;
            v2 = v2.rotate_left(32);
        };
    }

    let len = data.len();
    let mut chunks = data.chunks_exact(8);

    for chunk in &mut chunks {
        let m = LittleEndian::read_u64(chunk);
        v3 ^= m;
        sipround!();
        sipround!();
        v0 ^= m;
    }

    // Final block: remaining bytes plus the length in the top byte.
    let mut tail = [0u8; 8];
    let rest = chunks.remainder();
    tail[..rest.len()].copy_from_slice(rest);
    tail[7] = (len & 0xff) as u8;
    let m = LittleEndian::read_u64(&tail);

    v3 ^= m;
    sipround!();
    sipround!();
    v0 ^= m;

    v2 ^= 0xff;
    sipround!();
    sipround!();
    sipround!();
    sipround!();

    v0 ^ v1 ^ v2 ^ v3
}
