use bytes::{Buf, BufMut, Bytes, BytesMut};
use dht_transport::PeerId;

/// Small fixed-parameter Bloom filter over peer ids, the shape tracker
/// queries carry to exclude peers the requester already knows.
///
/// Double hashing over the two id halves; deterministic, so both ends
/// agree without negotiating hash seeds.
pub struct BloomFilter {
    bits: Vec<u8>,
    hashes: u8,
}

impl BloomFilter {
    pub fn new(bit_count: usize, _expected_items: usize) -> Self {
        Self {
            bits: vec![0u8; bit_count.div_ceil(8).max(1)],
            hashes: 3,
        }
    }

    fn positions(&self, id: &PeerId) -> impl Iterator<Item = usize> + '_ {
        fn mix(mut x: u64) -> u64 {
            x ^= x >> 33;
            x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
            x ^= x >> 33;
            x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
            x ^ (x >> 33)
        }

        let bytes = id.as_bytes();
        let high = u64::from_be_bytes(bytes[4..12].try_into().expect("peer id is 20 bytes"));
        let low = u64::from_be_bytes(bytes[12..20].try_into().expect("peer id is 20 bytes"));

        let h1 = mix(low ^ high.rotate_left(32));
        let h2 = mix(low.wrapping_add(0x9e37_79b9_7f4a_7c15) ^ high) | 1;
        let bit_count = (self.bits.len() * 8) as u64;

        (0..self.hashes as u64)
            .map(move |it| (h1.wrapping_add(it.wrapping_mul(h2)) % bit_count) as usize)
    }

    pub fn add(&mut self, id: &PeerId) {
        let positions = self.positions(id).collect::<Vec<_>>();
        for position in positions {
            self.bits[position / 8] |= 1 << (position % 8);
        }
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.positions(id)
            .all(|it| self.bits[it / 8] & (1 << (it % 8)) != 0)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(self.bits.len() + 5);
        bytes.put_u8(self.hashes);
        bytes.put_u32(self.bits.len() as u32);
        bytes.put(self.bits.as_slice());
        bytes.freeze()
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        if bytes.remaining() < 5 {
            return None;
        }

        let hashes = bytes.get_u8();
        let size = bytes.get_u32() as usize;
        if bytes.remaining() < size {
            return None;
        }

        Some(Self {
            hashes,
            bits: bytes[..size].to_vec(),
        })
    }
}

#[test]
fn bloom_membership() {
    let mut filter = BloomFilter::new(4096, 1000);
    let a = PeerId::from_low_u64(0x50);
    let b = PeerId::from_low_u64(0x20);

    filter.add(&a);
    assert!(filter.contains(&a));
    assert!(!filter.contains(&b));

    let decoded = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
    assert!(decoded.contains(&a));
    assert!(!decoded.contains(&b));
}
