use std::net::{IpAddr, Ipv4Addr};

use bytes::{Bytes, BytesMut};
use criterion::{Criterion, criterion_group, criterion_main};

use dht_transport_codec::{Command, Kind, Message, PeerAddress, PeerId, PeerSocketAddress};

fn sample() -> Message {
    let peer = |id: u64, port: u16| {
        PeerAddress::new(
            PeerId::from_low_u64(id),
            PeerSocketAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, port),
        )
    };

    let mut message = Message::new(
        Command::DIRECT_DATA,
        Kind::Request1,
        peer(0x50, 2424),
        peer(0x20, 8088),
    );

    message.id = 1;
    message.ints = vec![4000, 4001, 4002];
    message.buffers = vec![Bytes::from(vec![0u8; 1024])];
    message
}

fn criterion_benchmark(c: &mut Criterion) {
    let message = sample();
    let mut bytes = BytesMut::with_capacity(2048);
    message.encode(&mut bytes, None).unwrap();

    c.bench_function("encode_message", |b| {
        b.iter(|| {
            sample().encode(&mut bytes, None).unwrap();
        })
    });

    c.bench_function("decode_message", |b| {
        b.iter(|| {
            Message::decode(&bytes[..]).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
