//! Protocol encoding/decoding benchmarks.

use bytes::Bytes;
use comfoconnect_protocol::message::CnRpdoNotification;
use comfoconnect_protocol::{
    parse_uuid, property, Envelope, EnvelopeDecoder, MessageCodec, Opcode, Operation, Payload,
    PropertyType, PropertyValue, ProtobufCodec,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn rpdo_envelope(data_size: usize) -> Vec<u8> {
    let codec = ProtobufCodec::new();
    let operation = codec
        .encode_operation(&Operation::new(Opcode::CnRpdoNotification, 0))
        .unwrap();
    let payload = codec
        .encode_payload(
            Opcode::CnRpdoNotification,
            &Payload::RpdoNotification(CnRpdoNotification {
                pdid: 276,
                data: Bytes::from(vec![0x42; data_size]),
                zone: 1,
            }),
        )
        .unwrap();
    Envelope::to_bytes(
        parse_uuid("1").unwrap(),
        parse_uuid("2").unwrap(),
        &operation,
        &payload,
    )
    .unwrap()
    .to_vec()
}

fn bench_envelope_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode");
    let sender = parse_uuid("1").unwrap();
    let receiver = parse_uuid("2").unwrap();

    for size in [4, 100, 1000] {
        let payload = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(Envelope::to_bytes(sender, receiver, b"\x08\x29", payload).unwrap()));
        });
    }

    group.finish();
}

fn bench_envelope_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_decode");

    for size in [4, 100, 1000] {
        let encoded = rpdo_envelope(size);

        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| black_box(Envelope::decode(encoded, 0).unwrap()));
        });
    }

    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_decode");
    let codec = ProtobufCodec::new();

    for count in [1, 16, 256] {
        let stream: Vec<u8> = (0..count).flat_map(|_| rpdo_envelope(4)).collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stream, |b, stream| {
            b.iter(|| {
                let mut decoder = EnvelopeDecoder::new();
                decoder.extend(stream);
                while let Some(envelope) = decoder.decode_envelope().unwrap() {
                    let operation = codec.decode_operation(&envelope.operation).unwrap();
                    black_box(
                        codec
                            .decode_payload(operation.opcode, &envelope.payload)
                            .unwrap(),
                    );
                }
            });
        });
    }

    group.finish();
}

fn bench_property_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("property_codec");

    let cases = [
        (PropertyType::Uint8, PropertyValue::Uint(42)),
        (PropertyType::Int16, PropertyValue::Int(-210)),
        (PropertyType::Uint32, PropertyValue::Uint(1_049_600)),
        (PropertyType::Int64, PropertyValue::Int(i64::MIN)),
        (PropertyType::String, PropertyValue::Text("DEM0116153002".into())),
    ];

    for (data_type, value) in cases {
        let encoded = property::encode(data_type, &value).unwrap();

        group.bench_with_input(
            BenchmarkId::new("encode", data_type),
            &value,
            |b, value| {
                b.iter(|| black_box(property::encode(data_type, value).unwrap()));
            },
        );
        group.bench_with_input(
            BenchmarkId::new("decode", data_type),
            &encoded,
            |b, encoded| {
                b.iter(|| black_box(property::decode(data_type, encoded).unwrap()));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_envelope_encode,
    bench_envelope_decode,
    bench_stream_decode,
    bench_property_codec,
);

criterion_main!(benches);
