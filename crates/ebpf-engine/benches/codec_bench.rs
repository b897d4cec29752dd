//! 룰 테이블 코덱 / LPM 분류 벤치마크
//!
//! 인코딩, 버킷 바이트 변환, 유저스페이스 분류 성능을 측정합니다.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use infw_core::types::{IngressRule, InterfaceRules, PortRule, Protocol, ProtocolRule, RuleAction};
use infw_engine::attach::StaticIfIndexResolver;
use infw_engine::codec::{decode_bucket, encode, encode_bucket};
use infw_engine::index::PrefixMatchIndex;
use infw_engine::infw_ebpf_common::{PROTO_TCP, PacketMeta};

fn create_rules(prefixes: usize, rules_per_prefix: u32) -> InterfaceRules {
    let ingress = (0..prefixes)
        .map(|i| IngressRule {
            source_cidrs: vec![format!("10.{}.{}.0/24", i / 256, i % 256)],
            protocol_rules: (1..=rules_per_prefix)
                .map(|order| ProtocolRule {
                    order,
                    protocol: Protocol::Tcp,
                    protocol_rule: Some(PortRule {
                        ports: format!("{}", 1000 + order),
                    }),
                    icmp_rule: None,
                    action: if order % 2 == 0 {
                        RuleAction::Allow
                    } else {
                        RuleAction::Deny
                    },
                })
                .collect(),
        })
        .collect();

    let mut rules = InterfaceRules::new();
    rules.insert("eth0".to_owned(), ingress);
    rules
}

fn resolver() -> StaticIfIndexResolver {
    StaticIfIndexResolver::new([("eth0", 2)])
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let resolver = resolver();

    for prefixes in [1usize, 64, 512] {
        let rules = create_rules(prefixes, 100);
        group.throughput(Throughput::Elements(prefixes as u64 * 100));
        group.bench_with_input(BenchmarkId::from_parameter(prefixes), &rules, |b, rules| {
            b.iter(|| encode(black_box(rules), &resolver).unwrap());
        });
    }
    group.finish();
}

fn bench_bucket_bytes(c: &mut Criterion) {
    let table = encode(&create_rules(1, 100), &resolver()).unwrap();
    let (_, bucket) = table.iter().next().unwrap();
    let bytes = encode_bucket(bucket);

    let mut group = c.benchmark_group("bucket_bytes");
    group.bench_function("encode", |b| b.iter(|| encode_bucket(black_box(bucket))));
    group.bench_function("decode", |b| b.iter(|| decode_bucket(black_box(&bytes)).unwrap()));
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let table = encode(&create_rules(512, 100), &resolver()).unwrap();
    let index = PrefixMatchIndex::new(&table, RuleAction::Allow).unwrap();
    let pkt = PacketMeta {
        protocol: PROTO_TCP,
        dst_port: 1100,
        icmp_type: 0,
        icmp_code: 0,
    };

    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(1));
    group.bench_function("last_rule_hit", |b| {
        let src = "10.1.255.7".parse().unwrap();
        b.iter(|| index.classify(2, black_box(src), black_box(&pkt)));
    });
    group.bench_function("no_prefix", |b| {
        let src = "192.168.1.1".parse().unwrap();
        b.iter(|| index.classify(2, black_box(src), black_box(&pkt)));
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_bucket_bytes, bench_classify);
criterion_main!(benches);
