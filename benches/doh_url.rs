use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use netmgr::http::url::{encode_dns_param, parse_url};

const URLS: [&str; 4] = [
    "https://dns.example.com/dns-query",
    "https://dns.example.com:8443/dns-query?dns=AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB",
    "http://127.0.0.1:8053/dns-query",
    "https://[2001:db8::1]/resolve?dns=AAABAAABAAAAAAAAA3d3dwdleGFtcGxlA2NvbQAAAQAB",
];

fn bench_parse(c: &mut Criterion) {
    for url in URLS {
        c.bench_with_input(BenchmarkId::new("parse_url", url), black_box(&url), |b, i| {
            b.iter(|| {
                let _ = parse_url(black_box(i));
            })
        });
    }
}

fn bench_encode(c: &mut Criterion) {
    let message = vec![0u8; 128];
    c.bench_function("encode_dns_param/128B", |b| {
        b.iter(|| encode_dns_param(black_box(&message)))
    });
}

criterion_group!(benches, bench_parse, bench_encode);
criterion_main!(benches);
