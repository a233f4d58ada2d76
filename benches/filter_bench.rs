use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dfilter::*;

fn bench_compile_and_evaluate(c: &mut Criterion) {
    let registry = FieldRegistryBuilder::new()
        .field("ip.addr", FieldType::Ipv4)
        .field("tcp.port", FieldType::UInt16)
        .field("http.host", FieldType::String)
        .build();
    let macros = MacroTable::new(vec![MacroRecord::new("web", "tcp.port in {80 443 8080}")])
        .unwrap_or_default();
    let engine = FilterEngine::builder(registry).macros(macros).build();
    let filter_str = r#"ip.addr == 10.0.0.0/8 && ${web} && http.host matches "^www\.""#;

    let mut tree = ProtoTree::new();
    tree.add_parsed(engine.registry(), "ip.addr", "10.1.2.3").unwrap();
    tree.add_parsed(engine.registry(), "tcp.port", "443").unwrap();
    tree.add_parsed(engine.registry(), "http.host", "www.example.com").unwrap();

    c.bench_function("expand", |b| {
        b.iter(|| {
            let _ = engine.expand(black_box(filter_str));
        })
    });
    c.bench_function("compile", |b| {
        b.iter(|| {
            let _ = engine.compile(black_box(filter_str));
        })
    });
    let compiled = engine.compile(filter_str).unwrap();
    c.bench_function("evaluate", |b| {
        b.iter(|| {
            let _ = compiled.evaluate(black_box(&tree));
        })
    });
}

criterion_group!(benches, bench_compile_and_evaluate);
criterion_main!(benches);
