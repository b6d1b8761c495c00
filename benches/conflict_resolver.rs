use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dots_server::core::conflict::{check_overlap, ResolvedScope};
use dots_server::core::scope::{MitigationScope, ScopeInput};
use dots_server::core::target::{PortRangeInput, ResolvedTargets};

fn resolved(customer_id: i64, mid: i64, prefix: String) -> ResolvedScope {
    let input = ScopeInput {
        mitigation_id: mid,
        target_prefix: vec![prefix],
        target_port_range: vec![PortRangeInput {
            lower_port: 80,
            upper_port: Some(443),
        }],
        target_protocol: vec![6, 17],
        lifetime: Some(3600),
        ..Default::default()
    };
    let mut scope = MitigationScope::from_input(customer_id, &format!("client-{}", customer_id), None, &input, Utc::now())
        .expect("valid benchmark scope");
    scope.scope_instance_id = mid;
    let targets = ResolvedTargets::new(&scope.targets, &[]);
    ResolvedScope::new(scope, targets)
}

fn conflict_resolver_benchmark(c: &mut Criterion) {
    // 1000 live mitigations spread over 10.0.0.0/8, none overlapping the candidate
    let existing: Vec<ResolvedScope> = (0..1000)
        .map(|i| resolved(i % 50 + 2, i + 1, format!("10.{}.{}.0/24", i / 256, i % 256)))
        .collect();
    let candidate = resolved(1, 1, "192.0.2.0/24".to_string());

    c.bench_function("check_overlap_1000_disjoint", |b| {
        b.iter(|| check_overlap(black_box(&candidate), black_box(&existing), true, Utc::now()))
    });

    let hit = resolved(1, 1, "10.3.0.0/16".to_string());
    c.bench_function("check_overlap_1000_with_conflict", |b| {
        b.iter(|| check_overlap(black_box(&hit), black_box(&existing), true, Utc::now()))
    });
}

criterion_group!(benches, conflict_resolver_benchmark);
criterion_main!(benches);
