//! Criterion benchmarks for hot paths in the OCPP-J RPC framework.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - wire frame encode/decode (serde_json + the 3/5-tuple shape check)
//!   - JSON Schema validation (the validator registry's hot path)
//!   - rate limiter token-bucket check

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ocppjd::rate_limiter::RateLimiterRegistry;
use ocppjd::validator::{SchemaKind, ValidatorRegistry};
use ocppjd::wire::Message;
use serde_json::json;

fn bench_wire_roundtrip(c: &mut Criterion) {
    let call = Message::call(
        "1",
        "BootNotification",
        json!({"chargePointModel": "M", "chargePointVendor": "V"}),
    );
    let wire = call.to_wire_string();

    c.bench_function("wire_serialize_call", |b| {
        b.iter(|| {
            let s = black_box(&call).to_wire_string();
            black_box(s);
        });
    });

    c.bench_function("wire_parse_call", |b| {
        b.iter(|| {
            let parsed = Message::parse(black_box(&wire)).unwrap();
            black_box(parsed);
        });
    });

    let result = Message::call_result("1", json!({"status": "Accepted", "interval": 300}));
    let result_wire = result.to_wire_string();
    c.bench_function("wire_parse_call_result", |b| {
        b.iter(|| {
            let parsed = Message::parse(black_box(&result_wire)).unwrap();
            black_box(parsed);
        });
    });
}

fn bench_schema_validation(c: &mut Criterion) {
    let registry = ValidatorRegistry::new();
    registry
        .register(
            "Authorize",
            SchemaKind::Request,
            &json!({
                "type": "object",
                "properties": {
                    "idTag": { "type": "string", "maxLength": 20 }
                },
                "required": ["idTag"]
            }),
        )
        .unwrap();

    let payload = json!({"idTag": "ABC123"});
    c.bench_function("validator_check_valid_payload", |b| {
        b.iter(|| {
            let r = registry.validate("Authorize", SchemaKind::Request, black_box(&payload));
            black_box(r).ok();
        });
    });

    let bad_payload = json!({});
    c.bench_function("validator_check_invalid_payload", |b| {
        b.iter(|| {
            let r = registry.validate("Authorize", SchemaKind::Request, black_box(&bad_payload));
            black_box(r).ok();
        });
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    use ocppjd::config::RateLimitConfig;

    c.bench_function("rate_limiter_check_same_method", |b| {
        let registry = RateLimiterRegistry::new(RateLimitConfig {
            global_limit: 1_000_000,
            global_window_ms: 1_000,
            per_method_limit: 1_000_000,
            per_method_window_ms: 1_000,
        });
        let rt = tokio::runtime::Runtime::new().unwrap();
        b.iter(|| {
            rt.block_on(async { black_box(registry.check("Heartbeat").await) });
        });
    });
}

criterion_group!(
    benches,
    bench_wire_roundtrip,
    bench_schema_validation,
    bench_rate_limiter
);
criterion_main!(benches);
