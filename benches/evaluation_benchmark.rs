use criterion::Criterion;
use criterion::{criterion_group, criterion_main};
use featgate::{Attributes, Context, FeatureDefinition};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

fn context() -> Arc<Context> {
    let features: HashMap<String, FeatureDefinition> = serde_json::from_str(
        r#"{
            "targeted": {
                "defaultValue": false,
                "rules": [
                    {"condition": {"$and": [{"country": {"$in": ["US", "CA"]}}, {"age": {"$gte": 18}}]}, "force": true}
                ]
            },
            "experiment": {
                "defaultValue": "control",
                "rules": [{"key": "exp1", "variations": ["control", "a", "b"], "weights": [0.4, 0.3, 0.3]}]
            }
        }"#,
    )
    .unwrap();
    let context = Context::new();
    context.set_features(Arc::new(features));
    context.set_attributes(
        Attributes::new()
            .id("user-42")
            .with("country", "US")
            .with("age", 31),
    );
    Arc::new(context)
}

fn eval_feature_bench(c: &mut Criterion) {
    let context = context();
    c.bench_function("eval_targeted_feature", |b| {
        b.iter(|| context.is_on("targeted"));
    });
    c.bench_function("eval_experiment_feature", |b| {
        b.iter(|| context.eval_feature("experiment"));
    });
    c.bench_function("eval_from_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let context = Arc::clone(&context);
                    thread::spawn(move || {
                        for _ in 0..100 {
                            context.eval_feature("experiment");
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });
    });
}

criterion_group!(benches, eval_feature_bench);
criterion_main!(benches);
