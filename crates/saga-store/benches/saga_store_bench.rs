use criterion::{Criterion, criterion_group, criterion_main};
use saga_store::{
    InMemorySagaStore, SagaInstance, SagaKey, SagaQuery, SagaStatus, SagaStore, StepPhase,
    StepRecord,
};

fn make_instance(key: &str) -> SagaInstance {
    SagaInstance::new(
        SagaKey::new(key),
        "booking-confirmation",
        serde_json::json!({
            "booking_id": key,
            "event_id": "evt-1",
            "seats": ["A1", "A2", "A3"]
        }),
    )
}

fn bench_create(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/create", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                store.create(make_instance("booking-1")).await.unwrap();
            });
        });
    });
}

fn bench_compare_and_swap_chain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_store/compare_and_swap_x3", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemorySagaStore::new();
                let mut current = store.create(make_instance("booking-1")).await.unwrap();
                for (index, step) in ["reserve_seats", "capture_payment", "confirm_booking"]
                    .into_iter()
                    .enumerate()
                {
                    let mut next = current.clone();
                    next.status = SagaStatus::Running;
                    next.current_step_index = index;
                    next.step_outcomes
                        .push(StepRecord::started(index, step, StepPhase::Forward));
                    current = store
                        .compare_and_swap(next, current.version)
                        .await
                        .unwrap();
                }
            });
        });
    });
}

fn bench_query_active(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemorySagaStore::new();

    rt.block_on(async {
        for i in 0..1000 {
            store
                .create(make_instance(&format!("booking-{i}")))
                .await
                .unwrap();
        }
    });

    c.bench_function("saga_store/query_active_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                store.query(SagaQuery::active().limit(100)).await.unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_create,
    bench_compare_and_swap_chain,
    bench_query_active
);
criterion_main!(benches);
