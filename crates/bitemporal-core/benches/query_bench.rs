use std::sync::Arc;

use bitemporal_core::{
    Attributes, EntitySchema, FieldKind, ManualClock, MemoryStore, Selector, TemporalRepository,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use time::{Duration, OffsetDateTime};

const ENTITIES: usize = 200;
const VERSIONS_PER_ENTITY: i64 = 10;

fn fixture() -> (TemporalRepository<MemoryStore>, Vec<Selector>) {
    let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
    let schema = EntitySchema::new("product")
        .field("sku", FieldKind::Text, true)
        .field("price", FieldKind::Integer, false);
    let mut repo = match TemporalRepository::with_clock(MemoryStore::new(), schema, clock.clone()) {
        Ok(repo) => repo,
        Err(err) => panic!("benchmark schema rejected: {err}"),
    };

    let mut selectors = Vec::with_capacity(ENTITIES);
    for index in 0..ENTITIES {
        let mut attributes = Attributes::new();
        attributes.insert("sku".to_string(), json!(format!("SKU-{index}")));
        attributes.insert("price".to_string(), json!(0));
        let created = match repo.create(attributes, Some(OffsetDateTime::UNIX_EPOCH)) {
            Ok(created) => created,
            Err(err) => panic!("benchmark create failed: {err}"),
        };
        let selector = Selector::Entity(created.entity_id);

        for step in 1..VERSIONS_PER_ENTITY {
            clock.advance(Duration::seconds(1));
            let mut overrides = Attributes::new();
            overrides.insert("price".to_string(), json!(step));
            let cutoff = OffsetDateTime::UNIX_EPOCH + Duration::days(step);
            if let Err(err) = repo.supersede(&selector, overrides, Some(cutoff)) {
                panic!("benchmark supersede failed: {err}");
            }
        }
        selectors.push(selector);
    }

    (repo, selectors)
}

fn bench_as_of(c: &mut Criterion) {
    let (repo, selectors) = fixture();
    let instant = OffsetDateTime::UNIX_EPOCH + Duration::hours(100);

    c.bench_function("as_of_2000_versions", |b| {
        b.iter(|| {
            for selector in &selectors {
                if let Err(err) = repo.as_of(selector, instant) {
                    panic!("as_of benchmark failed: {err}");
                }
            }
        });
    });
}

fn bench_history(c: &mut Criterion) {
    let (repo, selectors) = fixture();

    c.bench_function("history_2000_versions", |b| {
        b.iter(|| {
            for selector in &selectors {
                if let Err(err) = repo.history(selector) {
                    panic!("history benchmark failed: {err}");
                }
            }
        });
    });
}

criterion_group!(query_benches, bench_as_of, bench_history);
criterion_main!(query_benches);
