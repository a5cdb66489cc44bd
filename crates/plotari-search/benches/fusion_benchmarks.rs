//! Benchmarks for the fusion step and the local index.
//!
//! Fusion runs once per search turn on `page_limit * candidate_multiplier`
//! hits per modality; the larger sizes here cover generous multipliers.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use plotari_core::types::{Property, SearchFilters};
use plotari_search::embedding::HashingEmbedder;
use plotari_search::fusion::{fuse, FusionWeights};
use plotari_search::index::{IndexHit, LocalPropertyIndex, SearchIndex};

const LISTING_COUNT: usize = 2_000;

fn listing(i: usize) -> Property {
    Property {
        id: format!("{:08}", i),
        address: format!("{} Maple Ave", i),
        city: Some(if i % 2 == 0 { "Springfield" } else { "Shelbyville" }.to_string()),
        state: Some("IL".to_string()),
        zipcode: None,
        price: Some(150_000.0 + (i % 50) as f64 * 10_000.0),
        bedrooms: Some((i % 5) as u32 + 1),
        bathrooms: Some(((i % 3) + 1) as f32),
        living_area: None,
        year_built: None,
        property_type: Some("house".to_string()),
        description: Some(format!(
            "Listing {} with a renovated kitchen, hardwood floors and a {} yard",
            i,
            if i % 3 == 0 { "large" } else { "small" }
        )),
        features: vec!["garage".to_string()],
        neighborhood: None,
        location: None,
        updated_at: None,
    }
}

fn hits(count: usize, offset: usize) -> Vec<IndexHit> {
    (0..count)
        .map(|i| {
            let record = listing(i + offset);
            IndexHit {
                id: record.id.clone(),
                score: 1.0 - i as f64 / count as f64,
                record,
            }
        })
        .collect()
}

fn bench_fuse(c: &mut Criterion) {
    let weights = FusionWeights::default();
    let mut group = c.benchmark_group("fuse");
    for size in [30, 300, 3_000] {
        // Half of each list overlaps with the other.
        let vector = hits(size, 0);
        let lexical = hits(size, size / 2);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                fuse(
                    black_box(vector.clone()),
                    black_box(lexical.clone()),
                    &weights,
                    10,
                )
            })
        });
    }
    group.finish();
}

fn bench_local_index(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let index = rt.block_on(async {
        let index = LocalPropertyIndex::new(Arc::new(HashingEmbedder::default()));
        for i in 0..LISTING_COUNT {
            index.insert(listing(i)).await.expect("insert");
        }
        index
    });
    let filters = SearchFilters {
        city: Some("Springfield".to_string()),
        bedrooms: Some(3),
        ..Default::default()
    };

    c.bench_function("lexical_search_2k", |b| {
        b.iter(|| {
            rt.block_on(index.lexical_search(
                black_box("large yard hardwood"),
                &filters,
                30,
            ))
        })
    });
}

criterion_group!(benches, bench_fuse, bench_local_index);
criterion_main!(benches);
