//! Integration tests for subgroup divergence scanning

use kolosal_explain::prelude::*;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Loan applicants whose true label depends on income and region, scored by an
/// oracle that ignores region
fn loan_population(n: usize) -> (FnOracle, Dataset) {
    let schema = Schema::new(vec![
        FeatureSpec::numeric("income"),
        FeatureSpec::numeric("age"),
        FeatureSpec::categorical("region", ["urban", "suburban", "rural"]),
    ])
    .unwrap();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(2024);
    let mut rows = Vec::with_capacity(n);
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let income: f64 = rng.gen_range(20_000.0..120_000.0);
        let age: f64 = rng.gen_range(18.0..80.0);
        let region = ["urban", "suburban", "rural"][rng.gen_range(0..3)];
        let approved = if region == "rural" {
            income > 40_000.0
        } else {
            income > 60_000.0
        };
        rows.push(
            FeatureVector::new()
                .with("income", income)
                .with("age", age)
                .with("region", region),
        );
        labels.push(usize::from(approved));
    }
    let oracle = FnOracle::new(|x: &Array2<f64>| {
        Ok(x.rows()
            .into_iter()
            .map(|r| usize::from(r[0] > 60_000.0))
            .collect())
    });
    (oracle, Dataset::new(schema, rows, Some(labels)).unwrap())
}

#[test]
fn test_report_is_sorted_by_absolute_divergence() {
    let (oracle, data) = loan_population(600);
    let report = scan_subgroup_divergence(&oracle, &data, &SubgroupConfig::default()).unwrap();

    assert!(!report.is_empty());
    for pair in report.records.windows(2) {
        assert!(pair[0].divergence.abs() >= pair[1].divergence.abs());
    }
}

#[test]
fn test_rural_subgroup_is_flagged() {
    let (oracle, data) = loan_population(600);
    let report = scan_subgroup_divergence(&oracle, &data, &SubgroupConfig::default()).unwrap();

    let rural = report
        .records
        .iter()
        .find(|r| r.description == "region == rural")
        .unwrap();
    assert!(rural.divergence > 0.0);
    assert!(rural.accuracy < report.overall_accuracy);

    let urban = report
        .records
        .iter()
        .find(|r| r.description == "region == urban")
        .unwrap();
    assert!(urban.divergence < 0.0);
    assert_eq!(urban.accuracy, 1.0);
}

#[test]
fn test_divergence_definition() {
    let (oracle, data) = loan_population(300);
    let report = scan_subgroup_divergence(&oracle, &data, &SubgroupConfig::default()).unwrap();
    for record in &report.records {
        assert_eq!(record.overall_accuracy, report.overall_accuracy);
        assert!((record.divergence - (record.overall_accuracy - record.accuracy)).abs() < 1e-12);
        assert!(record.size >= report.min_size);
    }
}

#[test]
fn test_fractional_min_size_and_top_k() {
    let (oracle, data) = loan_population(400);
    let config = SubgroupConfig::default()
        .with_min_size(MinSize::Fraction(0.25))
        .with_top_k(3);
    let report = scan_subgroup_divergence(&oracle, &data, &config).unwrap();

    assert_eq!(report.min_size, 100);
    assert!(report.len() <= 3);
    assert!(report.records.iter().all(|r| r.size >= 100));
}

#[test]
fn test_custom_percentiles() {
    let (oracle, data) = loan_population(200);
    let config = SubgroupConfig::default()
        .with_percentiles(vec![50.0])
        .with_min_size(MinSize::Absolute(1));
    let report = scan_subgroup_divergence(&oracle, &data, &config).unwrap();
    // One median split per numeric feature plus one record per region
    assert_eq!(report.len(), 2 + 3);
}
