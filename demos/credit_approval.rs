//! Credit Approval Example
//!
//! Explains a black-box credit model with every explainer in the crate.

use kolosal_explain::prelude::*;
use ndarray::Array2;
use polars::prelude::*;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Opaque scoring model over the encoded row (employment codes follow sorted category order)
fn credit_model() -> FnOracle {
    FnOracle::binary(|row: &[f64]| {
        let z = (row[0] - 650.0) / 20.0 + (row[1] - 45_000.0) / 25_000.0 + 0.4 * row[2];
        1.0 / (1.0 + (-z).exp())
    })
}

fn applicants(n: usize) -> anyhow::Result<DataFrame> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
    let employment = ["none", "full_time", "part_time"];
    let mut score = Vec::with_capacity(n);
    let mut income = Vec::with_capacity(n);
    let mut status = Vec::with_capacity(n);
    let mut approved = Vec::with_capacity(n);
    for _ in 0..n {
        let s: f64 = rng.gen_range(520.0..780.0);
        let i: f64 = rng.gen_range(15_000.0..110_000.0);
        let e = employment[rng.gen_range(0..3)];
        // Historical decisions were stricter for part-time workers
        let cutoff = if e == "part_time" { 670.0 } else { 650.0 };
        score.push(s);
        income.push(i);
        status.push(e);
        approved.push(i64::from(s > cutoff));
    }
    Ok(df!(
        "credit_score" => score,
        "income" => income,
        "employment" => status,
        "approved" => approved
    )?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kolosal_explain=info".into()),
        )
        .init();

    let df = applicants(800)?;
    let data = DatasetLoader::new()
        .with_label_column("approved")
        .from_dataframe(&df)?;
    println!("Background: {} rows, {} features", data.len(), data.n_features());

    let model = credit_model();
    let applicant = FeatureVector::new()
        .with("credit_score", 610.0)
        .with("income", 38_000.0)
        .with("employment", "part_time");

    let steps = FeatureSteps::new()
        .numeric("credit_score", [10.0, 25.0, 50.0])
        .numeric("income", [5_000.0, 10_000.0])
        .categorical("employment", ["full_time"])
        .with_bounds("credit_score", 300.0, 850.0);

    let config = ExplainerConfig::new();
    let report = ExplanationReporter::new(&model, &data)
        .with_config(config)
        .with_global_surrogate(true)
        .with_counterfactual(steps, Some(1))
        .with_subgroup_scan(&data)
        .report(&applicant)?;

    println!("\nExplanation report {}", report.id);
    for line in report.summary() {
        println!("  {}", line);
    }

    if let Some(surrogate) = &report.global_surrogate {
        println!("\nSurrogate rules (fidelity {:.3}):", surrogate.fidelity);
        for rule in surrogate.rules() {
            println!("  {}", rule);
        }
    }

    // The model itself can be queried through the adapter for spot checks
    let adapter = OracleAdapter::new(&model);
    let row = data.encode_row(&applicant)?;
    let batch = Array2::from_shape_vec((1, row.len()), row.to_vec())?;
    println!("\nApproval probability: {:.3}", adapter.class_score(&batch, 1)?[0]);

    Ok(())
}
