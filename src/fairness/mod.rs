//! Subgroup fairness analysis
//!
//! Finds the slices of a labelled population where the oracle's accuracy
//! departs most from its overall accuracy.

pub mod subgroup;

pub use subgroup::{percentile, SubgroupPredicate, SubgroupRecord, SubgroupReport, SubgroupScanner};

use crate::data::Dataset;
use crate::error::Result;
use crate::explainability::config::SubgroupConfig;
use crate::oracle::{Oracle, OracleAdapter};

/// Single-feature scan of `data` (which must carry labels) for accuracy divergence
pub fn scan_subgroup_divergence(
    oracle: &dyn Oracle,
    data: &Dataset,
    config: &SubgroupConfig,
) -> Result<SubgroupReport> {
    let adapter = OracleAdapter::new(oracle);
    SubgroupScanner::new(config.clone()).scan(&adapter, data)
}
