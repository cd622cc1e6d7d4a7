//! Hash policy: subjects assigned by a stable hash of their id.

use super::{
    subject_bucket_jobs, BucketAssignment, DistributionPolicy, PlanContext, Planner, TransferJob,
};
use crate::core::{TableMetadata, TableRef};
use crate::rules::SplitRule;

/// All rows of a subject land in `bucket(subject_id)`, across every table
/// that carries the subject column or derives from a parent that does.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashPlanner;

impl Planner for HashPlanner {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::Hash
    }

    fn plan_jobs(
        &self,
        table: &TableRef,
        rule: &SplitRule,
        metadata: &TableMetadata,
        ctx: &PlanContext,
    ) -> Vec<TransferJob> {
        subject_bucket_jobs(table, rule, metadata, ctx, BucketAssignment::Hash)
    }
}
