//! Round-robin policy: subjects dealt out in ascending id order.

use super::{
    subject_bucket_jobs, BucketAssignment, DistributionPolicy, PlanContext, Planner, TransferJob,
};
use crate::core::{TableMetadata, TableRef};
use crate::rules::SplitRule;

/// The subject at position `k` of the ascending distinct subject ids goes to
/// partition `k mod N`; dependent rows follow their subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobinPlanner;

impl Planner for RoundRobinPlanner {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::RoundRobin
    }

    fn plan_jobs(
        &self,
        table: &TableRef,
        rule: &SplitRule,
        metadata: &TableMetadata,
        ctx: &PlanContext,
    ) -> Vec<TransferJob> {
        let assignment = BucketAssignment::RoundRobin {
            subject_table: ctx.subject_table.clone(),
            subject_column: ctx.subject_column.clone(),
        };
        subject_bucket_jobs(table, rule, metadata, ctx, assignment)
    }
}
