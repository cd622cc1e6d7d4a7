//! Uniform policy: contiguous ordinal blocks of near-equal size.

use super::{
    block_jobs, bucket_jobs, ordinal_order, parent_join, replicate_jobs, BucketAssignment,
    ColumnRef, DistributionPolicy, PlanContext, Planner, TransferJob,
};
use crate::core::{TableMetadata, TableRef};
use crate::rules::SplitRule;

/// Splits ordered rows into `N` blocks; partition `i` gets
/// `rows / N + (i < rows % N)` rows.
///
/// Join-derived rows are not cut by their own count: they follow the block
/// their parent's subject id falls into when the distinct subject ids are cut
/// the same way, so they land with that subject's row of the subject table.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPlanner;

impl Planner for UniformPlanner {
    fn policy(&self) -> DistributionPolicy {
        DistributionPolicy::Uniform
    }

    fn plan_jobs(
        &self,
        table: &TableRef,
        rule: &SplitRule,
        metadata: &TableMetadata,
        ctx: &PlanContext,
    ) -> Vec<TransferJob> {
        let n = ctx.partitions;
        match rule {
            SplitRule::FullReplicate => replicate_jobs(table, n),
            SplitRule::OrdinalRange { order_column } => block_jobs(
                table,
                n,
                metadata.row_count,
                None,
                ordinal_order(order_column, metadata),
            ),
            SplitRule::HashSplit { key_column } => bucket_jobs(
                table,
                n,
                None,
                ColumnRef::Child(key_column.clone()),
                BucketAssignment::Hash,
            ),
            SplitRule::JoinDerived {
                parent_subject_column,
                ..
            } => bucket_jobs(
                table,
                n,
                parent_join(rule),
                ColumnRef::Parent(parent_subject_column.clone()),
                BucketAssignment::SubjectBlock {
                    subject_table: ctx.subject_table.clone(),
                    subject_column: ctx.subject_column.clone(),
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RowFilter;
    use crate::testing::{assert_partitioned, planned_jobs, person_visit_fixture, MemoryDatabase};

    #[tokio::test]
    async fn test_every_split_table_is_exhaustive_and_disjoint() {
        let db = person_visit_fixture();
        for (table, rule, jobs) in planned_jobs(&db, &UniformPlanner, 4).await {
            assert_eq!(jobs.len(), 4);
            assert_partitioned(&db, &table, &rule, &jobs);
        }
    }

    #[tokio::test]
    async fn test_remainder_goes_to_first_partitions() {
        let db = person_visit_fixture();
        let jobs = planned_jobs(&db, &UniformPlanner, 4).await;
        let (_, _, person_jobs) = jobs
            .iter()
            .find(|(t, _, _)| t.name == "person")
            .unwrap();
        let sizes: Vec<usize> = person_jobs
            .iter()
            .map(|j| db.select(&j.table, &j.selection).len())
            .collect();
        // 10 people over 4 partitions
        assert_eq!(sizes, vec![3, 3, 2, 2]);
    }

    #[tokio::test]
    async fn test_101_rows_split_26_25_25_25() {
        let db = MemoryDatabase::new("cdm")
            .table("person", &["person_id"], &["person_id"])
            .rows("person", (1..=101).map(|i| vec![Some(i)]).collect());
        let jobs = planned_jobs(&db, &UniformPlanner, 4).await;
        let sizes: Vec<usize> = jobs[0]
            .2
            .iter()
            .map(|j| db.select(&j.table, &j.selection).len())
            .collect();
        assert_eq!(sizes, vec![26, 25, 25, 25]);
    }

    #[tokio::test]
    async fn test_replicated_table_gets_all_rows_everywhere() {
        let db = person_visit_fixture();
        for (table, rule, jobs) in planned_jobs(&db, &UniformPlanner, 3).await {
            if rule.is_replicated() {
                for job in &jobs {
                    assert_eq!(job.selection.filter, RowFilter::All);
                    assert_eq!(db.select(&table, &job.selection).len(), db.row_total(&table));
                }
            }
        }
    }

    #[tokio::test]
    async fn test_join_derived_rows_land_with_their_subject() {
        // person 1 owns most of the events, so cutting episode_event by its
        // own row count would split them across partitions.
        let db = MemoryDatabase::new("cdm")
            .table("person", &["person_id"], &["person_id"])
            .rows("person", (1..=7).map(|i| vec![Some(i)]).collect())
            .table("episode", &["episode_id", "person_id"], &["episode_id"])
            .rows(
                "episode",
                [(1, Some(1)), (2, Some(1)), (3, Some(1)), (4, Some(2))]
                    .into_iter()
                    .chain([(5, Some(4)), (6, Some(6)), (7, Some(7)), (8, None)])
                    .map(|(id, person)| vec![Some(id), person])
                    .collect(),
            )
            .table("episode_event", &["episode_id", "event_id"], &[])
            .rows(
                "episode_event",
                (1..=12)
                    .map(|e| vec![Some(1), Some(e)])
                    .chain([4, 5, 6, 7, 8, 99].map(|ep| vec![Some(ep), Some(100 + ep)]))
                    .chain([vec![None, Some(200)]])
                    .collect(),
            )
            .foreign_key("episode", "person")
            .foreign_key("episode_event", "episode");

        let planned = planned_jobs(&db, &UniformPlanner, 3).await;
        let find = |name: &str| planned.iter().find(|(t, _, _)| t.name == name).unwrap();
        let (person, _, person_jobs) = find("person");
        let (events, rule, event_jobs) = find("episode_event");
        assert!(matches!(rule, SplitRule::JoinDerived { .. }));
        assert_partitioned(&db, events, rule, event_jobs);

        let mut sizes = Vec::new();
        for (i, job) in event_jobs.iter().enumerate() {
            assert_eq!(job.partition_index, i);
            let people: Vec<Option<i64>> = db
                .select(person, &person_jobs[i].selection)
                .into_iter()
                .map(|row| row[0])
                .collect();
            let rows = db.select(events, &job.selection);
            for row in &rows {
                match db.lookup("episode", "episode_id", row[0], "person_id") {
                    Some(subject) => assert!(
                        people.contains(&Some(subject)),
                        "event {:?} of person {} is not in partition {}",
                        row[1],
                        subject,
                        i
                    ),
                    // no parent or no subject
                    None => assert_eq!(i, 0),
                }
            }
            sizes.push(rows.len());
        }
        // people split 1-3, 4-5, 6-7
        assert_eq!(sizes, vec![16, 1, 2]);
    }
}
