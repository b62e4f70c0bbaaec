//! Failure deduplication across builders.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::metrics;
use crate::models::build::Build;
use crate::models::failure::FailureKind;
use crate::models::group::{CommitRef, FailureGroup, FailureSignature};
use crate::store::AnalysisStore;

/// The failure being grouped: its build, kind and regression window.
#[derive(Debug, Clone)]
pub struct GroupContext<'a> {
    pub build: &'a Build,
    pub kind: FailureKind,
    pub last_passed: Option<CommitRef>,
    pub first_failed: CommitRef,
}

#[derive(Debug, Clone)]
pub struct GroupMembership {
    pub group: FailureGroup,
    /// `false` when the failure joined a group another build started. A
    /// re-run of the representative build keeps `true`.
    pub is_new: bool,
}

/// Attaches the failure to an existing group with the same signature and an
/// overlapping window, or starts a new group anchored at this failure.
///
/// Returns `None` for an empty signature: nothing identifies the failure well
/// enough to share a root cause.
pub async fn find_or_create_group(
    store: &dyn AnalysisStore,
    signature: &FailureSignature,
    ctx: &GroupContext<'_>,
    now: DateTime<Utc>,
) -> Result<Option<GroupMembership>, StoreError> {
    if signature.is_empty() {
        return Ok(None);
    }
    let key = ctx.build.key();

    let candidates = store
        .find_failure_groups(&ctx.build.project, ctx.kind, signature)
        .await?;
    if let Some(mut group) = candidates
        .into_iter()
        .find(|g| g.overlaps(ctx.last_passed.as_ref(), &ctx.first_failed))
    {
        if group.representative_build == key {
            tracing::debug!(build = %key, group_id = %group.id, "Failure already anchors its group");
            return Ok(Some(GroupMembership {
                group,
                is_new: true,
            }));
        }
        if group.add_member(key.clone()) {
            store.update_failure_group(&group).await?;
        }
        tracing::info!(
            build = %key,
            group_id = %group.id,
            representative = %group.representative_build,
            "Failure joined existing group"
        );
        metrics::failure_grouped("joined");
        return Ok(Some(GroupMembership {
            group,
            is_new: false,
        }));
    }

    let group = FailureGroup {
        id: Uuid::new_v4(),
        project: ctx.build.project.clone(),
        bucket: ctx.build.bucket.clone(),
        kind: ctx.kind,
        representative_build: key.clone(),
        representative_build_id: ctx.build.build_id,
        last_passed_commit: ctx.last_passed.clone(),
        first_failed_commit: ctx.first_failed.clone(),
        output_nodes: signature.clone(),
        member_failure_keys: vec![key.clone()],
        created_at: now,
    };
    store.create_failure_group(&group).await?;
    tracing::info!(build = %key, group_id = %group.id, "Started failure group");
    metrics::failure_grouped("created");
    Ok(Some(GroupMembership {
        group,
        is_new: true,
    }))
}
