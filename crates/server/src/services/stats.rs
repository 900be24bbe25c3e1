// Per-user project counters. Stats are derived from the projects
// themselves and written back onto the profile on every recalculation.

use futures::future::join_all;
use serde::Serialize;

use crate::{
    db::models::{Project, ProjectState, Scope, UserStats},
    error::Result,
    feed::{normalize::normalize_all, query::union_documents},
    store::{Predicate, ProjectQuery, ProjectStore},
};

const ALL_SCOPES: [Scope; 5] = [
    Scope::Grupal,
    Scope::Local,
    Scope::State,
    Scope::National,
    Scope::Global,
];

/// Outcome of a fan-out where single items may fail without failing the
/// whole operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartialResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

fn bump(building: &mut u32, implementing: &mut u32, done: &mut u32, state: ProjectState) {
    match state {
        ProjectState::Building => *building += 1,
        ProjectState::Implementing => *implementing += 1,
        ProjectState::Done => *done += 1,
    }
}

pub fn count_projects(created: &[Project], collaborated: &[Project], supports_given: u32) -> UserStats {
    let mut stats = UserStats {
        supports_given,
        ..Default::default()
    };
    for project in created {
        bump(
            &mut stats.created_building,
            &mut stats.created_implementing,
            &mut stats.created_done,
            project.state,
        );
    }
    for project in collaborated {
        bump(
            &mut stats.collaborated_building,
            &mut stats.collaborated_implementing,
            &mut stats.collaborated_done,
            project.state,
        );
    }
    stats
}

pub async fn compute(store: &ProjectStore, user_id: &str) -> Result<UserStats> {
    let created = store
        .query(&ProjectQuery::new(Predicate::Creator(user_id.to_string())))
        .await?;

    let mut collaborated = Vec::with_capacity(ALL_SCOPES.len());
    for scope in ALL_SCOPES {
        let query = ProjectQuery::new(Predicate::ScopeAndCollaborator(scope, user_id.to_string()));
        collaborated.push(store.query(&query).await?);
    }
    let collaborated = union_documents(collaborated);

    // Legacy numeric `supports` values are scalars, so json_each yields a
    // single non-matching row for them.
    let supports_given = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM projects p, json_each(p.doc, '$.supports') s WHERE s.value = ?",
    )
    .bind(user_id)
    .fetch_one(&store.database().pool)
    .await?;

    Ok(count_projects(
        &normalize_all(&created),
        &normalize_all(&collaborated),
        u32::try_from(supports_given).unwrap_or(u32::MAX),
    ))
}

pub async fn recalculate(store: &ProjectStore, user_id: &str) -> Result<UserStats> {
    let stats = compute(store, user_id).await?;
    sqlx::query("UPDATE users SET stats = ? WHERE id = ?")
        .bind(serde_json::to_string(&stats)?)
        .bind(user_id)
        .execute(&store.database().pool)
        .await?;

    tracing::debug!(user_id, "User stats recalculated");
    Ok(stats)
}

pub async fn recalculate_participants(store: &ProjectStore, project: &Project) -> PartialResult {
    let mut user_ids = vec![project.created_by.clone()];
    user_ids.extend(
        project
            .collaborators
            .iter()
            .map(|c| c.user_id.clone())
            .filter(|id| *id != project.created_by),
    );

    let outcomes = join_all(user_ids.iter().map(|id| recalculate(store, id))).await;

    let mut result = PartialResult::default();
    for (user_id, outcome) in user_ids.into_iter().zip(outcomes) {
        match outcome {
            Ok(_) => result.succeeded.push(user_id),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Stats recalculation failed");
                result.failed.push(user_id);
            }
        }
    }
    result
}
