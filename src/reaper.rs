//! Idle reaper: stops running workspaces whose idle timeout has elapsed.

use std::sync::Arc;
use std::time::Duration;

use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::lifecycle::LifecycleManager;

const TICK: Duration = Duration::from_secs(60);

/// Effective timeout: project override, else the user default, else the
/// process-wide fallback. Zero means never reap.
pub fn effective_timeout(project_override: Option<i32>, user_default: Option<i32>) -> i32 {
    project_override
        .or(user_default)
        .unwrap_or(*crate::config::IDLE_TIMEOUT_MINUTES)
}

pub fn is_idle(
    last_accessed_at: chrono::DateTime<chrono::Utc>,
    timeout_minutes: i32,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    if timeout_minutes <= 0 {
        return false;
    }
    now - last_accessed_at >= chrono::Duration::minutes(i64::from(timeout_minutes))
}

pub fn spawn(pool: PgPool, manager: Arc<LifecycleManager>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        loop {
            ticker.tick().await;
            if let Err(err) = sweep(&pool, &manager).await {
                tracing::error!(?err, "idle reaper sweep failed");
            }
        }
    });
}

async fn sweep(pool: &PgPool, manager: &Arc<LifecycleManager>) -> crate::error::AppResult<()> {
    let rows = sqlx::query(
        "SELECT p.id, p.idle_timeout_minutes, p.last_accessed_at, \
         s.default_idle_timeout_minutes \
         FROM projects p \
         LEFT JOIN user_settings s ON s.user_id = p.user_id \
         WHERE p.status = 'running' AND p.last_accessed_at IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    let now = chrono::Utc::now();
    for row in rows {
        let id: Uuid = row.get("id");
        let project_override: Option<i32> = row.get("idle_timeout_minutes");
        let user_default: Option<i32> = row.get("default_idle_timeout_minutes");
        let last_accessed_at: chrono::DateTime<chrono::Utc> = row.get("last_accessed_at");

        let timeout = effective_timeout(project_override, user_default);
        if !is_idle(last_accessed_at, timeout, now) {
            continue;
        }
        tracing::info!(workspace_id = %id, timeout, "stopping idle workspace");
        if let Err(err) = Arc::clone(manager).stop(id).await {
            tracing::warn!(?err, workspace_id = %id, "idle stop failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_beats_user_default() {
        assert_eq!(effective_timeout(Some(5), Some(30)), 5);
        assert_eq!(effective_timeout(None, Some(30)), 30);
    }

    #[test]
    fn zero_means_never() {
        let now = chrono::Utc::now();
        let stale = now - chrono::Duration::hours(48);
        assert!(!is_idle(stale, 0, now));
    }

    #[test]
    fn idle_after_timeout_elapsed() {
        let now = chrono::Utc::now();
        assert!(is_idle(now - chrono::Duration::minutes(6), 5, now));
        assert!(!is_idle(now - chrono::Duration::minutes(4), 5, now));
        // Exactly at the boundary counts as idle.
        assert!(is_idle(now - chrono::Duration::minutes(5), 5, now));
    }
}
