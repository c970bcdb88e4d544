use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::SqliteStore;
use crate::application::ports::BuildConfigRepository;
use crate::db::models::{BuildConfig, BuildConfigRow, UpsertBuildConfig};

#[async_trait]
impl BuildConfigRepository for SqliteStore {
    async fn get_build_config(&self, stack_id: &str) -> Result<Option<BuildConfig>> {
        let row = sqlx::query_as::<_, BuildConfigRow>("SELECT * FROM build_configs WHERE stack_id = ?")
            .bind(stack_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(BuildConfig::try_from)
            .transpose()
            .context("Corrupt JSON column in build_configs")
    }

    async fn save_build_config(&self, config: UpsertBuildConfig) -> Result<BuildConfig> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO build_configs (
                stack_id, strategy, dockerfile_path, compose_path,
                pre_build_commands, post_build_commands, build_args, env_vars,
                timeout_seconds, auto_deploy, branch_patterns, rollback_on_failure,
                health_check_path, health_check_timeout_seconds, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(stack_id) DO UPDATE SET
                strategy = excluded.strategy,
                dockerfile_path = excluded.dockerfile_path,
                compose_path = excluded.compose_path,
                pre_build_commands = excluded.pre_build_commands,
                post_build_commands = excluded.post_build_commands,
                build_args = excluded.build_args,
                env_vars = excluded.env_vars,
                timeout_seconds = excluded.timeout_seconds,
                auto_deploy = excluded.auto_deploy,
                branch_patterns = excluded.branch_patterns,
                rollback_on_failure = excluded.rollback_on_failure,
                health_check_path = excluded.health_check_path,
                health_check_timeout_seconds = excluded.health_check_timeout_seconds,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.stack_id)
        .bind(config.strategy)
        .bind(&config.dockerfile_path)
        .bind(&config.compose_path)
        .bind(serde_json::to_string(&config.pre_build_commands)?)
        .bind(serde_json::to_string(&config.post_build_commands)?)
        .bind(serde_json::to_string(&config.build_args)?)
        .bind(serde_json::to_string(&config.env_vars)?)
        .bind(config.timeout_seconds)
        .bind(config.auto_deploy)
        .bind(serde_json::to_string(&config.branch_patterns)?)
        .bind(config.rollback_on_failure)
        .bind(&config.health_check_path)
        .bind(config.health_check_timeout_seconds)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_build_config(&config.stack_id)
            .await?
            .context("Build config vanished after upsert")
    }
}
