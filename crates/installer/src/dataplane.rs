//! ZooKeeper, Snuba and Kafka bootstrap.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::stage::{StageContext, StageOutcome};
use crate::ui;
use crate::validator::parse_count;

/// Topics ingestion needs; Kafka does not auto-create them.
pub const REQUIRED_TOPICS: [&str; 6] = [
    "ingest-attachments",
    "ingest-transactions",
    "ingest-events",
    "ingest-replay-recordings",
    "profiles",
    "ingest-occurrences",
];

const KAFKA_BOOTSTRAP: &str = "kafka:9092";
const ZK_DATA_DIR: &str = "/var/lib/zookeeper/data/version-2";
const ZK_LOG_DIR: &str = "/var/lib/zookeeper/log/version-2";

/// Topics from [`REQUIRED_TOPICS`] that do not appear in a `--list` output.
#[must_use]
pub fn missing_topics(listed: &str) -> Vec<&'static str> {
    let existing: Vec<&str> = listed.lines().map(str::trim).collect();
    REQUIRED_TOPICS
        .into_iter()
        .filter(|topic| !existing.contains(topic))
        .collect()
}

/// Whether ZooKeeper would refuse to start: logs exist but no snapshot does.
#[must_use]
pub fn needs_snapshot_repair(data_dir_exists: bool, log_files: u64, snapshot_files: u64) -> bool {
    data_dir_exists && log_files > 0 && snapshot_files == 0
}

fn count_entries(ctx: &StageContext<'_>, pattern: &str) -> Result<u64> {
    let script = format!("ls 2>/dev/null -Ubad1 -- {pattern} | wc -l");
    let output = ctx.tolerated(&ctx.compose.run_rm(["zookeeper", "bash", "-c", script.as_str()]))?;
    Ok(parse_count(&output.stdout))
}

/// Seed an empty snapshot when an upgrade left ZooKeeper with logs only.
///
/// Returns `true` if the repair ran.
///
/// # Errors
///
/// Returns an error if the snapshot cannot be copied or ZooKeeper not started.
pub fn repair_zookeeper(ctx: &StageContext<'_>) -> Result<bool> {
    let data_dir_exists = count_entries(ctx, ZK_DATA_DIR)? == 1;
    let (logs, snapshots) = if data_dir_exists {
        (
            count_entries(ctx, &format!("{ZK_LOG_DIR}/*"))?,
            count_entries(ctx, &format!("{ZK_DATA_DIR}/*"))?,
        )
    } else {
        (0, 0)
    };
    debug!(data_dir_exists, logs, snapshots, "ZooKeeper data layout");

    if !needs_snapshot_repair(data_dir_exists, logs, snapshots) {
        return Ok(false);
    }

    let seed = format!("{}:/temp", ctx.config.zookeeper_seed_dir().display());
    let copy = format!("cp /temp/snapshot.0 {ZK_DATA_DIR}/snapshot.0");
    ctx.checked(&ctx.compose.run_rm([
        "-v",
        seed.as_str(),
        "zookeeper",
        "bash",
        "-c",
        copy.as_str(),
    ]))
    .context("Failed to seed ZooKeeper snapshot")?;
    ctx.checked(&ctx.compose.command([
        "run",
        "-d",
        "-e",
        "ZOOKEEPER_SNAPSHOT_TRUST_EMPTY=true",
        "zookeeper",
    ]))
    .context("Failed to start ZooKeeper with an empty snapshot")?;

    info!("Seeded ZooKeeper with an empty snapshot");
    Ok(true)
}

/// Bootstrap and migrate Snuba's storage.
///
/// # Errors
///
/// Returns an error if either Snuba command fails.
pub fn migrate_snuba(ctx: &StageContext<'_>) -> Result<()> {
    ui::print_info("Bootstrapping and migrating Snuba...");
    ctx.checked(&ctx.compose.run_rm(["snuba-api", "bootstrap", "--no-migrate", "--force"]))
        .context("Snuba bootstrap failed")?;
    ctx.checked(&ctx.compose.run_rm(["snuba-api", "migrations", "migrate", "--force"]))
        .context("Snuba migrations failed")?;
    Ok(())
}

/// Create any missing Kafka topics. Returns the topics created.
///
/// A failed listing counts as "no topics"; creation is idempotent anyway.
///
/// # Errors
///
/// Returns an error if a topic cannot be created.
pub fn ensure_topics(ctx: &StageContext<'_>) -> Result<Vec<&'static str>> {
    let listed = ctx.tolerated(&ctx.compose.run_rm([
        "kafka",
        "kafka-topics",
        "--list",
        "--bootstrap-server",
        KAFKA_BOOTSTRAP,
    ]))?;
    let existing = if listed.success() {
        listed.stdout
    } else {
        String::new()
    };

    let missing = missing_topics(&existing);
    for &topic in &missing {
        ctx.checked(&ctx.compose.run_rm([
            "kafka",
            "kafka-topics",
            "--create",
            "--if-not-exists",
            "--topic",
            topic,
            "--bootstrap-server",
            KAFKA_BOOTSTRAP,
        ]))
        .with_context(|| format!("Failed to create Kafka topic {topic}"))?;
        info!(topic, "Created Kafka topic");
    }
    Ok(missing)
}

/// Run the whole data-plane bootstrap.
///
/// # Errors
///
/// Returns an error if any mandatory step fails.
pub fn bootstrap(ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let repaired = repair_zookeeper(ctx)?;
    migrate_snuba(ctx)?;
    let created = ensure_topics(ctx)?;

    let mut parts = vec!["Snuba migrated".to_string()];
    if repaired {
        parts.push("ZooKeeper snapshot repaired".into());
    }
    if !created.is_empty() {
        parts.push(format!("created topics {}", created.join(", ")));
    }
    Ok(StageOutcome::Done(parts.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_topics_exact_names() {
        let listed = "__consumer_offsets\ningest-events\ningest-attachments-dlq\nprofiles\n";
        assert_eq!(
            missing_topics(listed),
            vec![
                "ingest-attachments",
                "ingest-transactions",
                "ingest-replay-recordings",
                "ingest-occurrences",
            ]
        );
        assert!(missing_topics(&REQUIRED_TOPICS.join("\n")).is_empty());
        assert_eq!(missing_topics("").len(), REQUIRED_TOPICS.len());
    }

    #[test]
    fn test_snapshot_repair_condition() {
        assert!(needs_snapshot_repair(true, 3, 0));
        assert!(!needs_snapshot_repair(true, 3, 1));
        assert!(!needs_snapshot_repair(true, 0, 0));
        assert!(!needs_snapshot_repair(false, 3, 0));
    }
}
