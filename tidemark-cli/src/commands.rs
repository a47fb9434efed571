//! CLI subcommand handlers.

use crate::{Commands, ConfigAction, RoutesAction};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemark_core::export::export_snapshot;
use tidemark_core::{
    CommitLog, CommitMetadata, CommitRecord, Contract, ContractGate, DirtyStatus, DirtyTracker,
    JsonRecordsTransform, LineageLog, PartitionStatus, Pipeline, Planner, PublishOutcome,
    PublishRequest, Publisher, Router, Row, RuleSet, Storage, TidemarkConfig,
};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: &TidemarkConfig) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, config),
        Commands::Discover { root } => handle_discover(root, config).await,
        Commands::Routes { action } => handle_routes(action, config),
        Commands::Dirty { status } => handle_dirty(status.as_deref(), config),
        Commands::Plan { entity, partition } => handle_plan(&entity, &partition, config),
        Commands::Rebuild => handle_rebuild(config),
        Commands::Publish {
            contract,
            partition,
            rows,
            run_id,
        } => handle_publish(&contract, &partition, &rows, run_id, config),
        Commands::Commits {
            entity,
            partition,
            since,
            until,
        } => handle_commits(
            entity.as_deref(),
            partition.as_deref(),
            since.as_deref(),
            until.as_deref(),
            config,
        ),
        Commands::Lineage { entity, partition } => handle_lineage(&entity, &partition, config),
        Commands::Export { path } => handle_export(&path, config),
    }
}

fn open_storage(config: &TidemarkConfig) -> anyhow::Result<Storage> {
    let path = &config.storage.database_path;
    Storage::open(path, config.storage.busy_timeout())
        .with_context(|| format!("Failed to open database at {}", path.display()))
}

fn handle_config(action: ConfigAction, config: &TidemarkConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

async fn handle_discover(root: Option<PathBuf>, config: &TidemarkConfig) -> anyhow::Result<()> {
    let root = root.unwrap_or_else(|| config.discovery.root.clone());
    let storage = Arc::new(open_storage(config)?);
    let pipeline = Pipeline::from_config(storage, config);
    let report = pipeline.discover(&root).await?;

    let reg = &report.registration;
    println!("Scanned {} file(s) under {}", report.scanned, root.display());
    println!(
        "  registered: {} new, {} unchanged, {} superseded, {} revived, {} failed",
        reg.inserted, reg.unchanged, reg.superseded, reg.revived, reg.failed
    );
    let routing = &report.routing;
    println!(
        "  routed: {} file(s), {} new link(s), {} partition(s) marked dirty",
        routing.files_routed, routing.links_created, routing.dirty_marked
    );
    for path in &routing.unmatched {
        println!("  unmatched: {}", path);
    }
    for (path, reason) in &routing.rejected {
        println!("  rejected: {} ({})", path, reason);
    }
    Ok(())
}

fn handle_routes(action: RoutesAction, config: &TidemarkConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let router = Router::new(&storage);
    match action {
        RoutesAction::Load { path } => {
            let path = path.unwrap_or_else(|| config.routing.rules_path.clone());
            let rules = RuleSet::load(&path)?;
            let count = router.load_rules(&rules)?;
            println!("Loaded {} rule(s) from {}", count, path.display());
        }
        RoutesAction::List => {
            let rules = router.rules()?;
            if rules.is_empty() {
                println!("No route rules loaded. Use `tidemark routes load` first.");
                return Ok(());
            }
            for rule in rules.rules() {
                let spec = rule.spec();
                let state = if spec.enabled { "" } else { " (disabled)" };
                println!(
                    "  {} -> {} [{}] pattern '{}' source {}{}",
                    spec.route_id,
                    spec.entity,
                    spec.grain.as_str(),
                    spec.path_pattern,
                    spec.source_id.as_deref().unwrap_or("*"),
                    state
                );
            }
        }
    }
    Ok(())
}

fn handle_dirty(status: Option<&str>, config: &TidemarkConfig) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<DirtyStatus>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let storage = open_storage(config)?;
    let rows = DirtyTracker::new(&storage).list(status)?;
    if rows.is_empty() {
        println!("No partitions.");
        return Ok(());
    }
    for row in rows {
        println!(
            "  {}/{} {} since {} reason: {}{}",
            row.entity,
            row.partition_key,
            row.status.as_str(),
            row.first_seen_at.to_rfc3339(),
            row.reason.as_deref().unwrap_or("-"),
            row.claimed_by
                .map(|run| format!(" claimed by {run}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn handle_plan(entity: &str, partition: &str, config: &TidemarkConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let plan = Planner::new(&storage).plan(entity, partition)?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn handle_rebuild(config: &TidemarkConfig) -> anyhow::Result<()> {
    let contracts = Contract::load_dir(&config.publish.contracts_dir)?;
    let storage = Arc::new(open_storage(config)?);
    let pipeline = Pipeline::from_config(storage, config);
    let outcomes = pipeline.rebuild_dirty(&contracts, &JsonRecordsTransform, &ContractGate)?;
    if outcomes.is_empty() {
        println!("Nothing to rebuild.");
        return Ok(());
    }

    let mut failed = 0;
    for outcome in &outcomes {
        let target = format!("{}/{}", outcome.entity, outcome.partition_key);
        match &outcome.status {
            PartitionStatus::Published(published) => print_outcome(&target, published),
            PartitionStatus::Skipped { reason } => println!("  {} skipped: {}", target, reason),
            PartitionStatus::Failed { error } => {
                failed += 1;
                println!("  {} failed: {}", target, error);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} partition(s) failed to rebuild", failed);
    }
    Ok(())
}

fn print_outcome(target: &str, outcome: &PublishOutcome) {
    let record = outcome.record();
    let prefix = if outcome.is_committed() {
        "published"
    } else {
        "already committed"
    };
    println!(
        "  {} {} by {}: {} row(s), +{} ~{} -{}",
        target,
        prefix,
        record.run_id,
        record.row_count,
        record.insert_cnt,
        record.update_cnt,
        record.delete_cnt
    );
}

/// Resolve a contract argument: an existing file, or an entity in `contracts_dir`.
fn find_contract(arg: &str, config: &TidemarkConfig) -> anyhow::Result<Contract> {
    let path = Path::new(arg);
    if path.is_file() {
        return Ok(Contract::load(path)?);
    }
    Contract::load_dir(&config.publish.contracts_dir)?
        .into_iter()
        .find(|c| c.entity == arg)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "No contract for '{}' in {}",
                arg,
                config.publish.contracts_dir.display()
            )
        })
}

fn read_json_lines(path: &Path) -> anyhow::Result<Vec<Row>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: Row = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: not a JSON object", path.display(), index + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

fn handle_publish(
    contract: &str,
    partition: &str,
    rows: &Path,
    run_id: Option<String>,
    config: &TidemarkConfig,
) -> anyhow::Result<()> {
    let mut contract = find_contract(contract, config)?;
    if let Some(layer) = &config.publish.layer {
        contract.layer = layer.clone();
    }
    let data = read_json_lines(rows)?;
    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let storage = open_storage(config)?;
    let request = PublishRequest {
        contract: &contract,
        partition_key: partition,
        rows: data,
        metadata: CommitMetadata::new(run_id, config.publish.transform_version.clone()),
    };
    let outcome = Publisher::with_default_hooks(&storage).publish(request, &ContractGate)?;
    print_outcome(&format!("{}/{}", contract.entity, partition), &outcome);
    Ok(())
}

/// Accept RFC 3339 or a bare date (midnight UTC).
fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Invalid time '{}': expected RFC 3339 or YYYY-MM-DD", raw))?;
    Ok(date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

fn handle_commits(
    entity: Option<&str>,
    partition: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    config: &TidemarkConfig,
) -> anyhow::Result<()> {
    let since = since.map(parse_time).transpose()?;
    let until = until.map(parse_time).transpose()?;
    let storage = open_storage(config)?;
    let log = CommitLog::new(&storage);

    let commits: Vec<CommitRecord> = match (entity, partition, since, until) {
        (Some(entity), Some(partition), _, _) => log.history(entity, partition)?,
        (_, _, None, None) => log.all()?,
        (_, _, since, until) => log.between(
            since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            until.unwrap_or_else(Utc::now),
        )?,
    };
    let commits: Vec<_> = commits
        .into_iter()
        .filter(|c| entity.is_none_or(|e| c.entity == e))
        .filter(|c| partition.is_none_or(|p| c.partition_key == p))
        .filter(|c| since.is_none_or(|s| c.finished_at >= s))
        .filter(|c| until.is_none_or(|u| c.finished_at <= u))
        .collect();

    if commits.is_empty() {
        println!("No commits.");
        return Ok(());
    }
    for c in commits {
        println!(
            "  {} {}/{} [{}] run {}: {} row(s), +{} ~{} -{} spec {}",
            c.finished_at.to_rfc3339(),
            c.entity,
            c.partition_key,
            c.layer,
            c.run_id,
            c.row_count,
            c.insert_cnt,
            c.update_cnt,
            c.delete_cnt,
            c.spec_version
        );
    }
    Ok(())
}

fn handle_lineage(entity: &str, partition: &str, config: &TidemarkConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let events = LineageLog::new(&storage).events_for(entity, partition)?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

fn handle_export(path: &Path, config: &TidemarkConfig) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let snapshot = export_snapshot(&storage, path)?;
    println!(
        "Exported {} commit(s) and {} outstanding partition(s) to {}",
        snapshot.commits.len(),
        snapshot.outstanding.len(),
        path.display()
    );
    Ok(())
}
