use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use trackr_core::{BusinessKey, CellValue, SheetId};
use trackr_report::Document;
use trackr_storage::{load_manifest, ApiHttp, DeliverableStore, GitHubClient, SmartsheetClient};
use trackr_sync::{
    default_labels, load_labels, load_probe_checklist, load_records, publish_report, run_probes, sync_labels,
    write_sync_report, AttachOutcome, DuplicatePolicy, GitHubConfig, PresetRegistry, ProbeConfig, SmartsheetConfig,
    SyncConfig, SyncEngine, SyncMapping, SyncRecord, DEFAULT_PRESET,
};

#[derive(Debug, Parser)]
#[command(name = "trackr")]
#[command(about = "Keep a project-tracking sheet in step with declarative task records")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// Field-to-column mapping to use.
    #[arg(long, global = true, default_value = DEFAULT_PRESET)]
    preset: String,
    /// YAML preset definitions; the built-in set is used when omitted.
    #[arg(long, global = true)]
    presets: Option<PathBuf>,
    /// Write to the first matching row when a key is held by several rows.
    #[arg(long, global = true)]
    allow_duplicates: bool,
    /// Directory for run reports (default: TRACKR_REPORTS_DIR or ./reports).
    #[arg(long, global = true)]
    report_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show how preset fields resolve against the sheet's columns.
    Columns,
    /// Upsert every record in a YAML or JSON file.
    Sync {
        #[arg(long)]
        input: PathBuf,
    },
    /// Upsert a single row.
    Upsert {
        key: String,
        #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, CellValue)>,
        /// Place a new row right after this key.
        #[arg(long, conflicts_with = "parent")]
        after: Option<String>,
        /// Nest a new row under this key.
        #[arg(long)]
        parent: Option<String>,
    },
    /// Add the next numbered sub-task under a task.
    Subtask {
        parent: String,
        #[arg(long = "set", value_name = "FIELD=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, CellValue)>,
    },
    /// Delete the rows holding these keys.
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// List business keys held by more than one row.
    AuditKeys,
    /// Render a YAML document to DOCX and record it in the deliverable manifest.
    Report {
        #[arg(long)]
        doc: PathBuf,
        #[arg(long)]
        key: String,
        /// Deliverables directory (default: TRACKR_DELIVERABLES_DIR or ./deliverables).
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
    /// Upload manifest deliverables to their rows.
    Attach {
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Create the repository's issue labels.
    Labels {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Run an HTTP probe checklist against a deployment.
    Probe {
        #[arg(long)]
        checklist: PathBuf,
    },
}

fn parse_assignment(raw: &str) -> Result<(String, CellValue), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing field name in `{raw}`"));
    }
    Ok((name.to_string(), CellValue::infer(value)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trackr=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let reports_dir = cli
        .global
        .report_dir
        .clone()
        .unwrap_or_else(|| config.reports_dir.clone());

    match cli.command {
        Commands::Columns => {
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let mut missing_required = 0;
            for spec in engine.mapping().field_specs() {
                match engine.columns().require(&spec.name) {
                    Ok(id) => {
                        let title = engine.sheet().column(id).map(|c| c.title.as_str()).unwrap_or("?");
                        println!("{:<16} -> {title} ({id})", spec.name);
                    }
                    Err(err) => {
                        if spec.required {
                            missing_required += 1;
                        }
                        println!("{:<16} -> unresolved: {err}", spec.name);
                    }
                }
            }
            if missing_required > 0 {
                bail!("{missing_required} required column(s) unresolved");
            }
        }
        Commands::Sync { input } => {
            let records = load_records(&input).await?;
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let mut engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let report = engine.upsert_batch(&records).await?;
            let path = write_sync_report(&reports_dir, &report).await?;
            println!(
                "sync complete: run_id={} inserted={} updated={} unchanged={} failed={} report={}",
                report.run_id,
                report.inserted,
                report.updated,
                report.unchanged,
                report.failures.len(),
                path.display()
            );
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if !report.failures.is_empty() {
                bail!("{} record(s) failed; see {}", report.failures.len(), path.display());
            }
        }
        Commands::Upsert {
            key,
            set,
            after,
            parent,
        } => {
            let record = SyncRecord {
                key: BusinessKey::parse(&key),
                fields: set.into_iter().collect(),
                after: after.as_deref().map(BusinessKey::parse),
                parent: parent.as_deref().map(BusinessKey::parse),
            };
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let mut engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let applied = engine.upsert(&record).await?;
            println!("{}: {:?}", applied.key, applied.outcome);
            if let Some(warning) = applied.warning {
                println!("warning: {warning}");
            }
        }
        Commands::Subtask { parent, set } => {
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let mut engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let (child, applied) = engine
                .add_subtask(&BusinessKey::parse(&parent), set.into_iter().collect())
                .await?;
            println!("{child}: {:?}", applied.outcome);
        }
        Commands::Delete { keys } => {
            let keys: Vec<BusinessKey> = keys.iter().map(|k| BusinessKey::parse(k)).collect();
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let mut engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let report = engine.delete_by_keys(&keys).await?;
            println!("deleted rows: {:?}", report.deleted);
            for key in &report.missing {
                println!("not found: {key}");
            }
            for conflict in &report.conflicts {
                println!("skipped: {conflict}");
            }
            if !report.missing.is_empty() || !report.conflicts.is_empty() {
                bail!(
                    "{} key(s) not deleted",
                    report.missing.len() + report.conflicts.len()
                );
            }
        }
        Commands::AuditKeys => {
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let mut engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let duplicates = engine.audit_keys().await?;
            for duplicate in &duplicates {
                println!("{duplicate}");
            }
            if !duplicates.is_empty() {
                bail!("{} duplicated key(s)", duplicates.len());
            }
            println!("no duplicate keys");
        }
        Commands::Report { doc, key, out_dir } => {
            let raw = tokio::fs::read_to_string(&doc)
                .await
                .with_context(|| format!("reading {}", doc.display()))?;
            let document =
                Document::from_yaml_str(&raw).with_context(|| format!("parsing {}", doc.display()))?;
            let store = DeliverableStore::new(out_dir.unwrap_or_else(|| config.deliverables_dir.clone()));
            let (stored, entry) = publish_report(&store, &document, &BusinessKey::parse(&key)).await?;
            println!(
                "{} -> {} ({} bytes, sha256 {}{})",
                entry.task_key,
                stored.absolute_path.display(),
                entry.bytes,
                entry.sha256,
                if stored.unchanged { ", unchanged" } else { "" }
            );
        }
        Commands::Attach { manifest } => {
            let manifest_path =
                manifest.unwrap_or_else(|| DeliverableStore::new(config.deliverables_dir.clone()).manifest_path());
            let manifest = load_manifest(&manifest_path).await?;
            let root = manifest_path.parent().unwrap_or(Path::new("."));
            let (api, sheet_id) = sheet_client(&config)?;
            let mapping = load_mapping(&cli.global).await?;
            let engine = SyncEngine::connect(&api, sheet_id, mapping).await?;
            let reports = engine.attach_manifest(&manifest, root).await?;
            let mut unattached = 0;
            for report in &reports {
                if matches!(
                    report.outcome,
                    AttachOutcome::RowMissing | AttachOutcome::DuplicateKey { .. }
                ) {
                    unattached += 1;
                }
                println!("{} {}: {:?}", report.key, report.file, report.outcome);
            }
            if unattached > 0 {
                bail!("{unattached} deliverable(s) not attached");
            }
        }
        Commands::Labels { file } => {
            let github = GitHubConfig::from_env()?;
            let labels = match file {
                Some(path) => load_labels(&path).await?,
                None => default_labels()?,
            };
            let http = ApiHttp::new(config.http_client_config())?;
            let client = GitHubClient::new(http, github.api_url, github.token, github.owner, github.repo);
            for (name, outcome) in sync_labels(&client, &labels).await? {
                println!("{name}: {outcome:?}");
            }
        }
        Commands::Probe { checklist } => {
            let checks = load_probe_checklist(&checklist, &ProbeConfig::from_env()).await?;
            let http = ApiHttp::new(config.http_client_config())?;
            let outcomes = run_probes(&http, &checks).await;
            for outcome in &outcomes {
                let status = outcome.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into());
                let verdict = if outcome.passed { "PASS" } else { "FAIL" };
                println!("{verdict} {status} {} {}", outcome.name, outcome.url);
                for failure in &outcome.failures {
                    println!("    {failure}");
                }
            }
            let failed = outcomes.iter().filter(|o| !o.passed).count();
            if failed > 0 {
                bail!("{failed} of {} probe(s) failed", outcomes.len());
            }
        }
    }

    Ok(())
}

async fn load_mapping(global: &GlobalArgs) -> Result<SyncMapping> {
    let registry = match &global.presets {
        Some(path) => PresetRegistry::load(path).await?,
        None => PresetRegistry::builtin()?,
    };
    let mut mapping = registry.get(&global.preset).cloned().with_context(|| {
        format!(
            "unknown preset `{}` (available: {})",
            global.preset,
            registry.names().collect::<Vec<_>>().join(", ")
        )
    })?;
    if global.allow_duplicates {
        mapping.on_duplicate = DuplicatePolicy::UseFirst;
    }
    Ok(mapping)
}

fn sheet_client(config: &SyncConfig) -> Result<(SmartsheetClient, SheetId)> {
    let smartsheet = SmartsheetConfig::from_env()?;
    let http = ApiHttp::new(config.http_client_config())?;
    Ok((
        SmartsheetClient::with_base_url(http, smartsheet.token, smartsheet.base_url),
        smartsheet.sheet_id,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn assignments_infer_cell_types() {
        assert_eq!(
            parse_assignment("% Complete=0.5"),
            Ok(("% Complete".to_string(), CellValue::Number(0.5)))
        );
        assert_eq!(
            parse_assignment("Notes=a=b"),
            Ok(("Notes".to_string(), CellValue::Text("a=b".into())))
        );
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=x").is_err());
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from([
            "trackr",
            "upsert",
            "1.10",
            "--set",
            "Status=Complete",
            "--after",
            "1.9",
            "--allow-duplicates",
        ])
        .unwrap();
        assert!(cli.global.allow_duplicates);
        assert_eq!(cli.global.preset, DEFAULT_PRESET);
        match cli.command {
            Commands::Upsert { key, set, after, .. } => {
                assert_eq!(key, "1.10");
                assert_eq!(set.len(), 1);
                assert_eq!(after.as_deref(), Some("1.9"));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(Cli::try_parse_from(["trackr", "upsert", "2", "--after", "1", "--parent", "1"]).is_err());
    }
}
