use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use smartuptime::config::{LoggingConfig, MonitorConfig};
use smartuptime::executor::record::{ExecutionRecord, TriggerContext};
use smartuptime::executor::ScriptExecutor;
use smartuptime::scheduler::retention;
use smartuptime::sites::SiteDraft;
use smartuptime::storage::{self, ExecutionLedger, RuleStore, SiteRegistry};

#[derive(Parser)]
#[command(
    name = "smartuptime",
    about = "Uptime monitoring with automated remediation scripts",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (defaults to $SMARTUPTIME_CONFIG, then /etc/smartuptime/smartuptime.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + poll loop)
    Serve {
        /// Bind address, overriding [api].bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one poll cycle now and print the outcomes
    Check {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage monitored sites
    Sites {
        #[command(subcommand)]
        action: SiteAction,
    },

    /// Manage automation rules
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Show recent script executions
    Executions {
        /// Number of records to show
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Only executions for this site id
        #[arg(long)]
        site: Option<i64>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Delete probe outcomes older than the retention window
    Cleanup,
}

#[derive(Subcommand)]
enum SiteAction {
    /// Register a site
    Add {
        /// URL to probe
        url: String,

        /// Display name
        #[arg(long)]
        name: Option<String>,
    },

    /// List all sites
    List,

    /// Stop probing a site, keeping its history
    Deactivate { id: i64 },

    /// Remove a site and all of its outcomes
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum RuleAction {
    /// List all rules with their statistics
    List,

    /// Insert the default rules if none exist
    Seed,

    /// Run a rule's script now
    Run {
        id: i64,

        /// Arguments overriding the rule's defaults
        #[arg(long)]
        args: Option<String>,

        /// Site to attribute the execution to
        #[arg(long)]
        site: Option<i64>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = MonitorConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting SmartUptime daemon");
            smartuptime::serve(config).await?;
        }
        Commands::Check { json } => {
            let app = smartuptime::App::open(&config).await?;
            let report = app.scheduler.run_cycle(&app.shutdown).await?;
            // Let triggered remediations finish before exiting.
            app.executor.drain().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report.outcomes)?);
            } else {
                let labels: HashMap<i64, String> = app
                    .store
                    .list_sites()
                    .await?
                    .into_iter()
                    .map(|s| (s.id, s.label().to_string()))
                    .collect();

                if report.outcomes.is_empty() {
                    println!("No active sites.");
                } else {
                    println!("{:<30} | {:<6} | {:<10} | {:<7} | Error", "Site", "Status", "Latency", "Anomaly");
                    println!("{:-<30}-|-{:-<6}-|-{:-<10}-|-{:-<7}-|-{:-<20}", "", "", "", "", "");
                    for o in &report.outcomes {
                        let label = labels.get(&o.site_id).map(String::as_str).unwrap_or("?");
                        let latency = o.latency_ms.map(|ms| format!("{ms} ms")).unwrap_or_else(|| "-".to_string());
                        println!(
                            "{:<30} | {:<6} | {:<10} | {:<7} | {}",
                            label,
                            o.status_code,
                            latency,
                            o.is_anomaly,
                            o.error_message.as_deref().unwrap_or("")
                        );
                    }
                }
                println!(
                    "\n{} outcome(s) persisted, {} remediation(s) triggered, {} expired outcome(s) pruned",
                    report.outcomes.len(),
                    report.spawned,
                    report.pruned
                );
            }
        }
        Commands::Sites { action } => {
            let store = smartuptime::open_store(&config)?;
            match action {
                SiteAction::Add { url, name } => {
                    let draft = SiteDraft {
                        url,
                        name,
                        is_active: true,
                    };
                    draft.validate().map_err(anyhow::Error::msg)?;
                    let site = store.add_site(draft).await?;
                    println!("Site {} added ({}).", site.id, site.url);
                }
                SiteAction::List => {
                    let sites = store.list_sites().await?;
                    if sites.is_empty() {
                        println!("No sites registered.");
                    } else {
                        println!("{:<5} | {:<20} | {:<40} | Active", "Id", "Name", "Url");
                        println!("{:-<5}-|-{:-<20}-|-{:-<40}-|-{:-<6}", "", "", "", "");
                        for site in sites {
                            println!(
                                "{:<5} | {:<20} | {:<40} | {}",
                                site.id,
                                site.name.as_deref().unwrap_or("-"),
                                site.url,
                                site.is_active
                            );
                        }
                    }
                }
                SiteAction::Deactivate { id } => {
                    store.deactivate_site(id).await?;
                    println!("Site {} deactivated.", id);
                }
                SiteAction::Remove { id } => {
                    store.remove_site(id).await?;
                    println!("Site {} removed.", id);
                }
            }
        }
        Commands::Rules { action } => {
            let store = Arc::new(smartuptime::open_store(&config)?);
            match action {
                RuleAction::List => {
                    let rules = store.list_rules().await?;
                    if rules.is_empty() {
                        println!("No rules configured. Run `smartuptime rules seed` to add the defaults.");
                    } else {
                        println!(
                            "{:<4} | {:<32} | {:<10} | {:<9} | {:<6} | {:<5} | {:<5} | Avg",
                            "Id", "Name", "Type", "Condition", "Active", "Runs", "Fails"
                        );
                        println!(
                            "{:-<4}-|-{:-<32}-|-{:-<10}-|-{:-<9}-|-{:-<6}-|-{:-<5}-|-{:-<5}-|-{:-<8}",
                            "", "", "", "", "", "", "", ""
                        );
                        for r in rules {
                            let avg = r
                                .stats
                                .average_duration_ms
                                .map(|ms| format!("{ms} ms"))
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<4} | {:<32} | {:<10} | {:<9} | {:<6} | {:<5} | {:<5} | {}",
                                r.id,
                                r.name,
                                r.script_type,
                                r.trigger_condition.as_str(),
                                r.is_active,
                                r.stats.execution_count,
                                r.stats.failure_count,
                                avg
                            );
                        }
                    }
                }
                RuleAction::Seed => {
                    let added = storage::seed_default_rules(store.as_ref()).await?;
                    if added == 0 {
                        println!("Rules already present, nothing seeded.");
                    } else {
                        println!("Seeded {} default rule(s).", added);
                    }
                }
                RuleAction::Run { id, args, site } => {
                    let rule = store.get_rule(id).await?;
                    if let Some(site_id) = site {
                        store.get_site(site_id).await?;
                    }
                    let executor = ScriptExecutor::new(
                        store.clone(),
                        config.scripts.root.clone(),
                        config.scripts.timeout(),
                        CancellationToken::new(),
                    );
                    let record = executor.execute(&rule, TriggerContext::manual(site, args)).await?;
                    print_execution(&record);
                    if let Some(out) = record.output.as_deref().filter(|s| !s.is_empty()) {
                        println!("\n--- stdout ---\n{}", out);
                    }
                    if let Some(err) = record.error_output.as_deref().filter(|s| !s.is_empty()) {
                        println!("--- stderr ---\n{}", err);
                    }
                }
            }
        }
        Commands::Executions { limit, site, json } => {
            let store = smartuptime::open_store(&config)?;
            let records = store.recent_executions(limit, site).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No executions recorded.");
            } else {
                for record in &records {
                    print_execution(record);
                }
            }
        }
        Commands::Cleanup => {
            let store = smartuptime::open_store(&config)?;
            let removed = retention::sweep(&store, Utc::now(), config.scheduler.retention()).await?;
            println!("Removed {} outcome(s) older than {} day(s).", removed, config.scheduler.retention_days);
        }
    }

    Ok(())
}

fn print_execution(record: &ExecutionRecord) {
    let duration = record
        .duration_ms
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "-".to_string());
    let site = record.site_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    println!(
        "#{:<5} {:<32} {:<8} trigger={:<8} site={:<5} started={} duration={}",
        record.id,
        record.script_name,
        record.status.as_str(),
        record.trigger_type.as_str(),
        site,
        record.started_at.to_rfc3339(),
        duration
    );
    if let Some(message) = &record.error_message {
        println!("       error: {}", message);
    }
}
