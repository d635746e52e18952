use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::error;
use tracing_subscriber::EnvFilter;

use migration::MigrateOptions;
use volshift::{App, AppConfig, Result, SwitchDirection};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    std::process::exit(code);
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn cli() -> Command {
    Command::new("volshift")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Checkpointed bulk asset migration between S3-compatible object stores")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .default_value("volshift.json")
                .help("Path to the JSON config file"),
        )
        .subcommand(
            Command::new("migrate")
                .about("Copy all assets from the source provider to the target")
                .arg(flag("dry-run", "Plan and report without writing or persisting anything"))
                .arg(flag("resume", "Continue from the latest checkpoint for this scope"))
                .arg(
                    Arg::new("checkpoint-id")
                        .long("checkpoint-id")
                        .help("Resume a specific checkpoint instead of the latest"),
                )
                .arg(flag("skip-lock", "Bypass the migration lock (operator override)"))
                .arg(flag("no-verify", "Skip the post-copy verification pass"))
                .arg(
                    Arg::new("filter")
                        .long("filter")
                        .help("Only migrate assets whose path contains this substring"),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show checkpoint progress")
                .arg(
                    Arg::new("checkpoint-id")
                        .long("checkpoint-id")
                        .help("Checkpoint to inspect; defaults to the latest for this scope"),
                ),
        )
        .subcommand(
            Command::new("rollback")
                .about("Delete from the target everything a migration copied")
                .arg(Arg::new("checkpoint-id").required(true)),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Purge finished checkpoints past the retention window")
                .arg(
                    Arg::new("older-than-hours")
                        .long("older-than-hours")
                        .value_parser(clap::value_parser!(u64))
                        .help("Override the configured retention window"),
                )
                .arg(flag("force", "Also clear all migration locks")),
        )
        .subcommand(
            Command::new("switch")
                .about("Repoint volumes between providers, all-or-nothing")
                .subcommand_required(true)
                .subcommand(Command::new("preview").about("Show the plan without changing anything"))
                .subcommand(Command::new("to-target").about("Apply the configured volume mappings"))
                .subcommand(Command::new("to-source").about("Apply the mappings in reverse")),
        )
        .subcommand(Command::new("test-connectivity").about("Probe every configured provider"))
        .subcommand(
            Command::new("list")
                .about("List objects at a provider")
                .arg(Arg::new("provider").long("provider").help("Handle; defaults to source"))
                .arg(Arg::new("prefix").long("prefix").default_value("")),
        )
        .subcommand(
            Command::new("check")
                .about("Check one path, with suggestions when it is missing")
                .arg(Arg::new("provider").long("provider").help("Handle; defaults to source"))
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("compare")
                .about("Report drift between source and target")
                .arg(Arg::new("prefix").long("prefix").default_value("")),
        )
}

async fn run() -> Result<i32> {
    let matches = cli().get_matches();
    let config_path = matches
        .get_one::<String>("config")
        .expect("config has a default");
    let config = AppConfig::load(config_path).await?;
    let app = App::bootstrap(config).await?;

    match matches.subcommand() {
        Some(("migrate", sub)) => migrate(&app, sub).await,
        Some(("status", sub)) => {
            let status = app.status(sub.get_one::<String>("checkpoint-id").map(String::as_str)).await?;
            println!("checkpoint: {}", status.checkpoint_id);
            println!("scope:      {}", status.scope);
            println!("phase:      {}", status.phase);
            println!(
                "progress:   {}/{} completed, {} failed, cursor at {}",
                status.completed, status.total_assets, status.failed, status.cursor
            );
            println!("updated:    {}", status.updated_at);
            Ok(0)
        }
        Some(("rollback", sub)) => {
            let id = sub.get_one::<String>("checkpoint-id").expect("required");
            let report = app.rollback(id).await?;
            println!(
                "rollback {}: {} deleted, {} already absent",
                report.checkpoint_id, report.reversed, report.already_absent
            );
            for (path, reason) in &report.failures {
                println!("  failed: {path}: {reason}");
            }
            Ok(if report.failures.is_empty() { 0 } else { 2 })
        }
        Some(("cleanup", sub)) => {
            let report = app
                .cleanup(sub.get_one::<u64>("older-than-hours").copied(), sub.get_flag("force"))
                .await?;
            println!(
                "purged {} checkpoint(s), cleared {} lock(s)",
                report.purged.len(),
                report.locks_cleared
            );
            for id in &report.purged {
                println!("  {id}");
            }
            Ok(0)
        }
        Some(("switch", sub)) => {
            let (direction, label) = match sub.subcommand() {
                Some(("preview", _)) => (SwitchDirection::Preview, "would repoint"),
                Some(("to-target", _)) => (SwitchDirection::ToTarget, "repointed"),
                Some(("to-source", _)) => (SwitchDirection::ToSource, "repointed"),
                _ => unreachable!("subcommand required"),
            };
            let plan = app.switch(direction).await?;
            for action in &plan.actions {
                println!(
                    "{label} volume '{}' ({} -> {})",
                    action.volume.name, action.from, action.to
                );
            }
            for volume in &plan.skipped {
                println!("unchanged volume '{}' ({})", volume.name, volume.handle);
            }
            Ok(0)
        }
        Some(("test-connectivity", _)) => {
            let results = app.probe().await;
            let mut failures = 0;
            for (handle, test) in &results {
                if test.success {
                    println!(
                        "{handle}: ok ({:.3}s) {}",
                        test.response_time_seconds, test.message
                    );
                } else {
                    failures += 1;
                    println!(
                        "{handle}: FAILED {}",
                        test.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            Ok(if failures == 0 { 0 } else { 1 })
        }
        Some(("list", sub)) => {
            let objects = app
                .list(
                    sub.get_one::<String>("provider").map(String::as_str),
                    sub.get_one::<String>("prefix").expect("has default"),
                )
                .await?;
            for object in &objects {
                println!("{:>12}  {}", object.size, object.path);
            }
            println!("{} object(s)", objects.len());
            Ok(0)
        }
        Some(("check", sub)) => {
            let check = app
                .check(
                    sub.get_one::<String>("provider").map(String::as_str),
                    sub.get_one::<String>("path").expect("required"),
                )
                .await?;
            if check.exists {
                println!(
                    "{}: {} bytes, {}",
                    check.path,
                    check.size.unwrap_or(0),
                    check.content_type.as_deref().unwrap_or("unknown type")
                );
                if let Some(modified) = check.last_modified {
                    println!("last modified {modified}");
                }
                Ok(0)
            } else {
                println!("{}: not found", check.path);
                for (path, score) in &check.suggestions {
                    println!("  did you mean {path}? ({:.0}% similar)", score * 100.0);
                }
                Ok(1)
            }
        }
        Some(("compare", sub)) => {
            let report = app
                .compare(sub.get_one::<String>("prefix").expect("has default"))
                .await?;
            println!("{} path(s) match", report.matched);
            for path in &report.only_in_source {
                println!("only in source: {path}");
            }
            for path in &report.only_in_target {
                println!("only in target: {path}");
            }
            for mismatch in &report.size_mismatches {
                println!(
                    "size mismatch: {} ({} vs {})",
                    mismatch.path, mismatch.source_size, mismatch.target_size
                );
            }
            Ok(if report.is_clean() { 0 } else { 2 })
        }
        _ => unreachable!("subcommand required"),
    }
}

async fn migrate(app: &App, sub: &ArgMatches) -> Result<i32> {
    let opts = MigrateOptions {
        dry_run: sub.get_flag("dry-run"),
        resume: sub.get_flag("resume"),
        checkpoint_id: sub.get_one::<String>("checkpoint-id").cloned(),
        skip_lock: sub.get_flag("skip-lock"),
        verify: !sub.get_flag("no-verify"),
        filter: sub.get_one::<String>("filter").cloned(),
    };
    let report = app.migrate(&opts).await?;
    if report.dry_run {
        println!("dry run: no changes were made");
    }
    println!("checkpoint: {}", report.checkpoint_id);
    println!(
        "total: {}  copied: {}  skipped: {}  failed: {}",
        report.total, report.copied, report.skipped, report.failed
    );
    Ok(if report.has_failures() { 2 } else { 0 })
}
