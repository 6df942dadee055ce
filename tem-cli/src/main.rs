//! Read-only diagnostic tool over a Task Execution Manager database: report,
//! list, watch. No write operations.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use tem_core::{BatchService, Store, TaskService};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Diagnostic CLI for a Task Execution Manager database", long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print batch stats, and a single batch's detail plus interruption log if `code` is given.
    Report {
        db: PathBuf,
        code: Option<String>,
    },
    /// List every batch with id, code, type, status, and task counts.
    List {
        db: PathBuf,
    },
    /// Poll the store every second and redraw until Ctrl-C.
    Watch {
        db: PathBuf,
        code: Option<String>,
    },
}

/// Exit code 1: operational error (e.g. batch not found). 2: usage error,
/// already handled by clap itself before we get here.
const EXIT_OPERATIONAL_ERROR: i32 = 1;

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let code = match run(args).await {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            EXIT_OPERATIONAL_ERROR
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Report { db, code } => report(db, code).await,
        Command::List { db } => list(db).await,
        Command::Watch { db, code } => watch(db, code).await,
    }
}

async fn report(db: PathBuf, code: Option<String>) -> anyhow::Result<()> {
    let store = Store::open_read_only(db).await?;
    let batches = BatchService::new(store.clone());

    match code {
        None => print_overview(&batches).await,
        Some(code) => {
            let batch = batches.get_by_code(&code).await?;
            let stats = batches.get_stats(batch.id).await?;
            println!("batch {} ({})", batch.code, batch.id);
            println!("  type:        {}", batch.r#type);
            println!("  status:      {:?}", batch.status);
            println!("  created_at:  {}", batch.created_at);
            println!(
                "  tasks:       total={} pending={} running={} completed={} failed={}",
                stats.total, stats.pending, stats.running, stats.completed, stats.failed
            );

            let controller = tem_core::InterruptionController::new(store, batches, None);
            let log = controller.get_interruption_log(batch.id).await?;
            if !log.is_empty() {
                println!("  interruption log (most recent first):");
                for event in log {
                    println!("    [{}] {} — {}", event.created_at, event.reason.as_str(), event.message);
                }
            }
        }
    }
    Ok(())
}

async fn print_overview(batches: &BatchService) -> anyhow::Result<()> {
    let all = batches.list().await?;
    println!("{} batch(es)", all.len());
    for batch in all {
        let stats = batches.get_stats(batch.id).await?;
        println!(
            "  {:<6} {:<16} {:<12} {:<11} total={} completed={} failed={} running={} pending={}",
            batch.id,
            batch.code,
            batch.r#type,
            format!("{:?}", batch.status),
            stats.total,
            stats.completed,
            stats.failed,
            stats.running,
            stats.pending
        );
    }
    Ok(())
}

async fn list(db: PathBuf) -> anyhow::Result<()> {
    let store = Store::open_read_only(db).await?;
    let batches = BatchService::new(store);
    print_overview(&batches).await
}

async fn watch(db: PathBuf, code: Option<String>) -> anyhow::Result<()> {
    let store = Store::open_read_only(db).await?;
    let batches = BatchService::new(store.clone());
    let tasks = TaskService::new(store);

    let mut stdout = std::io::stdout();
    loop {
        execute!(stdout, Clear(ClearType::All), MoveTo(0, 0))?;
        match &code {
            Some(code) => {
                let batch = batches.get_by_code(code).await?;
                let stats = batches.get_stats(batch.id).await?;
                println!("watching batch {} ({:?})", batch.code, batch.status);
                println!(
                    "total={} completed={} failed={} running={} pending={}",
                    stats.total, stats.completed, stats.failed, stats.running, stats.pending
                );
                let running = tasks
                    .list_by_batch(batch.id)
                    .await?
                    .into_iter()
                    .filter(|t| matches!(t.status, tem_core::TaskStatus::Running))
                    .count();
                println!("currently running: {running}");
            }
            None => print_overview(&batches).await?,
        }
        println!("\n(ctrl-c to exit)");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}
