//! rewind shell - interactive SQL shell over the in-memory backend

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rewind_cli::{render, LoggingListener};
use rewind_core::backend::InMemoryBackend;
use rewind_core::{Connection, Runtime, RuntimeConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// rewind shell - interactive SQL shell
#[derive(Parser, Debug)]
#[command(name = "rewind-shell")]
#[command(about = "Interactive SQL shell for the rewind connection runtime", long_about = None)]
struct Args {
    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQL statement to execute (if provided, runs in non-interactive mode)
    #[arg(short, long)]
    query: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = RuntimeConfig::load_from(args.config.as_deref())
        .context("failed to load configuration")?;
    init_tracing(&config, args.debug);

    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let runtime = rt.block_on(Runtime::connect(Arc::new(InMemoryBackend::new()), config))?;
    let mut conn = runtime.connection();
    conn.add_retry_listener(Arc::new(LoggingListener));
    info!(connection = %conn.id(), "connected to in-memory backend");

    if let Some(query) = args.query {
        execute_and_display(&rt, &mut conn, &query)?;
    } else {
        interactive_mode(&rt, &mut conn, args.debug)?;
    }

    rt.block_on(async {
        conn.close().await;
        runtime.close().await;
    });
    Ok(())
}

fn init_tracing(config: &RuntimeConfig, debug: bool) {
    let log_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn interactive_mode(rt: &tokio::runtime::Runtime, conn: &mut Connection, debug: bool) -> Result<()> {
    println!("rewind interactive SQL shell");
    println!("Type SQL statements and press Enter. Type 'exit' or 'quit' to exit.");
    println!("Press Ctrl-C twice to exit.\n");

    let mut rl = DefaultEditor::new()?;
    let history_file = dirs::home_dir()
        .map(|mut p| {
            p.push(".rewind_history");
            p
        })
        .unwrap_or_default();
    if history_file.exists() {
        let _ = rl.load_history(&history_file);
    }

    let mut interrupt_count = 0;
    loop {
        let prompt = if conn.is_in_transaction() {
            "rewind*> "
        } else {
            "rewind> "
        };
        match rl.readline(prompt) {
            Ok(line) => {
                interrupt_count = 0;
                let statement = line.trim();
                if statement.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(statement);

                if statement.eq_ignore_ascii_case("exit") || statement.eq_ignore_ascii_case("quit")
                {
                    println!("Goodbye!");
                    break;
                }

                if let Err(e) = execute_and_display(rt, conn, statement) {
                    eprintln!("Error: {}", e);
                    if debug {
                        eprintln!("Details: {:?}", e);
                    }
                }
                println!();
            }
            Err(ReadlineError::Interrupted) => {
                interrupt_count += 1;
                if interrupt_count >= 2 {
                    println!("\nGoodbye!");
                    break;
                }
                println!("^C (press Ctrl-C again to exit)");
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Error reading input: {}", err);
                break;
            }
        }
    }

    if !history_file.as_os_str().is_empty() {
        let _ = rl.save_history(&history_file);
    }
    Ok(())
}

fn execute_and_display(
    rt: &tokio::runtime::Runtime,
    conn: &mut Connection,
    sql: &str,
) -> Result<()> {
    let start = Instant::now();
    let result = rt.block_on(conn.execute_sql(sql))?;
    println!("{}", render(&result));
    println!("{:.3}s", start.elapsed().as_secs_f64());
    Ok(())
}
