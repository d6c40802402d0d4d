use std::{sync::Arc, time::Duration};

use clap::Parser;
use sift::{
    AppState,
    BlobStore,
    Category,
    DataDir,
    Item,
    ItemDb,
    ItemPatch,
    SearchIndex,
    error::{self, Error},
    extractor::{DEFAULT_EXTRACTOR_URL, TikaExtractor},
    item::normalize_tags,
    query::Page,
    server::{self, ServerConfig},
    worker::{ExtractionWorker, WorkerConfig, WorkerPool},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SIFT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Serve(args) => cmd_serve(&data_dir, args).await?,
        Command::Add(args) => {
            let state = open_offline(&data_dir)?;
            let item = state
                .pipeline
                .create(&args.title, args.description)
                .await?;
            if args.json {
                print_json(&item)?;
            } else {
                println!("Created #{}", item.id);
            }
        }
        Command::Get(args) => {
            let state = open_offline(&data_dir)?;
            let item = state.pipeline.get(args.id).await?;
            if args.json {
                print_json(&item)?;
            } else {
                print_item_details(&item);
            }
        }
        Command::List(args) => {
            let state = open_offline(&data_dir)?;
            let category = parse_category(args.category.as_deref())?;
            let tags = normalize_tags(args.tags.iter().map(String::as_str));
            let page = state.query.list(args.page, category, tags).await?;
            print_page(&page, args.json)?;
        }
        Command::Search(args) => {
            let state = open_offline(&data_dir)?;
            let category = parse_category(args.category.as_deref())?;
            let tags = normalize_tags(args.tags.iter().map(String::as_str));
            let page = state
                .query
                .search(args.query, args.page, category, tags)
                .await?;
            print_page(&page, args.json)?;
        }
        Command::Move(args) => {
            let state = open_offline(&data_dir)?;
            let category: Category = args.category.parse()?;
            let due_date = if args.clear_due {
                Some(None)
            } else {
                args.due.map(Some)
            };
            let updates = ItemPatch {
                category: None,
                tags: args.tags,
                due_date,
                done: args.done,
            };
            let item = state
                .triage
                .recategorize(args.id, category, updates)
                .await?;
            if args.json {
                print_json(&item)?;
            } else {
                println!("Moved #{} to {}", item.id, item.category);
            }
        }
        Command::Counts(args) => {
            let state = open_offline(&data_dir)?;
            let counts = state.triage.counts().await?;
            if args.json {
                print_json(&counts)?;
            } else {
                for category in Category::ALL {
                    println!("{category}: {}", counts.get(category));
                }
            }
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Open both stores and wire up the services around them.
fn open_state(
    data_dir: &DataDir,
    extractor_url: &str,
    workers: WorkerConfig,
    public_url: Option<String>,
) -> error::Result<AppState> {
    let db = Arc::new(ItemDb::open(&data_dir.items_db())?);
    let index = Arc::new(SearchIndex::open(&data_dir.tantivy_dir()?)?);
    let blobs = Arc::new(BlobStore::new(data_dir.uploads_dir()?, public_url));

    let extractor = Arc::new(TikaExtractor::new(extractor_url, workers.timeout)?);
    let worker = ExtractionWorker::new(
        Arc::clone(&db),
        Arc::clone(&index),
        extractor,
        workers.timeout,
    );
    let pool = WorkerPool::new(worker, workers.workers);

    Ok(AppState::new(db, index, blobs, pool))
}

/// Services for one-shot commands. Both stores take an exclusive lock, so
/// these fail while `sift serve` holds the same data directory.
fn open_offline(data_dir: &DataDir) -> error::Result<AppState> {
    open_state(data_dir, DEFAULT_EXTRACTOR_URL, WorkerConfig::default(), None)
}

async fn cmd_serve(data_dir: &DataDir, args: cli::ServeArgs) -> error::Result<()> {
    let workers = WorkerConfig {
        workers: args.workers,
        timeout: Duration::from_secs(args.extract_timeout_secs),
    };
    let state = open_state(data_dir, &args.extractor_url, workers, args.public_url)?;
    let pool = state.pipeline.pool().clone();

    let config = ServerConfig {
        max_upload_bytes: args.max_upload_mb.saturating_mul(1024 * 1024),
        cors_origin: args.cors_origin,
    };
    let app = server::router(state, &config)?;

    info!(
        data_dir = %data_dir.root().display(),
        extractor = %args.extractor_url,
        workers = pool.workers(),
        "starting server"
    );
    server::serve(args.bind, app, shutdown_signal()).await?;

    if pool.in_flight() > 0 {
        info!(in_flight = pool.in_flight(), "waiting for extractions to finish");
        if tokio::time::timeout(workers.timeout, pool.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = pool.in_flight(),
                "extractions still running at shutdown"
            );
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn parse_category(raw: Option<&str>) -> error::Result<Option<Category>> {
    raw.map(str::parse::<Category>).transpose()
}

fn print_json<T: serde::Serialize>(value: &T) -> error::Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(Error::from)?;
    println!("{json}");
    Ok(())
}

fn print_item_line(item: &Item) {
    let status = item
        .status
        .map(|s| format!(" ({})", s.as_str()))
        .unwrap_or_default();
    println!("#{} [{}] {}{status}", item.id, item.category, item.title);
}

fn print_item_details(item: &Item) {
    print_item_line(item);
    println!("Created: {}", item.created_at.to_rfc3339());
    if let Some(location) = &item.file_location {
        println!("File: {location}");
    }
    if !item.tags.is_empty() {
        println!("Tags: {}", item.tags.join(", "));
    }
    if let Some(due) = item.due_date {
        println!("Due: {}", due.to_rfc3339());
    }
    if item.done {
        println!("Done: yes");
    }
    if let Some(description) = &item.description {
        println!();
        println!("{description}");
    }
}

fn print_page(page: &Page, json: bool) -> error::Result<()> {
    if json {
        return print_json(page);
    }
    if page.items.is_empty() {
        eprintln!("No items found.");
        return Ok(());
    }
    for item in &page.items {
        print_item_line(item);
    }
    let shown = page.page * page.limit + page.items.len();
    eprintln!("Showing {shown} of {} (page {})", page.total, page.page);
    Ok(())
}
