use std::{net::SocketAddr, path::PathBuf};

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "sift",
    about = "Capture notes and documents, triage them, and search them"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true, env = "SIFT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API and the extraction workers
    Serve(ServeArgs),
    /// Create a note by hand
    Add(AddArgs),
    /// Show one item
    Get(GetArgs),
    /// List items, newest first
    List(ListArgs),
    /// Fuzzy full-text search
    Search(SearchArgs),
    /// Move an item to another category
    Move(MoveArgs),
    /// Show how many items each category holds
    Counts(CountsArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Serve --

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "SIFT_BIND", default_value = sift::server::DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Endpoint of the content-extraction service
    #[arg(
        long,
        env = "SIFT_EXTRACTOR_URL",
        default_value = sift::extractor::DEFAULT_EXTRACTOR_URL
    )]
    pub extractor_url: String,

    /// Give up on one extraction after this many seconds
    #[arg(long, default_value = "30")]
    pub extract_timeout_secs: u64,

    /// Public base URL prefixed to stored file locations
    #[arg(long, env = "SIFT_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// Number of extractions allowed to run at once
    #[arg(long, default_value = "4")]
    pub workers: usize,

    /// Largest accepted request body, in MiB
    #[arg(long, default_value = "25")]
    pub max_upload_mb: usize,

    /// Only allow this CORS origin (any origin by default)
    #[arg(long, env = "SIFT_CORS_ORIGIN")]
    pub cors_origin: Option<String>,
}

// -- Add --

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Title of the note
    pub title: String,

    /// Optional body text
    #[arg(short, long)]
    pub description: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Get --

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Item id
    pub id: u64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- List --

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Zero-based page number
    #[arg(short, long, default_value = "0")]
    pub page: usize,

    /// Only items in this category
    #[arg(short, long)]
    pub category: Option<String>,

    /// Only items carrying any of these tags (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Zero-based page number
    #[arg(short, long, default_value = "0")]
    pub page: usize,

    /// Only items in this category
    #[arg(short, long)]
    pub category: Option<String>,

    /// Only items carrying any of these tags (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Move --

#[derive(Debug, Parser)]
pub struct MoveArgs {
    /// Item id
    pub id: u64,

    /// Target category: inbox, actionable, eliminate, incubate or file
    pub category: String,

    /// Replace the item's tags (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Option<Vec<String>>,

    /// Set a due date (RFC 3339)
    #[arg(long, conflicts_with = "clear_due")]
    pub due: Option<DateTime<Utc>>,

    /// Remove the due date
    #[arg(long)]
    pub clear_due: bool,

    /// Mark the item done or not done
    #[arg(long)]
    pub done: Option<bool>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Counts --

#[derive(Debug, Parser)]
pub struct CountsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "sift",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_serve_defaults() {
        let cli = Cli::try_parse_from(["sift", "serve"]).unwrap();
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.extract_timeout_secs, 30);
                assert_eq!(args.workers, 4);
                assert_eq!(args.max_upload_mb, 25);
            }
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn parse_move_with_updates() {
        let cli = Cli::try_parse_from([
            "sift",
            "move",
            "3",
            "file",
            "--tags",
            "tax,2024",
            "--done",
            "true",
        ])
        .unwrap();
        match cli.command {
            Command::Move(args) => {
                assert_eq!(args.id, 3);
                assert_eq!(args.category, "file");
                assert_eq!(
                    args.tags,
                    Some(vec!["tax".to_string(), "2024".to_string()])
                );
                assert_eq!(args.done, Some(true));
                assert!(args.due.is_none());
            }
            _ => panic!("expected move command"),
        }
    }

    #[test]
    fn due_and_clear_due_conflict() {
        let res = Cli::try_parse_from([
            "sift",
            "move",
            "1",
            "actionable",
            "--due",
            "2025-01-01T00:00:00Z",
            "--clear-due",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn parse_search_filters() {
        let cli = Cli::try_parse_from([
            "sift", "search", "budget", "-c", "file", "-t", "a,b", "-p", "2",
        ])
        .unwrap();
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "budget");
                assert_eq!(args.category.as_deref(), Some("file"));
                assert_eq!(args.tags, vec!["a".to_string(), "b".to_string()]);
                assert_eq!(args.page, 2);
            }
            _ => panic!("expected search command"),
        }
    }
}
