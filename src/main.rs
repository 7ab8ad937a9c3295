use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use prq::cache::{CacheStorage, SqliteStorage};
use prq::config::Config;
use prq::query::{FetchResult, QueryClient, QueryResult, ServiceResponse};
use prq::review::{PullRequestFilter, ReviewClient, ReviewQueries};

#[derive(Parser, Debug)]
#[command(name = "prq")]
#[command(about = "Query code-review projects from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/prq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Review API base url (overrides the config file)
  #[arg(long)]
  api_url: Option<String>,

  /// Also write logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List your projects with dashboard counters
  Projects,
  /// Show pull request details
  Pr { project: i64, number: u64 },
  /// List the comments on a pull request
  Comments { project: i64, number: u64 },
  /// Comment on a pull request
  Comment {
    project: i64,
    number: u64,
    text: String,
  },
  /// Edit a comment on a pull request
  Edit {
    project: i64,
    number: u64,
    comment_id: i64,
    text: String,
  },
  /// Delete a comment from a pull request
  Uncomment {
    project: i64,
    number: u64,
    comment_id: i64,
  },
  /// List the automated reviews of a pull request
  Reviews { project: i64, number: u64 },
  /// List pull requests
  Pulls {
    project: i64,
    /// open, closed, merged or all
    #[arg(long, default_value = "open")]
    state: String,
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = 20)]
    per_page: u32,
  },
  /// Show a project with its branches and members
  Project { project: i64 },
  /// Manage the persistent cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove every persisted query
  Clear,
  /// Show how many queries are persisted
  Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = prq::logging::init(args.verbose)?;

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override API url if specified on command line
  if let Some(url) = args.api_url {
    config.api.url = url;
  }

  let storage = open_storage(&config)?;

  if let Command::Cache { action } = &args.command {
    return run_cache(action, storage.as_deref());
  }

  let mut builder = QueryClient::builder();
  if let Some(storage) = storage {
    builder = builder.storage(storage);
  }
  let cache = builder.build();
  let queries = ReviewQueries::new(ReviewClient::new(&config)?, cache.clone(), &config);

  let outcome = run_query(&queries, args.command).await;
  debug!(stats = ?cache.stats(), "query cache");
  outcome
}

fn open_storage(config: &Config) -> Result<Option<Arc<dyn CacheStorage>>> {
  if !config.cache.persist {
    return Ok(None);
  }

  let storage: Arc<dyn CacheStorage> = match &config.cache.path {
    Some(path) => Arc::new(SqliteStorage::open_at(path)?),
    None => Arc::new(SqliteStorage::open()?),
  };
  Ok(Some(storage))
}

fn run_cache(action: &CacheAction, storage: Option<&dyn CacheStorage>) -> Result<()> {
  let storage =
    storage.ok_or_else(|| eyre!("Persistent cache is disabled (cache.persist: false)"))?;

  match action {
    CacheAction::Clear => {
      storage.clear()?;
      info!("persistent cache cleared");
      println!("Cache cleared");
    }
    CacheAction::Stats => {
      print_json(&serde_json::json!({ "entries": storage.len()? }))?;
    }
  }
  Ok(())
}

async fn run_query(queries: &ReviewQueries, command: Command) -> Result<()> {
  match command {
    Command::Projects => print_result(queries.dashboard().await),
    Command::Pr { project, number } => print_result(queries.pr_details(project, number).await),
    Command::Comments { project, number } => {
      print_result(queries.pr_comments(project, number).await)
    }
    Command::Comment {
      project,
      number,
      text,
    } => print_response(queries.create_comment(project, number, &text).await),
    Command::Edit {
      project,
      number,
      comment_id,
      text,
    } => print_response(
      queries
        .update_comment(project, number, comment_id, &text)
        .await,
    ),
    Command::Uncomment {
      project,
      number,
      comment_id,
    } => match queries
      .delete_comment(project, number, comment_id)
      .await
      .into_fetch_result()
    {
      FetchResult::Success(()) => {
        println!("Comment {} deleted", comment_id);
        Ok(())
      }
      FetchResult::Failure(message) => Err(eyre!("{}", message)),
    },
    Command::Reviews { project, number } => {
      print_result(queries.ai_reviews(project, number).await)
    }
    Command::Pulls {
      project,
      state,
      page,
      per_page,
    } => {
      let filter = PullRequestFilter {
        state,
        page,
        per_page,
      };
      print_result(queries.pull_requests(project, &filter).await)
    }
    Command::Project { project } => print_result(queries.project_overview(project).await),
    Command::Cache { .. } => Err(eyre!("cache commands do not run queries")),
  }
}

fn print_result<T: Serialize>(result: QueryResult<T>) -> Result<()> {
  if let Some(error) = result.error() {
    return Err(eyre!("{}", error));
  }

  match result.data() {
    Some(data) => print_json(data),
    None => Err(eyre!(
      "Nothing to fetch: project ids and pull request numbers must be positive"
    )),
  }
}

fn print_response<T: Serialize>(response: ServiceResponse<T>) -> Result<()> {
  match response.into_fetch_result() {
    FetchResult::Success(data) => print_json(&data),
    FetchResult::Failure(message) => Err(eyre!("{}", message)),
  }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let json =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", json);
  Ok(())
}
