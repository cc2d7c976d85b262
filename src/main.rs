use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshdash::actions;
use meshdash::config::Config;
use meshdash::domain::{ApiKey, Mesh, MeshAvailableUpdates, Package, Subscription, User};
use meshdash::page::PageOptions;
use meshdash::session::Session;
use meshdash::store::Entity;
use meshdash::transport::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "meshdash")]
#[command(about = "Browse and update meshes through the dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/meshdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List a collection page by page
  List {
    #[arg(value_enum)]
    resource: Resource,
    /// Partner id (users, subscriptions, meshes)
    #[arg(short, long)]
    partner: Option<String>,
    /// Mesh id (mesh-packages)
    #[arg(short, long)]
    mesh: Option<String>,
    /// Search filter
    #[arg(short, long)]
    search: Option<String>,
    /// Page size (default from config)
    #[arg(short, long)]
    limit: Option<usize>,
    /// Maximum number of pages to fetch
    #[arg(long, default_value_t = 1)]
    pages: usize,
  },
  /// Show a single user or mesh
  Show {
    #[arg(value_enum)]
    kind: Kind,
    id: String,
  },
  /// Show the pending package updates of a mesh
  Updates { mesh: String },
  /// Apply every pending package update of a mesh
  ApplyUpdates { mesh: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Resource {
  Users,
  Packages,
  Subscriptions,
  Meshes,
  MeshPackages,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
  User,
  Mesh,
}

/// Initialize tracing, writing to <data_dir>/meshdash/meshdash.log.
/// Use RUST_LOG to control the level (e.g., RUST_LOG=meshdash=debug).
fn init_tracing() -> WorkerGuard {
  let log_dir = dirs::data_dir()
    .unwrap_or_else(std::env::temp_dir)
    .join("meshdash");
  let appender = tracing_appender::rolling::never(log_dir, "meshdash.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let transport = HttpTransport::new(&config.api.url, Duration::from_secs(config.api.timeout_secs))?;
  let session = Session::new(Arc::new(transport), config.session_settings()?);
  info!(url = %config.api.url, "meshdash starting");

  let result = run(&session, args.command).await;
  session.close();
  result
}

async fn run(session: &Session, command: Command) -> Result<()> {
  match command {
    Command::List {
      resource,
      partner,
      mesh,
      search,
      limit,
      pages,
    } => {
      let listing = Listing {
        search,
        limit,
        pages: pages.max(1),
      };
      match resource {
        Resource::Users => {
          let partner = required(partner, "--partner")?;
          list::<User>(session, ApiKey::Users { partner_id: partner }, &listing).await
        }
        Resource::Subscriptions => {
          let partner = required(partner, "--partner")?;
          list::<Subscription>(session, ApiKey::Subscriptions { partner_id: partner }, &listing).await
        }
        Resource::Meshes => {
          let partner = required(partner, "--partner")?;
          list::<Mesh>(session, ApiKey::Meshes { partner_id: partner }, &listing).await
        }
        Resource::Packages => list::<Package>(session, ApiKey::Packages { search: None }, &listing).await,
        Resource::MeshPackages => {
          let mesh = required(mesh, "--mesh")?;
          list::<Package>(session, ApiKey::MeshPackages { mesh_id: mesh }, &listing).await
        }
      }
    }
    Command::Show { kind, id } => match kind {
      Kind::User => show::<User>(session, ApiKey::User { id }).await,
      Kind::Mesh => show::<Mesh>(session, ApiKey::Mesh { id }).await,
    },
    Command::Updates { mesh } => {
      show::<MeshAvailableUpdates>(session, ApiKey::MeshAvailableUpdates { mesh_id: mesh }).await
    }
    Command::ApplyUpdates { mesh } => {
      let record = actions::apply_available_updates(session, &mesh).await?;
      println!("Applied updates for mesh {}", record.read().id);
      Ok(())
    }
  }
}

struct Listing {
  search: Option<String>,
  limit: Option<usize>,
  pages: usize,
}

async fn list<T: Entity>(session: &Session, key: ApiKey, listing: &Listing) -> Result<()> {
  if key.is_invalid() {
    return Err(eyre!("Missing id for {}", key.description()));
  }
  let mut pager = session.use_page::<T>(
    key.request_key(),
    PageOptions {
      limit: listing.limit,
      is_invalid: false,
    },
  );
  if let Some(search) = &listing.search {
    pager.set_filter("search", search);
  }

  for _ in 0..listing.pages {
    let page = pager.settled().await;
    if let Some(err) = &page.error {
      return Err(eyre!("Failed to load {}: {}", key.description(), err));
    }
    println!("# {} (page {})", key.description(), page.page_index + 1);
    print_json(&page.values())?;
    if !pager.next_page() {
      break;
    }
  }
  Ok(())
}

async fn show<T: Entity>(session: &Session, key: ApiKey) -> Result<()> {
  if key.is_invalid() {
    return Err(eyre!("Missing id for {}", key.description()));
  }
  let state = session.use_api::<T>(&key).settled().await;
  if let Some(err) = &state.error {
    return Err(eyre!("Failed to load {}: {}", key.description(), err));
  }
  let record = state
    .first()
    .ok_or_else(|| eyre!("No data for {}", key.description()))?;
  print_json(&record.snapshot())
}

fn required(value: Option<String>, flag: &str) -> Result<String> {
  value.ok_or_else(|| eyre!("{} is required for this resource", flag))
}

fn print_json(value: &impl Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
