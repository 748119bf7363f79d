mod app;
mod cache;
mod config;
mod event;
mod http;
mod logging;
mod notify;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod worker;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use store::ActionKind;
use sync::SubmitOutcome;

#[derive(Parser, Debug)]
#[command(name = "shopswift-offline")]
#[command(about = "Offline cache and outbox synchronizer for the ShopSwift storefront")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shopswift/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the rolling log file
  #[arg(long)]
  log_stderr: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache the static asset manifest for the configured version
  Install,
  /// Delete cache partitions left over from other versions
  Activate,
  /// Fetch a path through the offline cache
  Fetch {
    /// Path relative to the origin, or an absolute URL
    target: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Treat the request as an image
    #[arg(long)]
    image: bool,
  },
  /// Inspect or extend the pending-action outbox
  Outbox {
    #[command(subcommand)]
    command: OutboxCommand,
  },
  /// Send a mutation, queueing it if the origin is unreachable
  Submit { action: ActionKind, payload: String },
  /// Replay the outbox once
  Sync,
  /// Inspect or import mirrored store data
  Store {
    #[command(subcommand)]
    command: StoreCommand,
  },
  /// Wipe all locally stored entities and pending actions
  Reset,
  /// Run the worker and synchronizer until interrupted
  Run,
  /// Show a push message payload
  Push {
    /// JSON payload with title/body/actions/data
    payload: String,
  },
  /// Simulate a click on the notification for a push payload
  Click { payload: String },
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
  Products {
    store_id: String,
    #[arg(long)]
    category: Option<String>,
  },
  Orders {
    store_id: String,
    #[arg(long)]
    status: Option<String>,
  },
  Profile { store_id: String },
  /// Load a JSON file (an array, or one object for profiles)
  Import { kind: ImportKind, file: PathBuf },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ImportKind {
  Products,
  Orders,
  Profile,
}

#[derive(Subcommand, Debug)]
enum OutboxCommand {
  /// List pending actions, oldest first
  List,
  /// Queue an action, e.g. `enqueue update_order_status '{"order_id":"o1","status":"shipped"}'`
  Enqueue { action: ActionKind, payload: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.data_dir()?.join("logs"), args.log_stderr)?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Install => {
      let report = app.install().await?;
      println!(
        "cached {} assets, {} failed",
        report.cached.len(),
        report.failed.len()
      );
      for url in report.failed {
        println!("  failed: {}", url);
      }
    }
    Command::Activate => {
      let report = app.activate().await?;
      for name in &report.deleted {
        println!("deleted {}", name);
      }
      for name in &report.failed {
        println!("could not delete {}", name);
      }
    }
    Command::Fetch {
      target,
      navigate,
      image,
    } => {
      let result = app.fetch(&target, navigate, image).await?;
      eprintln!(
        "{} ({:?}) {}",
        result.data.status,
        result.source,
        result.data.content_type().unwrap_or("")
      );
      println!("{}", result.data.text());
    }
    Command::Outbox { command } => match command {
      OutboxCommand::List => {
        for action in app.pending_actions().await? {
          println!(
            "{}\t{}\t{}\t{}",
            action.id,
            action.enqueued_at.to_rfc3339(),
            action.action,
            action.payload
          );
        }
      }
      OutboxCommand::Enqueue { action, payload } => {
        let id = app.enqueue(action, &payload).await?;
        println!("queued {} as {}", action, id);
      }
    },
    Command::Submit { action, payload } => match app.submit(action, &payload).await? {
      SubmitOutcome::Sent(response) => println!("{} {}", response.status, response.text()),
      SubmitOutcome::Queued(id) => println!("queued {} as {}", action, id),
    },
    Command::Sync => {
      let report = app.drain().await?;
      println!("replayed {}, remaining {}", report.replayed, report.remaining);
      if let Some(failure) = report.failure {
        println!("stopped at action {}: {}", failure.action_id, failure.error);
      }
    }
    Command::Store { command } => run_store_command(&app, command).await?,
    Command::Reset => {
      app.reset().await?;
      println!("local store cleared");
    }
    Command::Run => app.run().await?,
    Command::Push { payload } => app.push(&payload)?,
    Command::Click { payload } => app.click(&payload)?,
  }

  Ok(())
}

async fn run_store_command(app: &app::App, command: StoreCommand) -> Result<()> {
  match command {
    StoreCommand::Products { store_id, category } => {
      for product in app.products(&store_id, category.as_deref()).await? {
        println!(
          "{}\t{}\t{:.2}\t{}",
          product.product_id,
          product.name,
          product.price,
          product.category.as_deref().unwrap_or("-")
        );
      }
    }
    StoreCommand::Orders { store_id, status } => {
      for order in app.orders(&store_id, status.as_deref()).await? {
        println!(
          "{}\t{}\t{:.2}\t{}",
          order.order_id, order.customer_name, order.total_amount, order.status
        );
      }
    }
    StoreCommand::Profile { store_id } => match app.profile(&store_id).await? {
      Some(profile) => println!("{}\t{}\t{}", profile.store_id, profile.store_name, profile.subdomain),
      None => println!("no profile stored for {}", store_id),
    },
    StoreCommand::Import { kind, file } => {
      let json = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      match kind {
        ImportKind::Products => println!("imported {} products", app.import_products(&json).await?),
        ImportKind::Orders => println!("imported {} orders", app.import_orders(&json).await?),
        ImportKind::Profile => {
          app.import_profile(&json).await?;
          println!("imported store profile");
        }
      }
    }
  }
  Ok(())
}
