//! Command-line subcommands and their handlers.

use chrono::Utc;
use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use cairn::app::App;
use cairn::gateway::{Origin, Reply};
use cairn::session::Session;
use cairn::store::{MutationFilter, MutationStatus, QueueCounts, QueuedMutation, StoredBlob};
use cairn::sync::SyncState;
use cairn::transport::Method;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show sync state and queue counts
  Status,
  /// Drain the mutation queue once
  Sync,
  /// Move failed mutations back to pending and drain
  RetryFailed,
  /// Delete a queued mutation
  Discard { id: i64 },
  /// List queued mutations
  Queue {
    /// pending, syncing, failed or completed
    #[arg(long)]
    status: Option<MutationStatus>,
    #[arg(long)]
    visit: Option<String>,
  },
  /// Read a URL, falling back to the cache when offline
  Get { url: String },
  /// Issue a request, queueing writes that cannot reach the server
  Send {
    method: Method,
    url: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
  },
  /// Inspect or clear the response cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// Manage stored blobs
  Blob {
    #[command(subcommand)]
    action: BlobAction,
  },
  /// Manage the identity attached to requests
  Session {
    #[command(subcommand)]
    action: SessionAction,
  },
  /// Run the sync service and print every state change until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
  List,
  Clear {
    /// Only entries belonging to this visit
    #[arg(long)]
    visit: Option<String>,
  },
  Drop { url: String },
}

#[derive(Subcommand, Debug)]
pub enum BlobAction {
  Put {
    id: String,
    file: PathBuf,
    #[arg(long, default_value = "application/octet-stream")]
    mime: String,
    #[arg(long)]
    visit: Option<String>,
  },
  Get { id: String, out: PathBuf },
  Rm { id: String },
  List {
    #[arg(long)]
    visit: String,
  },
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
  Login {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    name: String,
    #[arg(long)]
    role: String,
  },
  Logout,
  Show,
}

pub async fn run(app: &App, command: Command) -> Result<()> {
  match command {
    Command::Status => status(app).await,
    Command::Sync => {
      let state = app.engine().sync_now().await?;
      print_state(&state)
    }
    Command::RetryFailed => {
      let state = app.engine().retry_failed().await?;
      print_state(&state)
    }
    Command::Discard { id } => {
      if !app.engine().discard(id).await? {
        return Err(eyre!("No queued mutation with id {}", id));
      }
      println!("discarded {}", id);
      Ok(())
    }
    Command::Queue { status, visit } => queue(app, status, visit).await,
    Command::Get { url } => {
      let reply = app.gateway().read(&url).await?;
      print_reply(&reply)
    }
    Command::Send { method, url, body } => {
      let body = body.as_deref().map(parse_body).transpose()?;
      let reply = app.gateway().execute(method, &url, body).await?;
      print_reply(&reply)
    }
    Command::Cache { action } => cache(app, action).await,
    Command::Blob { action } => blob(app, action).await,
    Command::Session { action } => session(app, action),
    Command::Watch => watch(app).await,
  }
}

async fn status(app: &App) -> Result<()> {
  let state = app.engine().refresh().await?;
  let counts = app.store().queue_counts().await?;

  #[derive(Serialize)]
  struct Status<'a> {
    state: &'a SyncState,
    queue: QueueCounts,
  }
  print_json(&Status {
    state: &state,
    queue: counts,
  })
}

async fn queue(app: &App, status: Option<MutationStatus>, visit: Option<String>) -> Result<()> {
  let filter = MutationFilter {
    status,
    entity_id: visit,
  };
  let mutations = app.store().mutations(&filter).await?;
  if mutations.is_empty() {
    println!("queue is empty");
    return Ok(());
  }
  for mutation in &mutations {
    println!("{}", queue_line(mutation));
  }
  Ok(())
}

async fn cache(app: &App, action: CacheAction) -> Result<()> {
  let store = app.store();
  match action {
    CacheAction::List => {
      for url in store.cached_urls().await? {
        println!("{}", url);
      }
    }
    CacheAction::Clear { visit: Some(visit) } => {
      let removed = app.gateway().clear_cache_for_visit(&visit).await?;
      println!("removed {} cached responses for visit {}", removed, visit);
    }
    CacheAction::Clear { visit: None } => {
      let removed = store.clear_cache().await?;
      println!("removed {} cached responses", removed);
    }
    CacheAction::Drop { url } => {
      if !store.delete_cached(&url).await? {
        return Err(eyre!("Nothing cached for {}", url));
      }
    }
  }
  Ok(())
}

async fn blob(app: &App, action: BlobAction) -> Result<()> {
  let store = app.store();
  match action {
    BlobAction::Put {
      id,
      file,
      mime,
      visit,
    } => {
      let data = std::fs::read(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let size = data.len();
      store
        .put_blob(&StoredBlob {
          id: id.clone(),
          data,
          mime_type: mime,
          filename: file_name(&file),
          entity_id: visit,
          created_at: Utc::now(),
        })
        .await?;
      println!("stored {} ({} bytes)", id, size);
    }
    BlobAction::Get { id, out } => {
      let blob = store
        .blob(&id)
        .await?
        .ok_or_else(|| eyre!("No blob with id {}", id))?;
      std::fs::write(&out, &blob.data)
        .map_err(|e| eyre!("Failed to write {}: {}", out.display(), e))?;
      println!("wrote {} bytes to {}", blob.data.len(), out.display());
    }
    BlobAction::Rm { id } => {
      if !store.delete_blob(&id).await? {
        return Err(eyre!("No blob with id {}", id));
      }
    }
    BlobAction::List { visit } => {
      for blob in store.blobs_for_entity(&visit).await? {
        println!(
          "{}\t{}\t{} bytes\t{}",
          blob.id,
          blob.mime_type,
          blob.data.len(),
          blob.filename.as_deref().unwrap_or("-")
        );
      }
    }
  }
  Ok(())
}

fn session(app: &App, action: SessionAction) -> Result<()> {
  match action {
    SessionAction::Login {
      user_id,
      name,
      role,
    } => app.login(Session::new(user_id, name, role)),
    SessionAction::Logout => {
      if !app.logout()? {
        println!("no session stored");
      }
      Ok(())
    }
    SessionAction::Show => match app.gateway().session() {
      Some(session) => print_json(&session),
      None => {
        println!("no session stored");
        Ok(())
      }
    },
  }
}

async fn watch(app: &App) -> Result<()> {
  let service = app.service();
  let _subscription = app.publisher().subscribe(|state| {
    if let Ok(line) = serde_json::to_string(state) {
      println!("{}", line);
    }
  });

  service.start().await?;
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
  service.stop().await;
  Ok(())
}

fn parse_body(raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Request body is not valid JSON: {}", e))
}

fn file_name(path: &Path) -> Option<String> {
  path
    .file_name()
    .map(|name| name.to_string_lossy().into_owned())
}

fn origin_label(origin: &Origin) -> String {
  match origin {
    Origin::Live => "live".to_string(),
    Origin::Stale { captured_at } => format!("stale, cached {}", captured_at.to_rfc3339()),
    Origin::Queued { mutation_id } => format!("queued as #{}", mutation_id),
  }
}

fn queue_line(mutation: &QueuedMutation) -> String {
  let mut line = format!(
    "#{}\t{}\t{}\t{}\tattempts={}",
    mutation.id,
    mutation.status,
    mutation.created_at.to_rfc3339(),
    mutation.describe(),
    mutation.retry_count
  );
  if let Some(error) = &mutation.last_error {
    line.push('\t');
    line.push_str(error);
  }
  line
}

fn print_reply(reply: &Reply) -> Result<()> {
  eprintln!("{} ({})", reply.status, origin_label(&reply.origin));
  print_json(&reply.body)
}

fn print_state(state: &SyncState) -> Result<()> {
  print_json(state)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}
