use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use client_core::{
    ClientEvent, DeletionError, EntityKey, EventsClient, HttpEventsApi, MutationState,
};
use shared::{
    domain::{EventDetail, EventId, EventPatch},
    error::ErrorCode,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_api_url};

#[derive(Parser, Debug)]
#[command(about = "View, edit and delete events")]
struct Args {
    /// Overrides the configured events API base url.
    #[arg(long)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all events.
    List,
    /// Show one event.
    Show { id: String },
    /// Edit an event. Only the given fields change.
    Edit {
        id: String,
        #[command(flatten)]
        fields: EditFields,
    },
    /// Delete an event after confirmation.
    Delete {
        id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(ClapArgs, Debug, Default)]
struct EditFields {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    time: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    image: Option<String>,
}

impl From<EditFields> for EventPatch {
    fn from(fields: EditFields) -> Self {
        Self {
            title: fields.title,
            description: fields.description,
            date: fields.date,
            time: fields.time,
            location: fields.location,
            image: fields.image,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(url) = &args.api_url {
        settings.api_url = normalize_api_url(url);
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .init();

    let api = HttpEventsApi::new(&settings.api_url)?;
    info!(api_url = %api.base_url(), "events_cli: starting");
    let client = EventsClient::new(Arc::new(api));

    match args.command {
        Command::List => list(&client).await,
        Command::Show { id } => show(&client, &EventId::new(id)).await,
        Command::Edit { id, fields } => edit(&client, EventId::new(id), fields.into()).await,
        Command::Delete { id, yes } => delete(&client, &EventId::new(id), yes).await,
    }
}

async fn list(client: &EventsClient) -> Result<()> {
    let events = client
        .load_event_list()
        .await
        .context("failed to load events")?;
    if events.is_empty() {
        println!("No events found.");
    }
    for event in events {
        println!(
            "{:<8} {:<12} {:<32} {}",
            event.id, event.date, event.title, event.location
        );
    }
    Ok(())
}

async fn show(client: &EventsClient, id: &EventId) -> Result<()> {
    let event = client
        .load_event(id)
        .await
        .with_context(|| format!("failed to load event {id}"))?;
    print_event(&event);
    Ok(())
}

async fn edit(client: &Arc<EventsClient>, id: EventId, patch: EventPatch) -> Result<()> {
    if patch.is_empty() {
        anyhow::bail!("nothing to change; pass at least one field flag");
    }
    client
        .load_event(&id)
        .await
        .with_context(|| format!("failed to load event {id}"))?;

    let key = EntityKey::event(&id);
    let mut events = client.subscribe_events();
    let task = {
        let client = Arc::clone(client);
        let id = id.clone();
        tokio::spawn(async move { client.submit_edit(&id, patch).await })
    };

    while let Ok(event) = events.recv().await {
        if event
            == (ClientEvent::MutationStateChanged {
                key: key.clone(),
                state: MutationState::SpeculativeApplied,
            })
        {
            if let Some(speculative) = client.cache().read(&key).value {
                if let Some(detail) = speculative.as_event() {
                    println!("Saving (shown optimistically):");
                    print_event(detail);
                }
            }
            break;
        }
    }

    match task.await.context("edit task panicked")? {
        Ok(saved) => {
            println!("Saved.");
            match client.load_event(&id).await {
                Ok(current) => print_event(&current),
                Err(err) => {
                    warn!(id = %id, error = %err, "edit: could not reload saved event");
                    print_event(&saved);
                }
            }
            Ok(())
        }
        Err(err) => {
            for (field, message) in &err.fields {
                eprintln!("  {field}: {message}");
            }
            if let Some(hint) = failure_hint(err.code) {
                eprintln!("{hint}");
            }
            Err(err).with_context(|| format!("failed to update event {id}; changes were rolled back"))
        }
    }
}

async fn delete(client: &EventsClient, id: &EventId, yes: bool) -> Result<()> {
    let flow = client.deletion_flow(id);
    flow.request_delete()?;

    if !yes && !confirm_on_stdin(id)? {
        flow.cancel()?;
        println!("Deletion cancelled.");
        return Ok(());
    }

    match flow.confirm().await {
        Ok(()) => {
            println!("Event {id} deleted.");
            Ok(())
        }
        Err(err) => {
            if let DeletionError::Remote(remote) = &err {
                if let Some(hint) = failure_hint(remote.code) {
                    eprintln!("{hint}");
                }
            }
            let message = flow
                .snapshot()
                .error_message
                .unwrap_or_else(|| err.to_string());
            anyhow::bail!("failed to delete event {id}: {message}")
        }
    }
}

fn failure_hint(code: ErrorCode) -> Option<&'static str> {
    if code.is_retry_safe() {
        Some("The server could not be reached. Running the command again is safe.")
    } else if code.requires_reconcile() {
        Some("The event changed on the server. Run `show` to see the current version.")
    } else {
        None
    }
}

fn confirm_on_stdin(id: &EventId) -> Result<bool> {
    print!("Are you sure you want to delete event {id}? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

fn print_event(event: &EventDetail) {
    println!("{} ({})", event.title, event.id);
    println!("  when:     {} @ {}", event.date, event.time);
    println!("  where:    {}", event.location);
    if !event.image.is_empty() {
        println!("  image:    {}", event.image);
    }
    if !event.description.is_empty() {
        println!("  about:    {}", event.description);
    }
    if let Some(updated_at) = &event.updated_at {
        println!("  updated:  {updated_at}");
    }
}
