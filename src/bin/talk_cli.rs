use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use talk::talk::history::HistoryLoader;
use talk::{Message, MessageStore, PocketBaseStore, Talk, TalkConfig};

/// Manual client for a Talk record store
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Base URL of the record store
    #[clap(long, env = "TALK_SERVER_URL", value_name = "URL")]
    server_url: String,

    /// Auth token of the signed-in user
    #[clap(long, env = "TALK_AUTH_TOKEN", requires = "user_id")]
    token: Option<String>,

    /// Record id of the signed-in user
    #[clap(long, env = "TALK_USER_ID")]
    user_id: Option<String>,

    /// Directory for application data
    #[clap(long, env = "TALK_DATA_DIR", value_name = "PATH", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, env = "TALK_LOGS_DIR", value_name = "PATH", default_value = "./logs")]
    logs_dir: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the newest messages of a conversation, paging back as requested
    History {
        conversation: String,
        #[clap(long, default_value_t = 1)]
        pages: u32,
    },
    /// Print the window around a message
    Around {
        message: String,
        #[clap(long, default_value_t = 50)]
        window: u32,
    },
    /// Send a text message through the outbound queue
    Send { conversation: String, text: String },
    /// Search a conversation's messages
    Search { conversation: String, query: String },
    /// Follow a conversation until interrupted
    Tail { conversation: String },
}

fn print_message(message: &Message) {
    println!(
        "{} [{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.id,
        message
            .sender_profile
            .as_ref()
            .and_then(|p| p.name.as_deref())
            .or(message.sender_id.as_deref())
            .unwrap_or("system"),
        message.content
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut store = PocketBaseStore::new(&args.server_url);
    if let (Some(token), Some(user_id)) = (&args.token, &args.user_id) {
        store = store.with_auth(token.clone(), user_id.clone());
    }
    let store: Arc<dyn MessageStore> = Arc::new(store);

    match args.command {
        Command::History {
            conversation,
            pages,
        } => {
            let history = HistoryLoader::new(store, 50);
            let mut page = history.load_latest(&conversation).await?;
            let mut messages = page.messages.clone();
            for _ in 1..pages {
                let Some(oldest) = messages.first() else {
                    break;
                };
                if !page.has_more_older {
                    break;
                }
                page = history.load_older(&conversation, oldest.created_at).await?;
                let mut older = page.messages.clone();
                older.append(&mut messages);
                messages = older;
            }
            messages.iter().for_each(print_message);
            if page.has_more_older {
                println!("... older messages available");
            }
        }
        Command::Around { message, window } => {
            let history = HistoryLoader::new(store, 50);
            let around = history.load_around(&message, window).await?;
            for (index, message) in around.messages.iter().enumerate() {
                if index == around.target_index {
                    print!("> ");
                }
                print_message(message);
            }
            println!(
                "more before: {}, more after: {}",
                around.has_more_before, around.has_more_after
            );
        }
        Command::Send { conversation, text } => {
            let config = TalkConfig::new(&args.data_dir, &args.logs_dir, &args.server_url);
            let talk = Talk::initialize(config, store).await?;
            let temp_id = talk.send_message(&conversation, &text).await?;
            let queued = talk.outbound_queue().snapshot();
            match queued.iter().find(|p| p.temp_id == temp_id) {
                Some(entry) => println!("Queued as {} ({})", temp_id, entry.status),
                None => println!("Delivered"),
            }
            talk.shutdown().await;
        }
        Command::Search {
            conversation,
            query,
        } => {
            let page = store.search(&conversation, &query, 50).await?;
            page.items.iter().for_each(print_message);
        }
        Command::Tail { conversation } => {
            let config = TalkConfig::new(&args.data_dir, &args.logs_dir, &args.server_url);
            let talk = Talk::initialize(config, store).await?;
            let mut controller = talk
                .open_conversation(&conversation, None)
                .await
                .context("Failed to open conversation")?;
            let mut updates = controller.subscribe();
            let mut printed = 0;

            loop {
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.messages.len() < printed {
                    printed = 0;
                }
                snapshot.messages[printed..].iter().for_each(print_message);
                printed = snapshot.messages.len();

                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            controller.close();
            talk.shutdown().await;
        }
    }

    Ok(())
}
