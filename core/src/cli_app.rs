use crate::client::ChatClient;
use crate::config::ChatConfig;
use crate::gateway::memory::{InMemoryBackend, InMemoryGateway};
use crate::gateway::MessageGateway;
use crate::messenger_types::{ChatEvent, Message, MessageId, Role};
use crate::session::{LocalUser, SessionState};
use colored::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

type Client = ChatClient<InMemoryGateway>;

/// Interactive console: the local user chats with a simulated counterpart
/// over an in-memory backend.
pub async fn run(config: ChatConfig) -> anyhow::Result<()> {
    let backend = InMemoryBackend::new();

    let me = LocalUser {
        display_name: Some("You".to_string()),
        ..LocalUser::new(config.local_user_id.clone(), config.local_email.clone(), config.role)
    };
    let counterpart = match config.role {
        Role::Advisor => LocalUser {
            display_name: Some("Carla (customer)".to_string()),
            ..LocalUser::new("customer-1", "carla@planchat.dev", Role::Customer)
        },
        Role::Customer => LocalUser {
            display_name: Some("Andrés (advisor)".to_string()),
            ..LocalUser::new("advisor-1", "andres@planchat.dev", Role::Advisor)
        },
    };
    backend.add_user(&me);
    backend.add_user(&counterpart);

    let session = SessionState::new();
    if config.guest {
        session.enter_guest();
    } else {
        session.sign_in(me.clone());
    }

    let bot = spawn_counterpart(&backend, counterpart.clone(), me.id.clone()).await?;

    let client = Arc::new(ChatClient::new(backend.gateway(session.clone()), session, config.clone()));
    client.start().await;

    print_banner(&me, &counterpart);

    if config.auto_open_advisor {
        match client.open_advisor_chat().await {
            Ok(Some(advisor)) => println!("{} Chatting with {}", "✓".green().bold(), advisor.label().cyan()),
            Ok(None) => {}
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().red()),
        }
    }

    let printed = Arc::new(Mutex::new(HashSet::new()));
    print_new_messages(&client, &printed).await;
    let renderer = spawn_renderer(client.clone(), printed.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end().to_string();
        if !handle_line(&client, &line).await {
            break;
        }
        print_new_messages(&client, &printed).await;
    }

    renderer.abort();
    bot.abort();
    client.shutdown().await;
    println!("{}", "Bye".dimmed());
    Ok(())
}

/// Returns false when the console should exit
async fn handle_line(client: &Client, line: &str) -> bool {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or("");
    let arg = parts.next().map(str::trim).unwrap_or("");

    match command {
        "/quit" | "/exit" => return false,
        "/help" => print_help(),
        "/open" => {
            if arg.is_empty() {
                eprintln!("{}", "Usage: /open <peer_id>".yellow());
            } else {
                let history = client.load_conversation(arg).await;
                println!("{} Opened {} ({} messages)", "✓".green().bold(), arg.cyan(), history.len());
            }
        }
        "/close" => {
            client.close_conversation().await;
            println!("{} Conversation closed", "✓".green().bold());
        }
        "/inbox" => print_inbox(client).await,
        "/typing" => client.notify_typing().await,
        "/retry" => {
            let outcome = client.retry_message(&MessageId::new(arg)).await;
            report(outcome.success, outcome.error.as_deref());
        }
        "/discard" => {
            let removed = client.discard_message(&MessageId::new(arg)).await;
            report(removed, Some("no such local message"));
        }
        "/delete" => {
            let outcome = client.delete_message(&MessageId::new(arg)).await;
            report(outcome.success, outcome.error.as_deref());
        }
        _ if command.starts_with('/') => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_help();
        }
        _ => {
            let Some(peer) = client.active_peer().await else {
                eprintln!("{}", "No open conversation, use /open <peer_id>".yellow());
                return true;
            };
            let outcome = client.send_message(line, &peer).await;
            if !outcome.success {
                report(false, outcome.error.as_deref());
            }
        }
    }
    true
}

fn report(success: bool, error: Option<&str>) {
    if success {
        println!("{}", "✓ Done".green().bold());
    } else {
        eprintln!("{} Error: {}", "✗".red().bold(), error.unwrap_or("Unknown error").red());
    }
}

fn spawn_renderer(client: Arc<Client>, printed: Arc<Mutex<HashSet<MessageId>>>) -> JoinHandle<()> {
    let mut events = client.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ChatEvent::ConversationChanged { .. }) => print_new_messages(&client, &printed).await,
                Ok(ChatEvent::TypingChanged { .. }) => {
                    if let Some(typing) = client.typing_for_active().await {
                        println!("{}", format!("{} is typing...", typing.peer_display).dimmed().italic());
                    }
                }
                Ok(ChatEvent::MessageFailed { message_id, error }) => {
                    eprintln!(
                        "{} Not delivered ({}): {}  {}",
                        "✗".red().bold(),
                        message_id.to_string().yellow(),
                        error.red(),
                        "/retry <id> or /discard <id>".dimmed()
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Console lagged {} events", n);
                }
                Err(_) => break,
            }
        }
    })
}

async fn print_new_messages(client: &Client, printed: &Mutex<HashSet<MessageId>>) {
    let me = client.session().current_user().map(|u| u.id).unwrap_or_default();
    let conversation = client.conversation().await;
    let mut printed = printed.lock().await;
    for msg in conversation.iter().filter(|m| !m.is_provisional()) {
        if printed.insert(msg.id.clone()) {
            print_message(msg, &me);
        }
    }
}

fn print_message(msg: &Message, me: &str) {
    let time = msg.created_at.format("%H:%M").to_string();
    let who = if msg.sender_id == me {
        "you".green().bold()
    } else {
        msg.sender
            .as_ref()
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| msg.sender_id.clone())
            .cyan()
            .bold()
    };
    println!("{} {}: {}  {}", time.dimmed(), who, msg.body, format!("#{}", msg.id).dimmed());
}

async fn print_inbox(client: &Client) {
    let inbox = client.inbox().await;
    if inbox.is_empty() {
        println!("{}", "No conversations yet.".dimmed());
        return;
    }
    for entry in inbox {
        let name = entry
            .peer
            .as_ref()
            .map(|p| p.label().to_string())
            .unwrap_or_else(|| entry.peer_id.clone());
        println!(
            "  {} {}  {}  {}",
            "•".cyan(),
            name.bold(),
            entry.last.body.dimmed(),
            entry.last.created_at.format("%H:%M").to_string().dimmed()
        );
    }
}

/// The other side of the demo: types for a moment, then answers every message
async fn spawn_counterpart(backend: &InMemoryBackend, user: LocalUser, peer_id: String) -> anyhow::Result<JoinHandle<()>> {
    let gateway = backend.gateway(SessionState::signed_in(user.clone()));
    let mut feed = gateway
        .subscribe_to_conversation(&peer_id)
        .await
        .map_err(|e| anyhow::anyhow!("counterpart subscription failed: {}", e))?;
    let display = user.display_name.clone().unwrap_or_else(|| user.email.clone());

    Ok(tokio::spawn(async move {
        // keep the feed registered for as long as the bot runs
        let _unsubscribe = feed.unsubscribe;
        while let Some(msg) = feed.receiver.recv().await {
            if msg.sender_id == user.id {
                continue;
            }
            let _ = gateway.broadcast_typing(&user.id, &display).await;
            tokio::time::sleep(Duration::from_millis(800)).await;
            let reply = format!("Thanks! I got your message: \"{}\"", msg.body);
            if let Err(e) = gateway.send_message(&reply, &peer_id).await {
                warn!("Counterpart reply failed: {}", e);
            }
        }
    }))
}

fn print_banner(me: &LocalUser, counterpart: &LocalUser) {
    println!("{}", "⚡ PlanChat console".bright_cyan().bold());
    println!("  signed in as {} ({:?})", me.id.cyan(), me.role);
    println!("  counterpart {} is {}", counterpart.id.cyan(), "online".green());
    print_help();
}

fn print_help() {
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {} <peer_id>   Open a conversation", "/open".cyan());
    println!("  {}             Close the conversation", "/close".cyan());
    println!("  {}             Show the inbox", "/inbox".cyan());
    println!("  {}            Tell the peer you are typing", "/typing".cyan());
    println!("  {} <id>       Re-send a failed message", "/retry".cyan());
    println!("  {} <id>     Drop a failed local message", "/discard".cyan());
    println!("  {} <id>      Delete a message", "/delete".cyan());
    println!("  {}              Exit", "/quit".cyan());
    println!("  anything else is sent to the open conversation");
    println!();
}
