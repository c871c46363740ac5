use crate::coordinator::{SelectOutcome, SyncCoordinator};
use crate::error::{Result, SyncError};
use crate::event::{Placement, SyncEvent};
use crate::model::{
    ConnectionState, ConnectionStatus, Conversation, ConversationView, Message, MessageView,
};
use crate::rest::MemoryBackend;
use chrono::{Duration as ChronoDuration, Local, Utc};
use colored::*;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

/// One console command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Open(String),
    Older,
    Send(String),
    New(String),
    Search(String),
    Status,
    Help,
    Quit,
}

/// Parse one input line; `Ok(None)` for blank lines
pub fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let needs = |usage: &str| -> Result<String> {
        if rest.is_empty() {
            Err(SyncError::InvalidInput(format!("Usage: {}", usage)))
        } else {
            Ok(rest.to_string())
        }
    };

    let command = match word.to_lowercase().as_str() {
        "list" | "ls" => Command::List,
        "open" => Command::Open(needs("open <conversation-id>")?),
        "older" => Command::Older,
        "send" => Command::Send(needs("send <text>")?),
        "new" => Command::New(needs("new <user-id>")?),
        "search" => Command::Search(rest.to_string()),
        "status" => Command::Status,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => {
            return Err(SyncError::InvalidInput(format!(
                "Unknown command: {} (try help)",
                other
            )))
        }
    };
    Ok(Some(command))
}

/// Read commands from stdin until `quit` or EOF, printing live events meanwhile
pub async fn run(coordinator: SyncCoordinator) -> anyhow::Result<()> {
    println!("{}", "⚡ chatsync console".bright_cyan().bold());
    if let Some(credential) = coordinator.session().current() {
        println!("   Signed in as {}", credential.user_id.cyan());
    }
    println!("   Type {} for commands", "help".cyan());
    println!();

    let printer = {
        let coordinator = coordinator.clone();
        let events = coordinator.subscribe_events();
        tokio::spawn(async move { print_events(coordinator, events).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut open: Option<String> = None;
    prompt(open.as_deref());
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(None) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = execute(&coordinator, command, &mut open).await {
                    eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
                }
            }
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e.to_string().yellow()),
        }
        prompt(open.as_deref());
    }

    printer.abort();
    Ok(())
}

async fn execute(
    coordinator: &SyncCoordinator,
    command: Command,
    open: &mut Option<String>,
) -> Result<()> {
    let user_id = coordinator
        .session()
        .current()
        .map(|c| c.user_id)
        .unwrap_or_default();

    match command {
        Command::List => {
            let list = coordinator.list_conversations().await?;
            print_conversations(&list);
        }
        Command::Search(term) => {
            let found = coordinator.search_conversations(&term).await;
            print_conversations(&found);
        }
        Command::Open(id) => match coordinator.select_conversation(&id).await? {
            SelectOutcome::Loaded { messages, .. } => {
                println!(
                    "{}",
                    format!("── {} ({} messages) ──", id, messages.len()).bright_cyan()
                );
                print_messages(&messages, &user_id);
                *open = Some(id);
            }
            SelectOutcome::Superseded => {
                println!("{}", "Selection superseded by a newer one".yellow());
            }
        },
        Command::Older => {
            let id = require_open(open)?;
            let added = coordinator.load_older(id).await?;
            if added == 0 {
                println!("{}", "No older messages".dimmed());
            } else {
                println!("{} {} older messages", "✓".green(), added);
                print_messages(&coordinator.messages(id).await, &user_id);
            }
        }
        Command::Send(text) => {
            let id = require_open(open)?;
            let sent = coordinator.send_message(id, &text).await?;
            println!("{} sent {}", "✓".green(), sent.id.dimmed());
        }
        Command::New(other) => {
            let view = coordinator.create_conversation(&other).await?;
            println!(
                "{} conversation {} with {}",
                "✓".green().bold(),
                view.id.cyan(),
                view.title().bright_white()
            );
        }
        Command::Status => print_status(coordinator),
        Command::Help => print_usage(),
        Command::Quit => {}
    }
    Ok(())
}

fn require_open(open: &Option<String>) -> Result<&str> {
    open.as_deref().ok_or_else(|| {
        SyncError::InvalidInput("No conversation open (use open <id>)".to_string())
    })
}

async fn print_events(coordinator: SyncCoordinator, mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("{}", format!("({} events skipped)", skipped).dimmed());
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            SyncEvent::MessageReceived {
                conversation_id,
                message,
                placement,
            } => {
                let user_id = coordinator
                    .session()
                    .current()
                    .map(|c| c.user_id)
                    .unwrap_or_default();
                let marker = match placement {
                    Placement::Trailing => "",
                    Placement::Retroactive => " (earlier)",
                };
                println!(
                    "\n{}{} {}",
                    format!("[{}]", conversation_id).dimmed(),
                    marker.yellow(),
                    format_message(&MessageView::from_message(&message, &user_id))
                );
            }
            SyncEvent::StatusChanged { status } => {
                println!("\n{} {}", "connection:".dimmed(), status_label(status));
            }
            SyncEvent::ConversationsChanged | SyncEvent::MessagesReset { .. } => {}
        }
    }
}

fn prompt(open: Option<&str>) {
    match open {
        Some(id) => print!("{} ", format!("{}>", id).cyan()),
        None => print!("{} ", ">".cyan()),
    }
    let _ = std::io::stdout().flush();
}

fn print_usage() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                  Load the conversation list", "list".cyan());
    println!("  {} <id>             Open a conversation", "open".cyan());
    println!("  {}                 Page in older messages", "older".cyan());
    println!("  {} <text>           Send to the open conversation", "send".cyan());
    println!("  {} <user-id>         Start or reuse a conversation", "new".cyan());
    println!("  {} <term>         Filter conversations by name", "search".cyan());
    println!("  {}                Connection status", "status".cyan());
    println!("  {}                  Leave", "quit".cyan());
}

fn print_conversations(list: &[ConversationView]) {
    if list.is_empty() {
        println!("{}", "No conversations".yellow());
        return;
    }
    println!(
        "{}",
        format!("Conversations ({})", list.len()).bright_cyan().bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for view in list {
        let preview = view.last_message_text.as_deref().unwrap_or("(no messages)");
        println!(
            "  {} {} {} {}",
            view.id.cyan(),
            view.title().bright_white(),
            view.last_message_at
                .with_timezone(&Local)
                .format("%H:%M")
                .to_string()
                .dimmed(),
            preview
        );
    }
}

fn print_messages(messages: &[Message], user_id: &str) {
    for message in messages {
        println!("  {}", format_message(&MessageView::from_message(message, user_id)));
    }
}

fn format_message(view: &MessageView) -> String {
    let time = view
        .created_at
        .with_timezone(&Local)
        .format("%H:%M:%S")
        .to_string();
    let sender = if view.outgoing {
        "me".green()
    } else {
        view.sender_id.as_str().magenta()
    };
    format!("{} {}: {}", time.dimmed(), sender, view.content)
}

fn print_status(coordinator: &SyncCoordinator) {
    println!(
        "{} {}",
        "Status:".bright_white().bold(),
        status_label(coordinator.connection_status())
    );
    for (topic, state) in coordinator.supervisor().topics() {
        let label = format!("{:?}", state);
        let label = match state {
            ConnectionState::Subscribed => label.green(),
            ConnectionState::Connecting | ConnectionState::Reconnecting => label.yellow(),
            ConnectionState::Degraded | ConnectionState::Disconnected => label.red(),
        };
        println!("  {} [{}]", topic.as_str().cyan(), label);
    }
}

fn status_label(status: ConnectionStatus) -> ColoredString {
    match status {
        ConnectionStatus::Connected => "connected".green(),
        ConnectionStatus::Reconnecting => "reconnecting".yellow(),
        ConnectionStatus::Degraded => "degraded".red().bold(),
    }
}

/// Fill the offline backend with a few threads for `user_id`
pub fn seed_demo(backend: &MemoryBackend, user_id: &str) {
    let now = Utc::now();
    let threads = [
        ("demo-1", "maria", "Maria (logo design)", ["Hi! Is the logo gig still open?", "Yes, send me your brief", "Sent it over just now"]),
        ("demo-2", "tom", "Tom (translation)", ["Can you do 2000 words by Friday?", "Friday works", "Great, ordering now"]),
    ];

    for (n, (id, peer, name, lines)) in threads.iter().enumerate() {
        let base = now - ChronoDuration::minutes(30 * (n as i64 + 1));
        let mut last = base;
        for (i, text) in lines.iter().enumerate() {
            let at = base + ChronoDuration::minutes(i as i64 * 5);
            let sender = if i % 2 == 0 { *peer } else { user_id };
            backend.insert_message(Message {
                id: format!("{}-m{}", id, i + 1),
                conversation_id: id.to_string(),
                sender_id: sender.to_string(),
                content: text.to_string(),
                created_at: at,
            });
            last = at;
        }
        backend.insert_conversation(Conversation {
            id: id.to_string(),
            participant_a: user_id.to_string(),
            participant_b: peer.to_string(),
            participant_a_name: None,
            participant_b_name: Some(name.to_string()),
            last_message_text: lines.last().map(|s| s.to_string()),
            last_message_at: last,
        });
    }
}
