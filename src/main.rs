use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use rust_dating_chat::common::{
    Attachment, AttachmentKind, ChatCommand, ConversationId, Message, SendState, SyncEvent,
};
use rust_dating_chat::config::{self, AppConfig};
use rust_dating_chat::error::{ApiError, StorageError, SyncError};
use rust_dating_chat::network::{Endpoints, HttpApi, Session, SocketClient, SocketConfig, SocketHandle};
use rust_dating_chat::storage::SessionDatabase;
use rust_dating_chat::sync::{ConversationSync, SyncSettings};

type ChatSync = ConversationSync<SocketHandle, HttpApi>;

#[derive(Parser)]
#[command(
    name = "rust_dating_chat",
    version,
    about = "Terminal client for the dating app chat"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Log in and keep the session for later runs
    Login { email: String, password: String },
    /// End the stored session
    Logout,
    /// List conversations with unread counts
    Inbox,
    /// Open a conversation and chat from stdin
    Chat { id: ConversationId },
}

#[derive(Error, Debug)]
enum HostError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no stored session, run `login` first")]
    NotLoggedIn,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);

    match run(cli.mode, app_config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mode: Mode, app_config: AppConfig) -> Result<(), HostError> {
    let store = SessionDatabase::with_path(&app_config.session_db_path).map_err(StorageError::from)?;
    let session = Session::with_store(store)?;
    let api = HttpApi::new(Endpoints::new(app_config.api_url.as_str()), session.clone());

    match mode {
        Mode::Login { email, password } => {
            let tokens = api.login(&email, &password).await?;
            match tokens.user_id {
                Some(user_id) => println!("Logged in as user {user_id}"),
                None => println!("Logged in"),
            }
            Ok(())
        }
        Mode::Logout => {
            api.logout().await;
            println!("Logged out");
            Ok(())
        }
        Mode::Inbox => {
            let (sync, _events) = start_session(&app_config, api, &session).await?;
            let result = sync.load_inbox().await;
            expire_on_auth_failure(&session, result).await?;
            for entry in sync.inbox().await {
                let badge = match entry.unread_count {
                    0 => String::new(),
                    n => format!(" [{n}]"),
                };
                println!(
                    "{:>6}  {}{}{}  {}",
                    entry.id,
                    entry.display_name(),
                    if entry.is_online { " *" } else { "" },
                    badge,
                    entry.last_message.as_deref().unwrap_or(""),
                );
            }
            println!("{} unread", sync.total_unread().await);
            Ok(())
        }
        Mode::Chat { id } => {
            let (sync, events) = start_session(&app_config, api, &session).await?;
            run_chat(sync, events, &session, id).await
        }
    }
}

/// Tie the socket and the sync layer to the restored session.
async fn start_session(
    app_config: &AppConfig,
    api: HttpApi,
    session: &Session,
) -> Result<(Arc<ChatSync>, mpsc::Receiver<SyncEvent>), HostError> {
    let Some(user_id) = session.user_id().await else {
        return Err(HostError::NotLoggedIn);
    };

    // Transport -> Sync
    let (transport_tx, transport_rx) = mpsc::channel(100);
    // Sync -> terminal
    let (sync_tx, sync_rx) = mpsc::channel(100);

    let (client, handle) =
        SocketClient::new(SocketConfig::from(app_config), session.clone(), transport_tx);
    tokio::spawn(client.run());

    let sync = ConversationSync::new(handle, api, user_id, SyncSettings::from(app_config), sync_tx);
    tokio::spawn(Arc::clone(&sync).run(transport_rx));

    log::info!("Session started for user {user_id}");
    Ok((sync, sync_rx))
}

async fn run_chat(
    sync: Arc<ChatSync>,
    mut events: mpsc::Receiver<SyncEvent>,
    session: &Session,
    id: ConversationId,
) -> Result<(), HostError> {
    match sync.open_conversation(id).await {
        Ok(_) | Err(SyncError::HistoryUnavailable { surface: false, .. }) => {}
        Err(err) if err.is_session_expired() => {
            session.clear().await;
            return Err(err.into());
        }
        Err(err) => println!("! {err}"),
    }
    print_messages(&sync.messages(id).await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match ChatCommand::parse(&line) {
                    Some(ChatCommand::Quit) => break,
                    Some(command) => dispatch(&sync, id, command),
                    None => {}
                }
            }
            Some(event) = events.recv() => {
                match event {
                    SyncEvent::MessagesChanged(changed) if changed == id => {
                        print_messages(&sync.messages(id).await);
                    }
                    SyncEvent::SendFailed { message_id, reason, .. } => {
                        println!("! {message_id} not sent: {reason} (/resend {message_id})");
                    }
                    SyncEvent::MutationReverted { message_id, reason, .. } => {
                        println!("! change to {message_id} undone: {reason}");
                    }
                    SyncEvent::ConnectionLost(reason) => println!("! connection lost: {reason}"),
                    SyncEvent::ServerReady => println!("- connected"),
                    SyncEvent::SessionExpired => {
                        session.clear().await;
                        return Err(SyncError::SessionExpired.into());
                    }
                    other => log::debug!("{other:?}"),
                }
            }
        }
    }

    sync.close_conversation().await;
    Ok(())
}

/// Run one chat command in the background so input stays responsive.
fn dispatch(sync: &Arc<ChatSync>, id: ConversationId, command: ChatCommand) {
    let sync = Arc::clone(sync);
    tokio::spawn(async move {
        let result = match command {
            ChatCommand::Send(text) => sync.send_message(id, &text).await.map(|_| ()),
            ChatCommand::Edit { id: message_id, text } => {
                sync.edit_message(id, &message_id, &text).await
            }
            ChatCommand::Delete(message_id) => sync.delete_message(id, &message_id).await,
            ChatCommand::Resend(message_id) => sync.resend(id, &message_id).await.map(|_| ()),
            ChatCommand::Attach(path) => match read_attachment(&path).await {
                Ok(attachment) => sync.send_attachment(id, attachment).await.map(|_| ()),
                Err(err) => {
                    println!("! cannot read {}: {err}", path.display());
                    return;
                }
            },
            ChatCommand::Clear => sync.clear_conversation(id).await,
            ChatCommand::Quit => Ok(()),
        };
        match result {
            Ok(()) => {}
            // Reported through the event stream.
            Err(
                SyncError::JoinTimeout { .. }
                | SyncError::JoinRejected { .. }
                | SyncError::SendTimeout { .. }
                | SyncError::SendRejected { .. }
                | SyncError::UploadFailed { .. }
                | SyncError::MutationRejected { .. }
                | SyncError::SessionExpired,
            ) => {}
            Err(err) => println!("! {err}"),
        }
    });
}

async fn expire_on_auth_failure<T>(
    session: &Session,
    result: Result<T, SyncError>,
) -> Result<T, HostError> {
    if let Err(err) = &result {
        if err.is_session_expired() {
            session.clear().await;
        }
    }
    Ok(result?)
}

async fn read_attachment(path: &Path) -> std::io::Result<Attachment> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let mime_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    };
    Ok(Attachment {
        file_name,
        mime_type: mime_type.to_string(),
        bytes,
    })
}

fn print_messages(messages: &[Message]) {
    println!("----");
    for message in messages {
        let who = if message.sender_is_local_user { "me" } else { "them" };
        let mut flags = String::new();
        match &message.send_state {
            SendState::Pending => flags.push_str(" (sending)"),
            SendState::Failed { reason } => flags.push_str(&format!(" (failed: {reason})")),
            SendState::Confirmed => {}
        }
        if message.edited && !message.deleted {
            flags.push_str(" (edited)");
        }
        if message.sender_is_local_user && message.read_by_peer {
            flags.push_str(" (read)");
        }
        let text = match (&message.attachment_url, message.attachment_kind()) {
            (Some(url), Some(kind)) if !message.deleted => {
                let tag = match kind {
                    AttachmentKind::Image => "photo",
                    AttachmentKind::Video => "video",
                    AttachmentKind::Audio => "audio",
                };
                format!("[{tag}] {} <{url}>", message.text)
            }
            _ => message.text.clone(),
        };
        println!(
            "[{}] #{} {who}: {text}{flags}",
            message.timestamp.format("%H:%M"),
            message.id,
        );
    }
}
