use std::path::PathBuf;

use super::types::MessageId;

/// Commands the user types during a chat session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Send(String),
    Edit { id: MessageId, text: String },
    Delete(MessageId),
    /// Retry a failed message as a new send
    Resend(MessageId),
    Attach(PathBuf),
    Clear,
    Quit,
}

impl ChatCommand {
    /// Parse one input line. Blank lines and malformed slash commands yield `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name {
            "edit" => {
                let (id, text) = args.split_once(char::is_whitespace)?;
                let text = text.trim();
                if text.is_empty() {
                    return None;
                }
                Some(Self::Edit {
                    id: id.parse().ok()?,
                    text: text.to_string(),
                })
            }
            "delete" if !args.is_empty() => Some(Self::Delete(args.parse().ok()?)),
            "resend" if !args.is_empty() => Some(Self::Resend(args.parse().ok()?)),
            "attach" if !args.is_empty() => Some(Self::Attach(PathBuf::from(args))),
            "clear" => Some(Self::Clear),
            "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}
