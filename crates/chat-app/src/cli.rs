use std::path::PathBuf;

use clap::{Parser, Subcommand};
use forkchat_storage::{ConversationId, MessageId};

#[derive(Debug, Parser)]
#[command(name = "forkchat")]
#[command(about = "Branching conversations with streamed model replies")]
#[command(version)]
pub struct Cli {
    /// Settings file, defaults to <config dir>/forkchat/settings.json
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// SQLite database, overrides `database_path` from the settings
    #[arg(long = "db", global = true, value_name = "PATH")]
    pub database_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    #[command(flatten)]
    Chat(ChatCommand),
    /// Print or write the settings file
    #[command(subcommand)]
    Config(ConfigAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum ConfigAction {
    /// Print the settings file location
    Path,
    /// Write default settings unless the file already exists
    Init,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum ChatCommand {
    /// Create a conversation
    New {
        #[arg(trailing_var_arg = true, value_name = "TITLE")]
        title: Vec<String>,
    },
    /// List conversations, most recently updated first
    List,
    /// Print the active branch of a conversation
    Show {
        #[arg(value_name = "CONVERSATION")]
        conversation_id: ConversationId,
    },
    /// Append a user turn under the active leaf and stream the reply
    Send {
        #[arg(value_name = "CONVERSATION")]
        conversation_id: ConversationId,
        #[arg(trailing_var_arg = true, num_args = 1.., required = true, value_name = "TEXT")]
        text: Vec<String>,
    },
    /// Branch a new version of a user turn and stream its answer
    Edit {
        #[arg(value_name = "MESSAGE")]
        message_id: MessageId,
        #[arg(trailing_var_arg = true, num_args = 1.., required = true, value_name = "TEXT")]
        text: Vec<String>,
    },
    /// Branch a new version of an assistant turn
    Regenerate {
        #[arg(value_name = "MESSAGE")]
        message_id: MessageId,
        /// Wait for the whole reply and insert only the finished row
        #[arg(long)]
        inline: bool,
    },
    /// Move the active branch to another version of the same turn
    Switch {
        #[arg(value_name = "CURRENT")]
        current_message_id: MessageId,
        #[arg(value_name = "TARGET")]
        target_message_id: MessageId,
    },
    /// Print the generation status of a message
    Status {
        #[arg(value_name = "MESSAGE")]
        message_id: MessageId,
    },
    /// Fail generations stuck longer than the timeout
    Sweep {
        #[arg(long, value_name = "N")]
        timeout_ms: Option<u64>,
    },
    /// Delete a conversation and its messages
    Delete {
        #[arg(value_name = "CONVERSATION")]
        conversation_id: ConversationId,
    },
}
