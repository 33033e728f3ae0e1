//! REPL command parsing for the `kv-node` shell.
//!
//! Console commands are a superset of client operations: besides reads and
//! writes they include membership changes (`JOIN`, `LEAVE`) that stand in
//! for the external membership authority, and meta-commands.

use anyhow::{Result, anyhow};

use crate::operation::NodeId;

/// Commands that can be entered at the REPL prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Insert { key: String, value: String },
    Remove { key: String },
    Get { key: String },
    Join { replica: NodeId },
    Leave { replica: NodeId },
    Status,
    Exit,
    Help,
}

pub const HELP: &str = "Commands: INSERT/i <key> <value>, REMOVE/r <key>, GET/g <key>, \
JOIN/j <id>, LEAVE/l <id>, STATUS/s, HELP/h, EXIT/e";

impl ConsoleCommand {
    /// Parses a line of user input into a command.
    ///
    /// Commands are case-insensitive and accept single-letter aliases.
    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = parts.first() else {
            return Err(anyhow!("empty command"));
        };

        let cmd = first.to_uppercase();
        let normalized_cmd = match cmd.as_str() {
            "I" | "PUT" => "INSERT",
            "R" | "DEL" => "REMOVE",
            "G" => "GET",
            "J" => "JOIN",
            "L" => "LEAVE",
            "S" => "STATUS",
            "H" => "HELP",
            "E" | "QUIT" => "EXIT",
            other => other,
        };

        match (normalized_cmd, parts.len()) {
            ("EXIT", 1) => Ok(ConsoleCommand::Exit),
            ("HELP", 1) => Ok(ConsoleCommand::Help),
            ("STATUS", 1) => Ok(ConsoleCommand::Status),
            ("INSERT", 3) => Ok(ConsoleCommand::Insert {
                key: parts[1].to_string(),
                value: parts[2].to_string(),
            }),
            ("REMOVE", 2) => Ok(ConsoleCommand::Remove {
                key: parts[1].to_string(),
            }),
            ("GET", 2) => Ok(ConsoleCommand::Get {
                key: parts[1].to_string(),
            }),
            ("JOIN", 2) => Ok(ConsoleCommand::Join {
                replica: parse_node_id(parts[1])?,
            }),
            ("LEAVE", 2) => Ok(ConsoleCommand::Leave {
                replica: parse_node_id(parts[1])?,
            }),
            ("INSERT", _) => Err(anyhow!(
                "INSERT requires exactly two arguments: INSERT <key> <value>"
            )),
            ("REMOVE" | "GET", _) => Err(anyhow!(
                "{normalized_cmd} requires exactly one argument: {normalized_cmd} <key>"
            )),
            ("JOIN" | "LEAVE", _) => Err(anyhow!(
                "{normalized_cmd} requires exactly one argument: {normalized_cmd} <node id>"
            )),
            ("EXIT" | "HELP" | "STATUS", _) => {
                Err(anyhow!("{normalized_cmd} takes no arguments"))
            }
            _ => Err(anyhow!("invalid command. {HELP}")),
        }
    }
}

fn parse_node_id(raw: &str) -> Result<NodeId> {
    raw.parse()
        .map_err(|_| anyhow!("invalid node id {raw:?}: expected a positive integer"))
}
