//! Output formatting utilities for the CLI
//!
//! Node tables, command output records and colored status messages.

use std::io::Write;
use std::time::{Duration, Instant};

use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use serde_json::{Map, Value};
use tabled::{
    settings::{Style, Width},
    Table, Tabled,
};

use rexec_core::{CommandResult, RemoteNode};
use rexec_protocol::OutputType;

/// Format discovered nodes as an ASCII table
///
/// The detailed view adds the engine and project roots and how long ago the
/// node last answered.
pub fn format_nodes(nodes: &[RemoteNode], detailed: bool) -> String {
    if nodes.is_empty() {
        return "No nodes found".to_string();
    }

    #[derive(Tabled)]
    struct NodeRow {
        #[tabled(rename = "NODE ID")]
        id: String,
        #[tabled(rename = "PROJECT")]
        project: String,
        #[tabled(rename = "ENGINE")]
        engine: String,
        #[tabled(rename = "MACHINE")]
        machine: String,
        #[tabled(rename = "USER")]
        user: String,
    }

    #[derive(Tabled)]
    struct NodeRowDetailed {
        #[tabled(rename = "NODE ID")]
        id: String,
        #[tabled(rename = "PROJECT")]
        project: String,
        #[tabled(rename = "PROJECT ROOT")]
        project_root: String,
        #[tabled(rename = "ENGINE")]
        engine: String,
        #[tabled(rename = "ENGINE ROOT")]
        engine_root: String,
        #[tabled(rename = "MACHINE")]
        machine: String,
        #[tabled(rename = "USER")]
        user: String,
        #[tabled(rename = "LAST SEEN")]
        last_seen: String,
    }

    if detailed {
        let now = Instant::now();
        let rows: Vec<NodeRowDetailed> = nodes
            .iter()
            .map(|n| NodeRowDetailed {
                id: n.node_id.to_string(),
                project: or_dash(n.project_name()),
                project_root: or_dash(n.project_root()),
                engine: or_dash(n.engine_version()),
                engine_root: or_dash(n.engine_root()),
                machine: or_dash(n.machine()),
                user: or_dash(n.user()),
                last_seen: format_age(now.saturating_duration_since(n.last_seen)),
            })
            .collect();

        Table::new(rows)
            .with(Style::rounded())
            .with(Width::wrap(140))
            .to_string()
    } else {
        let rows: Vec<NodeRow> = nodes
            .iter()
            .map(|n| NodeRow {
                id: truncate(n.node_id.as_str(), 12),
                project: or_dash(n.project_name()),
                engine: or_dash(n.engine_version()),
                machine: or_dash(n.machine()),
                user: or_dash(n.user()),
            })
            .collect();

        Table::new(rows).with(Style::rounded()).to_string()
    }
}

/// Nodes as a JSON array: each node's metadata plus its `node_id`
pub fn nodes_to_json(nodes: &[RemoteNode]) -> Value {
    Value::Array(
        nodes
            .iter()
            .map(|n| {
                let mut entry = Map::new();
                entry.insert("node_id".to_string(), Value::String(n.node_id.to_string()));
                entry.extend(n.data.clone());
                Value::Object(entry)
            })
            .collect(),
    )
}

/// Write a command's output records as the engine produced them: info to
/// stdout, warnings and errors to stderr
pub fn print_command_output(result: &CommandResult) {
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    for record in &result.output {
        let written = match record.output_type {
            OutputType::Info => stdout.write_all(record.output.as_bytes()),
            OutputType::Warning | OutputType::Error => stderr.write_all(record.output.as_bytes()),
        };
        if written.is_err() {
            break;
        }
    }
    let _ = stdout.flush();
}

/// Format an elapsed time for the node table
fn format_age(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1000 {
        format!("{}ms ago", millis)
    } else {
        format!("{}s ago", elapsed.as_secs())
    }
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Write `msg` behind a colored status tag
fn print_tagged(mut out: impl Write, color: Color, tag: &str, msg: &str) {
    let _ = crossterm::execute!(
        out,
        SetForegroundColor(color),
        Print(tag),
        Print(' '),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Confirm a completed config action on stdout
pub fn print_success(msg: &str) {
    print_tagged(std::io::stdout(), Color::Green, "✓", msg);
}

/// Report a failed command or an unusable configuration on stderr
pub fn print_error(msg: &str) {
    print_tagged(std::io::stderr(), Color::Red, "✗", msg);
}

/// Flag a fallback, such as a missing config file, on stderr
pub fn print_warning(msg: &str) {
    print_tagged(std::io::stderr(), Color::Yellow, "⚠", msg);
}

/// Status line for `config` subcommands
pub fn print_info(msg: &str) {
    print_tagged(std::io::stdout(), Color::Cyan, "ℹ", msg);
}
