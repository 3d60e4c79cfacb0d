//! CLI command implementations

mod config;
mod exec;
mod nodes;

pub use config::{config_init, config_path, config_show};
pub use exec::{exec_command, ExecOptions};
pub use nodes::{find_node, nodes_command};
