//! Exec command implementation

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use rexec_core::config::RemoteExecutionConfig;
use rexec_core::CommandResult;
use rexec_protocol::ExecMode;
use rexec_session::Session;

use super::nodes::find_node;
use crate::output::{print_command_output, print_error};

/// What to run and where
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Inline Python, or `-` to read it from stdin
    pub code: Option<String>,
    /// Script file whose contents are sent
    pub file: Option<PathBuf>,
    /// Execution mode; defaults to a file run for `--file` and a statement
    /// otherwise
    pub mode: Option<ExecMode>,
    /// Node id or project name
    pub node: Option<String>,
    /// How long to wait for discovery and for the node to connect; the
    /// configured `connect_timeout` when unset
    pub timeout: Option<Duration>,
    /// Suppress editor dialogs while the command runs
    pub unattended: bool,
}

impl ExecOptions {
    /// Timeout to apply, falling back to the configured one
    pub fn timeout_or(&self, config: &RemoteExecutionConfig) -> Duration {
        self.timeout.unwrap_or(config.connect_timeout)
    }
}

/// Run one command on a node and print what it produced.
///
/// Returns whether the node reported success.
pub async fn exec_command(config: RemoteExecutionConfig, options: ExecOptions) -> Result<bool> {
    let (command, mode) = resolve_command(&options)?;

    let session = Session::new(config);
    let outcome = run(&session, &command, mode, &options).await;
    session.stop().await;
    let result = outcome?;

    print_command_output(&result);
    if !result.success {
        // The traceback normally arrives as an error record already
        if result.has_errors() {
            print_error("Command failed");
        } else {
            print_error(&result.result);
        }
    } else if mode == ExecMode::EvaluateStatement {
        println!("{}", result.result);
    }

    Ok(result.success)
}

async fn run(
    session: &Session,
    command: &str,
    mode: ExecMode,
    options: &ExecOptions,
) -> Result<CommandResult> {
    let interval = session.config().node_ping_interval;
    let timeout = options.timeout_or(session.config());
    let node = find_node(session, options.node.as_deref(), interval, timeout).await?;
    tracing::info!("Using node {}", node);

    session
        .open_command_connection(&node, false, timeout)
        .await
        .with_context(|| format!("Failed to open a command connection to {}", node))?;

    let result = session
        .run_command(command, options.unattended, mode)
        .await
        .context("Command did not complete")?;
    Ok(result)
}

/// Work out the command text and mode from the options
fn resolve_command(options: &ExecOptions) -> Result<(String, ExecMode)> {
    match (&options.code, &options.file) {
        (Some(_), Some(_)) => bail!("Pass either CODE or --file, not both"),
        (None, Some(path)) => {
            let code = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read script: {:?}", path))?;
            Ok((code, options.mode.unwrap_or(ExecMode::ExecuteFile)))
        }
        (Some(code), None) if code == "-" => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            Ok((code, options.mode.unwrap_or(ExecMode::ExecuteFile)))
        }
        (Some(code), None) => Ok((
            code.clone(),
            options.mode.unwrap_or(ExecMode::ExecuteStatement),
        )),
        (None, None) => bail!("Nothing to execute: pass CODE, '-' or --file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ExecOptions {
        ExecOptions {
            code: None,
            file: None,
            mode: None,
            node: None,
            timeout: None,
            unattended: true,
        }
    }

    #[test]
    fn test_inline_code_defaults_to_statement() {
        let options = ExecOptions {
            code: Some("1+1".to_string()),
            ..options()
        };
        let (code, mode) = resolve_command(&options).unwrap();
        assert_eq!(code, "1+1");
        assert_eq!(mode, ExecMode::ExecuteStatement);

        let options = ExecOptions {
            mode: Some(ExecMode::EvaluateStatement),
            ..options
        };
        assert_eq!(resolve_command(&options).unwrap().1, ExecMode::EvaluateStatement);
    }

    #[test]
    fn test_file_defaults_to_execute_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.py");
        std::fs::write(&path, "import unreal\nprint(unreal.SystemLibrary.get_engine_version())\n")
            .unwrap();

        let options = ExecOptions {
            file: Some(path),
            ..options()
        };
        let (code, mode) = resolve_command(&options).unwrap();
        assert!(code.starts_with("import unreal"));
        assert_eq!(mode, ExecMode::ExecuteFile);
    }

    #[test]
    fn test_timeout_defaults_to_config() {
        let config = RemoteExecutionConfig {
            connect_timeout: Duration::from_millis(1500),
            ..Default::default()
        };
        assert_eq!(options().timeout_or(&config), Duration::from_millis(1500));

        let options = ExecOptions {
            timeout: Some(Duration::from_secs(9)),
            ..options()
        };
        assert_eq!(options.timeout_or(&config), Duration::from_secs(9));
    }

    #[test]
    fn test_requires_exactly_one_source() {
        assert!(resolve_command(&options()).is_err());

        let both = ExecOptions {
            code: Some("1".to_string()),
            file: Some(PathBuf::from("script.py")),
            ..options()
        };
        assert!(resolve_command(&both).is_err());
    }
}
