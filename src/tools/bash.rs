//! Bash tool — executes shell commands via `bash -c`, stateless across
//! calls except for the working directory carried in `ToolContext`.

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

#[cfg(unix)]
#[allow(unused_imports)]
use std::os::unix::process::CommandExt;

const MAX_OUTPUT_LENGTH: usize = 128 * 1024; // 128KB
const SNIP_SIZE: usize = 4 * 1024; // 4KB each end
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const BACKGROUND_NOTE_ENV: &str = "SHELLEY_CONVERSATION_ID";

/// Sentinel line appended to every foreground command so the executor can
/// detect a `cd`/`pushd`/`popd` that changed the working directory
/// (turn algorithm step h). Invisible in the output shown to the model.
const CWD_MARKER: &str = "__shelley_cwd__";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum ExecutionMode {
    #[default]
    Default,
    Slow,
    Background,
}

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
    #[serde(default)]
    mode: ExecutionMode,
}

pub struct BashTool;

impl BashTool {
    async fn execute_foreground(
        command: &str,
        mode: ExecutionMode,
        working_dir: &Path,
        conversation_id: &str,
    ) -> ToolOutput {
        let timeout_duration = match mode {
            ExecutionMode::Default => DEFAULT_TIMEOUT,
            ExecutionMode::Slow => SLOW_TIMEOUT,
            ExecutionMode::Background => unreachable!(),
        };

        let wrapped = format!("{{ {command}\n}}; printf '\\n{CWD_MARKER}:%s\\n' \"$PWD\"");

        let mut cmd = Command::new("bash");
        cmd.args(["-c", &wrapped])
            .current_dir(working_dir)
            .env(BACKGROUND_NOTE_ENV, conversation_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .ok();
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Failed to spawn process: {e}")),
        };

        let pid = child.id();

        match timeout(timeout_duration, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                let combined = if !stderr.is_empty() && !stdout.is_empty() {
                    format!("{stdout}{stderr}")
                } else if !stderr.is_empty() {
                    stderr.to_string()
                } else {
                    stdout.to_string()
                };

                let (visible, new_cwd) = extract_cwd_marker(&combined);
                let formatted = Self::truncate_output(visible.trim_end());

                let mut tool_output = if output.status.success() {
                    ToolOutput::success(formatted)
                } else {
                    let exit_code = output.status.code().unwrap_or(-1);
                    ToolOutput::error(format!(
                        "[command failed: exit code {exit_code}]\n{formatted}"
                    ))
                };

                if let Some(new_cwd) = new_cwd {
                    if new_cwd.as_path() != working_dir {
                        tool_output = tool_output.with_cwd_change(new_cwd);
                    }
                }
                tool_output
            }
            Ok(Err(e)) => ToolOutput::error(format!("Command execution failed: {e}")),
            Err(_) => {
                if let Some(pid) = pid {
                    #[cfg(unix)]
                    {
                        use nix::sys::signal::{killpg, Signal};
                        use nix::unistd::Pid;
                        let _ = killpg(Pid::from_raw(pid.cast_signed()), Signal::SIGKILL);
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = pid;
                    }
                }
                ToolOutput::error(format!("[command timed out after {timeout_duration:?}]"))
            }
        }
    }

    fn execute_background(command: &str, working_dir: &Path, conversation_id: &str) -> ToolOutput {
        let output_file =
            std::env::temp_dir().join(format!("shelley-bg-{}.log", uuid::Uuid::new_v4()));

        let file = match std::fs::File::create(&output_file) {
            Ok(f) => f,
            Err(e) => return ToolOutput::error(format!("Failed to create output file: {e}")),
        };

        let wrapper_script = format!(
            r#"{{ {}; }} > "{}" 2>&1; echo "" >> "{}"; echo "[background process completed with exit code $?]" >> "{}";"#,
            command,
            output_file.display(),
            output_file.display(),
            output_file.display()
        );

        let mut cmd = Command::new("bash");
        cmd.args(["-c", &wrapper_script])
            .current_dir(working_dir)
            .env(BACKGROUND_NOTE_ENV, conversation_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().ok();
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                drop(file);

                ToolOutput::success(format!(
                    "<pid>{}</pid>\n<output_file>{}</output_file>\n<reminder>To stop: kill -9 -{}</reminder>",
                    pid,
                    output_file.display(),
                    pid
                ))
            }
            Err(e) => ToolOutput::error(format!("Failed to start background process: {e}")),
        }
    }

    fn truncate_output(output: &str) -> String {
        if output.len() <= MAX_OUTPUT_LENGTH {
            return output.to_string();
        }

        let start = &output[..SNIP_SIZE];
        let end = &output[output.len() - SNIP_SIZE..];

        format!(
            "[output truncated in middle: got {} bytes, max is {} bytes]\n{}\n\n[snip]\n\n{}",
            output.len(),
            MAX_OUTPUT_LENGTH,
            start,
            end
        )
    }
}

/// Splits the trailing `__shelley_cwd__:<path>` sentinel line off the
/// combined output, returning the remainder plus the parsed directory.
fn extract_cwd_marker(combined: &str) -> (&str, Option<PathBuf>) {
    let prefix = format!("{CWD_MARKER}:");
    let Some(marker_start) = combined.rfind(&prefix) else {
        return (combined, None);
    };
    let (visible, marker) = combined.split_at(marker_start);
    let path_str = marker[prefix.len()..].trim_end_matches('\n').trim();
    if path_str.is_empty() {
        (visible, None)
    } else {
        (visible, Some(PathBuf::from(path_str)))
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> String {
        r#"Executes shell commands via bash -c, returning combined stdout/stderr.
Bash state changes (environment variables, aliases, shell functions) don't persist
between calls, but a `cd`/`pushd`/`popd` in the command updates the conversation's
working directory for subsequent tool calls.

With mode="background", returns immediately with output redirected to a file.
Use background for servers/demos that need to stay running.

Use mode="slow" for potentially slow commands: builds, downloads,
installs, tests, or any other substantive operation.

IMPORTANT: Keep commands concise. The command input must be less than 60k tokens.
For complex scripts, write them to a file first and then execute the file."#
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute via bash -c"
                },
                "mode": {
                    "type": "string",
                    "enum": ["default", "slow", "background"],
                    "description": "Execution mode: default (30s timeout), slow (15min timeout), background (detached)"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if input.command.is_empty() {
            return ToolOutput::error("Command cannot be empty");
        }

        match input.mode {
            ExecutionMode::Background => {
                Self::execute_background(&input.command, &ctx.working_dir, &ctx.conversation_id)
            }
            mode => {
                Self::execute_foreground(
                    &input.command,
                    mode,
                    &ctx.working_dir,
                    &ctx.conversation_id,
                )
                .await
            }
        }
    }
}
