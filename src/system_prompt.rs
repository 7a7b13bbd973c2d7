//! System prompt construction with `AGENTS.md`/`AGENT.md` discovery.
//!
//! Discovers and loads guidance files from the working directory up to the
//! filesystem root, combining them into the prompt handed to the model at
//! the top of every turn.

use std::fmt::Write;
use std::path::{Path, PathBuf};

const GUIDANCE_FILE_NAMES: &[&str] = &["AGENTS.md", "AGENT.md"];

const BASE_PROMPT: &str = r"You are Shelley, a coding agent with access to tools for executing shell commands, editing files, searching codebases, and driving a headless browser. Use tools when they get the job done faster or more reliably than reasoning alone.

Be concise. When you use a tool, say briefly what you're doing and why.

Your current working directory can change during the conversation — via the `change_dir` tool, or as a side effect of a `cd`/`pushd`/`popd` in a `bash` command. The `bash` tool description always reflects your current directory.

You can delegate focused, self-contained pieces of work to a subagent with the `subagent` tool, when one is available to you. A subagent is its own conversation: give it enough context to work independently, since it does not see this conversation's history.";

const SKILLS_SUFFIX: &str = r"

Skill guidance, if present, is discovered the same way as `AGENTS.md`: look under `$HOME` for a skills directory documenting conventions and runbooks specific to this environment.";

const SUB_AGENT_SUFFIX: &str = r"

You are running as a subagent spawned by a parent conversation. Complete the task described in the first message and give your final answer as plain text — there is no separate submission tool. Once you stop requesting tools, the parent conversation reads your last message as your result.";

/// A discovered guidance file with its path and content.
#[derive(Debug, Clone)]
pub struct GuidanceFile {
    pub path: PathBuf,
    pub content: String,
}

/// Discover guidance files from `working_dir` up to the filesystem root.
/// Returns them ordered root-first, `working_dir`-last (most specific
/// wins when concatenated).
pub fn discover_guidance_files(working_dir: &Path) -> Vec<GuidanceFile> {
    let mut files = Vec::new();
    let mut current = Some(working_dir.to_path_buf());

    while let Some(dir) = current {
        for name in GUIDANCE_FILE_NAMES {
            let path = dir.join(name);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    files.push(GuidanceFile {
                        path: path.clone(),
                        content,
                    });
                    break;
                }
            }
        }
        current = dir.parent().map(Path::to_path_buf);
    }

    files.reverse();
    files
}

/// Build the complete system prompt for a conversation.
pub fn build_system_prompt(working_dir: &Path, is_sub_agent: bool) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    prompt.push_str(SKILLS_SUFFIX);

    let guidance_files = discover_guidance_files(working_dir);
    if !guidance_files.is_empty() {
        prompt.push_str("\n\n<project_guidance>\n");

        for (i, file) in guidance_files.iter().enumerate() {
            if i > 0 {
                prompt.push_str("\n---\n\n");
            }
            let display_path = file.path.display();
            let _ = writeln!(prompt, "<!-- From: {display_path} -->");
            prompt.push_str(&file.content);
            if !file.content.ends_with('\n') {
                prompt.push('\n');
            }
        }

        prompt.push_str("</project_guidance>");
    }

    if is_sub_agent {
        prompt.push_str(SUB_AGENT_SUFFIX);
    }

    prompt
}
