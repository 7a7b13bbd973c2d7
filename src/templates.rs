//! `shelley unpack-template`: materializes a starter `AGENTS.md` and
//! `.shelley/` skeleton into a target directory. Full template discovery
//! and packaging lives outside this crate; this is just the CLI verb and
//! the one built-in starter it needs.

use crate::error::ConfigError;
use std::path::Path;

struct TemplateFile {
    relative_path: &'static str,
    contents: &'static str,
}

const STARTER_FILES: &[TemplateFile] = &[
    TemplateFile {
        relative_path: "AGENTS.md",
        contents: include_str!("../templates/starter/AGENTS.md"),
    },
    TemplateFile {
        relative_path: ".shelley/README.md",
        contents: include_str!("../templates/starter/.shelley/README.md"),
    },
];

const KNOWN_TEMPLATES: &[&str] = &["starter"];

/// Copy the named built-in template into `dir`. Fails if any target file
/// already exists, so a re-run never clobbers edits the user has made.
pub fn unpack(name: &str, dir: &Path) -> Result<Vec<String>, ConfigError> {
    if name != "starter" {
        return Err(ConfigError::Other(format!(
            "unknown template '{name}' (known: {})",
            KNOWN_TEMPLATES.join(", ")
        )));
    }

    let mut written = Vec::with_capacity(STARTER_FILES.len());
    for file in STARTER_FILES {
        let target = dir.join(file.relative_path);
        if target.exists() {
            return Err(ConfigError::Other(format!(
                "{} already exists, refusing to overwrite",
                target.display()
            )));
        }
    }

    for file in STARTER_FILES {
        let target = dir.join(file.relative_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Other(format!("creating {}: {e}", parent.display())))?;
        }
        std::fs::write(&target, file.contents)
            .map_err(|e| ConfigError::Other(format!("writing {}: {e}", target.display())))?;
        written.push(target.display().to_string());
    }

    Ok(written)
}
