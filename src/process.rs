use std::path::Path;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};

/// Runs an external program (editor, pager) on a note
pub trait ProgramLauncher {
    /// Run `program` with `path` as its last argument and wait for it to exit
    fn launch(&self, program: &str, path: &Path) -> Result<()>;
}

/// Launches real processes that share the terminal with us
pub struct SystemLauncher;

impl ProgramLauncher for SystemLauncher {
    fn launch(&self, program: &str, path: &Path) -> Result<()> {
        // "code --wait" style settings carry their own arguments
        let mut parts = program.split_whitespace();
        let Some(executable) = parts.next() else {
            return Err(Error::ExternalProcess {
                program: program.to_string(),
                reason: "no program given".into(),
            });
        };

        log::debug!("[process] Launching {} on {:?}", program, path);
        let status = Command::new(executable)
            .args(parts)
            .arg(path)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| Error::ExternalProcess {
                program: program.to_string(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            return Err(Error::ExternalProcess {
                program: program.to_string(),
                reason: status.to_string(),
            });
        }
        Ok(())
    }
}
