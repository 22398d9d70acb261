//! Interactive inspection of an ordered list of notes.
//!
//! The user picks a note by its number and a program to open it with; the
//! loop repeats over the same list until a blank selection or end of input.

use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::process::ProgramLauncher;
use crate::store::NoteStore;

pub const NOTHING_FOUND: &str = "Sorry, nothing found!";
const SELECTION_PROMPT: &str = "> Which note would you like to check? ";
const PROGRAM_PROMPT: &str = "> Which program would you like to use? ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingSelection,
    /// `selection` is an integer as typed; it may not fit any index type
    AwaitingProgram { selection: String },
    Dispatching { selection: String, program: String },
    Terminated,
}

/// What happened during a session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub prompts: usize,
    pub dispatched: usize,
    pub failures: usize,
}

pub struct InteractiveSession<'a, R, W, L> {
    titles: Vec<String>,
    store: &'a NoteStore,
    launcher: &'a L,
    default_program: String,
    input: R,
    output: W,
    summary: SessionSummary,
}

impl<'a, R, W, L> InteractiveSession<'a, R, W, L>
where
    R: BufRead,
    W: Write,
    L: ProgramLauncher,
{
    /// `titles` is captured as-is; changes to the store during the session do not refresh it
    pub fn new(
        titles: Vec<String>,
        store: &'a NoteStore,
        launcher: &'a L,
        default_program: &str,
        input: R,
        output: W,
    ) -> Self {
        Self {
            titles,
            store,
            launcher,
            default_program: default_program.to_string(),
            input,
            output,
            summary: SessionSummary::default(),
        }
    }

    pub fn run(mut self) -> Result<SessionSummary> {
        let mut state = SessionState::Idle;
        while state != SessionState::Terminated {
            state = self.step(state)?;
        }
        Ok(self.summary)
    }

    fn step(&mut self, state: SessionState) -> Result<SessionState> {
        match state {
            SessionState::Idle => {
                if self.titles.is_empty() {
                    self.say(NOTHING_FOUND)?;
                    return Ok(SessionState::Terminated);
                }
                let listing: Vec<String> = self
                    .titles
                    .iter()
                    .enumerate()
                    .map(|(i, title)| format!("{:5}) {}", i, title))
                    .collect();
                for line in listing {
                    self.say(&line)?;
                }
                Ok(SessionState::AwaitingSelection)
            }

            SessionState::AwaitingSelection => {
                let Some(line) = self.prompt(SELECTION_PROMPT)? else {
                    return Ok(SessionState::Terminated);
                };
                if line.is_empty() {
                    return Ok(SessionState::Terminated);
                }
                if is_integer(&line) {
                    Ok(SessionState::AwaitingProgram { selection: line })
                } else {
                    self.say(&format!("`{}` is not a note number", line))?;
                    Ok(SessionState::AwaitingSelection)
                }
            }

            SessionState::AwaitingProgram { selection } => {
                let Some(line) = self.prompt(PROGRAM_PROMPT)? else {
                    return Ok(SessionState::Terminated);
                };
                let program = if line.is_empty() {
                    self.default_program.clone()
                } else {
                    line
                };
                Ok(SessionState::Dispatching { selection, program })
            }

            SessionState::Dispatching { selection, program } => {
                let Some(title) = selection
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| self.titles.get(i))
                    .cloned()
                else {
                    self.say(&format!(
                        "noteId {} out of range [0] - [{}]",
                        selection,
                        self.titles.len() - 1
                    ))?;
                    return Ok(SessionState::AwaitingSelection);
                };

                match self.dispatch(&title, &program) {
                    Ok(()) => self.summary.dispatched += 1,
                    Err(e) if !e.is_fatal() || matches!(e, Error::InvalidArgument(_)) => {
                        self.summary.failures += 1;
                        log::warn!("[session] {}", e);
                        self.say(&e.to_string())?;
                    }
                    Err(e) => return Err(e),
                }
                Ok(SessionState::AwaitingSelection)
            }

            SessionState::Terminated => Ok(SessionState::Terminated),
        }
    }

    fn dispatch(&mut self, title: &str, program: &str) -> Result<()> {
        let path = self.store.path(title)?;
        self.launcher.launch(program, &path)
    }

    /// Print a prompt and read one trimmed line; `None` at end of input
    fn prompt(&mut self, text: &str) -> Result<Option<String>> {
        self.summary.prompts += 1;
        write!(self.output, "{}", text).map_err(terminal_error)?;
        self.output.flush().map_err(terminal_error)?;

        let mut line = String::new();
        let read = self.input.read_line(&mut line).map_err(terminal_error)?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn say(&mut self, text: &str) -> Result<()> {
        writeln!(self.output, "{}", text).map_err(terminal_error)
    }
}

/// Optional sign followed by decimal digits, of any length
fn is_integer(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn terminal_error(e: std::io::Error) -> Error {
    Error::io(Path::new("<terminal>"), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Records launches instead of running anything
    #[derive(Default)]
    struct RecordingLauncher {
        launched: RefCell<Vec<(String, PathBuf)>>,
        fail_with: Option<String>,
    }

    impl ProgramLauncher for RecordingLauncher {
        fn launch(&self, program: &str, path: &Path) -> Result<()> {
            self.launched
                .borrow_mut()
                .push((program.to_string(), path.to_path_buf()));
            match &self.fail_with {
                Some(reason) => Err(Error::ExternalProcess {
                    program: program.to_string(),
                    reason: reason.clone(),
                }),
                None => Ok(()),
            }
        }
    }

    fn run_session(
        titles: &[&str],
        input: &str,
        launcher: &RecordingLauncher,
    ) -> (TempDir, SessionSummary, String) {
        let temp_dir = TempDir::new().unwrap();
        let store = NoteStore::new(&Config::new(temp_dir.path())).unwrap();
        let mut output = Vec::new();
        let summary = InteractiveSession::new(
            titles.iter().map(|t| t.to_string()).collect(),
            &store,
            launcher,
            "less",
            Cursor::new(input.as_bytes().to_vec()),
            &mut output,
        )
        .run()
        .unwrap();
        (temp_dir, summary, String::from_utf8(output).unwrap())
    }

    #[test]
    fn test_empty_list_issues_no_prompts() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, output) = run_session(&[], "0\nvim\n", &launcher);

        assert_eq!(summary.prompts, 0);
        assert!(output.contains(NOTHING_FOUND));
        assert!(!output.contains(SELECTION_PROMPT));
        assert!(launcher.launched.borrow().is_empty());
    }

    #[test]
    fn test_dispatch_then_blank_line_terminates() {
        let launcher = RecordingLauncher::default();
        let (dir, summary, output) = run_session(&["a.txt", "b/c.txt"], "1\nvim\n\n", &launcher);

        assert!(output.contains("    0) a.txt"));
        assert!(output.contains("    1) b/c.txt"));
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.prompts, 3);
        let launched = launcher.launched.borrow();
        assert_eq!(launched[0].0, "vim");
        assert_eq!(launched[0].1, dir.path().join("b").join("c.txt"));
    }

    #[test]
    fn test_blank_program_uses_default() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, _output) = run_session(&["a.txt"], "0\n\n", &launcher);

        assert_eq!(summary.dispatched, 1);
        assert_eq!(launcher.launched.borrow()[0].0, "less");
    }

    #[test]
    fn test_out_of_range_reprompts_without_dispatch() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, output) = run_session(&["a.txt", "b.txt"], "5\nvim\n-1\n\n", &launcher);

        assert!(output.contains("noteId 5 out of range [0] - [1]"));
        assert!(output.contains("noteId -1 out of range [0] - [1]"));
        assert_eq!(summary.dispatched, 0);
        assert!(launcher.launched.borrow().is_empty());
        // selection, program, selection, program, final blank selection
        assert_eq!(summary.prompts, 5);
    }

    #[test]
    fn test_huge_selection_is_out_of_range() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, output) =
            run_session(&["a.txt"], "99999999999999999999\nvim\n\n", &launcher);

        assert!(output.contains("noteId 99999999999999999999 out of range [0] - [0]"));
        assert!(!output.contains("is not a note number"));
        assert_eq!(summary.dispatched, 0);
    }

    #[test]
    fn test_non_numeric_selection_stays_in_selection() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, output) = run_session(&["a.txt"], "abc\n0\nvim\n", &launcher);

        assert!(output.contains("`abc` is not a note number"));
        assert_eq!(summary.dispatched, 1);
    }

    #[test]
    fn test_failed_program_is_reported_and_loop_continues() {
        let launcher = RecordingLauncher {
            fail_with: Some("exit status: 2".into()),
            ..Default::default()
        };
        let (_dir, summary, output) = run_session(&["a.txt"], "0\nbroken\n0\nbroken\n", &launcher);

        assert_eq!(summary.failures, 2);
        assert_eq!(summary.dispatched, 0);
        assert!(output.contains("external program `broken` failed: exit status: 2"));
    }

    #[test]
    fn test_end_of_input_at_program_prompt_terminates() {
        let launcher = RecordingLauncher::default();
        let (_dir, summary, _output) = run_session(&["a.txt"], "0\n", &launcher);

        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.prompts, 2);
    }
}
