//! Confirmation gate used by interactive recovery.

use std::io::{self, BufRead, Write};

/// Asks whether a single destructive step may proceed.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(&str) -> bool,
{
    fn confirm(&mut self, prompt: &str) -> bool {
        self(prompt)
    }
}

/// Approves every step.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        true
    }
}

/// Parse a yes/no answer, case-insensitively.
pub fn parse_answer(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Prompts on a writer and reads answers line by line.
///
/// An empty line or end of input selects `default`; anything that is not
/// yes/no/y/n asks again.
pub struct LineConfirm<R, W> {
    input: R,
    output: W,
    default: bool,
}

impl<R: BufRead, W: Write> LineConfirm<R, W> {
    pub fn new(input: R, output: W, default: bool) -> Self {
        Self {
            input,
            output,
            default,
        }
    }

    fn ask(&mut self, prompt: &str) -> io::Result<bool> {
        let choices = if self.default { "[Y/n]" } else { "[y/N]" };
        loop {
            write!(self.output, "{prompt} {choices} ")?;
            self.output.flush()?;

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 || line.trim().is_empty() {
                return Ok(self.default);
            }

            match parse_answer(&line) {
                Some(answer) => return Ok(answer),
                None => writeln!(self.output, "Please answer yes or no.")?,
            }
        }
    }
}

impl<R: BufRead, W: Write> Confirm for LineConfirm<R, W> {
    fn confirm(&mut self, prompt: &str) -> bool {
        match self.ask(prompt) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read confirmation, declining");
                false
            }
        }
    }
}

/// Confirmation on the controlling terminal.
pub fn stdin_confirm(default: bool) -> LineConfirm<io::StdinLock<'static>, io::Stdout> {
    LineConfirm::new(io::stdin().lock(), io::stdout(), default)
}
