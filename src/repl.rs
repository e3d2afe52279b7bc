//! Interactive session
//!
//! Reads one question per line and answers it through the [`Agent`],
//! streaming the answer as it arrives. A failed turn prints a short message
//! and the session continues; only `exit`, `quit`, `q` or end of input stop it.

use std::io::{self, BufRead, Write};

use crate::agent::{Agent, TurnOutcome};
use crate::engine::DatabaseEngine;
use crate::llm::{LanguageModel, TokenSink};

const HELP: &str = "Ask a question about the database in plain language.
Commands:
  /clear   forget the conversation so far
  /help    show this message
  exit     end the session (also: quit, q)";

/// What one input line asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    Exit,
    Clear,
    Help,
    Empty,
    Ask(&'a str),
}

impl<'a> ReplCommand<'a> {
    #[must_use]
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        match line.to_ascii_lowercase().as_str() {
            "" => Self::Empty,
            "exit" | "quit" | "q" => Self::Exit,
            "/clear" => Self::Clear,
            "/help" | "?" => Self::Help,
            _ => Self::Ask(line),
        }
    }
}

/// Token sink that writes straight through to a terminal (or any writer)
pub struct WriterSink<'w, W: Write + Send> {
    out: &'w mut W,
    wrote: bool,
}

impl<'w, W: Write + Send> WriterSink<'w, W> {
    pub fn new(out: &'w mut W) -> Self {
        Self { out, wrote: false }
    }

    /// Whether any text was streamed
    pub const fn wrote(&self) -> bool {
        self.wrote
    }
}

impl<W: Write + Send> TokenSink for WriterSink<'_, W> {
    fn token(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        // A closed stdout only loses the echo; the turn itself still completes
        if self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()).is_ok() {
            self.wrote = true;
        }
    }
}

/// Answer a single question and print the result
///
/// Returns whether the model produced an answer; a turn that gave up or
/// failed still prints its message and yields `false`.
pub async fn answer_once<E, M, W>(
    agent: &mut Agent<E, M>,
    question: &str,
    out: &mut W,
) -> io::Result<bool>
where
    E: DatabaseEngine,
    M: LanguageModel,
    W: Write + Send,
{
    let mut sink = WriterSink::new(&mut *out);
    let result = agent.ask(question, &mut sink).await;
    let streamed = sink.wrote();

    let answered = match result {
        Ok(TurnOutcome::Answered(text)) => {
            if !streamed {
                write!(out, "{text}")?;
            }
            true
        }
        Ok(TurnOutcome::GaveUp(err)) | Err(err) => {
            if streamed {
                writeln!(out)?;
            }
            write!(out, "{}", err.user_message())?;
            false
        }
    };

    writeln!(out)?;
    out.flush()?;
    Ok(answered)
}

/// Run the read-eval-print loop until exit or end of input
pub async fn run<E, M, R, W>(agent: &mut Agent<E, M>, input: R, out: &mut W) -> io::Result<()>
where
    E: DatabaseEngine,
    M: LanguageModel,
    R: BufRead,
    W: Write + Send,
{
    writeln!(out, "Connected. Type a question, /help for commands, or 'exit' to quit.")?;
    let mut lines = input.lines();

    loop {
        write!(out, "\n> ")?;
        out.flush()?;

        let Some(line) = lines.next() else {
            writeln!(out)?;
            break;
        };
        let line = line?;

        match ReplCommand::parse(&line) {
            ReplCommand::Exit => break,
            ReplCommand::Empty => {}
            ReplCommand::Help => writeln!(out, "{HELP}")?,
            ReplCommand::Clear => {
                agent.reset();
                writeln!(out, "Conversation cleared.")?;
            }
            ReplCommand::Ask(question) => {
                answer_once(agent, question, out).await?;
            }
        }
    }

    tracing::debug!(turns = agent.conversation().user_turns(), "session ended");
    Ok(())
}
