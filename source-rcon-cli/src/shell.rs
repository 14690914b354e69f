use crossterm::tty::IsTty;
use rustyline_async::{Readline, ReadlineError, SharedWriter};
use std::io::{Stderr, Stdout, Write};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

/// Line source for the console: an editable prompt on a terminal, plain stdin otherwise.
pub struct ShellRead {
    prompt: String,
    inner: ShellReadInner,
}

/// Output side of the console. Writing through it keeps the prompt intact.
#[derive(Clone)]
pub struct ShellWrite {
    inner: ShellWriteInner,
}

enum ShellReadInner {
    Interactive(Readline, SharedWriter),
    Stream(Lines<BufReader<Stdin>>),
}

enum ShellWriteInner {
    Interactive(SharedWriter),
    Stream(Stdout, Stderr),
}

pub fn new_shell(prompt: String, disable_interactive: bool) -> (ShellRead, ShellWrite) {
    if !disable_interactive && std::io::stdout().is_tty() {
        match Readline::new(prompt.clone()) {
            Ok((read_line, writer)) => {
                return (
                    ShellRead {
                        prompt,
                        inner: ShellReadInner::Interactive(read_line, writer.clone()),
                    },
                    ShellWrite {
                        inner: ShellWriteInner::Interactive(writer),
                    },
                )
            }
            Err(err) => log::warn!("Falling back to plain input: {:?}", err),
        }
    }

    (
        ShellRead {
            prompt,
            inner: ShellReadInner::Stream(BufReader::new(tokio::io::stdin()).lines()),
        },
        ShellWrite {
            inner: ShellWriteInner::Stream(std::io::stdout(), std::io::stderr()),
        },
    )
}

impl ShellRead {
    /// Reads the next line, or `None` once input is closed or interrupted.
    pub async fn read_line(&mut self) -> Option<String> {
        match &mut self.inner {
            ShellReadInner::Interactive(read, writer) => {
                let line = match read.readline().await {
                    Ok(line) => line,
                    Err(ReadlineError::IO(err)) => {
                        writeln!(writer, "An error occurred: {}", err).ok();
                        return None;
                    }
                    Err(
                        ReadlineError::Eof | ReadlineError::Closed | ReadlineError::Interrupted,
                    ) => return None,
                };

                read.add_history_entry(line.clone());

                // echo back the line
                writeln!(writer, "{}{}", self.prompt, line).ok();

                Some(line)
            }
            ShellReadInner::Stream(lines) => match lines.next_line().await {
                Ok(line) => line,
                Err(err) => {
                    eprintln!("An error occurred: {}", err);
                    None
                }
            },
        }
    }
}

impl ShellWrite {
    pub fn out(&mut self) -> &mut dyn Write {
        match &mut self.inner {
            ShellWriteInner::Interactive(writer) => writer,
            ShellWriteInner::Stream(stdout, _) => stdout,
        }
    }

    pub fn err(&mut self) -> &mut dyn Write {
        match &mut self.inner {
            ShellWriteInner::Interactive(writer) => writer,
            ShellWriteInner::Stream(_, stderr) => stderr,
        }
    }
}

impl Clone for ShellWriteInner {
    fn clone(&self) -> Self {
        match self {
            ShellWriteInner::Interactive(w) => ShellWriteInner::Interactive(w.clone()),
            ShellWriteInner::Stream(_, _) => {
                ShellWriteInner::Stream(std::io::stdout(), std::io::stderr())
            }
        }
    }
}
