use std::io::{self, BufRead, BufReader, Stdin, Stdout, Write};

use crate::types::ChatMessage;

/// Longest slice of the previous message shown to a human prompter.
const SHOWN_CHARS: usize = 2000;

/// Produces the user side of a trial, one message per conversational turn.
pub trait Prompter: Send {
    /// Next user message, or `None` when the policy has nothing more to
    /// say. `prompts_sent` counts the user messages issued so far.
    fn next_message(&mut self, messages: &[ChatMessage], prompts_sent: usize) -> Option<String>;
}

/// Sends a fixed list of prompts in order.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPrompter {
    prompts: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(prompts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prompts: prompts.into_iter().map(Into::into).collect(),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn next_message(&mut self, _messages: &[ChatMessage], prompts_sent: usize) -> Option<String> {
        self.prompts.get(prompts_sent).cloned()
    }
}

/// Takes each user message from a person at a terminal: shows the latest
/// message, then reads one line. `quit`, `exit`, `q` or end of input end
/// the trial. Reads block the calling thread.
pub struct HumanPrompter<R, W> {
    input: R,
    output: W,
}

impl HumanPrompter<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> HumanPrompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    fn show(&mut self, messages: &[ChatMessage], prompts_sent: usize) -> io::Result<()> {
        if let Some(last) = messages.last() {
            let content = last.text().unwrap_or_default();
            let shown: String = content.chars().take(SHOWN_CHARS).collect();
            writeln!(self.output, "[{}]", last.role.as_str().to_uppercase())?;
            writeln!(self.output, "{shown}")?;
            if !last.tool_calls.is_empty() {
                let names: Vec<&str> = last.tool_calls.iter().map(|c| c.function.name.as_str()).collect();
                writeln!(self.output, "(tool calls: {})", names.join(", "))?;
            }
        }
        writeln!(self.output, "\nTurn {} | Type 'quit' to exit", prompts_sent + 1)?;
        write!(self.output, "You> ")?;
        self.output.flush()
    }
}

impl<R: BufRead + Send, W: Write + Send> Prompter for HumanPrompter<R, W> {
    fn next_message(&mut self, messages: &[ChatMessage], prompts_sent: usize) -> Option<String> {
        self.show(messages, prompts_sent).ok()?;
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if matches!(line.trim().to_lowercase().as_str(), "quit" | "exit" | "q") {
            return None;
        }
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn human_prompter_reads_lines_until_quit() {
        let input = Cursor::new("design a retry policy\r\n  add jitter too \nQuit\nnever read\n");
        let mut prompter = HumanPrompter::new(input, Vec::new());
        let history = vec![ChatMessage::system("sys"), ChatMessage::assistant("x".repeat(SHOWN_CHARS + 50))];

        assert_eq!(prompter.next_message(&history, 0).as_deref(), Some("design a retry policy"));
        assert_eq!(prompter.next_message(&history, 1).as_deref(), Some("  add jitter too "));
        assert_eq!(prompter.next_message(&history, 2), None);

        let shown = String::from_utf8(prompter.into_output()).expect("utf8");
        assert!(shown.contains("[ASSISTANT]"));
        assert!(shown.contains("Turn 1 | Type 'quit' to exit"));
        assert!(shown.contains("Turn 3 | Type 'quit' to exit"));
        assert!(!shown.contains(&"x".repeat(SHOWN_CHARS + 1)));
    }

    #[test]
    fn end_of_input_stops_the_human_prompter() {
        let mut prompter = HumanPrompter::new(Cursor::new(""), Vec::new());
        assert_eq!(prompter.next_message(&[], 0), None);
    }

    #[test]
    fn scripted_prompter_runs_out() {
        let mut prompter = ScriptedPrompter::new(["one", "two"]);
        assert_eq!(prompter.next_message(&[], 0).as_deref(), Some("one"));
        assert_eq!(prompter.next_message(&[], 1).as_deref(), Some("two"));
        assert_eq!(prompter.next_message(&[], 2), None);
    }
}
