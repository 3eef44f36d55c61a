//! Ordered assembly of shell command fragments.
//!
//! A [`ScriptBuilder`] records commands in insertion order and can nest other
//! builders, so a container hook can embed the extraction steps of every
//! mount without losing their relative order.

use std::borrow::Cow;
use std::fmt;

use shell_escape::unix::escape;

mod task;

pub use task::{BackgroundTask, Trigger};

/// Quotes `value` for inclusion in a POSIX shell command line.
#[must_use]
pub fn quote(value: &str) -> String {
    escape(Cow::Borrowed(value)).into_owned()
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Fragment {
    Command(String),
    Nested(ScriptBuilder),
}

/// Sequence of shell commands rendered either as one line or as a script.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScriptBuilder {
    fragments: Vec<Fragment>,
}

impl ScriptBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fragments: Vec::new(),
        }
    }

    /// Appends `command` followed by `args`, joined with single spaces.
    ///
    /// Arguments are inserted verbatim; quote them with [`quote`] when they
    /// may contain shell metacharacters.
    pub fn append<I, S>(&mut self, command: &str, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut line = command.to_owned();
        for arg in args {
            line.push(' ');
            line.push_str(arg.as_ref());
        }
        self.fragments.push(Fragment::Command(line));
        self
    }

    /// Appends a raw command line.
    pub fn line(&mut self, command: impl Into<String>) -> &mut Self {
        self.fragments.push(Fragment::Command(command.into()));
        self
    }

    /// Appends an `echo` of `message`, quoted.
    pub fn echo(&mut self, message: &str) -> &mut Self {
        self.fragments
            .push(Fragment::Command(format!("echo {}", quote(message))));
        self
    }

    /// Embeds another builder; its commands keep their order and position.
    pub fn nest(&mut self, other: Self) -> &mut Self {
        if !other.is_empty() {
            self.fragments.push(Fragment::Nested(other));
        }
        self
    }

    /// Returns `true` when no commands were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragments.iter().all(|fragment| match fragment {
            Fragment::Command(_) => false,
            Fragment::Nested(inner) => inner.is_empty(),
        })
    }

    /// Flattens nested builders into the ordered list of commands.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_into(&mut out);
        out
    }

    fn collect_into(&self, out: &mut Vec<String>) {
        for fragment in &self.fragments {
            match fragment {
                Fragment::Command(line) => out.push(line.clone()),
                Fragment::Nested(inner) => inner.collect_into(out),
            }
        }
    }

    /// Renders all commands on one line separated by `;`.
    #[must_use]
    pub fn to_command_line(&self) -> String {
        self.commands().join("; ")
    }

    /// Renders all commands one per line, suitable for a script body.
    #[must_use]
    pub fn dump_script(&self) -> String {
        let mut script = self.commands().join("\n");
        if !script.is_empty() {
            script.push('\n');
        }
        script
    }
}

impl fmt::Display for ScriptBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_line())
    }
}

#[cfg(test)]
mod tests;
