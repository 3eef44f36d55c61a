//! Background shell loops rendered into generated scripts.
//!
//! Output sync runs as two independent tasks that share nothing but their
//! destination: one repeats on an interval, the other fires once when an
//! event is observed (payload exit or a preemption notice). Both write whole
//! trees, so whichever finishes last wins.

use super::ScriptBuilder;

/// What causes a [`BackgroundTask`] to run its actions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Trigger {
    /// Runs the actions every `seconds` for as long as `guard` succeeds.
    Every {
        /// Seconds to sleep between iterations.
        seconds: u64,
        /// Shell condition checked before every iteration.
        guard: String,
    },
    /// Polls `check` every `poll_seconds` and runs the actions once, as soon
    /// as the check stops succeeding.
    WhenCheckFails {
        /// Shell condition that succeeds while nothing has happened.
        check: String,
        /// Seconds to sleep between checks.
        poll_seconds: u64,
    },
}

/// A backgrounded loop with a trigger and an ordered list of actions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackgroundTask {
    trigger: Trigger,
    actions: ScriptBuilder,
    redirect: Option<String>,
}

impl BackgroundTask {
    /// Creates a task running `actions` on `trigger`.
    #[must_use]
    pub const fn new(trigger: Trigger, actions: ScriptBuilder) -> Self {
        Self {
            trigger,
            actions,
            redirect: None,
        }
    }

    /// Redirects the task's output, e.g. `"> /dev/null 2>&1"`.
    #[must_use]
    pub fn with_redirect(mut self, redirect: impl Into<String>) -> Self {
        self.redirect = Some(redirect.into());
        self
    }

    /// Trigger of this task.
    #[must_use]
    pub const fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    /// Renders the task as a single backgrounded subshell.
    #[must_use]
    pub fn render(&self) -> String {
        let actions = self.actions.to_command_line();
        let body = match &self.trigger {
            Trigger::Every { seconds, guard } => {
                format!("while {guard}; do {actions}; sleep {seconds}; done")
            }
            Trigger::WhenCheckFails {
                check,
                poll_seconds,
            } => format!("while {check}; do sleep {poll_seconds}; done; {actions}"),
        };
        match &self.redirect {
            Some(redirect) => format!("( {body} ) {redirect} &"),
            None => format!("( {body} ) &"),
        }
    }
}
