//! Replay-safe logging for orchestration code.
//!
//! An orchestration body is re-executed from the top on every turn, so a
//! plain `tracing::info!` inside it fires once per replay. `ReplaySafeLogger`
//! only emits while the body is executing live, i.e. past the last completion
//! recorded in history.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::OrchestrationContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Logger bound to one orchestration context. Messages are written to
/// `tracing` and buffered on the context for the turn.
#[derive(Clone)]
pub struct ReplaySafeLogger {
    ctx: OrchestrationContext,
    component: &'static str,
}

impl ReplaySafeLogger {
    pub fn new(ctx: &OrchestrationContext, component: &'static str) -> Self {
        Self {
            ctx: ctx.clone(),
            component,
        }
    }

    /// Emit `message` at `level` unless the context is replaying.
    /// Returns whether the message was emitted.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        if self.ctx.is_replaying() {
            return false;
        }
        let message = message.into();
        let instance = self.ctx.instance_id();
        let component = self.component;
        let turn = self.ctx.turn_index();
        match level {
            LogLevel::Debug => tracing::debug!(%instance, component, turn, "{message}"),
            LogLevel::Info => tracing::info!(%instance, component, turn, "{message}"),
            LogLevel::Warn => tracing::warn!(%instance, component, turn, "{message}"),
            LogLevel::Error => tracing::error!(%instance, component, turn, "{message}"),
        }
        self.ctx.push_log(level, message);
        true
    }

    pub fn debug(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Info, message)
    }

    pub fn warn(&self, message: impl Into<String>) -> bool {
        self.log(LogLevel::Warn, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    #[test]
    fn emits_when_history_has_no_completions() {
        let ctx = OrchestrationContext::new("inst-log", Vec::new());
        let log = ReplaySafeLogger::new(&ctx, "test");
        assert!(log.info("hello"));
        assert_eq!(ctx.take_log_buffer(), vec![(LogLevel::Info, "hello".to_string())]);
    }

    #[test]
    fn suppressed_until_recorded_completions_are_consumed() {
        let history = vec![
            Event::ActivityScheduled {
                id: 1,
                name: "A".into(),
                input: "x".into(),
            },
            Event::ActivityCompleted {
                id: 1,
                result: "ok".into(),
            },
        ];
        let ctx = OrchestrationContext::new("inst-log", history);
        let log = ReplaySafeLogger::new(&ctx, "test");
        assert!(ctx.is_replaying());
        assert!(!log.warn("before the activity resolves"));
        assert!(ctx.take_log_buffer().is_empty());
    }

    #[test]
    fn logger_sees_the_host_turn() {
        let body = |ctx: OrchestrationContext| async move {
            ReplaySafeLogger::new(&ctx, "test").debug("turn");
            ctx.turn_index()
        };
        let (_h, _actions, logs, out) = crate::run_turn_with("inst-turn", Vec::new(), 3, body);
        assert_eq!(out, Some(3));
        assert_eq!(logs, vec![(LogLevel::Debug, "turn".to_string())]);
    }

    #[test]
    fn level_display_is_upper_case() {
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Debug.to_string(), "DEBUG");
    }
}
