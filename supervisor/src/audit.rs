//! Audit lines for lifecycle transitions.
//!
//! Each event goes into the application's own log buffer through the same
//! append path as process output, so audit lines interleave with stdout and
//! stderr in the order they happened. The same event is also emitted as a
//! structured `tracing` event for the supervisor's own log.

use tracing::{info, Span};

use crate::identity::Identity;
use crate::logbuf::{LogBuffer, LogSource};
use crate::signal::StopSignal;

/// A lifecycle action worth attributing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Start,
    Stop(StopSignal),
    ForceStop,
    Exit(i32),
}

impl AuditAction {
    pub fn name(&self) -> &'static str {
        match self {
            AuditAction::Start => "start",
            AuditAction::Stop(_) => "stop",
            AuditAction::ForceStop => "force_stop",
            AuditAction::Exit(_) => "exit",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AuditAction::Start => "Started application".to_string(),
            AuditAction::Stop(signal) => format!("Stopping application (Using {signal})"),
            AuditAction::ForceStop => "Force stopping application (Using SIGKILL)".to_string(),
            AuditAction::Exit(code) => format!("Application process exited with code {code}"),
        }
    }
}

/// Format an audit line as `<actor>: <message>`.
pub fn format_line(actor: &Identity, action: AuditAction) -> String {
    format!("{}: {}", actor.audit_name(), action.message())
}

/// Append an audit line for `action` on `app` and log it under `span`.
pub(crate) fn record(span: &Span, logs: &LogBuffer, app: &str, actor: &Identity, action: AuditAction) {
    let line = format_line(actor, action);
    logs.push(LogSource::Audit, line.as_str());

    info!(
        parent: span,
        action = action.name(),
        app,
        user_id = %actor.id,
        user_name = %actor.display_name,
        is_anonymous = actor.is_anonymous,
        ip_address = actor.ip_address.as_deref().unwrap_or(""),
        "{line}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{Grants, Role};

    #[test]
    fn test_messages() {
        let jane = Identity::user("u1", "Jane", Grants::new());
        assert_eq!(format_line(&jane, AuditAction::Start), "Jane: Started application");
        assert_eq!(
            format_line(&jane, AuditAction::Stop(StopSignal::Terminate)),
            "Jane: Stopping application (Using SIGTERM)"
        );
        assert_eq!(
            format_line(&jane, AuditAction::ForceStop),
            "Jane: Force stopping application (Using SIGKILL)"
        );
        assert_eq!(
            format_line(&jane, AuditAction::Exit(0)),
            "Jane: Application process exited with code 0"
        );
    }

    #[test]
    fn test_anonymous_actor_is_not_named() {
        let anon = Identity::anonymous_from_addr("10.1.2.3:9999", Role::Admin);
        assert_eq!(
            format_line(&anon, AuditAction::Start),
            "Anonymous: Started application"
        );
    }

    #[test]
    fn test_record_appends_audit_line() {
        let logs = LogBuffer::new(10);
        logs.push(LogSource::Stdout, "before");
        let jane = Identity::user("u1", "Jane", Grants::new());
        record(&Span::none(), &logs, "web", &jane, AuditAction::Exit(2));

        let lines = logs.snapshot();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].source, LogSource::Audit);
        assert_eq!(lines[1].message, "Jane: Application process exited with code 2");
    }
}
