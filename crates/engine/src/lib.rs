pub mod notify;
pub mod service;
pub mod sweeper;

pub use notify::{
    Notification, NotificationGateway, NotifyTarget, TracingNotificationGateway,
    WebhookNotificationGateway,
};
pub use service::{ApprovalService, EngineError, TracingAuditSink};
pub use sweeper::{EscalationSweeper, SweepSummary};
