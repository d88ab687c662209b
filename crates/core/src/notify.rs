use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;
use crate::domain::request::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ActionRequired,
    StepApproved,
    RequestApproved,
    RequestRejected,
    Escalated,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActionRequired => "action_required",
            Self::StepApproved => "step_approved",
            Self::RequestApproved => "request_approved",
            Self::RequestRejected => "request_rejected",
            Self::Escalated => "escalated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "action_required" => Some(Self::ActionRequired),
            "step_approved" => Some(Self::StepApproved),
            "request_approved" => Some(Self::RequestApproved),
            "request_rejected" => Some(Self::RequestRejected),
            "escalated" => Some(Self::Escalated),
            _ => None,
        }
    }
}

/// A request to tell someone something. Delivery is somebody else's job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub recipient: PrincipalId,
    pub kind: NotificationKind,
    pub request_id: RequestId,
    pub subject: String,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        recipient: PrincipalId,
        kind: NotificationKind,
        request_id: RequestId,
        subject: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self { recipient, kind, request_id, subject: subject.into(), created_at }
    }
}

pub trait NotificationSink: Send + Sync {
    fn enqueue(&self, notification: NotificationRequest);
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    queued: Arc<Mutex<Vec<NotificationRequest>>>,
}

impl InMemoryNotificationSink {
    pub fn queued(&self) -> Vec<NotificationRequest> {
        match self.queued.lock() {
            Ok(queued) => queued.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn enqueue(&self, notification: NotificationRequest) {
        match self.queued.lock() {
            Ok(mut queued) => queued.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
    }
}
