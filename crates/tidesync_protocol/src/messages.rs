//! Protocol messages for one sync round.

use crate::error::{ProtocolError, ProtocolResult};
use crate::issue::SyncIssue;
use crate::object::SyncObject;
use crate::options::SyncOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Path of the begin endpoint.
pub const BEGIN_PATH: &str = "/sync/begin";
/// Path of the change count endpoint.
pub const CHANGE_COUNT_PATH: &str = "/sync/changes/count";
/// Path of the change page endpoint.
pub const CHANGES_PATH: &str = "/sync/changes";
/// Path of the apply endpoint.
pub const APPLY_PATH: &str = "/sync/apply";
/// Path of the corrections lookup endpoint.
pub const CORRECTIONS_PATH: &str = "/sync/corrections";
/// Path of the apply-corrections endpoint.
pub const APPLY_CORRECTIONS_PATH: &str = "/sync/corrections/apply";
/// Path of the end endpoint.
pub const END_PATH: &str = "/sync/end";

/// Opens a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginSyncRequest {
    /// Correlation id chosen by the caller.
    pub session_id: Uuid,
    /// Options as requested by the caller (untrusted).
    pub options: SyncOptions,
}

impl BeginSyncRequest {
    /// Creates a begin request.
    pub fn new(session_id: Uuid, options: SyncOptions) -> Self {
        Self {
            session_id,
            options,
        }
    }
}

/// Answer to [`BeginSyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginSyncResponse {
    /// Session id.
    pub session_id: Uuid,
    /// Options the peer will actually honor.
    pub options: SyncOptions,
    /// The peer's "now", captured once when the session began.
    pub started_on: DateTime<Utc>,
}

/// Asks for one page of changes (or their count).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Inclusive lower bound.
    pub since: DateTime<Utc>,
    /// Exclusive upper bound.
    pub until: DateTime<Utc>,
    /// Number of changes to skip.
    pub skip: u64,
    /// Maximum number of changes to return.
    pub take: u32,
}

impl ChangeRequest {
    /// Creates a change request for the first page.
    pub fn new(session_id: Uuid, since: DateTime<Utc>, until: DateTime<Utc>, take: u32) -> Self {
        Self {
            session_id,
            since,
            until,
            skip: 0,
            take,
        }
    }

    /// Returns the request for the page after this one.
    pub fn next_page(&self, returned: usize) -> Self {
        Self {
            skip: self.skip + returned as u64,
            ..self.clone()
        }
    }
}

/// Answer to a change count request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCountResponse {
    /// Number of changes in the window.
    pub count: u64,
}

/// Carries objects to apply (changes or corrections).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Objects to apply.
    pub items: Vec<SyncObject>,
}

/// Asks for the authoritative values of the objects named by `issues`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionRequest {
    /// Session id.
    pub session_id: Uuid,
    /// Issues the caller wants corrected.
    pub issues: Vec<SyncIssue>,
}

/// Closes a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSyncRequest {
    /// Session id.
    pub session_id: Uuid,
}

/// A page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResult<T> {
    /// Items in this page.
    pub items: Vec<T>,
    /// Total number of items across all pages, if known.
    pub total_count: u64,
    /// Whether another page follows.
    pub has_more: bool,
}

impl<T> ServiceResult<T> {
    /// A complete, single-page result.
    pub fn complete(items: Vec<T>) -> Self {
        let total_count = items.len() as u64;
        Self {
            items,
            total_count,
            has_more: false,
        }
    }

    /// One page of a larger result.
    pub fn page(items: Vec<T>, total_count: u64, has_more: bool) -> Self {
        Self {
            items,
            total_count,
            has_more,
        }
    }

    /// An empty result.
    pub fn empty() -> Self {
        Self::complete(Vec::new())
    }
}

impl<T> Default for ServiceResult<T> {
    fn default() -> Self {
        Self::empty()
    }
}

/// A request routed by path.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Begin a session.
    Begin(BeginSyncRequest),
    /// Count changes in a window.
    ChangeCount(ChangeRequest),
    /// Fetch one page of changes.
    Changes(ChangeRequest),
    /// Apply incoming changes.
    Apply(ApplyRequest),
    /// Look up authoritative values for issues.
    Corrections(CorrectionRequest),
    /// Apply corrections.
    ApplyCorrections(ApplyRequest),
    /// End a session.
    End(EndSyncRequest),
}

impl SyncMessage {
    /// Returns the endpoint path for this message.
    pub fn path(&self) -> &'static str {
        match self {
            SyncMessage::Begin(_) => BEGIN_PATH,
            SyncMessage::ChangeCount(_) => CHANGE_COUNT_PATH,
            SyncMessage::Changes(_) => CHANGES_PATH,
            SyncMessage::Apply(_) => APPLY_PATH,
            SyncMessage::Corrections(_) => CORRECTIONS_PATH,
            SyncMessage::ApplyCorrections(_) => APPLY_CORRECTIONS_PATH,
            SyncMessage::End(_) => END_PATH,
        }
    }

    /// Returns the session id the message belongs to.
    pub fn session_id(&self) -> Uuid {
        match self {
            SyncMessage::Begin(r) => r.session_id,
            SyncMessage::ChangeCount(r) | SyncMessage::Changes(r) => r.session_id,
            SyncMessage::Apply(r) | SyncMessage::ApplyCorrections(r) => r.session_id,
            SyncMessage::Corrections(r) => r.session_id,
            SyncMessage::End(r) => r.session_id,
        }
    }

    /// Encodes the message body as JSON.
    pub fn encode_body(&self) -> ProtocolResult<Vec<u8>> {
        let body = match self {
            SyncMessage::Begin(r) => serde_json::to_vec(r)?,
            SyncMessage::ChangeCount(r) | SyncMessage::Changes(r) => serde_json::to_vec(r)?,
            SyncMessage::Apply(r) | SyncMessage::ApplyCorrections(r) => serde_json::to_vec(r)?,
            SyncMessage::Corrections(r) => serde_json::to_vec(r)?,
            SyncMessage::End(r) => serde_json::to_vec(r)?,
        };
        Ok(body)
    }

    /// Decodes a message from its path and JSON body.
    pub fn decode(path: &str, body: &[u8]) -> ProtocolResult<Self> {
        let message = match path {
            BEGIN_PATH => SyncMessage::Begin(serde_json::from_slice(body)?),
            CHANGE_COUNT_PATH => SyncMessage::ChangeCount(serde_json::from_slice(body)?),
            CHANGES_PATH => SyncMessage::Changes(serde_json::from_slice(body)?),
            APPLY_PATH => SyncMessage::Apply(serde_json::from_slice(body)?),
            CORRECTIONS_PATH => SyncMessage::Corrections(serde_json::from_slice(body)?),
            APPLY_CORRECTIONS_PATH => SyncMessage::ApplyCorrections(serde_json::from_slice(body)?),
            END_PATH => SyncMessage::End(serde_json::from_slice(body)?),
            other => return Err(ProtocolError::UnknownPath(other.to_string())),
        };
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::SyncStatus;

    #[test]
    fn paging_advances_skip() {
        let now = Utc::now();
        let first = ChangeRequest::new(Uuid::new_v4(), crate::full_sync_watermark(), now, 10);
        let second = first.next_page(10);
        assert_eq!(second.skip, 10);
        assert_eq!(second.take, 10);
        assert_eq!(second.until, now);
    }

    #[test]
    fn message_routing() {
        let session_id = Uuid::new_v4();
        let message = SyncMessage::Apply(ApplyRequest {
            session_id,
            items: vec![SyncObject::deleted(
                "Person",
                Uuid::new_v4(),
                Utc::now(),
                String::new(),
            )],
        });

        assert_eq!(message.path(), APPLY_PATH);
        let body = message.encode_body().unwrap();
        let decoded = SyncMessage::decode(message.path(), &body).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.session_id(), session_id);

        if let SyncMessage::Apply(request) = decoded {
            assert_eq!(request.items[0].status, SyncStatus::Deleted);
        }
    }

    #[test]
    fn same_body_routes_by_path() {
        let request = ApplyRequest {
            session_id: Uuid::new_v4(),
            items: vec![],
        };
        let body = serde_json::to_vec(&request).unwrap();
        let message = SyncMessage::decode(APPLY_CORRECTIONS_PATH, &body).unwrap();
        assert!(matches!(message, SyncMessage::ApplyCorrections(_)));
    }

    #[test]
    fn unknown_path() {
        let result = SyncMessage::decode("/sync/teleport", b"{}");
        assert!(matches!(result, Err(ProtocolError::UnknownPath(_))));
    }

    #[test]
    fn service_result_shapes() {
        let complete = ServiceResult::complete(vec![1, 2, 3]);
        assert_eq!(complete.total_count, 3);
        assert!(!complete.has_more);

        let page = ServiceResult::page(vec![1], 10, true);
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["hasMore"], true);
        assert_eq!(json["totalCount"], 10);

        let empty: ServiceResult<u8> = ServiceResult::default();
        assert!(empty.items.is_empty());
    }
}
