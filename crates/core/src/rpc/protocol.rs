//! Wire format between the host side and the storage worker.
//!
//! Every message is a single-line JSON object. Requests carry a caller
//! generated `id` that the worker echoes back unchanged:
//!
//! ```text
//! -> {"id":"…","action":"exec","sql":"SELECT …","params":["e1",1000]}
//! <- {"id":"…","results":{"values":[["e1",1000]]}}
//! <- {"id":"…","error":"no such table: …"}
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::StorageError;
use crate::storage::{Rows, SqlValue};

/// Unique per outstanding request.
pub type RequestId = String;

/// The four operations the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAction {
    Exec,
    BeginTransaction,
    EndTransaction,
    RollbackTransaction,
}

impl std::fmt::Display for WorkerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exec => write!(f, "exec"),
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::EndTransaction => write!(f, "end_transaction"),
            Self::RollbackTransaction => write!(f, "rollback_transaction"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: RequestId,
    pub action: WorkerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<SqlValue>>,
}

impl WorkerRequest {
    pub fn exec(id: RequestId, sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            id,
            action: WorkerAction::Exec,
            sql: Some(sql.into()),
            params: Some(params),
        }
    }

    pub fn control(id: RequestId, action: WorkerAction) -> Self {
        Self {
            id,
            action,
            sql: None,
            params: None,
        }
    }
}

/// Either `results` or `error` is set. `id` is absent only when the worker
/// could not read one from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Rows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok(id: RequestId, results: Rows) -> Self {
        Self {
            id: Some(id),
            results: Some(results),
            error: None,
        }
    }

    pub fn err(id: Option<RequestId>, error: impl Into<String>) -> Self {
        Self {
            id,
            results: None,
            error: Some(error.into()),
        }
    }

    /// Outcome for the caller that issued request `id`.
    pub fn into_result(self, id: &str) -> Result<Rows, StorageError> {
        match (self.results, self.error) {
            (_, Some(error)) => Err(StorageError::Statement(error)),
            (Some(rows), None) => Ok(rows),
            (None, None) => Err(StorageError::ProtocolMismatch {
                request_id: id.to_string(),
                detail: "response carries neither results nor error".into(),
            }),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names() {
        let actions = [
            WorkerAction::Exec,
            WorkerAction::BeginTransaction,
            WorkerAction::EndTransaction,
            WorkerAction::RollbackTransaction,
        ];
        let names: Vec<String> = actions
            .iter()
            .map(|a| serde_json::to_value(a).unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            ["exec", "begin_transaction", "end_transaction", "rollback_transaction"]
        );
        for (action, name) in actions.iter().zip(&names) {
            assert_eq!(&action.to_string(), name);
        }
    }

    #[test]
    fn test_control_request_omits_sql_and_params() {
        let req = WorkerRequest::control("r1".into(), WorkerAction::BeginTransaction);
        assert_eq!(
            encode(&req).unwrap(),
            r#"{"id":"r1","action":"begin_transaction"}"#
        );
    }

    #[test]
    fn test_encoded_messages_are_single_line() {
        let req = WorkerRequest::exec(
            "r2".into(),
            "SELECT id\n  FROM ping_events\n WHERE id = ?1",
            vec![SqlValue::from("line\nbreak")],
        );
        assert!(!encode(&req).unwrap().contains('\n'));
    }

    #[test]
    fn test_response_outcomes() {
        let rows = Rows {
            values: vec![vec![SqlValue::from(1i64)]],
        };
        let ok = WorkerResponse::ok("a".into(), rows.clone());
        assert_eq!(ok.into_result("a").unwrap(), rows);

        let err = WorkerResponse::err(Some("b".into()), "boom");
        assert!(matches!(err.into_result("b"), Err(StorageError::Statement(ref m)) if m == "boom"));

        let empty: WorkerResponse = serde_json::from_str(r#"{"id":"c"}"#).unwrap();
        assert!(matches!(
            empty.into_result("c"),
            Err(StorageError::ProtocolMismatch { ref request_id, .. }) if request_id == "c"
        ));
    }
}
