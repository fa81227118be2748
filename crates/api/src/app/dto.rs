use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use docket_core::Process;
use docket_infra::scheduler::{Admission, DocumentAccess};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct MaterializeQuery {
    #[serde(default)]
    pub auto_download: Option<bool>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookUrlRequest {
    pub webhook_url: String,
}

// -------------------------
// Response mapping
// -------------------------

pub fn process_to_json(process: &Process) -> JsonValue {
    json!({
        "process_number": process.process_number.to_string(),
        "court": process.court,
        "subject": process.subject,
        "summary": process.summary,
        "has_documents": process.has_documents,
        "created_at": process.created_at,
        "updated_at": process.updated_at,
    })
}

fn document_access_to_json(access: &DocumentAccess) -> JsonValue {
    json!({
        "id": access.document.document_id.to_string(),
        "uuid": access.document.external_uuid(),
        "name": access.document.name,
        "mime_type": access.document.mime_type,
        "size": access.document.size,
        "status": access.document.status,
        "download_url": access.download_url,
    })
}

/// Response of `GET /processes/{n}`: the process summary plus how the
/// materialization request was resolved.
pub fn admission_to_json(admission: &Admission) -> JsonValue {
    let mut body = json!({
        "process": process_to_json(&admission.process),
    });
    if let Some(decision) = admission.decision {
        body["decision"] = json!(decision.as_str());
    }
    if let Some(job) = &admission.job {
        body["job_id"] = json!(job.job_id);
        body["job_status"] = json!(job.status);
    }
    if !admission.documents.is_empty() {
        body["documents"] = JsonValue::Array(
            admission
                .documents
                .iter()
                .map(document_access_to_json)
                .collect(),
        );
    }
    body
}
