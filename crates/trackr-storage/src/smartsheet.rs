use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use trackr_core::{Attachment, CellPatch, NewRow, Row, RowId, RowPatch, RowPosition, RowWrite, Sheet, SheetId};

use crate::{ApiError, ApiHttp};

pub const DEFAULT_SMARTSHEET_BASE_URL: &str = "https://api.smartsheet.com/2.0";

/// Operations against a remote sheet. Each call maps to one HTTP request.
#[async_trait]
pub trait SheetApi: Send + Sync {
    async fn get_sheet(&self, sheet_id: SheetId) -> Result<Sheet, ApiError>;

    async fn get_sheet_version(&self, sheet_id: SheetId) -> Result<u64, ApiError>;

    async fn insert_rows(
        &self,
        sheet_id: SheetId,
        rows: &[NewRow],
        position: RowPosition,
    ) -> Result<RowWrite, ApiError>;

    async fn update_rows(&self, sheet_id: SheetId, patches: &[RowPatch]) -> Result<RowWrite, ApiError>;

    /// Rows that are already gone are not an error.
    async fn delete_rows(&self, sheet_id: SheetId, row_ids: &[RowId]) -> Result<Vec<RowId>, ApiError>;

    async fn list_attachments(&self, sheet_id: SheetId, row_id: RowId) -> Result<Vec<Attachment>, ApiError>;

    async fn upload_attachment(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<Attachment, ApiError>;
}

#[derive(Debug, Clone)]
pub struct SmartsheetClient {
    http: ApiHttp,
    base_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRowBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    to_top: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_bottom: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sibling_id: Option<RowId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<RowId>,
    cells: &'a [CellPatch],
}

impl<'a> InsertRowBody<'a> {
    fn new(row: &'a NewRow, position: RowPosition) -> Self {
        let mut body = Self {
            to_top: None,
            to_bottom: None,
            sibling_id: None,
            parent_id: None,
            cells: &row.cells,
        };
        match position {
            RowPosition::Top => body.to_top = Some(true),
            RowPosition::Bottom => body.to_bottom = Some(true),
            RowPosition::AfterSibling(id) => body.sibling_id = Some(id),
            RowPosition::ChildOf(id) => {
                body.parent_id = Some(id);
                body.to_bottom = Some(true);
            }
        }
        body
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultEnvelope<T> {
    #[serde(default)]
    message: Option<String>,
    result: T,
    #[serde(default)]
    version: Option<u64>,
    #[serde(default)]
    failed_items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct AttachmentPage {
    #[serde(default)]
    data: Vec<Attachment>,
}

impl SmartsheetClient {
    pub fn new(http: ApiHttp, token: impl Into<String>) -> Self {
        Self::with_base_url(http, token, DEFAULT_SMARTSHEET_BASE_URL)
    }

    pub fn with_base_url(http: ApiHttp, token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn rows_written(call: &str, envelope: ResultEnvelope<Vec<Row>>) -> Result<RowWrite, ApiError> {
        if !envelope.failed_items.is_empty() {
            return Err(ApiError::PartialBatch {
                applied: envelope.result.len(),
                failed: envelope.failed_items.len(),
                detail: serde_json::Value::Array(envelope.failed_items).to_string(),
            });
        }
        info!(
            call,
            rows = envelope.result.len(),
            version = ?envelope.version,
            message = envelope.message.as_deref().unwrap_or(""),
            "rows written"
        );
        Ok(RowWrite {
            rows: envelope.result,
            version: envelope.version,
        })
    }
}

#[async_trait]
impl SheetApi for SmartsheetClient {
    async fn get_sheet(&self, sheet_id: SheetId) -> Result<Sheet, ApiError> {
        let url = self.url(&format!("/sheets/{sheet_id}"));
        self.http
            .send_json("get_sheet", true, || {
                self.http.client().get(&url).bearer_auth(&self.token)
            })
            .await
    }

    async fn get_sheet_version(&self, sheet_id: SheetId) -> Result<u64, ApiError> {
        let url = self.url(&format!("/sheets/{sheet_id}/version"));
        let body: VersionBody = self
            .http
            .send_json("get_sheet_version", true, || {
                self.http.client().get(&url).bearer_auth(&self.token)
            })
            .await?;
        Ok(body.version)
    }

    async fn insert_rows(
        &self,
        sheet_id: SheetId,
        rows: &[NewRow],
        position: RowPosition,
    ) -> Result<RowWrite, ApiError> {
        if rows.is_empty() {
            return Ok(RowWrite::default());
        }
        let url = self.url(&format!("/sheets/{sheet_id}/rows"));
        let body: Vec<InsertRowBody<'_>> = rows.iter().map(|r| InsertRowBody::new(r, position)).collect();
        let envelope: ResultEnvelope<Vec<Row>> = self
            .http
            .send_json("insert_rows", false, || {
                self.http.client().post(&url).bearer_auth(&self.token).json(&body)
            })
            .await?;
        Self::rows_written("insert_rows", envelope)
    }

    async fn update_rows(&self, sheet_id: SheetId, patches: &[RowPatch]) -> Result<RowWrite, ApiError> {
        if patches.is_empty() {
            return Ok(RowWrite::default());
        }
        let url = self.url(&format!("/sheets/{sheet_id}/rows"));
        let envelope: ResultEnvelope<Vec<Row>> = self
            .http
            .send_json("update_rows", true, || {
                self.http.client().put(&url).bearer_auth(&self.token).json(patches)
            })
            .await?;
        Self::rows_written("update_rows", envelope)
    }

    async fn delete_rows(&self, sheet_id: SheetId, row_ids: &[RowId]) -> Result<Vec<RowId>, ApiError> {
        if row_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.url(&format!("/sheets/{sheet_id}/rows"));
        let ids = row_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let envelope: ResultEnvelope<Vec<RowId>> = self
            .http
            .send_json("delete_rows", true, || {
                self.http
                    .client()
                    .delete(&url)
                    .bearer_auth(&self.token)
                    .query(&[("ids", ids.as_str()), ("ignoreRowsNotFound", "true")])
            })
            .await?;
        if envelope.result.len() < row_ids.len() {
            warn!(
                requested = row_ids.len(),
                deleted = envelope.result.len(),
                "some rows were already absent"
            );
        }
        Ok(envelope.result)
    }

    async fn list_attachments(&self, sheet_id: SheetId, row_id: RowId) -> Result<Vec<Attachment>, ApiError> {
        let url = self.url(&format!("/sheets/{sheet_id}/rows/{row_id}/attachments"));
        let page: AttachmentPage = self
            .http
            .send_json("list_attachments", true, || {
                self.http.client().get(&url).bearer_auth(&self.token)
            })
            .await?;
        Ok(page.data)
    }

    async fn upload_attachment(
        &self,
        sheet_id: SheetId,
        row_id: RowId,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<Attachment, ApiError> {
        let url = self.url(&format!("/sheets/{sheet_id}/rows/{row_id}/attachments"));
        let result = self
            .http
            .send_json::<ResultEnvelope<Attachment>, _>("upload_attachment", false, || {
                let part = Part::bytes(bytes.clone()).file_name(file_name.to_string());
                self.http
                    .client()
                    .post(&url)
                    .bearer_auth(&self.token)
                    .multipart(Form::new().part("file", part))
            })
            .await;
        match result {
            Ok(envelope) => Ok(envelope.result),
            Err(ApiError::Upstream { status: 409, .. }) => Err(ApiError::Conflict {
                row_id,
                file_name: file_name.to_string(),
            }),
            Err(err) => Err(err),
        }
    }
}
