use std::time::Duration;

use serde_json::json;
use trackr_core::{CellPatch, CellValue, NewRow, RowPatch, RowPosition};
use trackr_storage::{ApiError, ApiHttp, BackoffPolicy, HttpClientConfig, SheetApi, SmartsheetClient};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_http(max_retries: usize) -> ApiHttp {
    ApiHttp::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: Some("trackr-test".into()),
        backoff: BackoffPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        },
    })
    .expect("http client")
}

fn client(server: &MockServer, max_retries: usize) -> SmartsheetClient {
    SmartsheetClient::with_base_url(fast_http(max_retries), "tok", server.uri())
}

fn one_cell_row(value: &str) -> NewRow {
    NewRow {
        cells: vec![CellPatch {
            column_id: 1,
            value: CellValue::Text(value.into()),
        }],
    }
}

#[tokio::test]
async fn get_sheet_sends_bearer_token_and_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sheets/7"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "name": "Tracker",
            "version": 4,
            "columns": [{"id": 1, "title": "Task ID", "type": "TEXT_NUMBER", "primary": true}],
            "rows": [{"id": 100, "cells": [{"columnId": 1, "value": 1.1}]}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sheet = client(&server, 0).get_sheet(7).await.expect("sheet");
    assert_eq!(sheet.version, Some(4));
    assert_eq!(sheet.columns[0].title, "Task ID");
    assert_eq!(sheet.rows[0].value(1), Some(&CellValue::Number(1.1)));
}

#[tokio::test]
async fn rate_limited_write_succeeds_after_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "errorCode": 4003,
            "message": "Rate limit exceeded."
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "SUCCESS",
            "resultCode": 0,
            "version": 5,
            "result": [{"id": 200, "cells": [{"columnId": 1, "value": "x"}]}]
        })))
        .mount(&server)
        .await;

    let written = client(&server, 3)
        .insert_rows(7, &[one_cell_row("x")], RowPosition::Bottom)
        .await
        .expect("insert should succeed after retry");

    assert_eq!(written.rows.len(), 1);
    assert_eq!(written.rows[0].id, 200);
    assert_eq!(written.version, Some(5));
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn exhausted_retry_budget_surfaces_the_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/sheets/7/rows"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({"message": "Rate limit exceeded."})))
        .expect(3)
        .mount(&server)
        .await;

    let err = client(&server, 2)
        .update_rows(
            7,
            &[RowPatch {
                id: 100,
                cells: vec![CellPatch {
                    column_id: 1,
                    value: CellValue::Text("y".into()),
                }],
            }],
        )
        .await
        .expect_err("should give up");

    match err {
        ApiError::Upstream { status, message, .. } => {
            assert_eq!(status, 429);
            assert_eq!(message, "Rate limit exceeded.");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_on_inserts_are_not_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .respond_with(ResponseTemplate::new(502))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .insert_rows(7, &[one_cell_row("x")], RowPosition::Bottom)
        .await
        .expect_err("502 should surface");
    assert_eq!(err.status(), Some(502));
}

#[tokio::test]
async fn insert_position_is_encoded_in_the_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .and(body_json(json!([
            {"siblingId": 55, "cells": [{"columnId": 1, "value": "after"}]}
        ])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "SUCCESS",
            "result": [{"id": 56, "siblingId": 55, "cells": []}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .and(body_json(json!([
            {"parentId": 55, "toBottom": true, "cells": [{"columnId": 1, "value": "child"}]}
        ])))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "SUCCESS",
            "result": [{"id": 57, "parentId": 55, "cells": []}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, 0);
    let after = api
        .insert_rows(7, &[one_cell_row("after")], RowPosition::AfterSibling(55))
        .await
        .expect("sibling insert");
    assert_eq!(after.rows[0].sibling_id, Some(55));
    let child = api
        .insert_rows(7, &[one_cell_row("child")], RowPosition::ChildOf(55))
        .await
        .expect("child insert");
    assert_eq!(child.rows[0].parent_id, Some(55));
}

#[tokio::test]
async fn partial_batches_are_reported_as_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "PARTIAL_SUCCESS",
            "resultCode": 3,
            "result": [{"id": 1, "cells": []}],
            "failedItems": [{"index": 1, "error": {"errorCode": 1036, "message": "bad value"}}]
        })))
        .mount(&server)
        .await;

    let err = client(&server, 0)
        .insert_rows(7, &[one_cell_row("a"), one_cell_row("b")], RowPosition::Bottom)
        .await
        .expect_err("partial batch");
    assert!(matches!(err, ApiError::PartialBatch { applied: 1, failed: 1, .. }));
}

#[tokio::test]
async fn delete_ignores_missing_rows() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/sheets/7/rows"))
        .and(query_param("ids", "1,2"))
        .and(query_param("ignoreRowsNotFound", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "SUCCESS",
            "result": [1]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, 0);
    let deleted = api.delete_rows(7, &[1, 2]).await.expect("delete");
    assert_eq!(deleted, vec![1]);
    assert!(api.delete_rows(7, &[]).await.expect("noop").is_empty());
}

#[tokio::test]
async fn upstream_errors_carry_status_and_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sheets/404"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errorCode": 1006,
            "message": "Not Found",
            "refId": "abc"
        })))
        .mount(&server)
        .await;

    let err = client(&server, 3).get_sheet(404).await.expect_err("missing sheet");
    match err {
        ApiError::Upstream { status, message, body } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Not Found");
            assert!(body.contains("refId"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn sheet_version_and_attachments_are_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sheets/7/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": 12})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sheets/7/rows/100/attachments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "pageNumber": 1,
            "totalCount": 1,
            "data": [{"id": 9, "name": "1.1-Report.docx", "attachmentType": "FILE", "mimeType": "application/octet-stream"}]
        })))
        .mount(&server)
        .await;

    let api = client(&server, 0);
    assert_eq!(api.get_sheet_version(7).await.expect("version"), 12);
    let attachments = api.list_attachments(7, 100).await.expect("attachments");
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].name, "1.1-Report.docx");
}

#[tokio::test]
async fn duplicate_attachment_upload_is_a_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows/100/attachments"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"message": "already attached"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server, 3)
        .upload_attachment(7, 100, b"docx".to_vec(), "1.1-Report.docx")
        .await
        .expect_err("conflict");
    assert!(matches!(
        err,
        ApiError::Conflict { row_id: 100, ref file_name } if file_name == "1.1-Report.docx"
    ));
}

#[tokio::test]
async fn attachment_upload_returns_created_attachment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sheets/7/rows/100/attachments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "SUCCESS",
            "resultCode": 0,
            "result": {"id": 31, "name": "1.1-Report.docx", "attachmentType": "FILE", "sizeInKb": 12}
        })))
        .mount(&server)
        .await;

    let attachment = client(&server, 0)
        .upload_attachment(7, 100, b"docx".to_vec(), "1.1-Report.docx")
        .await
        .expect("upload");
    assert_eq!(attachment.id, 31);
    assert_eq!(attachment.size_in_kb, Some(12));
}
