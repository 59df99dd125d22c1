use std::io::{Cursor, Read};

use trackr_report::{
    extract_text, render, Alignment, CalloutTone, Document, Paragraph, ReportError, Run, Table, TableCell,
    TextStyle,
};

fn audit_report() -> Document {
    Document {
        subtitle: Some("Security audit & follow-ups".into()),
        author: Some("Platform team".into()),
        ..Document::new("1.4 Security <Audit> Report")
    }
    .heading(1, "Summary")
    .paragraph(Paragraph {
        runs: vec![
            Run::plain("Overall status: "),
            Run {
                text: "PASS with findings".into(),
                style: TextStyle {
                    bold: true,
                    color: Some("#548235".into()),
                    ..TextStyle::default()
                },
            },
        ],
        align: Alignment::Justify,
    })
    .callout(CalloutTone::Warning, Some("Action required"), "Rotate the service key before launch.")
    .heading(2, "Endpoint probes")
    .table(Table {
        header_row: vec!["Endpoint".into(), "Status".into(), "Result".into()],
        body_rows: vec![
            vec!["/rest/v1/profiles".into(), "401".into(), "pass".into()],
            vec![
                "/functions/v1/admin".into(),
                "200".into(),
                TableCell {
                    text: "FAIL".into(),
                    shade: Some("FBE4E4".into()),
                    align: Alignment::Center,
                    ..TableCell::default()
                },
            ],
        ],
        column_widths: vec![5000, 1500, 2860],
    })
    .page_break()
    .heading(3, "Appendix")
    .paragraph(Paragraph::plain("Generated from the probe checklist."))
}

#[test]
fn rendered_package_text_matches_document() {
    let doc = audit_report();
    let bytes = render(&doc).expect("render");
    assert_eq!(&bytes[..2], b"PK");

    let extracted = extract_text(&bytes).expect("extract");
    assert_eq!(extracted, doc.text_content());
    assert_eq!(extracted[0], "1.4 Security <Audit> Report");
    assert!(extracted.contains(&"Overall status: PASS with findings".to_string()));
    assert!(extracted.contains(&"Action required".to_string()));
}

#[test]
fn package_contains_the_parts_word_expects() {
    let bytes = render(&audit_report()).expect("render");
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).expect("zip");
    for part in [
        "[Content_Types].xml",
        "_rels/.rels",
        "word/_rels/document.xml.rels",
        "word/document.xml",
        "word/styles.xml",
        "word/footer1.xml",
        "docProps/core.xml",
    ] {
        assert!(archive.by_name(part).is_ok(), "missing {part}");
    }

    let mut document = String::new();
    archive
        .by_name("word/document.xml")
        .unwrap()
        .read_to_string(&mut document)
        .unwrap();
    assert!(document.contains(r#"<w:pStyle w:val="Heading2"/>"#));
    assert!(document.contains(r#"<w:color w:val="548235"/>"#));
    assert!(document.contains(r#"<w:br w:type="page"/>"#));
    assert!(document.contains(r#"<w:gridCol w:w="5000"/>"#));
    assert!(document.contains(r#"w:fill="FBE4E4""#));
    assert!(document.contains(r#"<w:footerReference w:type="default" r:id="rId2"/>"#));

    let mut footer = String::new();
    archive
        .by_name("word/footer1.xml")
        .unwrap()
        .read_to_string(&mut footer)
        .unwrap();
    assert!(footer.contains(" PAGE "));
}

#[test]
fn structural_content_is_deterministic() {
    let doc = audit_report();
    let first = extract_text(&render(&doc).unwrap()).unwrap();
    let second = extract_text(&render(&doc).unwrap()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn invalid_documents_are_rejected() {
    let ragged = Document::new("x").table(Table {
        header_row: vec!["a".into(), "b".into()],
        body_rows: vec![vec!["only one".into()]],
        column_widths: vec![],
    });
    assert!(matches!(
        render(&ragged),
        Err(ReportError::RaggedTable { row: 0, expected: 2, found: 1, .. })
    ));

    let widths = Document::new("x").table(Table {
        header_row: vec!["a".into()],
        body_rows: vec![],
        column_widths: vec![100, 200],
    });
    assert!(matches!(render(&widths), Err(ReportError::ColumnWidthMismatch { .. })));

    let heading = Document::new("x").heading(4, "too deep");
    assert!(matches!(render(&heading), Err(ReportError::InvalidHeadingLevel(4))));

    let color = Document::new("x").paragraph(Paragraph {
        runs: vec![Run {
            text: "bad".into(),
            style: TextStyle {
                color: Some("reddish".into()),
                ..TextStyle::default()
            },
        }],
        align: Alignment::Left,
    });
    assert!(matches!(render(&color), Err(ReportError::InvalidColor(_))));
}

#[test]
fn documents_load_from_yaml() {
    let doc = Document::from_yaml_str(
        r#"
title: Tech Stack Analysis Report
subtitle: Task 1.1
sections:
  - kind: heading
    level: 1
    text: Frontend
  - kind: paragraph
    runs:
      - text: "React 18 with "
      - text: Vite
        bold: true
  - kind: table
    header_row:
      - text: Layer
      - text: Choice
    body_rows:
      - - text: UI
        - text: React
          color: "1F3864"
  - kind: callout
    tone: info
    text: Versions pinned in package.json.
  - kind: page_break
"#,
    )
    .expect("yaml");

    assert_eq!(doc.sections.len(), 5);
    assert_eq!(
        doc.text_content(),
        vec![
            "Tech Stack Analysis Report",
            "Task 1.1",
            "Frontend",
            "React 18 with Vite",
            "Layer",
            "Choice",
            "UI",
            "React",
            "Versions pinned in package.json.",
        ]
    );
    let bytes = render(&doc).expect("render");
    assert_eq!(extract_text(&bytes).unwrap(), doc.text_content());
}
