//! Extraction of binary formats from real containers, and training them
//! through the engine.

use std::io::Write;
use std::sync::Arc;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Object, Stream};

use kb_engine::config::Config;
use kb_engine::engine::{KnowledgeEngine, NewKnowledgeBase};
use kb_engine::extract::extract;
use kb_engine::EngineParts;
use kb_engine_core::embedding::HashingEmbedder;
use kb_engine_core::models::{
    DocumentStatus, QueryOptions, RerankStrategy, SearchMode, SourceType, TrainingOptions,
};
use kb_engine_core::EngineError;

/// One page per entry, each drawn with the standard Courier font.
fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 14.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).unwrap();
    out
}

fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

const W_NS: &str = "http://schemas.openxmlformats.org/wordprocessingml/2006/main";

fn docx_fixture() -> Vec<u8> {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="{W_NS}"><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Release Process</w:t></w:r></w:p>
<w:p><w:r><w:t xml:space="preserve">Tag the release </w:t></w:r><w:r><w:t>and publish the changelog.</w:t></w:r></w:p>
<w:tbl>
<w:tr><w:tc><w:p><w:r><w:t>Step</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Owner</w:t></w:r></w:p></w:tc></w:tr>
<w:tr><w:tc><w:p><w:r><w:t>Freeze</w:t></w:r></w:p></w:tc><w:tc><w:p><w:r><w:t>Maintainers</w:t></w:r></w:p></w:tc></w:tr>
</w:tbl>
<w:p><w:pPr><w:pStyle w:val="Heading2"/></w:pPr><w:r><w:t>Rollback</w:t></w:r></w:p>
<w:p><w:r><w:t>Revert the tag and yank the crate.</w:t></w:r></w:p>
</w:body></w:document>"#
    );
    zip_with(&[("word/document.xml", &xml)])
}

fn xlsx_fixture() -> Vec<u8> {
    let shared = r#"<?xml version="1.0" encoding="UTF-8"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="3" uniqueCount="3">
<si><t>Region</t></si><si><t>Revenue</t></si><si><t>North</t></si>
</sst>"#;
    let sheet = r#"<?xml version="1.0" encoding="UTF-8"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>
<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
<row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>1250</v></c></row>
<row r="3"><c r="A3" t="inlineStr"><is><t>South</t></is></c><c r="B3" t="b"><v>1</v></c></row>
</sheetData></worksheet>"#;
    zip_with(&[
        ("xl/sharedStrings.xml", shared),
        ("xl/worksheets/sheet1.xml", sheet),
    ])
}

#[test]
fn pdf_text_is_extracted() {
    let bytes = pdf_with_pages(&["Quarterly revenue grew", "Headcount stayed flat"]);
    let out = extract(&bytes, SourceType::Pdf).unwrap();
    let words: Vec<&str> = out.text.split_whitespace().collect();
    for word in ["Quarterly", "revenue", "Headcount", "flat"] {
        assert!(words.contains(&word), "{word} missing from {:?}", out.text);
    }
}

#[test]
fn docx_headings_and_tables_become_hints() {
    let out = extract(&docx_fixture(), SourceType::Docx).unwrap();
    assert!(out.text.starts_with("Release Process"));
    assert!(out.text.contains("Tag the release and publish the changelog."));
    assert!(out.text.contains("Step\tOwner\nFreeze\tMaintainers"));

    let headings: Vec<(u8, &str)> = out
        .hints
        .headings
        .iter()
        .map(|h| (h.level, h.title.as_str()))
        .collect();
    assert_eq!(headings, vec![(1, "Release Process"), (2, "Rollback")]);
    assert_eq!(out.hints.tables.len(), 1);
    let span = out.hints.tables[0];
    assert!(out.text[span.start..span.end].starts_with("Step\tOwner"));

    let revert = out.text.find("Revert").unwrap();
    assert_eq!(out.hints.section_at(revert), Some("Rollback"));
}

#[test]
fn xlsx_sheets_become_tables() {
    let out = extract(&xlsx_fixture(), SourceType::Xlsx).unwrap();
    assert!(out.text.starts_with("Sheet 1"));
    assert!(out
        .text
        .contains("Region\tRevenue\nNorth\t1250\nSouth\tTRUE"));
    assert_eq!(out.hints.headings.len(), 1);
    assert_eq!(out.hints.tables.len(), 1);
}

#[test]
fn containers_without_their_main_part_are_corrupt() {
    let not_word = zip_with(&[("readme.txt", "hello")]);
    assert!(matches!(
        extract(&not_word, SourceType::Docx),
        Err(EngineError::CorruptSource(_))
    ));
    assert!(matches!(
        extract(&not_word, SourceType::Xlsx),
        Err(EngineError::CorruptSource(_))
    ));
}

fn engine() -> KnowledgeEngine {
    let parts = EngineParts::in_memory(Arc::new(HashingEmbedder::new(64)));
    KnowledgeEngine::from_parts(parts, &Config::with_db_path("unused.sqlite"))
}

#[tokio::test]
async fn corrupt_documents_fail_alone() {
    let engine = engine();
    let kb = engine
        .create_knowledge_base(NewKnowledgeBase {
            name: "mixed".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let good = engine
        .add_document(
            &kb.id,
            "release.docx",
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            &docx_fixture(),
            None,
        )
        .await
        .unwrap();
    let bad = engine
        .add_document(&kb.id, "broken.pdf", "pdf", b"not a valid pdf", None)
        .await
        .unwrap();

    let report = engine
        .train_quiet(&kb.id, TrainingOptions::default())
        .await
        .unwrap();
    assert_eq!(report.ready, 1);
    assert_eq!(report.failed, 1);

    let status = engine.training_status(&kb.id).await.unwrap();
    let by_id = |id: &str| {
        status
            .documents
            .iter()
            .find(|d| d.document_id == id)
            .unwrap()
            .clone()
    };
    assert_eq!(by_id(&good.id).status, DocumentStatus::Ready);
    let failed = by_id(&bad.id);
    assert_eq!(failed.status, DocumentStatus::Failed);
    assert_eq!(failed.chunk_count, 0);
    assert!(failed.failure_reason.unwrap().contains("pdf"));

    let response = engine
        .query(
            &kb.id,
            "yank the crate",
            &QueryOptions {
                mode: Some(SearchMode::Keyword),
                rerank: Some(RerankStrategy::PassThrough),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let top = &response.results[0];
    assert_eq!(top.citation.document_name, "release.docx");
    assert!(top.text.contains("yank the crate"));
}
