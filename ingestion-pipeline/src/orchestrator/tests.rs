use std::collections::HashMap;

use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::{
        background_task::BackgroundTask,
        chunk::{Chunk, ChunkType, ImageInfo},
        index_entry::IndexEntry,
        knowledge::{EnableStatus, Knowledge, KnowledgeType, ManualStatus, ParseStatus},
        knowledge_base::KnowledgeBase,
        tag::KnowledgeTag,
        task_payloads::{DocumentProcessPayload, KnowledgeListDeletePayload, TaskPayload},
        tenant::Tenant,
    },
};

use super::{
    document::{file_name_from_content_disposition, IMAGE_WITHOUT_MULTIMODAL},
    passages_to_segments, FileUpload, ManualInput, UrlSource,
};
use crate::{
    pipeline::QUOTA_EXCEEDED_MESSAGE,
    test_support::{harness, text_segment, ReadCall, TestHarness, TENANT},
};

async fn document_tasks(h: &TestHarness) -> Vec<DocumentProcessPayload> {
    BackgroundTask::list_unfinished(&h.db)
        .await
        .expect("tasks")
        .into_iter()
        .filter_map(|task| match task.payload {
            TaskPayload::DocumentProcess(payload) => Some(payload),
            _ => None,
        })
        .collect()
}

fn upload(name: &str, body: &str) -> FileUpload {
    FileUpload {
        file_name: name.to_string(),
        bytes: Bytes::from(body.to_string()),
        ..FileUpload::default()
    }
}

fn manual(title: &str, content: &str, status: &str) -> ManualInput {
    ManualInput {
        title: title.to_string(),
        content: content.to_string(),
        status: status.to_string(),
        ..ManualInput::default()
    }
}

#[tokio::test]
async fn file_upload_is_stored_and_scheduled() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let outcome = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("Guide.PDF", "pdf bytes"))
        .await
        .expect("create");
    assert!(!outcome.duplicate);

    let knowledge = outcome.knowledge;
    assert_eq!(knowledge.knowledge_type, KnowledgeType::File);
    assert_eq!(knowledge.parse_status, ParseStatus::Pending);
    assert_eq!(knowledge.file_type, "pdf");
    assert_eq!(knowledge.file_size, 9);
    assert!(!knowledge.file_path.is_empty());
    assert_eq!(
        h.engine.storage().get_file(&knowledge.file_path).await.expect("stored"),
        Bytes::from("pdf bytes")
    );

    let tasks = document_tasks(&h).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].knowledge_id, knowledge.id);
    assert_eq!(tasks[0].file_path, knowledge.file_path);
    assert_eq!(tasks[0].question_count, 3);
    assert!(!tasks[0].enable_multimodal);
}

#[tokio::test]
async fn identical_upload_returns_existing_record() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let first = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("a.txt", "same body"))
        .await
        .expect("first");
    let second = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("a.txt", "same body"))
        .await
        .expect("second");

    assert!(second.duplicate);
    assert_eq!(second.knowledge.id, first.knowledge.id);
    assert_eq!(document_tasks(&h).await.len(), 1);
}

#[tokio::test]
async fn image_upload_requires_bucket_and_vlm() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let err = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("scan.png", "png"))
        .await
        .expect_err("no bucket");
    assert!(matches!(err, AppError::BadRequest(ref msg) if msg.contains("对象存储")));

    let mut with_bucket = kb.clone();
    with_bucket.storage_config.bucket_name = "images".into();
    let with_bucket = with_bucket.save(&h.db).await.expect("save kb");
    let err = h
        .engine
        .create_knowledge_from_file(TENANT, &with_bucket.id, upload("scan.png", "png"))
        .await
        .expect_err("no vlm");
    assert!(matches!(err, AppError::BadRequest(ref msg) if msg.contains("VLM")));

    let mut complete = with_bucket;
    complete.vlm_config.enabled = true;
    complete.vlm_config.model_id = "vlm".into();
    let complete = complete.save(&h.db).await.expect("save kb");
    let outcome = h
        .engine
        .create_knowledge_from_file(TENANT, &complete.id, upload("scan.png", "png"))
        .await
        .expect("image accepted");
    assert_eq!(outcome.knowledge.file_type, "png");
    assert!(document_tasks(&h).await[0].enable_multimodal);
}

#[tokio::test]
async fn unsupported_file_type_is_rejected() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let err = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("tool.exe", "MZ"))
        .await
        .expect_err("exe");
    assert!(matches!(err, AppError::BadRequest(ref msg) if msg.contains("exe")));
    assert!(Knowledge::list_by_knowledge_base(&h.db, TENANT, &kb.id)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn exhausted_quota_blocks_new_sources() {
    let h = harness().await;
    h.tenant(100).await;
    Tenant::adjust_storage_used(&h.db, TENANT, 100).await.expect("use quota");
    let kb = h.document_kb().await;

    let err = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("a.md", "# hi"))
        .await
        .expect_err("quota");
    assert!(matches!(err, AppError::QuotaExceeded(ref msg) if msg == QUOTA_EXCEEDED_MESSAGE));
    assert!(document_tasks(&h).await.is_empty());
}

#[tokio::test]
async fn url_knowledge_rejects_internal_targets() {
    let h = harness().await;
    let kb = h.document_kb().await;

    for url in ["http://127.0.0.1/admin", "file:///etc/passwd", "http://localhost/"] {
        let err = h
            .engine
            .create_knowledge_from_url(
                TENANT,
                &kb.id,
                UrlSource {
                    url: url.to_string(),
                    ..UrlSource::default()
                },
            )
            .await
            .expect_err(url);
        assert!(matches!(err, AppError::Validation(_)), "{url}");
    }

    let outcome = h
        .engine
        .create_knowledge_from_url(
            TENANT,
            &kb.id,
            UrlSource {
                url: "https://example.com/blog/post".into(),
                ..UrlSource::default()
            },
        )
        .await
        .expect("public url");
    assert_eq!(outcome.knowledge.knowledge_type, KnowledgeType::Url);
    assert_eq!(outcome.knowledge.title, "https://example.com/blog/post");
    assert_eq!(document_tasks(&h).await[0].url, "https://example.com/blog/post");
}

#[tokio::test]
async fn document_urls_are_downloaded_as_files() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let outcome = h
        .engine
        .create_knowledge_from_url(
            TENANT,
            &kb.id,
            UrlSource {
                url: "https://example.com/files/handbook.pdf".into(),
                ..UrlSource::default()
            },
        )
        .await
        .expect("file url");
    let knowledge = outcome.knowledge;
    assert_eq!(knowledge.knowledge_type, KnowledgeType::FileUrl);
    assert_eq!(knowledge.file_name, "handbook.pdf");
    assert_eq!(knowledge.file_type, "pdf");

    let tasks = document_tasks(&h).await;
    assert_eq!(tasks[0].file_url, "https://example.com/files/handbook.pdf");
    assert!(tasks[0].url.is_empty());

    let err = h
        .engine
        .create_knowledge_from_url(
            TENANT,
            &kb.id,
            UrlSource {
                url: "https://example.com/download?id=1".into(),
                file_type: "xlsx".into(),
                ..UrlSource::default()
            },
        )
        .await
        .expect_err("xlsx over file url");
    assert!(matches!(err, AppError::BadRequest(ref msg) if msg.contains("xlsx")));
}

#[tokio::test]
async fn passage_with_script_is_rejected() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let err = h
        .engine
        .create_knowledge_from_passage(
            TENANT,
            &kb.id,
            vec!["fine".into(), "<script>alert(1)</script>".into()],
        )
        .await
        .expect_err("script");
    assert!(matches!(err, AppError::Validation(ref msg) if msg.contains('2')));
}

#[tokio::test]
async fn sync_passages_are_processed_before_returning() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let outcome = h
        .engine
        .create_knowledge_from_passage_sync(
            TENANT,
            &kb.id,
            vec!["first passage".into(), String::new(), "second passage".into()],
        )
        .await
        .expect("sync");
    let knowledge = outcome.knowledge;
    assert_eq!(knowledge.knowledge_type, KnowledgeType::Passage);
    assert_eq!(knowledge.parse_status, ParseStatus::Completed);
    assert_eq!(knowledge.enable_status, EnableStatus::Enabled);

    let chunks = Chunk::list_by_knowledge(&h.db, &knowledge.id).await.expect("chunks");
    assert_eq!(chunks.len(), 2);
    assert!(h.reader.calls.lock().await.is_empty());
}

#[test]
fn passage_offsets_accumulate() {
    let segments = passages_to_segments(&["ab".into(), String::new(), "cde".into()]);
    let spans: Vec<(i64, i64, i64)> = segments.iter().map(|s| (s.seq, s.start, s.end)).collect();
    assert_eq!(spans, vec![(0, 0, 2), (2, 2, 5)]);
}

#[tokio::test]
async fn manual_draft_is_stored_without_processing() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let outcome = h
        .engine
        .create_knowledge_from_manual(TENANT, &kb.id, manual("Notes", "# Notes\nbody", ""))
        .await
        .expect("draft");
    let knowledge = outcome.knowledge;
    assert_eq!(knowledge.parse_status, ParseStatus::Draft);
    assert_eq!(knowledge.file_name, "Notes.md");
    let meta = knowledge.manual().expect("manual metadata");
    assert_eq!(meta.version, 1);
    assert_eq!(meta.status, ManualStatus::Draft);
    assert!(document_tasks(&h).await.is_empty());

    let err = h
        .engine
        .create_knowledge_from_manual(TENANT, &kb.id, manual("x", "<script>x</script>", "publish"))
        .await
        .expect_err("empty after cleaning");
    assert!(matches!(err, AppError::Validation(_)));

    let err = h
        .engine
        .create_knowledge_from_manual(TENANT, &kb.id, manual("x", "body", "archived"))
        .await
        .expect_err("bad status");
    assert!(matches!(err, AppError::Validation(ref msg) if msg.contains("draft")));
}

#[tokio::test]
async fn published_manual_is_processed_as_markdown() {
    let h = harness().await;
    let kb = h.document_kb().await;

    let knowledge = h
        .engine
        .create_knowledge_from_manual(TENANT, &kb.id, manual("", "# Heading\ntext", "publish"))
        .await
        .expect("publish")
        .knowledge;
    assert!(knowledge.title.starts_with("Knowledge-"));
    assert_eq!(knowledge.parse_status, ParseStatus::Pending);

    let tasks = document_tasks(&h).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].file_type, "md");
    assert!(!tasks[0].enable_question_generation);

    h.engine.process_document(&tasks[0], false).await.expect("process");
    let calls = h.reader.calls.lock().await.clone();
    assert_eq!(
        calls,
        vec![ReadCall::File {
            file_name: format!("{}.md", knowledge.title),
            size: "# Heading\ntext".len(),
        }]
    );
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Completed);
}

#[tokio::test]
async fn manual_update_bumps_version_and_drops_old_index() {
    let h = harness().await;
    h.tenant(0).await;
    let kb = h.document_kb().await;

    let knowledge = h
        .engine
        .create_knowledge_from_manual(TENANT, &kb.id, manual("Doc", "v1 body", "publish"))
        .await
        .expect("publish")
        .knowledge;
    let task = document_tasks(&h).await.remove(0);
    h.engine.process_document(&task, false).await.expect("process");
    let charged = h.knowledge(&knowledge.id).await.storage_size;
    assert!(charged > 0);

    let updated = h
        .engine
        .update_manual_knowledge(TENANT, &knowledge.id, manual("", "v2 body", "draft"))
        .await
        .expect("update");
    assert_eq!(updated.title, "Doc");
    assert_eq!(updated.parse_status, ParseStatus::Draft);
    assert_eq!(updated.enable_status, EnableStatus::Disabled);
    assert_eq!(updated.storage_size, 0);
    let meta = updated.manual().expect("manual");
    assert_eq!(meta.version, 2);
    assert_eq!(meta.content, "v2 body");

    assert!(Chunk::list_by_knowledge(&h.db, &knowledge.id).await.expect("chunks").is_empty());
    assert!(IndexEntry::list_by_knowledge(&h.db, &knowledge.id)
        .await
        .expect("entries")
        .is_empty());
    assert_eq!(Tenant::get(&h.db, TENANT).await.expect("tenant").storage_used, 0);

    let file = h.file_knowledge(&kb, "a.pdf").await;
    let err = h
        .engine
        .update_manual_knowledge(TENANT, &file.id, manual("x", "y", "draft"))
        .await
        .expect_err("not manual");
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn reparse_resets_and_reschedules() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("doc.txt", "hello"))
        .await
        .expect("create")
        .knowledge;
    let task = document_tasks(&h).await.remove(0);
    h.engine.process_document(&task, false).await.expect("process");

    let reparsed = h
        .engine
        .reparse_knowledge(TENANT, &knowledge.id)
        .await
        .expect("reparse");
    assert_eq!(reparsed.parse_status, ParseStatus::Pending);
    assert_eq!(reparsed.enable_status, EnableStatus::Disabled);
    assert!(reparsed.processed_at.is_none());
    assert!(Chunk::list_by_knowledge(&h.db, &knowledge.id).await.expect("chunks").is_empty());

    let passage = h
        .engine
        .create_knowledge_from_passage(TENANT, &kb.id, vec!["text".into()])
        .await
        .expect("passage")
        .knowledge;
    let err = h
        .engine
        .reparse_knowledge(TENANT, &passage.id)
        .await
        .expect_err("passage reparse");
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn delete_removes_derived_data_and_refunds_storage() {
    let h = harness().await;
    h.tenant(0).await;
    let kb = h.document_kb().await;
    let knowledge = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("doc.md", "# title\nbody"))
        .await
        .expect("create")
        .knowledge;
    let task = document_tasks(&h).await.remove(0);
    h.engine.process_document(&task, false).await.expect("process");
    assert!(Tenant::get(&h.db, TENANT).await.expect("tenant").storage_used > 0);

    h.engine
        .delete_knowledge(TENANT, &knowledge.id)
        .await
        .expect("delete");

    assert!(Knowledge::get(&h.db, &knowledge.id).await.expect("get").is_none());
    assert!(Chunk::list_by_knowledge(&h.db, &knowledge.id).await.expect("chunks").is_empty());
    assert!(IndexEntry::list_by_knowledge(&h.db, &knowledge.id)
        .await
        .expect("entries")
        .is_empty());
    assert!(h.engine.storage().get_file(&knowledge.file_path).await.is_err());
    assert_eq!(Tenant::get(&h.db, TENANT).await.expect("tenant").storage_used, 0);
    assert!(document_tasks(&h).await.is_empty(), "queued processing is cancelled");
    let graph = h.graph.deleted.lock().await;
    assert!(graph.iter().any(|ns| ns.knowledge_id == knowledge.id));
    assert!(h
        .retrieval
        .calls
        .lock()
        .await
        .contains(&format!("delete_knowledge:{}", knowledge.id)));
}

#[tokio::test]
async fn list_delete_runs_through_the_queue_payload() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let first = h.file_knowledge(&kb, "a.pdf").await;
    let second = h.file_knowledge(&kb, "b.pdf").await;

    let other_kb = KnowledgeBase::new(TENANT + 1, "other", "hashed")
        .save(&h.db)
        .await
        .expect("kb");
    let foreign = Knowledge::new(TENANT + 1, &other_kb.id, KnowledgeType::File, "c", "hashed")
        .create(&h.db)
        .await
        .expect("foreign");

    let task = h
        .engine
        .enqueue_knowledge_list_delete(
            TENANT,
            vec![first.id.clone(), second.id.clone(), foreign.id.clone()],
        )
        .await
        .expect("enqueue");
    let TaskPayload::KnowledgeListDelete(payload) = task.payload else {
        panic!("expected list delete payload");
    };
    h.engine
        .process_knowledge_list_delete(&payload)
        .await
        .expect("delete list");

    assert!(Knowledge::get(&h.db, &first.id).await.expect("get").is_none());
    assert!(Knowledge::get(&h.db, &second.id).await.expect("get").is_none());
    assert!(Knowledge::get(&h.db, &foreign.id).await.expect("get").is_some());

    h.engine
        .process_knowledge_list_delete(&KnowledgeListDeletePayload {
            tenant_id: TENANT,
            knowledge_ids: Vec::new(),
        })
        .await
        .expect("empty list is a no-op");
}

#[tokio::test]
async fn document_handler_reads_urls_through_the_reader() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h
        .engine
        .create_knowledge_from_url(
            TENANT,
            &kb.id,
            UrlSource {
                url: "https://example.com/page".into(),
                title: "Example".into(),
                ..UrlSource::default()
            },
        )
        .await
        .expect("url")
        .knowledge;
    let task = document_tasks(&h).await.remove(0);

    h.engine.process_document(&task, false).await.expect("process");
    assert_eq!(
        h.reader.calls.lock().await.clone(),
        vec![ReadCall::Url {
            url: "https://example.com/page".into()
        }]
    );
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Completed);
}

#[tokio::test]
async fn read_failures_only_fail_the_knowledge_on_the_last_attempt() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h
        .engine
        .create_knowledge_from_file(TENANT, &kb.id, upload("doc.txt", "hello"))
        .await
        .expect("create")
        .knowledge;
    let task = document_tasks(&h).await.remove(0);
    h.reader.set_segments(Err("parser crashed")).await;

    let err = h
        .engine
        .process_document(&task, false)
        .await
        .expect_err("retryable");
    assert!(!err.is_permanent());
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Processing);

    h.engine
        .process_document(&task, true)
        .await
        .expect_err("last attempt");
    let stored = h.knowledge(&knowledge.id).await;
    assert_eq!(stored.parse_status, ParseStatus::Failed);
    assert!(stored.error_message.contains("parser crashed"));

    h.reader.set_segments(Ok(vec![text_segment(0, "recovered")])).await;
    h.engine.process_document(&task, false).await.expect("retry after failure");
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Completed);
}

#[tokio::test]
async fn image_without_multimodal_fails_permanently() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h.file_knowledge(&kb, "scan.png").await;
    let payload = DocumentProcessPayload {
        tenant_id: TENANT,
        knowledge_id: knowledge.id.clone(),
        knowledge_base_id: kb.id.clone(),
        file_path: "tenant/scan.png".into(),
        file_name: "scan.png".into(),
        file_type: "png".into(),
        ..DocumentProcessPayload::default()
    };

    let err = h
        .engine
        .process_document(&payload, false)
        .await
        .expect_err("image");
    assert!(err.is_permanent());
    let stored = h.knowledge(&knowledge.id).await;
    assert_eq!(stored.parse_status, ParseStatus::Failed);
    assert_eq!(stored.error_message, IMAGE_WITHOUT_MULTIMODAL);
    assert!(h.reader.calls.lock().await.is_empty());
}

#[tokio::test]
async fn file_url_is_rechecked_before_download() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h.file_knowledge(&kb, "internal.pdf").await;
    let payload = DocumentProcessPayload {
        tenant_id: TENANT,
        knowledge_id: knowledge.id.clone(),
        knowledge_base_id: kb.id.clone(),
        file_url: "http://169.254.169.254/latest/meta-data.pdf".into(),
        ..DocumentProcessPayload::default()
    };

    let err = h
        .engine
        .process_document(&payload, false)
        .await
        .expect_err("ssrf");
    assert!(err.is_permanent());
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Failed);
}

#[tokio::test]
async fn stale_tasks_are_ignored() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h.file_knowledge(&kb, "doc.pdf").await;
    let payload = DocumentProcessPayload {
        tenant_id: TENANT,
        knowledge_id: knowledge.id.clone(),
        knowledge_base_id: kb.id.clone(),
        passages: vec!["text".into()],
        ..DocumentProcessPayload::default()
    };

    let missing = DocumentProcessPayload {
        knowledge_id: "gone".into(),
        ..payload.clone()
    };
    h.engine.process_document(&missing, false).await.expect("missing");

    let foreign = DocumentProcessPayload {
        tenant_id: TENANT + 1,
        ..payload.clone()
    };
    h.engine.process_document(&foreign, false).await.expect("foreign");
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Pending);

    Knowledge::mark_deleting(&h.db, std::slice::from_ref(&knowledge.id))
        .await
        .expect("mark");
    h.engine.process_document(&payload, false).await.expect("deleting");
    assert_eq!(h.knowledge(&knowledge.id).await.parse_status, ParseStatus::Deleting);
    assert!(Chunk::list_by_knowledge(&h.db, &knowledge.id).await.expect("chunks").is_empty());
}

#[test]
fn content_disposition_names() {
    assert_eq!(
        file_name_from_content_disposition(r#"attachment; filename="report.pdf""#).as_deref(),
        Some("report.pdf")
    );
    assert_eq!(
        file_name_from_content_disposition(
            "attachment; filename=fallback.pdf; filename*=UTF-8''%E6%8A%A5%E5%91%8A.pdf"
        )
        .as_deref(),
        Some("报告.pdf")
    );
    assert_eq!(file_name_from_content_disposition("inline"), None);
}

#[tokio::test]
async fn knowledge_tags_must_belong_to_the_same_base() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let other = h.document_kb().await;
    let tag = KnowledgeTag::new(TENANT, &kb.id, "ops")
        .create(&h.db)
        .await
        .expect("tag");
    let foreign = KnowledgeTag::new(TENANT, &other.id, "ops")
        .create(&h.db)
        .await
        .expect("foreign tag");
    let first = h.file_knowledge(&kb, "a.txt").await;
    let second = h.file_knowledge(&kb, "b.txt").await;
    let untouched = h.file_knowledge(&kb, "c.txt").await;

    let updated = h
        .engine
        .update_knowledge_tag(TENANT, &first.id, Some(&tag.id))
        .await
        .expect("tag");
    assert_eq!(updated.tag_id, tag.id);
    let err = h
        .engine
        .update_knowledge_tag(TENANT, &first.id, Some(&foreign.id))
        .await
        .expect_err("foreign");
    assert!(matches!(err, AppError::BadRequest(ref m) if m == "标签不属于当前知识库"));

    h.engine
        .update_knowledge_tag_batch(
            TENANT,
            &HashMap::from([(first.id.clone(), None), (second.id.clone(), Some(tag.id.clone()))]),
        )
        .await
        .expect("batch");
    assert!(h.knowledge(&first.id).await.tag_id.is_empty());
    assert_eq!(h.knowledge(&second.id).await.tag_id, tag.id);

    let err = h
        .engine
        .update_knowledge_tag_batch(
            TENANT,
            &HashMap::from([
                (untouched.id.clone(), Some(tag.id.clone())),
                (first.id.clone(), Some("missing".to_string())),
            ]),
        )
        .await
        .expect_err("unknown tag");
    assert!(matches!(err, AppError::BadRequest(_)));
    assert!(
        h.knowledge(&untouched.id).await.tag_id.is_empty(),
        "batch is validated before writing"
    );
}

#[tokio::test]
async fn image_info_updates_rewrite_and_create_sub_chunks() {
    let h = harness().await;
    let kb = h.document_kb().await;
    let knowledge = h.file_knowledge(&kb, "scan.pdf").await;
    let old_image = ImageInfo {
        url: "https://cdn/img.png".into(),
        original_url: "img.png".into(),
        caption: "a bike".into(),
        ..ImageInfo::default()
    };
    let mut text = Chunk::new(TENANT, &knowledge.id, &kb.id, ChunkType::Text, "see figure");
    text.image_info = vec![old_image.clone()];
    let mut caption = Chunk::new(TENANT, &knowledge.id, &kb.id, ChunkType::ImageCaption, "a bike");
    caption.parent_chunk_id = text.id.clone();
    caption.image_info = vec![old_image];
    let (text_id, caption_id) = (text.id.clone(), caption.id.clone());
    Chunk::create_batch(&h.db, vec![text, caption])
        .await
        .expect("chunks");

    let err = h
        .engine
        .update_image_info(TENANT, &knowledge.id, "missing", ImageInfo::default())
        .await
        .expect_err("unknown chunk");
    assert!(matches!(err, AppError::NotFound(_)));

    let image = ImageInfo {
        url: "https://cdn/img.png".into(),
        original_url: "img.png".into(),
        caption: "a red bicycle".into(),
        ocr_text: "SALE 50".into(),
        ..ImageInfo::default()
    };
    h.engine
        .update_image_info(TENANT, &knowledge.id, &text_id, image.clone())
        .await
        .expect("update");

    let text: Chunk = h.db.get_item(&text_id).await.expect("db").expect("text");
    assert_eq!(text.image_info, vec![image]);
    let children = Chunk::list_by_parent(&h.db, TENANT, &text_id)
        .await
        .expect("children");
    assert_eq!(children.len(), 2);
    let content_of = |kind: ChunkType| {
        children
            .iter()
            .find(|c| c.chunk_type == kind)
            .map(|c| c.content.clone())
    };
    assert_eq!(content_of(ChunkType::ImageCaption).as_deref(), Some("a red bicycle"));
    assert_eq!(content_of(ChunkType::ImageOcr).as_deref(), Some("SALE 50"));

    let calls = h.retrieval.calls.lock().await.clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], format!("index:{caption_id}"));
    assert_ne!(h.knowledge(&knowledge.id).await.file_hash, knowledge.file_hash);
}
