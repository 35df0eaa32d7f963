//! End-to-end ingest and query tests through the library API.
//!
//! Uses the offline hashing embedder and a generation stub that echoes the
//! prompt back, so no network access is needed.

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use session_rag::config::Config;
use session_rag::embedding::{EmbeddingProvider, HashingProvider};
use session_rag::error::{EmbedError, GenerationError, IngestError, QueryError, RetrievalError};
use session_rag::generation::{GenerationProvider, GenerationRequest, ModelId};
use session_rag::models::{SessionId, SessionState};
use session_rag::orchestrator::QueryOrchestrator;
use session_rag::retrieve::Retriever;
use session_rag::store::VectorCollection;

/// Returns the user prompt verbatim.
struct EchoProvider;

#[async_trait]
impl GenerationProvider for EchoProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        Ok(request.user_prompt.clone())
    }
}

/// Always fails with the given error.
struct FailingProvider(GenerationError);

#[async_trait]
impl GenerationProvider for FailingProvider {
    async fn generate(&self, _request: &GenerationRequest) -> Result<String, GenerationError> {
        Err(self.0.clone())
    }
}

/// Echoes the prompt after a delay, signalling when generation starts.
struct SlowEcho {
    delay: Duration,
    started: Arc<Notify>,
}

#[async_trait]
impl GenerationProvider for SlowEcho {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        Ok(request.user_prompt.clone())
    }
}

/// Hashing embedder that stalls every batch, signalling when it starts.
struct SlowEmbedder {
    inner: HashingProvider,
    delay: Duration,
    started: Arc<Notify>,
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.embed(texts).await
    }
}

fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage.root = root.join("sessions");
    config.storage.cleanup_backoff_ms = 1;
    config.generation.max_retries = 0;
    config
}

fn orchestrator(root: &Path, dims: usize) -> QueryOrchestrator {
    QueryOrchestrator::new(
        test_config(root),
        Arc::new(HashingProvider::new(dims)),
        Arc::new(EchoProvider),
    )
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn three_paragraphs() -> String {
    let sentence = "Widgets are assembled from brass gears and tiny springs. ";
    let para = sentence.repeat(9);
    format!("{}\n\n{}\n\n{}", para.trim_end(), para.trim_end(), para.trim_end())
}

fn docx(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
        body
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

async fn collection_ids(orch: &QueryOrchestrator, id: &SessionId) -> Vec<String> {
    let ctx = orch.sessions().open_existing(id).unwrap();
    let col = VectorCollection::open_existing(&ctx.collection_path())
        .await
        .unwrap()
        .unwrap();
    let ids = col
        .all_vectors()
        .await
        .unwrap()
        .into_iter()
        .map(|v| v.chunk_id)
        .collect();
    col.close().await;
    ids
}

#[tokio::test]
async fn three_paragraph_file_yields_four_chunks() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let file = write(&tmp.path().join("in"), "widgets.txt", &three_paragraphs());

    let session = orch.create_session().unwrap();
    let summary = orch.ingest(&session.id, &[file]).await.unwrap();

    assert_eq!(summary.documents, 1);
    assert_eq!(summary.chunks, 4);
    assert_eq!(summary.new_chunks, 4);
    assert_eq!(summary.collection_size, 4);
    assert!(summary.warnings.is_empty());
    assert_eq!(orch.session_state(&session.id).unwrap(), SessionState::Ready);
}

#[tokio::test]
async fn echoed_prompt_contains_chunk_and_query() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 128);
    let chunk_text = "Xylo is a widget used for sorting coloured beads.";
    let file = write(&tmp.path().join("in"), "xylo.txt", chunk_text);

    let session = orch.create_session().unwrap();
    orch.ingest(&session.id, &[file]).await.unwrap();

    let answer = orch
        .query(&session.id, "What is Xylo?", None)
        .await
        .unwrap();
    assert!(answer.answer.contains(chunk_text));
    assert_eq!(answer.answer.matches("What is Xylo?").count(), 1);
    assert_eq!(answer.model, ModelId::default().as_str());
    assert_eq!(answer.context_chunk_ids.len(), 1);
}

#[tokio::test]
async fn sources_are_top_k_by_descending_score() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 1024);
    let inbox = tmp.path().join("in");
    let files = vec![
        write(&inbox, "1.txt", "Gears are made of brass."),
        write(&inbox, "2.txt", "Springs are made of steel wire."),
        write(&inbox, "3.txt", "The brass gears drive the clock hands."),
        write(&inbox, "4.txt", "Quarterly revenue grew in Europe."),
        write(&inbox, "5.txt", "Our office cat enjoys long naps."),
    ];

    let session = orch.create_session().unwrap();
    let summary = orch.ingest(&session.id, &files).await.unwrap();
    assert_eq!(summary.collection_size, 5);

    let out = orch
        .query_with_sources(&session.id, "What are the gears made of?", None, Some(3))
        .await
        .unwrap();
    assert_eq!(out.sources.len(), 3);
    for pair in out.sources.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    assert_eq!(out.top_similarity_score, out.sources[0].score);
    assert!(out.sources[0].snippet.contains("brass"));
}

#[tokio::test]
async fn reset_returns_session_to_empty() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let file = write(&tmp.path().join("in"), "a.txt", "Some searchable content.");

    let session = orch.create_session().unwrap();
    orch.ingest(&session.id, &[file]).await.unwrap();
    assert_eq!(orch.session_state(&session.id).unwrap(), SessionState::Ready);

    let status = orch.reset(&session.id).await.unwrap();
    assert_eq!(status.state, SessionState::Empty);

    let err = orch
        .query(&session.id, "anything?", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Retrieval(RetrievalError::SessionNotReady {
            state: SessionState::Empty
        })
    ));
    let files_dir = orch.sessions().paths_for(&session.id).files_dir;
    assert_eq!(std::fs::read_dir(files_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn query_before_ingest_is_not_ready() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let session = orch.create_session().unwrap();

    let err = orch.query(&session.id, "hello?", None).await.unwrap_err();
    assert!(err.is_not_ready());
}

#[tokio::test]
async fn empty_query_rejected() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let session = orch.create_session().unwrap();

    let err = orch.query(&session.id, "   ", None).await.unwrap_err();
    assert!(matches!(err, QueryError::EmptyQuery));
}

#[tokio::test]
async fn reingest_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let inbox = tmp.path().join("in");
    let files = vec![
        write(&inbox, "widgets.txt", &three_paragraphs()),
        write(&inbox, "notes.md", "# Notes\n\nShort markdown notes."),
    ];

    let session = orch.create_session().unwrap();
    let first = orch.ingest(&session.id, &files).await.unwrap();
    let ids_first = collection_ids(&orch, &session.id).await;

    let second = orch.ingest(&session.id, &files).await.unwrap();
    let ids_second = collection_ids(&orch, &session.id).await;

    assert_eq!(first.collection_size, second.collection_size);
    assert_eq!(second.new_chunks, 0);
    assert_eq!(ids_first, ids_second);
}

#[tokio::test]
async fn sessions_are_isolated() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 128);
    let a_file = write(&tmp.path().join("a"), "a.txt", "Apples grow on trees in orchards.");
    let b_file = write(&tmp.path().join("b"), "b.txt", "Apples are sold at the market stall.");

    let a = orch.create_session().unwrap();
    let b = orch.create_session().unwrap();
    orch.ingest(&a.id, &[a_file]).await.unwrap();
    orch.ingest(&b.id, &[b_file]).await.unwrap();

    let b_ids = collection_ids(&orch, &b.id).await;
    let out = orch
        .query_with_sources(&a.id, "Where do apples come from?", None, Some(10))
        .await
        .unwrap();
    assert!(!out.sources.is_empty());
    for s in &out.sources {
        assert!(!b_ids.contains(&s.chunk_id));
    }
}

#[tokio::test]
async fn ranking_is_prefix_stable() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let inbox = tmp.path().join("in");
    let files: Vec<PathBuf> = (0..8)
        .map(|i| {
            write(
                &inbox,
                &format!("{}.txt", i),
                &format!("Document {} mentions widgets {} times.", i, i),
            )
        })
        .collect();

    let session = orch.create_session().unwrap();
    orch.ingest(&session.id, &files).await.unwrap();

    let ctx = orch.sessions().open_existing(&session.id).unwrap();
    let retriever = Retriever::new(Arc::new(HashingProvider::new(64)));
    let short = retriever.search(&ctx, "widgets", 3).await.unwrap();
    let long = retriever.search(&ctx, "widgets", 6).await.unwrap();
    assert_eq!(short.len(), 3);
    assert_eq!(&long[..3], &short[..]);

    let all = retriever.search(&ctx, "widgets", 100).await.unwrap();
    assert_eq!(all.len(), 8);
}

#[tokio::test]
async fn unsupported_files_are_warnings() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let inbox = tmp.path().join("in");
    let good = write(&inbox, "good.txt", "Readable content.");
    let bad = write(&inbox, "sheet.xlsx", "not really a spreadsheet");

    let session = orch.create_session().unwrap();
    let summary = orch.ingest(&session.id, &[good, bad]).await.unwrap();
    assert_eq!(summary.documents, 1);
    assert_eq!(summary.warnings.len(), 1);
    assert!(matches!(
        summary.warnings[0],
        IngestError::UnsupportedFormat { .. }
    ));
}

#[tokio::test]
async fn all_unsupported_fails_and_marks_error() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let bad = write(&tmp.path().join("in"), "data.csv", "a,b,c");

    let session = orch.create_session().unwrap();
    let err = orch.ingest(&session.id, &[bad]).await.unwrap_err();
    assert!(matches!(err, IngestError::NoUsableDocuments));

    let status = orch.session_status(&session.id).unwrap();
    assert_eq!(status.state, SessionState::Error);
    assert!(status.last_error.is_some());
}

#[tokio::test]
async fn error_session_recovers_on_successful_ingest() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let inbox = tmp.path().join("in");
    let session = orch.create_session().unwrap();

    let bad = write(&inbox, "data.csv", "a,b,c");
    assert!(orch.ingest(&session.id, &[bad]).await.is_err());
    assert_eq!(orch.session_state(&session.id).unwrap(), SessionState::Error);

    let good = write(&inbox, "good.txt", "Now with real text.");
    orch.ingest(&session.id, &[good]).await.unwrap();
    let status = orch.session_status(&session.id).unwrap();
    assert_eq!(status.state, SessionState::Ready);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn docx_documents_are_ingested() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 128);
    let inbox = tmp.path().join("in");
    std::fs::create_dir_all(&inbox).unwrap();
    let path = inbox.join("report.docx");
    std::fs::write(
        &path,
        docx(&["The committee approved the budget.", "Meetings resume in spring."]),
    )
    .unwrap();

    let session = orch.create_session().unwrap();
    let summary = orch.ingest(&session.id, &[path]).await.unwrap();
    assert_eq!(summary.documents, 1);

    let answer = orch
        .query(&session.id, "What did the committee approve?", None)
        .await
        .unwrap();
    assert!(answer
        .answer
        .contains("The committee approved the budget.\n\nMeetings resume in spring."));
}

#[tokio::test]
async fn dimension_change_is_rejected_and_collection_kept() {
    let tmp = TempDir::new().unwrap();
    let inbox = tmp.path().join("in");
    let first = write(&inbox, "a.txt", "First document text.");
    let second = write(&inbox, "b.txt", "Second document text.");

    let orch64 = orchestrator(tmp.path(), 64);
    let session = orch64.create_session().unwrap();
    orch64.ingest(&session.id, &[first]).await.unwrap();
    let before = collection_ids(&orch64, &session.id).await;

    let orch32 = orchestrator(tmp.path(), 32);
    let err = orch32.ingest(&session.id, &[second]).await.unwrap_err();
    assert!(matches!(
        err,
        IngestError::Embedding(EmbedError::DimensionMismatch {
            expected: 64,
            actual: 32
        })
    ));
    assert_eq!(collection_ids(&orch32, &session.id).await, before);
    assert_eq!(orch32.session_state(&session.id).unwrap(), SessionState::Error);
}

#[tokio::test]
async fn concurrent_ingests_leave_one_consistent_collection() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let inbox = tmp.path().join("in");
    let file = write(&inbox, "widgets.txt", &three_paragraphs());

    let session = orch.create_session().unwrap();
    let paths = vec![file];
    let (first, second) = tokio::join!(
        orch.ingest(&session.id, &paths),
        orch.ingest(&session.id, &paths)
    );

    if let Err(e) = &first {
        assert!(matches!(e, IngestError::Cancelled), "unexpected error: {}", e);
    }
    let second = second.unwrap();
    assert_eq!(second.collection_size, 4);
    assert_eq!(orch.session_state(&session.id).unwrap(), SessionState::Ready);
    assert_eq!(collection_ids(&orch, &session.id).await.len(), 4);
}

#[tokio::test]
async fn generation_failure_is_an_error_not_an_answer() {
    let tmp = TempDir::new().unwrap();
    let orch = QueryOrchestrator::new(
        test_config(tmp.path()),
        Arc::new(HashingProvider::new(64)),
        Arc::new(FailingProvider(GenerationError::AuthFailure(
            "invalid key".to_string(),
        ))),
    );
    let file = write(&tmp.path().join("in"), "a.txt", "Some content.");
    let session = orch.create_session().unwrap();
    orch.ingest(&session.id, &[file]).await.unwrap();

    let err = orch.query(&session.id, "what?", None).await.unwrap_err();
    assert!(matches!(
        err,
        QueryError::Generation(GenerationError::AuthFailure(_))
    ));
}

#[tokio::test]
async fn interrupted_indexing_reloads_as_error() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let session = orch.create_session().unwrap();
    orch.sessions()
        .set_state(&session.id, SessionState::Indexing, None)
        .unwrap();

    let fresh = orchestrator(tmp.path(), 64);
    let status = fresh.session_status(&session.id).unwrap();
    assert_eq!(status.state, SessionState::Error);

    let err = fresh.query(&session.id, "anything?", None).await.unwrap_err();
    assert!(err.is_not_ready());
}

#[tokio::test]
async fn destroy_then_query_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 64);
    let session = orch.create_session().unwrap();
    orch.destroy(&session.id).await.unwrap();

    let err = orch.query(&session.id, "anything?", None).await.unwrap_err();
    assert!(matches!(err, QueryError::Session(_)));
}

#[tokio::test]
async fn reset_waits_for_in_flight_query() {
    let tmp = TempDir::new().unwrap();
    let started = Arc::new(Notify::new());
    let orch = Arc::new(QueryOrchestrator::new(
        test_config(tmp.path()),
        Arc::new(HashingProvider::new(64)),
        Arc::new(SlowEcho {
            delay: Duration::from_millis(500),
            started: started.clone(),
        }),
    ));
    let file = write(&tmp.path().join("in"), "gears.txt", "Gears are made of brass.");
    let session = orch.create_session().unwrap();
    orch.ingest(&session.id, &[file]).await.unwrap();

    let query = {
        let orch = orch.clone();
        let id = session.id;
        tokio::spawn(async move { orch.query(&id, "What are gears made of?", None).await })
    };
    started.notified().await;

    let status = orch.reset(&session.id).await.unwrap();
    assert!(query.is_finished(), "reset completed while the query was generating");
    assert_eq!(status.state, SessionState::Empty);

    // The answer was built from the documents that existed when it started.
    let answer = query.await.unwrap().unwrap();
    assert!(answer.answer.contains("Gears are made of brass."));
    assert!(orch.query(&session.id, "gears?", None).await.unwrap_err().is_not_ready());
}

fn slow_ingest_orchestrator(root: &Path, started: Arc<Notify>) -> Arc<QueryOrchestrator> {
    Arc::new(QueryOrchestrator::new(
        test_config(root),
        Arc::new(SlowEmbedder {
            inner: HashingProvider::new(64),
            delay: Duration::from_secs(30),
            started,
        }),
        Arc::new(EchoProvider),
    ))
}

#[tokio::test]
async fn reset_cancels_in_flight_ingest() {
    let tmp = TempDir::new().unwrap();
    let started = Arc::new(Notify::new());
    let orch = slow_ingest_orchestrator(tmp.path(), started.clone());
    let file = write(&tmp.path().join("in"), "widgets.txt", &three_paragraphs());
    let session = orch.create_session().unwrap();

    let ingest = {
        let orch = orch.clone();
        let id = session.id;
        tokio::spawn(async move { orch.ingest(&id, &[file]).await })
    };
    started.notified().await;

    let status = orch.reset(&session.id).await.unwrap();
    let err = ingest.await.unwrap().unwrap_err();
    assert!(matches!(err, IngestError::Cancelled), "unexpected error: {}", err);

    assert_eq!(status.state, SessionState::Empty);
    assert_eq!(orch.session_state(&session.id).unwrap(), SessionState::Empty);
    let paths = orch.sessions().paths_for(&session.id);
    assert!(!paths.index_dir.join(format!("{}.sqlite", session.id)).exists());
    assert_eq!(std::fs::read_dir(&paths.files_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn destroy_cancels_in_flight_ingest() {
    let tmp = TempDir::new().unwrap();
    let started = Arc::new(Notify::new());
    let orch = slow_ingest_orchestrator(tmp.path(), started.clone());
    let file = write(&tmp.path().join("in"), "widgets.txt", &three_paragraphs());
    let session = orch.create_session().unwrap();

    let ingest = {
        let orch = orch.clone();
        let id = session.id;
        tokio::spawn(async move { orch.ingest(&id, &[file]).await })
    };
    started.notified().await;

    orch.destroy(&session.id).await.unwrap();
    let err = ingest.await.unwrap().unwrap_err();
    assert!(matches!(err, IngestError::Cancelled), "unexpected error: {}", err);
    assert!(!orch.sessions().paths_for(&session.id).root.exists());
}

#[tokio::test]
async fn same_named_files_from_different_directories_are_kept() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 256);
    let a = write(&tmp.path().join("a"), "notes.txt", "Alpha turbines spin at dawn.");
    let b = write(&tmp.path().join("b"), "notes.txt", "Beta pumps idle at dusk.");
    let session = orch.create_session().unwrap();

    let summary = orch.ingest(&session.id, &[a, b]).await.unwrap();
    assert_eq!(summary.documents, 2);
    assert_eq!(summary.chunks, 2);
    assert!(summary.warnings.is_empty());

    let answer = orch.query(&session.id, "What spins?", None).await.unwrap();
    assert!(answer.answer.contains("Alpha turbines spin at dawn."));
    assert!(answer.answer.contains("Beta pumps idle at dusk."));
}

#[tokio::test]
async fn same_named_uploads_are_kept() {
    let tmp = TempDir::new().unwrap();
    let orch = orchestrator(tmp.path(), 256);
    let session = orch.create_session().unwrap();

    let summary = orch
        .ingest_uploads(
            &session.id,
            vec![
                ("notes.txt".to_string(), b"Alpha turbines spin at dawn.".to_vec()),
                ("notes.txt".to_string(), b"Beta pumps idle at dusk.".to_vec()),
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.documents, 2);
    assert_eq!(summary.collection_size, 2);
}
