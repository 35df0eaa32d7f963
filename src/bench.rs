//! Retrieval/answer benchmark over a single document.
//!
//! Ingests one document into a throwaway session, asks every question of a
//! question set through [`QueryOrchestrator::query_with_sources`] and records
//! the answer, latency, top similarity score and sources of each. A failing
//! question records its error text as the answer with no score; the run goes
//! on. The session is destroyed afterwards whether or not the run succeeded.
//!
//! # Question File
//!
//! ```json
//! {
//!   "description": "Five questions about the report",
//!   "questions": [
//!     { "id": 1, "category": "factual", "question": "Who wrote the report?" }
//!   ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::generation::ModelId;
use crate::models::SourceMatch;
use crate::orchestrator::QueryOrchestrator;

/// Sources reported per question.
const BENCH_SOURCE_TOP_K: usize = 3;

/// Default name of the JSON report.
pub const DEFAULT_REPORT_FILE: &str = "final_benchmark_results.json";

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionSet {
    #[serde(default)]
    pub description: String,
    pub questions: Vec<BenchQuestion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchQuestion {
    pub id: QuestionId,
    #[serde(default)]
    pub category: String,
    pub question: String,
}

/// Question ids may be numbers or strings in hand-written files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QuestionId {
    Number(i64),
    Text(String),
}

// ============ Report ============

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub meta: RunMeta,
    pub system_stats: SystemStats,
    pub benchmark_summary: BenchmarkSummary,
    pub runs: Vec<QuestionRun>,
    pub executive_summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub run_id: String,
    pub run_date: String,
    pub source_file: String,
    pub model: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub runs: usize,
    pub docs: usize,
    pub total_questions: usize,
    pub total_latency_ms: f64,
    pub avg_similarity_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkSummary {
    pub source_document: String,
    pub model_used: String,
    pub questions_evaluated: usize,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionRun {
    pub id: QuestionId,
    pub category: String,
    pub question: String,
    pub answer: String,
    pub latency_ms: f64,
    pub similarity_score: Option<f64>,
    pub sources: Vec<SourceMatch>,
}

pub fn load_questions(path: &Path) -> Result<QuestionSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read question file: {}", path.display()))?;
    let set: QuestionSet = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse question file: {}", path.display()))?;
    if set.questions.is_empty() {
        bail!("Question file {} contains no questions", path.display());
    }
    Ok(set)
}

/// Run `questions` against `document` in a fresh session.
pub async fn run_benchmark(
    orchestrator: &QueryOrchestrator,
    document: &Path,
    questions: &QuestionSet,
    model: ModelId,
) -> Result<BenchmarkReport> {
    if !document.is_file() {
        bail!("Document not found: {}", document.display());
    }
    let doc_name = document
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| document.display().to_string());

    let session = orchestrator.create_session()?;
    let id = session.id;
    tracing::info!(session_id = %id, document = %doc_name, model = %model, "benchmark started");

    let outcome = async {
        orchestrator
            .ingest(&id, &[document.to_path_buf()])
            .await
            .with_context(|| format!("Failed to ingest {}", doc_name))?;

        let mut runs = Vec::with_capacity(questions.questions.len());
        for q in &questions.questions {
            let started = Instant::now();
            let result = orchestrator
                .query_with_sources(&id, &q.question, Some(model), Some(BENCH_SOURCE_TOP_K))
                .await;
            let latency_ms = round_to(started.elapsed().as_secs_f64() * 1000.0, 2);

            let run = match result {
                Ok(out) => QuestionRun {
                    id: q.id.clone(),
                    category: q.category.clone(),
                    question: q.question.clone(),
                    answer: out.answer,
                    latency_ms,
                    similarity_score: Some(round_to(out.top_similarity_score as f64, 4)),
                    sources: out.sources,
                },
                Err(e) => {
                    tracing::warn!(session_id = %id, question = ?q.id, error = %e, "benchmark question failed");
                    QuestionRun {
                        id: q.id.clone(),
                        category: q.category.clone(),
                        question: q.question.clone(),
                        answer: format!("Error: {}", e),
                        latency_ms,
                        similarity_score: None,
                        sources: Vec::new(),
                    }
                }
            };
            runs.push(run);
        }
        Ok::<_, anyhow::Error>(runs)
    }
    .await;

    if let Err(e) = orchestrator.destroy(&id).await {
        tracing::warn!(session_id = %id, error = %e, "failed to remove benchmark session");
    }
    let runs = outcome?;

    Ok(build_report(&doc_name, model, &questions.description, runs))
}

/// Assemble the report for finished `runs`.
pub fn build_report(
    doc_name: &str,
    model: ModelId,
    description: &str,
    runs: Vec<QuestionRun>,
) -> BenchmarkReport {
    let now = chrono::Local::now();
    let system_stats = system_stats(&runs);
    let executive_summary = executive_summary(doc_name, model, &runs, &system_stats);

    BenchmarkReport {
        meta: RunMeta {
            run_id: now.format("%Y%m%d_%H%M%S").to_string(),
            run_date: now.to_rfc3339(),
            source_file: doc_name.to_string(),
            model: model.as_str().to_string(),
            description: description.to_string(),
        },
        benchmark_summary: BenchmarkSummary {
            source_document: doc_name.to_string(),
            model_used: model.as_str().to_string(),
            questions_evaluated: runs.len(),
            status: "Success".to_string(),
        },
        system_stats,
        runs,
        executive_summary,
    }
}

fn system_stats(runs: &[QuestionRun]) -> SystemStats {
    SystemStats {
        runs: runs.len(),
        docs: 1,
        total_questions: runs.len(),
        total_latency_ms: round_to(runs.iter().map(|r| r.latency_ms).sum(), 2),
        avg_similarity_score: mean_score(runs).map(|avg| round_to(avg, 4)),
    }
}

fn mean_score(runs: &[QuestionRun]) -> Option<f64> {
    let scores: Vec<f64> = runs.iter().filter_map(|r| r.similarity_score).collect();
    if scores.is_empty() {
        return None;
    }
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

fn executive_summary(
    doc_name: &str,
    model: ModelId,
    runs: &[QuestionRun],
    stats: &SystemStats,
) -> String {
    let mut parts = vec![
        format!("Benchmark completed on {} with model {}.", doc_name, model),
        format!("{} questions executed successfully.", runs.len()),
        format!("Total query latency: {:.2} ms.", stats.total_latency_ms),
    ];
    if let Some(avg) = mean_score(runs) {
        parts.push(format!("Average top retrieval similarity score: {:.4}.", avg));
    }
    parts.join(" ")
}

/// Write `report` as pretty JSON to `path`, creating parent directories.
pub fn write_report(report: &BenchmarkReport, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(score: Option<f64>, latency_ms: f64) -> QuestionRun {
        QuestionRun {
            id: QuestionId::Number(1),
            category: "factual".to_string(),
            question: "q".to_string(),
            answer: "a".to_string(),
            latency_ms,
            similarity_score: score,
            sources: Vec::new(),
        }
    }

    #[test]
    fn question_ids_accept_numbers_and_strings() {
        let set: QuestionSet = serde_json::from_str(
            r#"{"questions":[{"id":1,"category":"a","question":"x"},{"id":"q2","question":"y"}]}"#,
        )
        .unwrap();
        assert_eq!(set.questions[0].id, QuestionId::Number(1));
        assert_eq!(set.questions[1].id, QuestionId::Text("q2".to_string()));
        assert_eq!(set.questions[1].category, "");
        assert_eq!(set.description, "");
    }

    #[test]
    fn stats_skip_failed_questions() {
        let runs = vec![run(Some(0.5), 10.0), run(None, 5.5), run(Some(0.25), 1.25)];
        let stats = system_stats(&runs);
        assert_eq!(stats.runs, 3);
        assert_eq!(stats.total_latency_ms, 16.75);
        assert_eq!(stats.avg_similarity_score, Some(0.375));
    }

    #[test]
    fn summary_text_matches_report_format() {
        let runs = vec![run(Some(0.5), 10.0), run(Some(0.25), 2.5)];
        let report = build_report("doc.pdf", ModelId::default(), "desc", runs);
        assert_eq!(
            report.executive_summary,
            "Benchmark completed on doc.pdf with model llama-3.3-70b-versatile. \
             2 questions executed successfully. Total query latency: 12.50 ms. \
             Average top retrieval similarity score: 0.3750."
        );
        assert_eq!(report.benchmark_summary.questions_evaluated, 2);
        assert_eq!(report.meta.description, "desc");
    }

    #[test]
    fn summary_omits_score_when_all_failed() {
        let report = build_report("doc.pdf", ModelId::default(), "", vec![run(None, 1.0)]);
        assert!(!report.executive_summary.contains("similarity"));
        assert_eq!(report.system_stats.avg_similarity_score, None);
    }

    #[test]
    fn report_serializes_null_scores() {
        let report = build_report("doc.pdf", ModelId::default(), "", vec![run(None, 1.0)]);
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["runs"][0]["similarity_score"].is_null());
        assert_eq!(json["meta"]["source_file"], "doc.pdf");
    }
}
