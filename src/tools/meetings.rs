//! Local tools over the meeting knowledge base.

use super::{required_str, str_arg, usize_arg, AsyncTool, InputSchema, ParamType, ToolCallContext, ToolDescriptor, ToolOutput};
use crate::embedding::Embedder;
use crate::error::{ReferatError, Result};
use crate::indexer::{document_id, MeetingIndexer, MeetingInfo};
use crate::metadata::{MeetingMetadata, SpeakerMap};
use crate::retrieval::{MeetingId, RetrievalPlanner, MEETING_ID_FIELD, MEETING_TIMESTAMP_FIELD, SPEAKERS_FIELD};
use crate::vector_store::{Condition, DeleteSelector, Filter, ScoredRecord, VectorStore};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const DEFAULT_LIST_LIMIT: usize = 10;
const DEFAULT_TEXT_SOURCE: &str = "Manual Entry";

/// Shared services used by the meeting tools.
pub struct MeetingToolContext {
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub indexer: Arc<MeetingIndexer>,
    pub planner: RetrievalPlanner,
    /// Upper bound on records read when listing meetings.
    pub list_scan_limit: usize,
}

impl MeetingToolContext {
    fn namespace(&self) -> &str {
        self.indexer.namespace()
    }
}

#[derive(Debug, Clone, Copy)]
enum MeetingOp {
    Search,
    Metadata,
    ListRecent,
    UpsertText,
    Delete,
}

struct MeetingTool {
    ctx: Arc<MeetingToolContext>,
    op: MeetingOp,
}

#[async_trait]
impl AsyncTool for MeetingTool {
    async fn call(&self, call: &ToolCallContext, args: Value) -> Result<ToolOutput> {
        let text = match self.op {
            MeetingOp::Search => self.search(call, &args).await?,
            MeetingOp::Metadata => self.metadata(&args).await?,
            MeetingOp::ListRecent => self.list_recent(&args).await?,
            MeetingOp::UpsertText => self.upsert_text(&args).await?,
            MeetingOp::Delete => self.delete(&args).await?,
        };
        Ok(ToolOutput::Text(text))
    }
}

/// The meeting knowledge-base tools.
pub fn meeting_tools(ctx: Arc<MeetingToolContext>) -> Vec<ToolDescriptor> {
    let tool = |op| -> Arc<dyn AsyncTool> {
        Arc::new(MeetingTool {
            ctx: ctx.clone(),
            op,
        })
    };

    vec![
        ToolDescriptor::local_async(
            "search_meetings",
            "Search meeting transcripts and documents. Mention a meeting id (meeting_xxxxxxxx), \
             speakers, dates or minute ranges in the query to narrow the search. Ask for a \
             summary or overview to cover a whole meeting.",
            InputSchema::new()
                .required("query", ParamType::String, "What to look for")
                .optional("max_results", ParamType::Integer, "Maximum number of segments to return")
                .optional("meeting_id", ParamType::String, "Restrict the search to one meeting"),
            tool(MeetingOp::Search),
        )
        .with_progress("Searching your meetings..."),
        ToolDescriptor::local_async(
            "get_meeting_metadata",
            "Get the title, date, summary and source of a meeting.",
            InputSchema::new().required("meeting_id", ParamType::String, "Meeting id, e.g. meeting_ab12cd34"),
            tool(MeetingOp::Metadata),
        )
        .with_progress("Looking up meeting details..."),
        ToolDescriptor::local_async(
            "list_recent_meetings",
            "List the most recent meetings, newest first.",
            InputSchema::new().optional("limit", ParamType::Integer, "How many meetings to list (default 10)"),
            tool(MeetingOp::ListRecent),
        )
        .with_progress("Listing recent meetings..."),
        ToolDescriptor::local_async(
            "upsert_text",
            "Save free text (notes, a document, a pasted transcript) to the knowledge base.",
            InputSchema::new()
                .required("text", ParamType::String, "Content to store")
                .required("title", ParamType::String, "Title of the document")
                .optional("source", ParamType::String, "Where the text came from (default \"Manual Entry\")")
                .optional("date", ParamType::String, "Date of the content as YYYY-MM-DD (default today)"),
            tool(MeetingOp::UpsertText),
        )
        .with_progress("Saving document..."),
        ToolDescriptor::local_async(
            "delete_meeting",
            "Delete every stored segment of a meeting.",
            InputSchema::new().required("meeting_id", ParamType::String, "Meeting id, e.g. meeting_ab12cd34"),
            tool(MeetingOp::Delete),
        )
        .with_progress("Deleting meeting..."),
    ]
}

fn parse_meeting_id(tool: &str, raw: &str) -> Result<MeetingId> {
    MeetingId::parse(raw).ok_or_else(|| ReferatError::InvalidArguments {
        tool: tool.to_string(),
        message: format!("'{}' is not a meeting id like meeting_ab12cd34", raw),
    })
}

fn join_or_none<S: AsRef<str>>(items: impl Iterator<Item = S>) -> String {
    let joined = items.map(|s| s.as_ref().to_string()).collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "none".to_string()
    } else {
        joined
    }
}

fn meeting_filter(id: &MeetingId) -> Filter {
    Filter::new().and(MEETING_ID_FIELD, Condition::Eq(id.hex().into()))
}

impl MeetingTool {
    #[instrument(skip(self, call, args), fields(session = %call.session_id))]
    async fn search(&self, call: &ToolCallContext, args: &Value) -> Result<String> {
        let query = required_str("search_meetings", args, "query")?;
        let planner = &self.ctx.planner;
        let mut plan = planner.plan(query, &call.hints);

        if plan.meeting_id().is_none() {
            if let Some(raw) = str_arg(args, "meeting_id") {
                let id = parse_meeting_id("search_meetings", raw)?;
                plan.filter.push(MEETING_ID_FIELD, Condition::Eq(id.hex().into()));
                if plan.comprehensive {
                    plan.top_k = planner.comprehensive_top_k();
                }
            }
        }
        // An explicit count never shrinks a whole-meeting budget.
        if let Some(max_results) = usize_arg(args, "max_results") {
            if plan.top_k == planner.default_top_k() {
                plan.top_k = max_results;
            }
        }
        debug!("Search plan: top_k={} filter={}", plan.top_k, plan.filter);

        let embedding = self.ctx.embedder.embed(query).await?;
        let results = self
            .ctx
            .store
            .query(self.ctx.namespace(), &embedding, plan.top_k, &plan.filter)
            .await?;

        if results.is_empty() {
            return Ok("No relevant meeting content found.".to_string());
        }

        let formatted = results
            .iter()
            .enumerate()
            .map(|(i, r)| format_segment(i + 1, r))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(format!(
            "Found {} relevant meeting segments:\n\n{}",
            results.len(),
            formatted
        ))
    }

    async fn metadata(&self, args: &Value) -> Result<String> {
        let raw = required_str("get_meeting_metadata", args, "meeting_id")?;
        let id = parse_meeting_id("get_meeting_metadata", raw)?;
        let rows = self
            .ctx
            .store
            .scan(self.ctx.namespace(), &meeting_filter(&id), self.ctx.list_scan_limit)
            .await?;

        let Some(row) = rows.first() else {
            return Ok(format!("No meeting found with ID: {}", raw));
        };

        let speakers: BTreeSet<&str> = rows
            .iter()
            .flat_map(|r| r.list_field(SPEAKERS_FIELD).iter().map(String::as_str))
            .collect();
        let mapping = SpeakerMap::from_metadata_str(row.text_field("speaker_mapping")).unwrap_or_else(|e| {
            warn!("Meeting {} has an unreadable speaker mapping: {}", id, e);
            SpeakerMap::new()
        });
        let chunk_count = row
            .number_field("total_chunks")
            .map(|n| n as usize)
            .unwrap_or(rows.len());

        Ok(format!(
            "Meeting {}\nDate: {}\nTitle: {}\nSummary: {}\nSpeakers: {}\nSpeaker Mapping: {}\nChunks: {}\nSource: {}\nSource File: {}\nLanguage: {}\nTranscription Model: {}\nDuration: {}",
            id,
            row.text_field("meeting_date"),
            row.text_field("meeting_title"),
            row.text_field("summary"),
            join_or_none(speakers.into_iter()),
            join_or_none(mapping.iter().map(|(label, name)| format!("{} = {}", label, name))),
            chunk_count,
            row.text_field("source"),
            row.text_field("source_file"),
            row.text_field("language"),
            row.text_field("transcription_model"),
            row.text_field("meeting_duration"),
        ))
    }

    async fn list_recent(&self, args: &Value) -> Result<String> {
        let limit = usize_arg(args, "limit").unwrap_or(DEFAULT_LIST_LIMIT);
        let rows = self
            .ctx
            .store
            .scan(self.ctx.namespace(), &Filter::new(), self.ctx.list_scan_limit)
            .await?;

        let meetings = recent_meetings(rows, limit);
        if meetings.is_empty() {
            return Ok("No meetings found.".to_string());
        }

        let formatted = meetings
            .iter()
            .map(|r| {
                format!(
                    "- meeting_{} | {} | {} | {}",
                    r.text_field(MEETING_ID_FIELD),
                    r.text_field("meeting_date"),
                    r.text_field("meeting_title"),
                    r.text_field("source"),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(format!("Recent meetings ({}):\n\n{}", meetings.len(), formatted))
    }

    #[instrument(skip(self, args))]
    async fn upsert_text(&self, args: &Value) -> Result<String> {
        let text = required_str("upsert_text", args, "text")?;
        let title = required_str("upsert_text", args, "title")?;
        let source = str_arg(args, "source").unwrap_or(DEFAULT_TEXT_SOURCE);
        let date = match str_arg(args, "date") {
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| ReferatError::InvalidArguments {
                tool: "upsert_text".to_string(),
                message: format!("'{}' is not a date in YYYY-MM-DD form", raw),
            })?,
            None => Local::now().date_naive(),
        };

        let info = MeetingInfo {
            meeting_id: MeetingId::generate(),
            metadata: MeetingMetadata {
                title: title.to_string(),
                summary: format!("Imported from {}", source),
                meeting_date: Some(date),
                ..MeetingMetadata::default()
            },
            source: source.to_string(),
            source_file: format!("{}_upload", source.to_lowercase()),
            transcription_model: "text_import".to_string(),
            language: Some("en".to_string()),
        };

        let stored = self.ctx.indexer.index_text(&info, text).await?;
        Ok(format!(
            "Successfully saved '{}' to the knowledge base in {} chunk(s) (ID: {})",
            title,
            stored,
            document_id(&info.meeting_id)
        ))
    }

    async fn delete(&self, args: &Value) -> Result<String> {
        let raw = required_str("delete_meeting", args, "meeting_id")?;
        let id = parse_meeting_id("delete_meeting", raw)?;
        let removed = self
            .ctx
            .store
            .delete(self.ctx.namespace(), &DeleteSelector::Filter(meeting_filter(&id)))
            .await?;

        if removed == 0 {
            Ok(format!("No meeting found with ID: {}", raw))
        } else {
            Ok(format!("Deleted {} segment(s) of {}", removed, id))
        }
    }
}

/// One row per meeting, newest first.
fn recent_meetings(rows: Vec<ScoredRecord>, limit: usize) -> Vec<ScoredRecord> {
    let mut seen = HashSet::new();
    let mut meetings: Vec<ScoredRecord> = rows
        .into_iter()
        .filter(|r| seen.insert(r.text_field(MEETING_ID_FIELD).to_string()))
        .collect();
    meetings.sort_by(|a, b| {
        let ta = a.number_field(MEETING_TIMESTAMP_FIELD).unwrap_or_default();
        let tb = b.number_field(MEETING_TIMESTAMP_FIELD).unwrap_or_default();
        tb.total_cmp(&ta)
    });
    meetings.truncate(limit);
    meetings
}

fn format_segment(rank: usize, r: &ScoredRecord) -> String {
    let speakers = r.list_field("speakers");
    let speakers = if speakers.is_empty() {
        r.text_field("speaker").to_string()
    } else {
        speakers.join(", ")
    };
    format!(
        "--- Segment {} (score {:.2}) ---\nMeeting: {} ({}) [meeting_{}]\nChunk: {}/{}\nSpeakers: {}\nTime: {} - {}\n{}",
        rank,
        r.score,
        r.text_field("meeting_title"),
        r.text_field("meeting_date"),
        r.text_field(MEETING_ID_FIELD),
        r.number_field("chunk_index").unwrap_or_default() as usize + 1,
        r.number_field("total_chunks").unwrap_or_default() as usize,
        speakers,
        r.text_field("start_time_formatted"),
        r.text_field("end_time_formatted"),
        r.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::retrieval::ConversationHints;
    use crate::tools::ToolRegistry;
    use crate::transcription::SpeakerSegment;
    use crate::vector_store::MemoryVectorStore;
    use serde_json::json;

    struct ConstEmbedder;

    #[async_trait]
    impl Embedder for ConstEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    async fn registry_with_meeting() -> (ToolRegistry, Arc<MemoryVectorStore>) {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder: Arc<dyn Embedder> = Arc::new(ConstEmbedder);
        let chunking = ChunkingConfig {
            min_chars: 1,
            max_chars: 40,
            overlap_chars: 0,
        };
        let indexer = Arc::new(MeetingIndexer::new(store.clone(), embedder.clone(), "test", chunking));

        let mut mapping = SpeakerMap::new();
        mapping.insert("SPEAKER_00", "Alice");
        let info = MeetingInfo {
            meeting_id: MeetingId::parse("ab12cd34").unwrap(),
            metadata: MeetingMetadata {
                title: "Budget review".into(),
                summary: "Q3 budget".into(),
                meeting_date: NaiveDate::from_ymd_opt(2024, 3, 5),
                speaker_mapping: mapping,
            },
            source: "Video Upload".into(),
            source_file: "budget.mp4".into(),
            transcription_model: "whisperx".into(),
            language: Some("en".into()),
        };
        let segments: Vec<SpeakerSegment> = (0..6)
            .map(|i| SpeakerSegment {
                speaker: Some(format!("SPEAKER_0{}", i % 2)),
                start: i as f64 * 30.0,
                end: i as f64 * 30.0 + 30.0,
                text: format!("Point number {} about the travel budget.", i),
            })
            .collect();
        indexer.index_segments(&info, &segments).await.unwrap();

        let ctx = Arc::new(MeetingToolContext {
            store: store.clone(),
            embedder,
            indexer,
            planner: RetrievalPlanner::new(3, 100),
            list_scan_limit: 1000,
        });
        let mut registry = ToolRegistry::new();
        registry.register_all(meeting_tools(ctx)).unwrap();
        (registry, store)
    }

    fn segment_count(output: &ToolOutput) -> usize {
        output.render().matches("--- Segment ").count()
    }

    #[tokio::test]
    async fn test_search_scopes_to_meeting_and_respects_budget() {
        let (registry, _) = registry_with_meeting().await;
        let search = registry.resolve("search_meetings").unwrap();
        let ctx = ToolCallContext::new("s");

        let targeted = search
            .invoke(&ctx, json!({"query": "what did meeting_ab12cd34 decide on travel?"}))
            .await
            .unwrap();
        assert_eq!(segment_count(&targeted), 3);
        assert!(targeted.render().starts_with("Found 3 relevant meeting segments"));
        assert!(targeted.render().contains("[meeting_ab12cd34]"));

        let all = search
            .invoke(&ctx, json!({"query": "summarize meeting_ab12cd34"}))
            .await
            .unwrap();
        assert!(segment_count(&all) > 3);
    }

    #[tokio::test]
    async fn test_search_with_explicit_meeting_id_and_max_results() {
        let (registry, _) = registry_with_meeting().await;
        let search = registry.resolve("search_meetings").unwrap();
        let ctx = ToolCallContext::new("s").with_hints(ConversationHints::default());

        let out = search
            .invoke(&ctx, json!({"query": "travel", "meeting_id": "meeting_ab12cd34", "max_results": 1}))
            .await
            .unwrap();
        assert_eq!(segment_count(&out), 1);

        let none = search
            .invoke(&ctx, json!({"query": "travel", "meeting_id": "meeting_00000000"}))
            .await
            .unwrap();
        assert_eq!(none.render(), "No relevant meeting content found.");

        let err = search
            .invoke(&ctx, json!({"query": "travel", "meeting_id": "yesterday"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ReferatError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_metadata_and_listing() {
        let (registry, store) = registry_with_meeting().await;
        let ctx = ToolCallContext::new("s");

        let meta = registry
            .resolve("get_meeting_metadata")
            .unwrap()
            .invoke(&ctx, json!({"meeting_id": "meeting_ab12cd34"}))
            .await
            .unwrap()
            .render();
        assert!(meta.contains("Title: Budget review"));
        assert!(meta.contains("Date: 2024-03-05"));
        assert!(meta.contains("Transcription Model: whisperx"));
        assert!(meta.contains("Speakers: Alice, SPEAKER_01"));
        assert!(meta.contains("Speaker Mapping: SPEAKER_00 = Alice"));
        let stored = store
            .scan("test", &Filter::new(), 1000)
            .await
            .unwrap()
            .len();
        assert!(stored > 1);
        assert!(meta.contains(&format!("Chunks: {}", stored)));

        let missing = registry
            .resolve("get_meeting_metadata")
            .unwrap()
            .invoke(&ctx, json!({"meeting_id": "meeting_ffffffff"}))
            .await
            .unwrap();
        assert_eq!(missing.render(), "No meeting found with ID: meeting_ffffffff");

        let list = registry
            .resolve("list_recent_meetings")
            .unwrap()
            .invoke(&ctx, json!({}))
            .await
            .unwrap()
            .render();
        assert!(list.starts_with("Recent meetings (1):"));
        assert_eq!(list.matches("meeting_ab12cd34").count(), 1);
    }

    #[tokio::test]
    async fn test_upsert_text_then_delete() {
        let (registry, store) = registry_with_meeting().await;
        let ctx = ToolCallContext::new("s");

        let saved = registry
            .resolve("upsert_text")
            .unwrap()
            .invoke(
                &ctx,
                json!({"text": "Roadmap notes", "title": "Roadmap", "source": "Notion", "date": "2024-04-01"}),
            )
            .await
            .unwrap()
            .render();
        assert!(saved.starts_with("Successfully saved 'Roadmap'"));
        let id = saved
            .rsplit("(ID: ")
            .next()
            .unwrap()
            .trim_end_matches(')')
            .to_string();
        assert!(id.starts_with("doc_"));

        let rows = store
            .scan("test", &meeting_filter(&MeetingId::parse(&id).unwrap()), 10)
            .await
            .unwrap();
        assert_eq!(rows[0].text_field("source_file"), "notion_upload");
        assert_eq!(rows[0].text_field("summary"), "Imported from Notion");

        let list = registry
            .resolve("list_recent_meetings")
            .unwrap()
            .invoke(&ctx, json!({"limit": 1}))
            .await
            .unwrap()
            .render();
        assert!(list.contains("Roadmap"));
        assert!(!list.contains("Budget review"));

        let deleted = registry
            .resolve("delete_meeting")
            .unwrap()
            .invoke(&ctx, json!({"meeting_id": id}))
            .await
            .unwrap()
            .render();
        assert!(deleted.starts_with("Deleted 1 segment(s)"));
    }

    #[tokio::test]
    async fn test_upsert_text_rejects_bad_date() {
        let (registry, _) = registry_with_meeting().await;
        let err = registry
            .resolve("upsert_text")
            .unwrap()
            .invoke(
                &ToolCallContext::new("s"),
                json!({"text": "x", "title": "y", "date": "last tuesday"}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }
}
