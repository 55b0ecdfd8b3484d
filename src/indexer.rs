//! Turns a transcript into embedded, metadata-tagged vector records.

use crate::chunking::{chunk_plain_text, chunk_segments, ChunkingConfig, TranscriptChunk};
use crate::embedding::Embedder;
use crate::error::{ReferatError, Result};
use crate::metadata::MeetingMetadata;
use crate::retrieval::{
    date_to_timestamp, MeetingId, MEETING_ID_FIELD, MEETING_TIMESTAMP_FIELD, SPEAKERS_FIELD,
    START_TIME_FIELD,
};
use crate::transcription::{format_timestamp, SpeakerSegment};
use crate::vector_store::{Metadata, MetadataValue, VectorRecord, VectorStore};
use chrono::{Local, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

/// Descriptive fields shared by every chunk of one meeting.
#[derive(Debug, Clone)]
pub struct MeetingInfo {
    pub meeting_id: MeetingId,
    pub metadata: MeetingMetadata,
    /// Where the content came from ("Video Upload", "Notion", ...).
    pub source: String,
    pub source_file: String,
    pub transcription_model: String,
    pub language: Option<String>,
}

/// Chunks, embeds and stores meetings in one namespace.
pub struct MeetingIndexer {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    namespace: String,
    chunking: ChunkingConfig,
}

impl MeetingIndexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        namespace: &str,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            namespace: namespace.to_string(),
            chunking,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Index a diarized transcript, replacing speaker labels with mapped names.
    #[instrument(skip(self, info, segments), fields(meeting = %info.meeting_id))]
    pub async fn index_segments(&self, info: &MeetingInfo, segments: &[SpeakerSegment]) -> Result<usize> {
        let mapping = &info.metadata.speaker_mapping;
        let named: Vec<SpeakerSegment> = segments
            .iter()
            .map(|s| SpeakerSegment {
                speaker: s.speaker.as_deref().map(|label| mapping.resolve(label).to_string()),
                start: s.start,
                end: s.end,
                text: mapping.apply(&s.text),
            })
            .collect();

        let duration = named.iter().map(|s| s.end).fold(0.0, f64::max);
        let chunks = chunk_segments(&named, &self.chunking);
        self.index_chunks(info, &info.meeting_id.to_string(), chunks, duration)
            .await
    }

    /// Index free text without speaker information.
    #[instrument(skip(self, info, text), fields(meeting = %info.meeting_id))]
    pub async fn index_text(&self, info: &MeetingInfo, text: &str) -> Result<usize> {
        let text = info.metadata.speaker_mapping.apply(text);
        let chunks = chunk_plain_text(&text, 0.0, &self.chunking);
        self.index_chunks(info, &document_id(&info.meeting_id), chunks, 0.0)
            .await
    }

    async fn index_chunks(
        &self,
        info: &MeetingInfo,
        record_prefix: &str,
        chunks: Vec<TranscriptChunk>,
        duration: f64,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Err(ReferatError::Workflow(
                "The transcript is empty, so there is nothing to store.".to_string(),
            ));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let total = chunks.len();
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .enumerate()
            .map(|(index, (chunk, embedding))| VectorRecord {
                id: format!("{}_chunk_{}", record_prefix, index),
                embedding,
                metadata: chunk_metadata(info, chunk, index, total, duration),
                text: chunk.text.clone(),
            })
            .collect();

        let stored = self.store.upsert(&self.namespace, &records).await?;
        info!("Indexed {} chunks for {}", stored, info.meeting_id);
        Ok(stored)
    }
}

/// Identifier shown for documents imported as free text.
pub fn document_id(id: &MeetingId) -> String {
    format!("doc_{}", id.hex())
}

/// Flat metadata stored alongside one chunk.
pub fn chunk_metadata(
    info: &MeetingInfo,
    chunk: &TranscriptChunk,
    index: usize,
    total: usize,
    meeting_duration: f64,
) -> Metadata {
    let date = info
        .metadata
        .meeting_date
        .unwrap_or_else(|| Local::now().date_naive());
    let primary_speaker = chunk.speakers.first().cloned().unwrap_or_else(|| "Unknown".to_string());

    let mut metadata = Metadata::new();
    let mut put = |key: &str, value: MetadataValue| {
        metadata.insert(key.to_string(), value);
    };

    put(MEETING_ID_FIELD, info.meeting_id.hex().into());
    put("meeting_title", info.metadata.title.as_str().into());
    put("meeting_date", date.format("%Y-%m-%d").to_string().into());
    put(MEETING_TIMESTAMP_FIELD, date_to_timestamp(date).into());
    put("summary", info.metadata.summary.as_str().into());
    put(START_TIME_FIELD, chunk.start.into());
    put("end_time", chunk.end.into());
    put("duration", (chunk.end - chunk.start).max(0.0).into());
    put("start_time_formatted", format_timestamp(chunk.start).into());
    put("end_time_formatted", format_timestamp(chunk.end).into());
    put("meeting_duration", format_timestamp(meeting_duration).into());
    put("speaker", primary_speaker.into());
    put(SPEAKERS_FIELD, chunk.speakers.clone().into());
    put("speaker_count", chunk.speakers.len().into());
    put("speaker_mapping", info.metadata.speaker_mapping.to_metadata_string().into());
    put("chunk_type", chunk.chunk_type.as_str().into());
    put("chunk_index", index.into());
    put("total_chunks", total.into());
    put("word_count", chunk.word_count().into());
    put("char_count", chunk.char_count().into());
    put("segment_count", chunk.segment_count.into());
    put("source", info.source.as_str().into());
    put("source_file", info.source_file.as_str().into());
    put("transcription_model", info.transcription_model.as_str().into());
    put("language", info.language.clone().unwrap_or_else(|| "en".to_string()).into());
    put("date_transcribed", Utc::now().format("%Y-%m-%d").to_string().into());
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SpeakerMap;
    use crate::vector_store::{Condition, Filter, MemoryVectorStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;

    struct LengthEmbedder;

    #[async_trait]
    impl Embedder for LengthEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn info(hex: &str) -> MeetingInfo {
        let mut mapping = SpeakerMap::new();
        mapping.insert("SPEAKER_00", "Alice");
        MeetingInfo {
            meeting_id: MeetingId::parse(hex).unwrap(),
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
        }
    }

    fn seg(speaker: &str, start: f64, text: &str) -> SpeakerSegment {
        SpeakerSegment {
            speaker: Some(speaker.into()),
            start,
            end: start + 5.0,
            text: text.into(),
        }
    }

    #[tokio::test]
    async fn test_index_segments_maps_speakers_and_tags_metadata() {
        let store = Arc::new(MemoryVectorStore::new());
        let indexer = MeetingIndexer::new(store.clone(), Arc::new(LengthEmbedder), "dev", ChunkingConfig::default());

        let segments = vec![
            seg("SPEAKER_00", 0.0, "We should cut travel, said SPEAKER_00."),
            seg("SPEAKER_01", 5.0, "Agreed."),
        ];
        let stored = indexer.index_segments(&info("ab12cd34"), &segments).await.unwrap();
        assert!(stored >= 1);

        let filter = Filter::new().and(MEETING_ID_FIELD, Condition::Eq("ab12cd34".into()));
        let rows = store.scan("dev", &filter, 100).await.unwrap();
        assert_eq!(rows.len(), stored);

        let first = &rows[0];
        assert_eq!(first.id, "meeting_ab12cd34_chunk_0");
        assert!(first.list_field(SPEAKERS_FIELD).contains(&"Alice".to_string()));
        assert!(first.text.contains("Alice"));
        assert!(!first.text.contains("SPEAKER_00"));
        assert_eq!(first.text_field("meeting_date"), "2024-03-05");
        assert_eq!(
            first.number_field(MEETING_TIMESTAMP_FIELD),
            Some(date_to_timestamp(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()))
        );
        assert_eq!(
            SpeakerMap::from_metadata_str(first.text_field("speaker_mapping"))
                .unwrap()
                .get("SPEAKER_00"),
            Some("Alice")
        );
        assert_eq!(first.number_field("total_chunks"), Some(stored as f64));
    }

    #[tokio::test]
    async fn test_index_text_uses_document_ids() {
        let store = Arc::new(MemoryVectorStore::new());
        let indexer = MeetingIndexer::new(store.clone(), Arc::new(LengthEmbedder), "dev", ChunkingConfig::default());
        let stored = indexer
            .index_text(&info("0badf00d"), "Notes from the planning page. SPEAKER_00 owns the roadmap.")
            .await
            .unwrap();
        assert_eq!(stored, 1);

        let rows = store.scan("dev", &Filter::new(), 10).await.unwrap();
        assert_eq!(rows[0].id, "doc_0badf00d_chunk_0");
        assert_eq!(rows[0].text_field(MEETING_ID_FIELD), "0badf00d");
        assert_eq!(rows[0].text_field("chunk_type"), "full_transcript_chunk");
        assert!(rows[0].text.contains("Alice owns the roadmap"));
    }

    #[tokio::test]
    async fn test_empty_text_is_a_workflow_error() {
        let indexer = MeetingIndexer::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(LengthEmbedder),
            "dev",
            ChunkingConfig::default(),
        );
        let err = indexer.index_text(&info("ab12cd34"), "   ").await.unwrap_err();
        assert!(matches!(err, ReferatError::Workflow(_)));
    }
}
