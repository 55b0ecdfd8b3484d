//! Session-scoped tools for the upload, transcribe, edit and commit workflow.

use super::{required_str, str_arg, AsyncTool, InputSchema, ParamType, ToolCallContext, ToolDescriptor, ToolOutput, WorkflowAccess};
use crate::error::{ReferatError, Result};
use crate::indexer::{MeetingIndexer, MeetingInfo};
use crate::metadata::{MetadataExtractor, SpeakerMap};
use crate::retrieval::MeetingId;
use crate::transcription::{format_transcript, parse_transcript, Transcriber};
use crate::workflow::{WorkflowHandle, WorkflowState, WorkflowStore};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

const PREVIEW_CHARS: usize = 1500;
const VIDEO_SOURCE: &str = "Video Upload";
const NO_TRANSCRIPT: &str = "No transcription available to edit. Please transcribe a video first.";
const NO_TRANSCRIPT_TO_UPLOAD: &str = "No transcription available to upload. Please transcribe a video first.";

/// Services the video workflow tools depend on.
pub struct VideoToolContext {
    pub workflow: WorkflowStore,
    pub transcriber: Arc<dyn Transcriber>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub indexer: Arc<MeetingIndexer>,
}

#[derive(Debug, Clone, Copy)]
enum VideoOp {
    RequestUpload,
    Transcribe,
    RequestEdit,
    UpdateTranscription,
    UpdateSpeakerNames,
    Upload,
    Cancel,
}

struct VideoTool {
    ctx: Arc<VideoToolContext>,
    op: VideoOp,
}

#[async_trait]
impl AsyncTool for VideoTool {
    async fn call(&self, call: &ToolCallContext, args: Value) -> Result<ToolOutput> {
        let handle = self.ctx.workflow.handle(&call.session_id)?;
        let text = match self.op {
            VideoOp::RequestUpload => request_upload(&handle)?,
            VideoOp::Transcribe => self.transcribe(&handle, &args).await?,
            VideoOp::RequestEdit => request_edit(&handle)?,
            VideoOp::UpdateTranscription => update_transcription(&handle, &args)?,
            VideoOp::UpdateSpeakerNames => update_speaker_names(&handle, &args)?,
            VideoOp::Upload => self.upload(&handle).await?,
            VideoOp::Cancel => {
                handle.reset()?;
                "The video workflow has been cancelled. Nothing was saved.".to_string()
            }
        };
        Ok(ToolOutput::Text(text))
    }
}

/// The video workflow tools. Every one of them writes session state.
pub fn video_tools(ctx: Arc<VideoToolContext>) -> Vec<ToolDescriptor> {
    let tool = |op| -> Arc<dyn AsyncTool> {
        Arc::new(VideoTool {
            ctx: ctx.clone(),
            op,
        })
    };

    vec![
        ToolDescriptor::local_async(
            "request_video_upload",
            "Show the video upload control so the user can provide a meeting recording.",
            InputSchema::new(),
            tool(VideoOp::RequestUpload),
        )
        .with_progress("Preparing video upload..."),
        ToolDescriptor::local_async(
            "transcribe_uploaded_video",
            "Transcribe and diarize the uploaded meeting video.",
            InputSchema::new().optional(
                "video_path",
                ParamType::String,
                "Path of the uploaded video (defaults to the session's upload)",
            ),
            tool(VideoOp::Transcribe),
        )
        .with_progress("Starting video transcription..."),
        ToolDescriptor::local_async(
            "request_transcription_edit",
            "Open the editor so the user can correct the current transcription.",
            InputSchema::new(),
            tool(VideoOp::RequestEdit),
        )
        .with_progress("Opening the transcription editor..."),
        ToolDescriptor::local_async(
            "update_transcription",
            "Replace the current transcription with the user's edited text.",
            InputSchema::new().required("edited_text", ParamType::String, "Full edited transcription"),
            tool(VideoOp::UpdateTranscription),
        )
        .with_progress("Saving your edits..."),
        ToolDescriptor::local_async(
            "update_speaker_names",
            "Set real names for diarized speaker labels, e.g. {\"SPEAKER_00\": \"Alice\"}.",
            InputSchema::new().required("mapping", ParamType::Object, "Speaker label to name"),
            tool(VideoOp::UpdateSpeakerNames),
        )
        .with_progress("Updating speaker names..."),
        ToolDescriptor::local_async(
            "upload_transcription",
            "Store the current transcription in the meeting knowledge base.",
            InputSchema::new(),
            tool(VideoOp::Upload),
        )
        .with_progress("Uploading transcription to the knowledge base..."),
        ToolDescriptor::local_async(
            "cancel_video_workflow",
            "Discard the uploaded video and any transcription in progress.",
            InputSchema::new(),
            tool(VideoOp::Cancel),
        )
        .with_progress("Cancelling the video workflow..."),
    ]
    .into_iter()
    .map(|descriptor| descriptor.with_workflow_access(WorkflowAccess::Write))
    .collect()
}

fn workflow_error(message: &str) -> ReferatError {
    ReferatError::Workflow(message.to_string())
}

fn request_upload(handle: &WorkflowHandle) -> Result<String> {
    handle.update(|s| {
        s.show_upload = true;
        s.show_editor = false;
    })?;
    Ok("Please upload your meeting video using the upload control. I will transcribe it once it is uploaded.".to_string())
}

fn request_edit(handle: &WorkflowHandle) -> Result<String> {
    let opened = handle.update(|s| {
        if s.has_transcript() {
            s.show_editor = true;
        }
        s.show_editor
    })?;
    if !opened {
        return Err(workflow_error(NO_TRANSCRIPT));
    }
    Ok("The transcription editor is open. Save your changes when you are done.".to_string())
}

fn update_transcription(handle: &WorkflowHandle, args: &Value) -> Result<String> {
    let edited = required_str("update_transcription", args, "edited_text")?.to_string();
    let segments = parse_transcript(&edited).unwrap_or_default();

    let updated = handle.update(|s| {
        if !s.has_transcript() {
            return false;
        }
        s.transcript_text = Some(edited);
        s.segments = segments;
        s.metadata = None;
        s.show_editor = false;
        true
    })?;
    if !updated {
        return Err(workflow_error(NO_TRANSCRIPT));
    }
    Ok("The transcription has been updated. Meeting details will be extracted again from the edited text.".to_string())
}

fn update_speaker_names(handle: &WorkflowHandle, args: &Value) -> Result<String> {
    let invalid = |message: &str| ReferatError::InvalidArguments {
        tool: "update_speaker_names".to_string(),
        message: message.to_string(),
    };
    let object = args
        .get("mapping")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("'mapping' must be an object of label to name"))?;

    let mut names = SpeakerMap::new();
    for (label, name) in object {
        let name = name
            .as_str()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("every speaker name must be a non-empty string"))?;
        names.insert(label.trim(), name);
    }
    if names.is_empty() {
        return Err(invalid("'mapping' is empty"));
    }

    handle.update(|s| s.speaker_names.merge(&names))?;
    let listed = names
        .iter()
        .map(|(label, name)| format!("{} = {}", label, name))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!("Updated speaker names: {}", listed))
}

impl VideoTool {
    #[instrument(skip(self, handle, args), fields(session = %handle.session_id()))]
    async fn transcribe(&self, handle: &WorkflowHandle, args: &Value) -> Result<String> {
        let current = handle.snapshot()?.uploaded_asset;
        let path = match str_arg(args, "video_path") {
            Some(raw) => PathBuf::from(raw),
            None => current
                .clone()
                .ok_or_else(|| workflow_error("No video has been uploaded yet. Please upload a video first."))?,
        };
        if !path.exists() {
            return Err(ReferatError::Workflow(format!(
                "Video file not found: {}. Please upload the video again.",
                path.display()
            )));
        }

        if current.as_deref() != Some(path.as_path()) {
            handle.set_uploaded_asset(path.clone())?;
        }
        handle.update(|s| {
            s.show_upload = false;
            s.transcription_in_progress = true;
        })?;

        let started = Instant::now();
        let transcript = match self.ctx.transcriber.transcribe(&path).await {
            Ok(transcript) => transcript,
            Err(e) => {
                handle.update(|s| s.transcription_in_progress = false)?;
                return Err(e);
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        let text = format_transcript(&transcript.segments);
        let duration = transcript.duration();
        let speakers = transcript.speakers();
        let segment_count = transcript.segments.len();
        let language = transcript.language.clone();

        handle.set_transcript(text.clone(), transcript.segments, language.clone(), Some(duration))?;
        let timing = format!("Transcribed {:.0}s of audio in {:.1}s", duration, elapsed);
        info!("{}", timing);
        handle.update(|s| s.timing_info = Some(timing.clone()))?;

        let preview: String = text.chars().take(PREVIEW_CHARS).collect();
        let more = if text.chars().count() > PREVIEW_CHARS { "\n..." } else { "" };
        Ok(format!(
            "Transcription complete: {} segments, {} speaker(s), language {}. {}.\n\nPreview:\n{}{}\n\n\
             You can edit the transcription, set speaker names, or upload it to the knowledge base.",
            segment_count,
            speakers.len(),
            language.as_deref().unwrap_or("unknown"),
            timing,
            preview,
            more
        ))
    }

    #[instrument(skip(self, handle), fields(session = %handle.session_id()))]
    async fn upload(&self, handle: &WorkflowHandle) -> Result<String> {
        let state = handle.snapshot()?;
        let Some(text) = state.transcript_text.clone().filter(|_| state.has_transcript()) else {
            return Err(workflow_error(NO_TRANSCRIPT_TO_UPLOAD));
        };

        let mut metadata = match state.metadata.clone() {
            Some(metadata) => metadata,
            None => {
                let extracted = self.ctx.extractor.extract(&text).await?;
                handle.set_extracted_metadata(extracted.clone())?;
                extracted
            }
        };
        metadata.speaker_mapping.merge(&state.speaker_names);

        let info = MeetingInfo {
            meeting_id: MeetingId::generate(),
            source: VIDEO_SOURCE.to_string(),
            source_file: source_file(&state),
            transcription_model: self.ctx.transcriber.model_name().to_string(),
            language: state.language.clone(),
            metadata,
        };

        let stored = match parse_transcript(&text) {
            Some(segments) => self.ctx.indexer.index_segments(&info, &segments).await?,
            None => {
                warn!("Edited transcript is no longer line-formatted; indexing as plain text");
                self.ctx.indexer.index_text(&info, &text).await?
            }
        };

        handle.reset()?;
        Ok(format!(
            "Successfully uploaded '{}' to the knowledge base as {} ({} chunks). You can now ask questions about this meeting.",
            info.metadata.title, info.meeting_id, stored
        ))
    }
}

fn source_file(state: &WorkflowState) -> String {
    state
        .uploaded_asset
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video_upload".to_string())
}
