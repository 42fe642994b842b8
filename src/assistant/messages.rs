use super::{Artifact, JobState};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct MessageListData {
    #[serde(default)]
    pub data: Vec<ThreadMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: MessageText },
    ImageFile { image_file: FileRef },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageText {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Annotation {
    FilePath { file_path: FileRef },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileRef {
    pub file_id: String,
}

/// Flattens a thread's message list into ordered artifacts. The listing
/// endpoint returns newest first, so messages are walked in reverse to
/// restore emission order. Only assistant messages produce artifacts; text
/// annotations referencing produced files become file artifacts right after
/// their text.
pub fn collect_artifacts(messages: &[ThreadMessage]) -> Vec<Artifact> {
    let mut artifacts = Vec::new();
    for message in messages.iter().rev() {
        if message.role != "assistant" {
            continue;
        }
        for item in &message.content {
            match item {
                MessageContent::Text { text } => {
                    artifacts.push(Artifact::Text {
                        content: text.value.clone(),
                    });
                    for annotation in &text.annotations {
                        if let Annotation::FilePath { file_path } = annotation {
                            artifacts.push(Artifact::File {
                                file_id: file_path.file_id.clone(),
                            });
                        }
                    }
                }
                MessageContent::ImageFile { image_file } => {
                    artifacts.push(Artifact::File {
                        file_id: image_file.file_id.clone(),
                    });
                }
                MessageContent::Unknown => {}
            }
        }
    }
    artifacts
}

/// Maps a run's wire status to a terminal state, or `None` while the run is
/// still in flight.
pub fn terminal_outcome(
    status: &str,
    last_error: Option<String>,
) -> Option<(JobState, Option<String>)> {
    match status {
        "completed" => Some((JobState::Completed, None)),
        "incomplete" => Some((
            JobState::Incomplete,
            Some(last_error.unwrap_or_else(|| "run ended incomplete".to_string())),
        )),
        "failed" | "cancelled" | "expired" => Some((
            JobState::Failed,
            Some(last_error.unwrap_or_else(|| format!("run ended {status}"))),
        )),
        _ => None,
    }
}
