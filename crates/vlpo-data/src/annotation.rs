//! Annotation records and file loading.
//!
//! Files are LLaVA-style records: an id, an optional image file name and a list of
//! alternating human/assistant turns. Comparison files carry a list of answers in
//! rank order in place of the assistant turn's text.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};
use vlpo_core::{Result, VlpoError};

/// Value of a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnValue {
    /// Plain text.
    Text(String),
    /// Ranked answers, best first.
    Ranked(Vec<String>),
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker tag (`human`, `gpt`, ...).
    #[serde(default)]
    pub from: String,
    /// Turn content.
    pub value: TurnValue,
}

#[derive(Deserialize)]
struct RawAnnotation {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    image: Option<String>,
    conversations: Vec<Turn>,
}

/// One conversational unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Stable identifier.
    pub id: String,
    /// Image file name relative to the image folder.
    pub image: Option<String>,
    /// Ordered turns.
    pub conversations: Vec<Turn>,
}

impl Annotation {
    fn from_raw(raw: RawAnnotation, position: usize) -> Self {
        let id = match raw.id {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Null) | None => position.to_string(),
            Some(other) => other.to_string(),
        };
        Self {
            id,
            image: raw.image,
            conversations: raw.conversations,
        }
    }

    /// Question/answer pairs of a plain conversation.
    pub fn question_answer_pairs(&self) -> Result<Vec<(&str, &str)>> {
        if self.conversations.len() < 2 {
            return Err(self.malformed("needs at least one question and one answer"));
        }
        self.conversations
            .chunks_exact(2)
            .map(|pair| match (&pair[0].value, &pair[1].value) {
                (TurnValue::Text(q), TurnValue::Text(a)) => Ok((q.as_str(), a.as_str())),
                _ => Err(self.malformed("conversation turns must be text")),
            })
            .collect()
    }

    /// First question and the ranked answers that follow it.
    pub fn ranked_answers(&self) -> Result<(&str, &[String])> {
        match self.conversations.as_slice() {
            [first, second, ..] => match (&first.value, &second.value) {
                (TurnValue::Text(q), TurnValue::Ranked(answers)) => Ok((q.as_str(), answers)),
                _ => Err(self.malformed("expected a question followed by a list of ranked answers")),
            },
            _ => Err(self.malformed("needs a question and ranked answers")),
        }
    }

    /// First question of the conversation.
    pub fn first_question(&self) -> Result<&str> {
        match self.conversations.first().map(|t| &t.value) {
            Some(TurnValue::Text(q)) => Ok(q),
            _ => Err(self.malformed("first turn must be a text question")),
        }
    }

    fn malformed(&self, reason: &str) -> VlpoError {
        VlpoError::Data(format!("annotation {}: {reason}", self.id))
    }
}

/// Load annotations from a `.json` array or a `.jsonl` file.
///
/// Ids missing from the file are assigned from the record position.
pub fn load_annotations(path: impl AsRef<Path>) -> Result<Vec<Annotation>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(VlpoError::Data(format!(
            "annotation file {} not found",
            path.display()
        )));
    }

    let parse_err =
        |e: serde_json::Error| VlpoError::Data(format!("{}: {e}", path.display()));

    let raw: Vec<RawAnnotation> = match path.extension().and_then(|e| e.to_str()) {
        Some("jsonl") => {
            let reader = BufReader::new(File::open(path)?);
            let mut records: Vec<RawAnnotation> = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(serde_json::from_str(&line).map_err(parse_err)?);
            }
            records
        }
        _ => {
            let reader = BufReader::new(File::open(path)?);
            serde_json::from_reader(reader).map_err(parse_err)?
        }
    };

    let annotations: Vec<Annotation> = raw
        .into_iter()
        .enumerate()
        .map(|(i, r)| Annotation::from_raw(r, i))
        .collect();

    tracing::info!(
        "Loaded {} annotations from {}",
        annotations.len(),
        path.display()
    );
    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_json_assigns_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.json");
        std::fs::write(
            &path,
            r#"[
                {"image": "a.png", "conversations": [
                    {"from": "human", "value": "<image>\nq1"},
                    {"from": "gpt", "value": "a1"}]},
                {"id": 42, "conversations": [
                    {"from": "human", "value": "q2"},
                    {"from": "gpt", "value": ["best", "worst"]}]}
            ]"#,
        )
        .unwrap();

        let anns = load_annotations(&path).unwrap();
        assert_eq!(anns.len(), 2);
        assert_eq!(anns[0].id, "0");
        assert_eq!(anns[1].id, "42");
        assert_eq!(anns[0].question_answer_pairs().unwrap(), vec![("<image>\nq1", "a1")]);
        let (q, ranked) = anns[1].ranked_answers().unwrap();
        assert_eq!(q, "q2");
        assert_eq!(ranked, ["best".to_string(), "worst".to_string()]);
        assert!(anns[1].question_answer_pairs().is_err());
    }

    #[test]
    fn test_load_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(f, r#"{{"id": "x", "conversations": [{{"from": "human", "value": "q"}}, {{"from": "gpt", "value": "a"}}]}}"#).unwrap();
        writeln!(f).unwrap();
        writeln!(f, r#"{{"conversations": [{{"from": "human", "value": "q"}}, {{"from": "gpt", "value": "b"}}]}}"#).unwrap();

        let anns = load_annotations(&path).unwrap();
        assert_eq!(anns.len(), 2);
        assert_eq!(anns[0].id, "x");
        assert_eq!(anns[1].id, "1");
    }

    #[test]
    fn test_missing_file_is_data_error() {
        let err = load_annotations("/nonexistent/annotations.json").unwrap_err();
        assert!(matches!(err, VlpoError::Data(_)));
    }

    #[test]
    fn test_malformed_is_data_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"conversations": 3}]"#).unwrap();
        assert!(matches!(load_annotations(&path), Err(VlpoError::Data(_))));
    }
}
