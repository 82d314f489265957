//! write_note tool: appends a note to a remote log over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::Tool;

pub struct WriteNoteTool {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct Params {
    title: String,
    content: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Serialize)]
struct NoteBody<'a> {
    title: &'a str,
    content: &'a str,
    filename: String,
    date: String,
}

impl WriteNoteTool {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// File name derived from the title when none is given.
fn default_filename(title: &str) -> String {
    let slug: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "notes.md".to_string()
    } else {
        format!("{slug}.md")
    }
}

#[async_trait]
impl Tool for WriteNoteTool {
    fn name(&self) -> &str {
        "write_note"
    }

    fn description(&self) -> &str {
        "Save a note for the user. Use it when the user asks you to remember, write down, or log something."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Short title of the note"
                },
                "content": {
                    "type": "string",
                    "description": "Body of the note"
                },
                "filename": {
                    "type": "string",
                    "description": "Target file name (default: derived from the title)"
                },
                "date": {
                    "type": "string",
                    "description": "Date of the note, YYYY-MM-DD (default: today)"
                }
            },
            "required": ["title", "content"]
        })
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        let p: Params = serde_json::from_value(params)?;
        if p.title.trim().is_empty() || p.content.trim().is_empty() {
            anyhow::bail!("title and content must not be empty");
        }

        let body = NoteBody {
            title: &p.title,
            content: &p.content,
            filename: p.filename.unwrap_or_else(|| default_filename(&p.title)),
            date: p
                .date
                .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string()),
        };
        debug!(title = %body.title, filename = %body.filename, "write_note");

        let resp = self.client.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("notes endpoint returned HTTP {status}: {text}");
        }

        let reply: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(json!({
            "success": true,
            "filename": body.filename,
            "response": reply,
        }))
    }
}
