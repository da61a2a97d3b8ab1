//! Request sources: restartable lazy sequences of request payloads.
//!
//! Two implementations: a finite file-backed source (JSONL or CSV prompt
//! files) and an infinite synthetic source. Sampling order (sequential or
//! seeded shuffle) is fixed at construction; `reset()` restores the exact
//! same iteration, shuffle included, so repeated runs of a sweep see
//! identical payload sequences.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use crate::backend::estimate_tokens;
use crate::config::{DataSpec, SampleOrder};
use crate::errors::BenchError;
use crate::request::{ChatMessage, EndpointKind, GenerationParams, RequestPayload};

/// A restartable lazy sequence of request payloads. Single-consumer.
pub trait RequestSource: Send {
    /// Returns the source to its start; the subsequent iteration is
    /// identical to the first one.
    fn reset(&mut self);

    /// Next payload, or `None` when a finite source is exhausted.
    fn next(&mut self) -> Option<RequestPayload>;

    /// Whether the source ever ends. Infinite sources require an external
    /// request or duration cap.
    fn is_finite(&self) -> bool;
}

/// Builds the source described by the configuration's `data` block.
pub fn build_source(
    data: &DataSpec,
    endpoint: EndpointKind,
    order: SampleOrder,
    seed: u64,
) -> Result<Box<dyn RequestSource>, BenchError> {
    match data {
        DataSpec::Synthetic {
            prompt_tokens,
            max_tokens,
        } => Ok(Box::new(SyntheticSource::new(
            *prompt_tokens,
            *max_tokens,
            endpoint,
            seed,
        ))),
        DataSpec::File { path } => Ok(Box::new(FileSource::load(path, endpoint, order, seed)?)),
    }
}

/// One row of a JSONL prompt file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRow {
    prompt: Option<String>,
    messages: Option<Vec<ChatMessage>>,
    max_tokens: Option<u64>,
    temperature: Option<f64>,
    #[serde(default)]
    stop: Vec<String>,
    prompt_tokens: Option<u64>,
}

/// Finite source backed by a prompt file loaded fully at startup.
pub struct FileSource {
    payloads: Vec<RequestPayload>,
    order: Vec<usize>,
    cursor: usize,
}

impl FileSource {
    /// Loads a `.jsonl` or `.csv` prompt file.
    pub fn load(
        path: &Path,
        endpoint: EndpointKind,
        order: SampleOrder,
        seed: u64,
    ) -> Result<Self, BenchError> {
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let rows = match extension {
            "jsonl" => Self::read_jsonl(path)?,
            "csv" => Self::read_csv(path)?,
            other => {
                return Err(BenchError::ConfigInvalid(format!(
                    "unsupported prompt file extension '{}' for {}: use .jsonl or .csv",
                    other,
                    path.display()
                )))
            }
        };
        if rows.is_empty() {
            return Err(BenchError::ConfigInvalid(format!(
                "prompt file {} contains no rows",
                path.display()
            )));
        }

        let payloads: Vec<RequestPayload> = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| row_to_payload(row, index as u64, endpoint))
            .collect::<Result<_, _>>()?;

        let mut indices: Vec<usize> = (0..payloads.len()).collect();
        if order == SampleOrder::Shuffled {
            let mut rng = StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
        }

        info!(
            path = %path.display(),
            rows = payloads.len(),
            order = ?order,
            "Prompt file loaded"
        );

        Ok(Self {
            payloads,
            order: indices,
            cursor: 0,
        })
    }

    fn read_jsonl(path: &Path) -> Result<Vec<FileRow>, BenchError> {
        let file = File::open(path)?;
        let mut rows = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let row: FileRow = serde_json::from_str(&line).map_err(|e| {
                BenchError::ConfigInvalid(format!(
                    "{}:{}: invalid JSONL row: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            rows.push(row);
        }
        Ok(rows)
    }

    fn read_csv(path: &Path) -> Result<Vec<FileRow>, BenchError> {
        let file = File::open(path)?;
        let mut reader = csv::Reader::from_reader(file);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| BenchError::ConfigInvalid(format!("{}: {}", path.display(), e)))?
            .iter()
            .map(|h| h.to_string())
            .collect();

        let prompt_col = headers.iter().position(|h| h == "prompt").ok_or_else(|| {
            BenchError::ConfigInvalid(format!(
                "{}: CSV prompt files need a 'prompt' column",
                path.display()
            ))
        })?;
        let max_tokens_col = headers.iter().position(|h| h == "max_tokens");

        let mut rows = Vec::new();
        for result in reader.records() {
            let record =
                result.map_err(|e| BenchError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
            let prompt = record.get(prompt_col).unwrap_or("").to_string();
            let max_tokens = max_tokens_col
                .and_then(|col| record.get(col))
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse::<u64>().map_err(|e| {
                        BenchError::ConfigInvalid(format!(
                            "{}: invalid max_tokens '{}': {}",
                            path.display(),
                            v,
                            e
                        ))
                    })
                })
                .transpose()?;
            rows.push(FileRow {
                prompt: Some(prompt),
                messages: None,
                max_tokens,
                temperature: None,
                stop: Vec::new(),
                prompt_tokens: None,
            });
        }
        Ok(rows)
    }
}

fn row_to_payload(
    row: FileRow,
    index: u64,
    endpoint: EndpointKind,
) -> Result<RequestPayload, BenchError> {
    let params = GenerationParams {
        max_tokens: row.max_tokens,
        temperature: row.temperature,
        stop: row.stop,
    };
    let (prompt, messages) = match (endpoint, row.prompt, row.messages) {
        (EndpointKind::Chat, _, Some(messages)) => (None, messages),
        (EndpointKind::Chat, Some(prompt), None) => (None, vec![ChatMessage::user(prompt)]),
        (EndpointKind::Text, Some(prompt), None) => (Some(prompt), Vec::new()),
        (EndpointKind::Text, _, Some(_)) => {
            return Err(BenchError::ConfigInvalid(format!(
                "row {}: message lists require the chat endpoint",
                index
            )))
        }
        (_, None, None) => {
            return Err(BenchError::ConfigInvalid(format!(
                "row {}: needs either 'prompt' or 'messages'",
                index
            )))
        }
    };

    let hint = row.prompt_tokens.unwrap_or_else(|| {
        let text: String = match (&prompt, &messages) {
            (Some(p), _) => p.clone(),
            (None, msgs) => msgs.iter().map(|m| m.content.as_str()).collect(),
        };
        estimate_tokens(&text)
    });

    Ok(RequestPayload {
        endpoint,
        prompt,
        messages,
        params,
        prompt_tokens_hint: Some(hint),
        dataset_index: Some(index),
    })
}

impl RequestSource for FileSource {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next(&mut self) -> Option<RequestPayload> {
        let slot = *self.order.get(self.cursor)?;
        self.cursor += 1;
        Some(self.payloads[slot].clone())
    }

    fn is_finite(&self) -> bool {
        true
    }
}

/// Word pool for synthetic prompts. Content is irrelevant to measurement;
/// only the token shape matters.
const FILLER_WORDS: &[&str] = &[
    "system", "request", "latency", "stream", "token", "model", "batch", "cache", "prefill",
    "decode", "server", "client", "queue", "sample", "weight", "tensor", "prompt", "output",
    "window", "context",
];

/// Infinite source of fixed-shape synthetic prompts.
pub struct SyntheticSource {
    prompt_tokens: u64,
    max_tokens: u64,
    endpoint: EndpointKind,
    seed: u64,
    rng: StdRng,
    cursor: u64,
}

impl SyntheticSource {
    pub fn new(prompt_tokens: u64, max_tokens: u64, endpoint: EndpointKind, seed: u64) -> Self {
        Self {
            prompt_tokens,
            max_tokens,
            endpoint,
            seed,
            rng: StdRng::seed_from_u64(seed),
            cursor: 0,
        }
    }

    fn generate_prompt(&mut self) -> String {
        let words = self.prompt_tokens.max(1) as usize;
        let mut prompt = String::new();
        for i in 0..words {
            if i > 0 {
                prompt.push(' ');
            }
            let word = FILLER_WORDS[self.rng.gen_range(0..FILLER_WORDS.len())];
            prompt.push_str(word);
        }
        prompt
    }
}

impl RequestSource for SyntheticSource {
    fn reset(&mut self) {
        debug!(seed = self.seed, "Resetting synthetic source");
        self.rng = StdRng::seed_from_u64(self.seed);
        self.cursor = 0;
    }

    fn next(&mut self) -> Option<RequestPayload> {
        let prompt = self.generate_prompt();
        let index = self.cursor;
        self.cursor += 1;

        let (text, messages) = match self.endpoint {
            EndpointKind::Text => (Some(prompt), Vec::new()),
            EndpointKind::Chat => (None, vec![ChatMessage::user(prompt)]),
        };
        Some(RequestPayload {
            endpoint: self.endpoint,
            prompt: text,
            messages,
            params: GenerationParams {
                max_tokens: Some(self.max_tokens),
                temperature: None,
                stop: Vec::new(),
            },
            prompt_tokens_hint: Some(self.prompt_tokens),
            dataset_index: Some(index),
        })
    }

    fn is_finite(&self) -> bool {
        false
    }
}
