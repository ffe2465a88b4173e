use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    functions::{json_schema_for, FunctionDefinition, FunctionParameter, ToolFunction},
    text::tokenize,
    tools::required_str,
    LLMError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub text: String,
}

impl Document {
    fn new(id: &str, title: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            text: text.to_string(),
        }
    }
}

pub fn builtin_corpus() -> Vec<Document> {
    vec![
        Document::new("1", "Springfield, IL", "Springfield is a city in Illinois with a population of 116,250 as of 2020."),
        Document::new("2", "Springfield Economy", "The GDP of Springfield IL is approximately 7.6 billion dollars."),
        Document::new("3", "Python", "Python is a programming language created by Guido van Rossum in 1991."),
        Document::new("4", "Speed of Light", "The speed of light is approximately 299,792,458 meters per second."),
        Document::new("5", "Earth", "The Earth's circumference is approximately 40,075 kilometers."),
        Document::new("6", "Water", "Water boils at 100 degrees Celsius at standard atmospheric pressure."),
        Document::new("7", "Body Temperature", "The average human body temperature is 37 degrees Celsius or 98.6 degrees Fahrenheit."),
        Document::new("8", "Mount Everest", "Mount Everest is 8,849 meters tall, making it the tallest mountain on Earth."),
        Document::new("9", "Amazon River", "The Amazon River is approximately 6,400 kilometers long."),
        Document::new("10", "Tokyo", "Tokyo has a population of approximately 13.96 million people."),
    ]
}

/// Okapi BM25 over a fixed document set.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    k1: f64,
    b: f64,
    docs: Vec<Document>,
    term_freqs: Vec<HashMap<String, usize>>,
    lengths: Vec<usize>,
    avg_len: f64,
    idf: BTreeMap<String, f64>,
}

impl Bm25Index {
    pub fn new(docs: Vec<Document>) -> Self {
        let mut term_freqs = Vec::with_capacity(docs.len());
        let mut lengths = Vec::with_capacity(docs.len());
        let mut doc_freq: BTreeMap<String, usize> = BTreeMap::new();

        for doc in &docs {
            let tokens = tokenize(&doc.text);
            lengths.push(tokens.len());
            let mut freqs: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *freqs.entry(token).or_default() += 1;
            }
            for term in freqs.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
            term_freqs.push(freqs);
        }

        let n = docs.len() as f64;
        let avg_len = if docs.is_empty() {
            1.0
        } else {
            lengths.iter().sum::<usize>() as f64 / n
        };
        let idf = doc_freq
            .into_iter()
            .map(|(term, df)| {
                let df = df as f64;
                (term, ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();

        Self {
            k1: 1.5,
            b: 0.75,
            docs,
            term_freqs,
            lengths,
            avg_len,
            idf,
        }
    }

    /// Top `top_k` documents with a positive score, best first; ties keep
    /// corpus order.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(&Document, f64)> {
        let terms = tokenize(query);
        let mut scored: Vec<(usize, f64)> = self
            .docs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let len = self.lengths[i] as f64;
                let score = terms
                    .iter()
                    .filter_map(|term| {
                        let idf = self.idf.get(term)?;
                        let tf = *self.term_freqs[i].get(term).unwrap_or(&0) as f64;
                        let norm = tf + self.k1 * (1.0 - self.b + self.b * len / self.avg_len);
                        Some(idf * tf * (self.k1 + 1.0) / norm)
                    })
                    .sum::<f64>();
                (i, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored
            .into_iter()
            .take(top_k)
            .filter(|(_, score)| *score > 0.0)
            .map(|(i, score)| (&self.docs[i], score))
            .collect()
    }
}

pub struct SearchTool {
    index: Bm25Index,
}

impl SearchTool {
    pub fn new(docs: Vec<Document>) -> Self {
        Self {
            index: Bm25Index::new(docs),
        }
    }
}

impl Default for SearchTool {
    fn default() -> Self {
        Self::new(builtin_corpus())
    }
}

#[async_trait]
impl ToolFunction for SearchTool {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new("search")
            .with_description("Search a knowledge corpus. Returns the best matching documents.")
            .with_parameter(
                FunctionParameter::new("query", json_schema_for::<String>())
                    .with_description("Search query string."),
            )
            .with_parameter(
                FunctionParameter::new("top_k", json_schema_for::<u32>())
                    .with_description("Number of results to return.")
                    .with_default(json!(3))
                    .optional(),
            )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let query = required_str(arguments, "query")?;
        if query.trim().is_empty() {
            return Err(LLMError::InvalidToolArguments("query must not be empty".to_string()));
        }
        let top_k = arguments.get("top_k").and_then(Value::as_u64).unwrap_or(3) as usize;

        let hits: Vec<Value> = self
            .index
            .search(query, top_k)
            .into_iter()
            .map(|(doc, score)| {
                json!({
                    "id": doc.id,
                    "title": doc.title,
                    "text": doc.text,
                    "score": (score * 1000.0).round() / 1000.0,
                })
            })
            .collect();
        Ok(Value::Array(hits))
    }
}
