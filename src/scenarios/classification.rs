//! Sentiment labelling without access to ground truth. The prompter sends
//! held-out texts in batches; grading compares the returned labels with the
//! hidden ones.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{
    prompter::{Prompter, ScriptedPrompter},
    scenario::{MetricMap, Scenario, ScenarioConfig, ScenarioResult, TaskFamily},
    types::{ChatMessage, MessageRole},
};

pub const ID: &str = "classification/sentiment";
pub const LABELS: [&str; 3] = ["positive", "negative", "neutral"];

const DATASET_SIZE: usize = 200;
const BATCH_SIZE: usize = 5;
const BATCH_HEADER: &str = "Classify these texts:";
const FEW_SHOT: usize = 3;

const SYSTEM_PROMPT: &str = "You are a classification assistant. You will be given text snippets \
and must classify each by sentiment. Respond with exactly one label per text: 'positive', \
'negative', or 'neutral'.";

const POSITIVE: [&str; 10] = [
    "I absolutely loved this product, it exceeded all my expectations!",
    "What a wonderful experience, I would highly recommend it.",
    "The service was outstanding and the staff were incredibly helpful.",
    "This is the best purchase I've made this year, truly amazing quality.",
    "I'm so happy with the results, everything worked perfectly.",
    "Fantastic quality and great value for money.",
    "This made my day so much better, truly a delight.",
    "Exceeded my expectations in every way possible.",
    "The team did an incredible job, very professional.",
    "I can't say enough good things about this product.",
];

const NEGATIVE: [&str; 10] = [
    "Terrible experience, I would never recommend this to anyone.",
    "The quality was extremely poor and not worth the money.",
    "I'm very disappointed with the service, it was awful.",
    "This product broke after just one day of use, completely useless.",
    "Worst purchase I've ever made, total waste of money.",
    "The customer support was unhelpful and rude.",
    "Nothing worked as advertised, very frustrating.",
    "I regret buying this, it's a complete disaster.",
    "The food was cold and tasteless, terrible restaurant.",
    "Absolutely horrible quality, do not buy this.",
];

const NEUTRAL: [&str; 10] = [
    "The product arrived on time and was as described.",
    "It's an average product, nothing special but it works.",
    "The service was okay, neither great nor terrible.",
    "I received my order today, it matches the description.",
    "It's a standard item that does what it's supposed to do.",
    "The experience was unremarkable, just average overall.",
    "Nothing noteworthy to report, everything was normal.",
    "The product is functional but has no standout features.",
    "A typical purchase, no complaints but no praise either.",
    "It meets basic requirements but doesn't exceed them.",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub text: String,
    pub label: &'static str,
}

/// The 200-item synthetic sentiment set: every template, two reworded
/// variants of each, then numbered repeats until the set is full.
pub fn builtin_dataset() -> Vec<Example> {
    let mut dataset = Vec::with_capacity(DATASET_SIZE);
    for (label, templates) in LABELS.into_iter().zip([POSITIVE, NEGATIVE, NEUTRAL]) {
        for template in templates {
            let stem = template.trim_end_matches(['.', '!']);
            for text in [
                template.to_string(),
                format!("{stem}. Overall, my feelings are clear."),
                format!("{stem}. This is my honest review."),
            ] {
                dataset.push(Example { text, label });
            }
        }
    }
    let base = dataset.len();
    for i in base..DATASET_SIZE {
        let source = &dataset[i % base];
        let text = format!("{} (review #{i})", source.text);
        let label = source.label;
        dataset.push(Example { text, label });
    }
    dataset
}

/// Seeded 80/20 split of the dataset into (train, test).
fn split(dataset: &[Example], seed: u64) -> (Vec<Example>, Vec<Example>) {
    let mut shuffled = dataset.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
    let test = shuffled.split_off(shuffled.len() * 8 / 10);
    (shuffled, test)
}

/// Maps a free-text answer onto a label: exact word, then prefix, then the
/// closest label within two edits.
pub fn parse_label(answer: &str) -> Option<&'static str> {
    let words: Vec<String> = answer
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    if let Some(label) = LABELS.into_iter().find(|label| words.iter().any(|w| w == label)) {
        return Some(label);
    }
    if let Some(label) = LABELS
        .into_iter()
        .find(|label| words.iter().any(|w| w.len() >= 3 && label.starts_with(w.as_str())))
    {
        return Some(label);
    }
    let mut best: Option<(&'static str, usize)> = None;
    for label in LABELS {
        for word in &words {
            let distance = strsim::levenshtein(word, label);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((label, distance));
            }
        }
    }
    best.filter(|(_, d)| *d <= 2).map(|(label, _)| label)
}

/// Labels by position within a batch. Lines may carry a `[n]` marker;
/// unmarked lines fill the first open position.
fn parse_batch_reply(reply: &str, batch_len: usize) -> Vec<Option<&'static str>> {
    let mut labels: Vec<Option<&'static str>> = vec![None; batch_len];
    for line in reply.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let marked = line
            .strip_prefix('[')
            .and_then(|rest| rest.split_once(']'))
            .and_then(|(n, rest)| n.trim().parse::<usize>().ok().map(|n| (n, rest)));
        let (position, rest) = match marked {
            Some((n, rest)) if n >= 1 => (Some(n - 1), rest),
            _ => (labels.iter().position(Option::is_none), line),
        };
        let (Some(position), Some(label)) = (position, parse_label(rest)) else {
            continue;
        };
        if let Some(slot) = labels.get_mut(position) {
            if slot.is_none() {
                *slot = Some(label);
            }
        }
    }
    labels
}

fn batch_prompt(batch: &[Example]) -> String {
    let lines: Vec<String> = batch
        .iter()
        .enumerate()
        .map(|(i, example)| format!("[{}] {}", i + 1, example.text))
        .collect();
    format!("{BATCH_HEADER}\n{}", lines.join("\n"))
}

pub struct ClassificationScenario {
    config: ScenarioConfig,
    dataset: Vec<Example>,
}

impl Default for ClassificationScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassificationScenario {
    pub fn new() -> Self {
        Self::with_dataset(builtin_dataset())
    }

    pub fn with_dataset(dataset: Vec<Example>) -> Self {
        Self {
            config: ScenarioConfig::new(TaskFamily::Classification, "sentiment", "Sentiment Classification")
                .with_description(
                    "Label held-out snippets as positive, negative or neutral without seeing \
                     ground truth. Scored by accuracy within the budget.",
                ),
            dataset,
        }
    }

    fn batch_count(&self) -> usize {
        let test = self.dataset.len() - self.dataset.len() * 8 / 10;
        test.div_ceil(BATCH_SIZE)
    }

    fn instruction(train: &[Example]) -> String {
        let mut shots: Vec<&Example> = Vec::new();
        for label in LABELS {
            if let Some(example) = train.iter().find(|e| e.label == label) {
                shots.push(example);
            }
        }
        let examples: Vec<String> = shots
            .iter()
            .take(FEW_SHOT)
            .map(|e| format!("Example: \"{}\" -> {}", e.text, e.label))
            .collect();
        format!(
            "I need you to classify text snippets by sentiment. For each numbered text, answer \
             on its own line as `[n] label` where label is 'positive', 'negative' or 'neutral'.\n{}",
            examples.join("\n")
        )
    }
}

impl Scenario for ClassificationScenario {
    fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn setup(&self, _seed: u64) -> Vec<ChatMessage> {
        vec![ChatMessage::system(SYSTEM_PROMPT)]
    }

    /// Instruction with a few labelled training examples, then one prompt
    /// per batch of held-out texts.
    fn prompter(&self, seed: u64) -> Box<dyn Prompter> {
        let (train, test) = split(&self.dataset, seed);
        let mut prompts = vec![Self::instruction(&train)];
        prompts.extend(test.chunks(BATCH_SIZE).map(batch_prompt));
        Box::new(ScriptedPrompter::new(prompts))
    }

    /// Done once every batch has been answered.
    fn check_termination(&self, messages: &[ChatMessage], _turn: usize, _tokens_used: u64) -> bool {
        let batches_sent = messages
            .iter()
            .filter(|m| m.role == MessageRole::User && m.text().is_some_and(|t| t.starts_with(BATCH_HEADER)))
            .count();
        let answered = messages
            .last()
            .is_some_and(|m| m.is_reply());
        batches_sent >= self.batch_count() && answered
    }

    fn grade(&self, result: &ScenarioResult) -> MetricMap {
        let (_, test) = split(&self.dataset, result.seed);
        let batches: Vec<&[Example]> = test.chunks(BATCH_SIZE).collect();

        let mut prompted = 0usize;
        let mut predictions = 0usize;
        let mut correct = 0usize;
        let mut answered_batches = 0usize;
        let mut well_formed = 0usize;
        let mut sent = 0usize;
        let mut awaiting: Option<usize> = None;

        for message in &result.messages {
            match message.role {
                MessageRole::User if message.text().is_some_and(|t| t.starts_with(BATCH_HEADER)) => {
                    awaiting = Some(sent);
                    sent += 1;
                }
                MessageRole::Assistant if message.tool_calls.is_empty() => {
                    let Some(batch) = awaiting.take().and_then(|i| batches.get(i)) else {
                        continue;
                    };
                    let labels = parse_batch_reply(message.text().unwrap_or_default(), batch.len());
                    answered_batches += 1;
                    prompted += batch.len();
                    if labels.iter().all(Option::is_some) {
                        well_formed += 1;
                    }
                    for (label, example) in labels.iter().zip(batch.iter()) {
                        if let Some(label) = label {
                            predictions += 1;
                            if *label == example.label {
                                correct += 1;
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let accuracy = ratio(correct, prompted);
        let success = accuracy > 0.5;
        let efficiency = if predictions == 0 {
            0.0
        } else {
            let per_prediction = result.budget.tokens_used as f64 / predictions as f64;
            (1.0 - per_prediction / 500.0).max(0.0)
        };

        MetricMap::from([
            ("task_success".to_string(), bool_metric(success)),
            ("accuracy".to_string(), accuracy),
            ("consistency".to_string(), ratio(well_formed, answered_batches)),
            ("efficiency".to_string(), efficiency),
            ("predictions_made".to_string(), predictions as f64),
            ("recovery_rate".to_string(), bool_metric(success && result.had_errors())),
        ])
    }
}

pub(crate) fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub(crate) fn bool_metric(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_is_full_and_balanced_in_templates() {
        let dataset = builtin_dataset();
        assert_eq!(dataset.len(), DATASET_SIZE);
        for label in LABELS {
            assert!(dataset.iter().filter(|e| e.label == label).count() >= 60);
        }
    }

    #[test]
    fn split_depends_only_on_seed() {
        let dataset = builtin_dataset();
        let (train, test) = split(&dataset, 3);
        assert_eq!((train.len(), test.len()), (160, 40));
        assert_eq!(split(&dataset, 3).1, test);
        assert_ne!(split(&dataset, 4).1, test);
    }

    #[test]
    fn labels_tolerate_noise() {
        assert_eq!(parse_label("Positive."), Some("positive"));
        assert_eq!(parse_label("neg"), Some("negative"));
        assert_eq!(parse_label("nuetral"), Some("neutral"));
        assert_eq!(parse_label("banana"), None);
    }

    #[test]
    fn batch_reply_respects_markers() {
        let labels = parse_batch_reply("[2] negative\n[1] positive\nneutral", 3);
        assert_eq!(labels, vec![Some("positive"), Some("negative"), Some("neutral")]);
    }

    #[test]
    fn perfect_answers_grade_to_full_accuracy() {
        let scenario = ClassificationScenario::new();
        let (_, test) = split(&scenario.dataset, 0);
        let mut messages = scenario.setup(0);
        for batch in test.chunks(BATCH_SIZE) {
            messages.push(ChatMessage::user(batch_prompt(batch)));
            let reply: Vec<String> = batch
                .iter()
                .enumerate()
                .map(|(i, e)| format!("[{}] {}", i + 1, e.label))
                .collect();
            messages.push(ChatMessage::assistant(reply.join("\n")));
        }
        assert!(scenario.check_termination(&messages, 8, 0));

        let result = ScenarioResult {
            scenario_id: ID.to_string(),
            seed: 0,
            messages,
            budget: Default::default(),
            termination: crate::scenario::TerminationReason::Success,
            tool_calls: Vec::new(),
            model_errors: 0,
        };
        let metrics = scenario.grade(&result);
        assert_eq!(metrics["accuracy"], 1.0);
        assert_eq!(metrics["predictions_made"], 40.0);
        assert_eq!(metrics["consistency"], 1.0);
        assert_eq!(metrics["task_success"], 1.0);
    }

    #[test]
    fn empty_result_reports_the_same_metric_names() {
        let scenario = ClassificationScenario::new();
        let result = ScenarioResult {
            scenario_id: ID.to_string(),
            seed: 0,
            messages: scenario.setup(0),
            budget: Default::default(),
            termination: crate::scenario::TerminationReason::BudgetExhausted,
            tool_calls: Vec::new(),
            model_errors: 0,
        };
        let metrics = scenario.grade(&result);
        assert_eq!(metrics.len(), 6);
        assert_eq!(metrics["accuracy"], 0.0);
    }
}
