//! Command Scorer - Language metrics computed by an external bridge process
//!
//! Protocol (one process per call):
//! `<cmd> <args...> --metric <name> [--df <corpus>]`
//! stdin:  `{"metric": "cider", "gts": [{"image_id", "captions"}], "res": [...]}`
//! stdout: `{"scores": [{"method": "CIDEr", "corpus": 0.9, "per_image": [...]}]}`
//!
//! `<cmd> <args...> --tokenize`
//! stdin:  `{"captions": [{"image_id", "captions"}]}`
//! stdout: `{"captions": [...]}`, same images in the same order

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;

use super::coco::{CaptionTokenizer, ImageCaptions, MethodScore, Metric, Scorer, ScorerFactory};

#[derive(Serialize)]
struct ScoreRequest<'a> {
    metric: &'a str,
    gts: &'a [ImageCaptions],
    res: &'a [ImageCaptions],
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<MethodScore>,
}

#[derive(Serialize, Deserialize)]
struct TokenizeMessage {
    captions: Vec<ImageCaptions>,
}

fn bridge_command(program: &str, args: &[String]) -> Command {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Run one bridge call. The request is written from its own thread so a
/// child that logs heavily before draining stdin cannot deadlock us.
fn exchange(mut command: Command, request: Vec<u8>, what: &str) -> Result<Vec<u8>> {
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to start {} bridge {:?}", what, command.get_program()))?;
    let mut stdin = child
        .stdin
        .take()
        .context("Bridge stdin was not captured")?;
    let writer = thread::spawn(move || -> std::io::Result<()> {
        stdin.write_all(&request)?;
        stdin.flush()
    });

    let output = child.wait_with_output()?;
    let written = writer
        .join()
        .map_err(|_| anyhow::anyhow!("{} bridge writer panicked", what))?;
    if !output.status.success() {
        anyhow::bail!(
            "{} bridge {:?} failed with {}: {}",
            what,
            command.get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    written.with_context(|| format!("Failed to send the {} request", what))?;
    Ok(output.stdout)
}

pub struct CommandScorer {
    metric: Metric,
    program: String,
    args: Vec<String>,
    /// Document-frequency corpus for CIDEr-D
    df: Option<String>,
}

impl CommandScorer {
    pub fn new(metric: Metric, program: &str, args: &[String], df: Option<String>) -> Self {
        Self {
            metric,
            program: program.to_string(),
            args: args.to_vec(),
            df,
        }
    }

    fn command(&self) -> Command {
        let mut command = bridge_command(&self.program, &self.args);
        command.arg("--metric").arg(self.metric.name());
        if let Some(ref df) = self.df {
            command.arg("--df").arg(df);
        }
        command
    }
}

impl Scorer for CommandScorer {
    fn metric(&self) -> Metric {
        self.metric
    }

    fn compute_score(
        &mut self,
        gts: &[ImageCaptions],
        res: &[ImageCaptions],
    ) -> Result<Vec<MethodScore>> {
        let request = serde_json::to_vec(&ScoreRequest {
            metric: self.metric.name(),
            gts,
            res,
        })?;
        let stdout = exchange(self.command(), request, self.metric.name())?;

        let response: ScoreResponse = serde_json::from_slice(&stdout)
            .with_context(|| format!("Malformed {} scorer output", self.metric))?;
        for score in &response.scores {
            anyhow::ensure!(
                self.metric.methods().contains(&score.method.as_str()),
                "Scorer for {} reported unexpected method '{}'",
                self.metric,
                score.method
            );
        }
        Ok(response.scores)
    }
}

/// PTB tokenization done by the same bridge that computes the metrics
pub struct CommandTokenizer {
    program: String,
    args: Vec<String>,
}

impl CommandTokenizer {
    pub fn new(program: &str, args: &[String]) -> Self {
        Self {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }
}

impl CaptionTokenizer for CommandTokenizer {
    fn tokenize(&self, captions: &[ImageCaptions]) -> Result<Vec<ImageCaptions>> {
        let request = serde_json::to_vec(&TokenizeMessage {
            captions: captions.to_vec(),
        })?;
        let mut command = bridge_command(&self.program, &self.args);
        command.arg("--tokenize");
        let stdout = exchange(command, request, "tokenize")?;

        let response: TokenizeMessage =
            serde_json::from_slice(&stdout).context("Malformed tokenizer output")?;
        anyhow::ensure!(
            response.captions.len() == captions.len()
                && response
                    .captions
                    .iter()
                    .zip(captions)
                    .all(|(out, inp)| out.image_id == inp.image_id
                        && out.captions.len() == inp.captions.len()),
            "Tokenizer returned {} entries that do not match the {} sent",
            response.captions.len(),
            captions.len()
        );
        Ok(response.captions)
    }
}

/// Builds a `CommandScorer` per metric; CIDEr gets `cached_tokens` as its
/// document frequencies when set.
pub struct CommandScorerFactory {
    pub program: String,
    pub args: Vec<String>,
    pub cached_tokens: Option<String>,
}

impl ScorerFactory for CommandScorerFactory {
    fn build(&self, metric: Metric) -> Result<Box<dyn Scorer>> {
        let df = match metric {
            Metric::Cider => self.cached_tokens.clone(),
            _ => None,
        };
        Ok(Box::new(CommandScorer::new(
            metric,
            &self.program,
            &self.args,
            df,
        )))
    }

    fn tokenizer(&self) -> Result<Box<dyn CaptionTokenizer>> {
        Ok(Box::new(CommandTokenizer::new(&self.program, &self.args)))
    }
}
