//! Evaluate command - Offline significance check for an experiment snapshot
//!
//! Reads variation counts from a JSON file and prints every challenger's
//! comparison against control along with the winner the engine would pick.

use chrono::Utc;
use clap::{Args, ValueEnum};
use colored::Colorize;
use decision::{default_settings, Comparison, SignificanceEngine};
use experiment_config::{EngineConfig, WinnerPolicy};
use experiment_types::{Experiment, SettingsRequest, Variation, WinnerResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::read_json;

/// Counts to evaluate, without the rest of the experiment
#[derive(Debug, Clone, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_name")]
    pub name: String,
    pub variations: Vec<Variation>,
    /// Missing fields fall back to configured defaults
    #[serde(default)]
    pub settings: SettingsRequest,
}

fn default_name() -> String {
    "snapshot".to_string()
}

impl Snapshot {
    /// Build an experiment with derived rates recomputed from counts
    pub fn into_experiment(self, config: &EngineConfig) -> Experiment {
        let settings = self.settings.resolve(&default_settings(&config.defaults));
        let variations = self
            .variations
            .into_iter()
            .map(|v| {
                let (visitors, conversions) = (v.visitors, v.conversions);
                v.with_counts(visitors, conversions)
            })
            .collect();
        Experiment::new("offline", self.name, variations, settings, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PolicyArg {
    FirstSignificant,
    HighestConfidence,
}

impl From<PolicyArg> for WinnerPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstSignificant => WinnerPolicy::FirstSignificant,
            PolicyArg::HighestConfidence => WinnerPolicy::HighestConfidence,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct EvaluateCommand {
    /// Snapshot file with variations and optional settings
    #[arg(long, short, value_name = "PATH")]
    pub file: PathBuf,

    /// Override the configured winner policy
    #[arg(long, value_enum)]
    pub policy: Option<PolicyArg>,

    /// Print the evaluation as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
pub struct Evaluation {
    pub comparisons: Vec<Comparison>,
    pub winner: Option<WinnerResult>,
}

impl EvaluateCommand {
    pub fn execute(&self, config: &EngineConfig) -> anyhow::Result<()> {
        let snapshot: Snapshot = read_json(&self.file)?;
        let experiment = snapshot.into_experiment(config);
        let evaluation = self.evaluate(&experiment, config);

        if self.json {
            println!("{}", serde_json::to_string_pretty(&evaluation)?);
        } else {
            print_evaluation(&experiment, &evaluation);
        }
        Ok(())
    }

    pub fn evaluate(&self, experiment: &Experiment, config: &EngineConfig) -> Evaluation {
        let policy = self
            .policy
            .map(WinnerPolicy::from)
            .unwrap_or(config.significance.winner_policy);
        let engine = SignificanceEngine::new(policy);

        Evaluation {
            comparisons: engine.comparisons(experiment),
            winner: engine.evaluate(experiment),
        }
    }
}

fn print_evaluation(experiment: &Experiment, evaluation: &Evaluation) {
    println!("{}", format!("Experiment: {}", experiment.name).bold().cyan());
    println!(
        "Minimum sample size {}, minimum confidence {}%",
        experiment.settings.min_sample_size, experiment.settings.min_confidence
    );
    println!("{}", "-".repeat(60));

    for variation in &experiment.variations {
        let label = if variation.is_control {
            format!("{} (control)", variation.name).dimmed()
        } else {
            variation.name.normal()
        };
        println!(
            "  {:<28} {:>8} visitors {:>8} conversions {:>7.2}%",
            label, variation.visitors, variation.conversions, variation.conversion_rate
        );

        if let Some(c) = evaluation
            .comparisons
            .iter()
            .find(|c| c.variation == variation.name)
        {
            let confidence = format!("{:.2}%", c.confidence);
            let confidence = if c.significant {
                confidence.green()
            } else {
                confidence.yellow()
            };
            println!(
                "      z = {:.4}, p = {:.6}, confidence {}, improvement {:.2}%",
                c.z_score, c.p_value, confidence, c.improvement
            );
        }
    }

    println!();
    match &evaluation.winner {
        Some(winner) => println!(
            "{} {} ({:.2}% confidence, {:.2}% improvement)",
            "Winner:".green().bold(),
            winner.winner,
            winner.confidence,
            winner.improvement
        ),
        None => println!("{}", "No significant winner yet".yellow()),
    }
}
