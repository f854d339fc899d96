//! Config command - Show the effective configuration

use clap::Args;
use colored::Colorize;
use experiment_config::EngineConfig;

#[derive(Args, Debug, Clone)]
pub struct ConfigCommand {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

impl ConfigCommand {
    pub fn execute(&self, config: &EngineConfig) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(config)?);
            return Ok(());
        }

        for (section, entries) in sections(config) {
            println!("{}", section.bold().cyan());
            for (key, value) in entries {
                println!("  {:<20} {}", key, value.green());
            }
        }
        Ok(())
    }
}

fn sections(config: &EngineConfig) -> Vec<(&'static str, Vec<(&'static str, String)>)> {
    vec![
        (
            "scheduler",
            vec![
                ("enabled", config.scheduler.enabled.to_string()),
                ("interval_secs", config.scheduler.interval_secs.to_string()),
                ("tick_budget_secs", config.scheduler.tick_budget_secs.to_string()),
            ],
        ),
        (
            "defaults",
            vec![
                ("min_sample_size", config.defaults.min_sample_size.to_string()),
                ("min_confidence", config.defaults.min_confidence.to_string()),
                ("max_duration_days", config.defaults.max_duration_days.to_string()),
            ],
        ),
        (
            "significance",
            vec![(
                "winner_policy",
                serde_json::to_value(config.significance.winner_policy)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            )],
        ),
        (
            "observability",
            vec![
                ("log_level", config.observability.log_level.clone()),
                ("json_logging", config.observability.json_logging.to_string()),
            ],
        ),
    ]
}
