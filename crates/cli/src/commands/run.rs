//! Run command - Drive the background scheduler
//!
//! Stores are in-memory: experiments can be seeded from a JSON file, in
//! which case each variation's recorded visitors and conversions are
//! replayed as session records so the scheduler recomputes them.

use clap::Args;
use colored::Colorize;
use decision::{
    BackgroundScheduler, ExperimentStore, MemoryExperimentStore, MemorySessionStore, SystemClock,
    TickReport,
};
use experiment_config::EngineConfig;
use experiment_types::Experiment;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::load_experiments;

#[derive(Args, Debug, Clone)]
pub struct RunCommand {
    /// Experiments to load before starting (single object or array)
    #[arg(long, short, value_name = "PATH")]
    pub seed: Option<PathBuf>,

    /// Run a single sweep and exit
    #[arg(long)]
    pub once: bool,
}

impl RunCommand {
    pub async fn execute(&self, config: &EngineConfig) -> anyhow::Result<()> {
        let store = MemoryExperimentStore::new();
        let sessions = MemorySessionStore::new();

        if let Some(path) = &self.seed {
            let experiments = load_experiments(path)?;
            let count = seed_stores(experiments, &store, &sessions).await?;
            info!(count, path = %path.display(), "Seeded experiments");
        }

        let scheduler = Arc::new(BackgroundScheduler::from_config(
            config,
            Arc::new(store.clone()),
            Arc::new(sessions),
            Arc::new(SystemClock),
        ));

        if self.once {
            let report = scheduler.run_tick().await;
            print_report(&report);
            return Ok(());
        }

        if !config.scheduler.enabled {
            warn!("Scheduler is disabled in configuration, nothing to run");
            return Ok(());
        }

        println!(
            "{} sweeping every {}s (budget {}s), press Ctrl-C to stop",
            "Scheduler started:".green().bold(),
            config.scheduler.interval_secs,
            config.scheduler.tick_budget_secs
        );

        let handle = scheduler.clone().spawn();
        tokio::signal::ctrl_c().await?;
        handle.shutdown().await;

        let stats = scheduler.stats();
        println!(
            "{} {} ticks ({} skipped), {} experiments completed, {} failures",
            "Scheduler stopped:".cyan().bold(),
            stats.ticks_run,
            stats.ticks_skipped,
            stats.experiments_completed,
            stats.experiment_failures
        );
        Ok(())
    }
}

/// Load experiments into the stores, replaying their counts as sessions
pub async fn seed_stores(
    experiments: Vec<Experiment>,
    store: &MemoryExperimentStore,
    sessions: &MemorySessionStore,
) -> anyhow::Result<usize> {
    let count = experiments.len();
    for experiment in experiments {
        for variation in &experiment.variations {
            if variation.conversions > variation.visitors {
                anyhow::bail!(
                    "variation '{}' of experiment {} has more conversions than visitors",
                    variation.name,
                    experiment.id
                );
            }
            sessions.seed_variation(
                experiment.id,
                &variation.name,
                variation.visitors,
                variation.conversions,
            );
        }
        store.insert(experiment).await?;
    }
    Ok(count)
}

fn print_report(report: &TickReport) {
    println!("{}", "Sweep finished".bold().cyan());
    println!("  evaluated: {}", report.evaluated);
    println!("  completed: {}", report.completed.to_string().green());
    if report.conflicts > 0 {
        println!("  conflicts: {}", report.conflicts);
    }
    if report.failed > 0 {
        println!("  failed:    {}", report.failed.to_string().red());
    }
    if report.deferred > 0 {
        println!("  deferred:  {}", report.deferred.to_string().yellow());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use experiment_types::ExperimentStatus;
    use std::io::Write;

    const SEED: &str = r#"[
        {
            "id": "6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f",
            "website_id": "site-1",
            "name": "Pricing headline",
            "status": "active",
            "variations": [
                {"name": "control", "is_control": true, "traffic_percentage": 50, "visitors": 1000, "conversions": 100},
                {"name": "bold", "traffic_percentage": 50, "visitors": 1000, "conversions": 140}
            ],
            "start_date": "2026-01-05T09:00:00Z",
            "created_at": "2026-01-05T09:00:00Z",
            "updated_at": "2026-01-05T09:00:00Z"
        },
        {
            "id": "0a1b2c3d-4e5f-4a6b-9c7d-8e9f0a1b2c3d",
            "website_id": "site-1",
            "name": "Footer links",
            "status": "draft",
            "variations": [
                {"name": "control", "traffic_percentage": 50},
                {"name": "compact", "traffic_percentage": 50}
            ],
            "created_at": "2026-01-06T09:00:00Z",
            "updated_at": "2026-01-06T09:00:00Z"
        }
    ]"#;

    #[tokio::test]
    async fn test_seed_and_single_sweep() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let store = MemoryExperimentStore::new();
        let sessions = MemorySessionStore::new();
        let experiments = load_experiments(file.path()).unwrap();
        let seeded = seed_stores(experiments, &store, &sessions).await.unwrap();
        assert_eq!(seeded, 2);

        let scheduler = BackgroundScheduler::from_config(
            &EngineConfig::default(),
            Arc::new(store.clone()),
            Arc::new(sessions),
            Arc::new(SystemClock),
        );
        let report = scheduler.run_tick().await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.completed, 1);

        let id = "6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f".parse().unwrap();
        let done = store.get(&id).await.unwrap().unwrap();
        assert_eq!(done.status, ExperimentStatus::Completed);
        assert_eq!(done.results.unwrap().winner, "bold");
    }

    #[tokio::test]
    async fn test_seed_rejects_impossible_counts() {
        let mut experiments: Vec<Experiment> = serde_json::from_str(SEED).unwrap();
        experiments[0].variations[0].conversions = 5000;

        let result = seed_stores(
            experiments,
            &MemoryExperimentStore::new(),
            &MemorySessionStore::new(),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_once_command() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();

        let cmd = RunCommand {
            seed: Some(file.path().to_path_buf()),
            once: true,
        };
        assert!(cmd.execute(&EngineConfig::default()).await.is_ok());
    }
}
