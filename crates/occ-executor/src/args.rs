//! Parallel execution arguments and configuration.
//!
//! | Flag | Env | Default | Description |
//! |------|-----|---------|-------------|
//! | `--occ.workers` | `OCC_WORKERS` | `0` | Worker threads per pool, `0` or negative for one per task |
//! | `--occ.max-rounds` | `OCC_MAX_ROUNDS` | `10` | Parallel rounds before the sequential fallback |
//! | `--occ.commit-failed-writes` | | `false` | Keep writes of tasks that report failure |

use anyhow::{anyhow, Result};
use derive_more::Display;
use serde::Deserialize;
use std::path::Path;

const DEFAULT_WORKERS: i64 = 0;
const DEFAULT_MAX_ROUNDS: usize = 10;
const DEFAULT_COMMIT_FAILED_WRITES: bool = false;

/// Parameters for optimistic parallel execution
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
#[command(next_help_heading = "Parallel Execution")]
pub struct ParallelExecutionArgs {
    /// Worker threads per execution and validation pool
    #[arg(
        long = "occ.workers",
        env = "OCC_WORKERS",
        default_value_t = DEFAULT_WORKERS,
        allow_negative_numbers = true
    )]
    pub workers: i64,

    /// Parallel rounds before the remaining transactions run sequentially
    #[arg(
        long = "occ.max-rounds",
        env = "OCC_MAX_ROUNDS",
        default_value_t = DEFAULT_MAX_ROUNDS
    )]
    pub max_rounds: usize,

    /// Commit the writes of validated transactions that report failure
    #[arg(long = "occ.commit-failed-writes", default_value_t = DEFAULT_COMMIT_FAILED_WRITES)]
    pub commit_failed_writes: bool,
}

impl Default for ParallelExecutionArgs {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_rounds: DEFAULT_MAX_ROUNDS,
            commit_failed_writes: DEFAULT_COMMIT_FAILED_WRITES,
        }
    }
}

/// Which validated transactions have their writes committed.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Writes of a transaction whose response reports failure are discarded.
    #[default]
    #[display("successful_only")]
    SuccessfulOnly,
    /// Writes of every validated transaction are kept.
    #[display("all_validated")]
    AllValidated,
}

/// Executor configuration, built from [`ParallelExecutionArgs`] or loaded from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads per pool, `0` for one per task
    pub workers: usize,
    /// Parallel rounds before the sequential fallback
    pub max_rounds: usize,
    pub commit_policy: CommitPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_rounds: DEFAULT_MAX_ROUNDS,
            commit_policy: CommitPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow!(
                "Failed to read executor config file {}: {}",
                path.display(),
                e
            )
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            anyhow!(
                "Failed to parse executor config file {}: {}",
                path.display(),
                e
            )
        })?;

        Ok(config)
    }

    /// Threads to spawn for a pool of `num_tasks` tasks.
    pub fn workers_for(&self, num_tasks: usize) -> usize {
        if self.workers == 0 {
            num_tasks
        } else {
            self.workers.min(num_tasks)
        }
    }
}

impl From<&ParallelExecutionArgs> for ExecutorConfig {
    fn from(args: &ParallelExecutionArgs) -> Self {
        Self {
            workers: usize::try_from(args.workers).unwrap_or(0),
            max_rounds: args.max_rounds,
            commit_policy: if args.commit_failed_writes {
                CommitPolicy::AllValidated
            } else {
                CommitPolicy::SuccessfulOnly
            },
        }
    }
}
