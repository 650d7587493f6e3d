//! Strategy scheduler: per-strategy timers with jitter, persisted run
//! leases and a bounded worker pool.

use super::decision::{Decision, ProviderRegistry};
use super::model::Strategy;
use super::pipeline::SubmissionPipeline;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::exchange::{ExchangeClient, ResilientExchange};
use crate::persistence::Store;
use crate::utils::{shutdown_requested, ServiceHandle};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-symbol failure inside a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolFailure {
    pub symbol: String,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub strategy_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub evaluated: usize,
    pub no_ops: usize,
    /// Bracket group ids (or entry client ids) placed in this run
    pub submitted: Vec<String>,
    pub failures: Vec<SymbolFailure>,
}

impl RunReport {
    fn new(strategy_id: &str) -> Self {
        let now = Utc::now();
        Self {
            strategy_id: strategy_id.to_string(),
            started_at: now,
            finished_at: now,
            evaluated: 0,
            no_ops: 0,
            submitted: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, symbol: &str, err: &Error) {
        self.failures.push(SymbolFailure {
            symbol: symbol.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run holds the strategy's lease
    Skipped,
    Completed(RunReport),
}

pub struct StrategyScheduler {
    store: Store,
    exchange: ResilientExchange,
    providers: ProviderRegistry,
    pipeline: Arc<SubmissionPipeline>,
    config: SchedulerConfig,
    /// Identifies this process in lease rows
    instance_id: String,
    workers: Arc<Semaphore>,
}

impl StrategyScheduler {
    pub fn new(
        store: Store,
        exchange: ResilientExchange,
        providers: ProviderRegistry,
        pipeline: Arc<SubmissionPipeline>,
        config: SchedulerConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            store,
            exchange,
            providers,
            pipeline,
            config,
            instance_id: Uuid::new_v4().simple().to_string(),
            workers,
        }
    }

    /// Run one evaluation of `strategy_id` now, unless a run already holds
    /// its lease. The lease is released and last-run updated whatever the
    /// run's outcome.
    pub async fn evaluate_once(&self, strategy_id: &str) -> Result<RunOutcome> {
        let strategy = self
            .store
            .get_strategy(strategy_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("strategy {:?}", strategy_id)))?;

        let holder = format!("{}:{}", self.instance_id, Uuid::new_v4().simple());
        if !self
            .store
            .try_acquire_lease(&strategy.id, &holder, self.config.lease_ttl())
            .await?
        {
            debug!(strategy_id = %strategy.id, "Run already in flight, skipping");
            return Ok(RunOutcome::Skipped);
        }

        let result = self.run(&strategy).await;

        if let Err(e) = self.store.touch_last_run(&strategy.id, Utc::now()).await {
            warn!(strategy_id = %strategy.id, error = %e, "Failed to record last run");
        }
        match self.store.release_lease(&strategy.id, &holder).await {
            Ok(true) => {}
            Ok(false) => warn!(
                strategy_id = %strategy.id,
                "Lease expired before the run finished"
            ),
            Err(e) => warn!(strategy_id = %strategy.id, error = %e, "Failed to release lease"),
        }

        let report = result?;
        info!(
            strategy_id = %report.strategy_id,
            evaluated = report.evaluated,
            submitted = report.submitted.len(),
            no_ops = report.no_ops,
            failures = report.failures.len(),
            "Strategy run complete"
        );
        Ok(RunOutcome::Completed(report))
    }

    async fn run(&self, strategy: &Strategy) -> Result<RunReport> {
        let provider = self.providers.get(&strategy.kind)?;
        let mut report = RunReport::new(&strategy.id);

        for symbol in &strategy.symbols {
            report.evaluated += 1;

            let snapshot = match self.exchange.market_snapshot(symbol).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    let err = Error::from(e);
                    warn!(strategy_id = %strategy.id, %symbol, error = %err, "No market snapshot");
                    report.fail(symbol, &err);
                    continue;
                }
            };

            let decision = match tokio::time::timeout(
                self.config.decision_timeout(),
                provider.evaluate(symbol, &snapshot, &strategy.params),
            )
            .await
            {
                Ok(Ok(decision)) => decision,
                Ok(Err(e)) => {
                    warn!(strategy_id = %strategy.id, %symbol, error = %e, "Decision provider failed");
                    report.fail(symbol, &e);
                    report.no_ops += 1;
                    continue;
                }
                Err(_) => {
                    warn!(
                        strategy_id = %strategy.id,
                        %symbol,
                        timeout_ms = self.config.decision_timeout_ms,
                        "Decision provider timed out, treating as no-op"
                    );
                    Decision::no_op("decision timed out")
                }
            };

            if decision.action.side().is_none() {
                debug!(strategy_id = %strategy.id, %symbol, reason = %decision.reason, "No-op");
                report.no_ops += 1;
                continue;
            }

            match self
                .pipeline
                .submit(strategy, symbol, &decision, snapshot.last_price)
                .await
            {
                Ok(submission) => report.submitted.push(submission.id().to_string()),
                Err(e) => {
                    error!(
                        strategy_id = %strategy.id,
                        %symbol,
                        error = %e,
                        kind = e.kind(),
                        "Submission failed"
                    );
                    report.fail(symbol, &e);
                }
            }
        }

        report.finished_at = Utc::now();
        Ok(report)
    }

    fn next_due(&self, strategy: &Strategy, from: Instant) -> Instant {
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        from + strategy.interval() + Duration::from_millis(jitter)
    }

    /// First due time for a strategy seen by this process.
    fn initial_due(&self, strategy: &Strategy, now: Instant) -> Instant {
        let Some(last_run) = strategy.last_run_at else {
            return now;
        };
        let elapsed = (Utc::now() - last_run).to_std().unwrap_or(Duration::ZERO);
        match strategy.interval().checked_sub(elapsed) {
            Some(remaining) => now + remaining,
            None => now,
        }
    }

    /// Poll for due strategies until stopped. In-flight runs finish before
    /// the handle's `stop` returns.
    pub fn start(self: Arc<Self>) -> ServiceHandle {
        ServiceHandle::spawn("scheduler", move |mut shutdown| async move {
            let mut poll = tokio::time::interval(self.config.poll_interval());
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut due: HashMap<String, Instant> = HashMap::new();
            let mut runs: JoinSet<()> = JoinSet::new();

            info!(
                max_concurrent_runs = self.config.max_concurrent_runs,
                instance_id = %self.instance_id,
                "Strategy scheduler running"
            );

            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        self.dispatch_due(&mut due, &mut runs).await;
                    }
                    Some(joined) = runs.join_next(), if !runs.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "Strategy run task failed");
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }

            if !runs.is_empty() {
                info!(in_flight = runs.len(), "Waiting for in-flight strategy runs");
            }
            while let Some(joined) = runs.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Strategy run task failed");
                }
            }
        })
    }

    async fn dispatch_due(self: &Arc<Self>, due: &mut HashMap<String, Instant>, runs: &mut JoinSet<()>) {
        let strategies = match self.store.list_enabled_strategies().await {
            Ok(strategies) => strategies,
            Err(e) => {
                error!(error = %e, "Failed to load strategies");
                return;
            }
        };

        let now = Instant::now();
        due.retain(|id, _| strategies.iter().any(|s| &s.id == id));

        for strategy in strategies {
            let next = *due
                .entry(strategy.id.clone())
                .or_insert_with(|| self.initial_due(&strategy, now));
            if next > now {
                continue;
            }

            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                debug!(strategy_id = %strategy.id, "Worker pool saturated, deferring");
                break;
            };

            due.insert(strategy.id.clone(), self.next_due(&strategy, now));

            let scheduler = Arc::clone(self);
            runs.spawn(async move {
                let _permit = permit;
                match scheduler.evaluate_once(&strategy.id).await {
                    Ok(RunOutcome::Completed(_)) => {}
                    Ok(RunOutcome::Skipped) => {
                        debug!(strategy_id = %strategy.id, "Previous run still holds the lease")
                    }
                    Err(e) => error!(
                        strategy_id = %strategy.id,
                        error = %e,
                        kind = e.kind(),
                        "Strategy run failed"
                    ),
                }
            });
        }
    }
}
