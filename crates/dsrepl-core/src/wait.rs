//! Phased wait/poll state machine.
//!
//! Polls fresh snapshots until the required health phases hold for a
//! steady run of cycles, or a deadline fires. The engine owns its loop
//! entirely: callers must not wrap it in retries. One snapshot read per
//! target set per cycle bounds load on the server; the backlog probe is
//! sampled only every `monitor_every` cycles.
//!
//! Phase deadlines (`configured`, `start`, `done`) are independent and
//! measured from the start of the wait call. A transient connection
//! failure during a cycle neither resets nor advances the steady streak;
//! any other failure counts as an unhealthy observation.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dsrepl_ldap::client::LdapClient;
use dsrepl_ldap::config::LdapConnParams;

use crate::error::Result;
use crate::model::{classify, AgreementPhase, AgreementStatus, ClassifyContext, ReplicationInfo, Summary};
use crate::monitor::{BacklogProbe, DsconfMonitor};
use crate::snapshot::{snapshot, summarize, SnapshotOptions};

/// Which agreements a wait call watches.
#[derive(Debug, Clone)]
pub enum WaitTargets {
    /// Every agreement under the replica.
    All,
    /// Agreements whose cn or DN contains one of these tokens.
    Named(Vec<String>),
}

/// Which phases must hold for success.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRequirements {
    /// Agreements exist and are enabled (and the replica is enabled).
    pub configured: bool,
    /// Evidence of replication activity.
    pub working: bool,
    /// Full convergence.
    pub finished: bool,
}

impl Default for PhaseRequirements {
    fn default() -> Self {
        Self {
            configured: true,
            working: true,
            finished: false,
        }
    }
}

/// Per-phase deadlines, each measured from the start of the wait call.
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimeouts {
    /// Deadline for `configured`.
    pub configured: Duration,
    /// Deadline for `working`.
    pub start: Duration,
    /// Deadline for `finished`.
    pub done: Duration,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            configured: Duration::from_secs(20),
            start: Duration::from_secs(30),
            done: Duration::from_secs(120),
        }
    }
}

/// Polling budgets and policy for one wait call.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Target selection.
    pub targets: WaitTargets,
    /// Maximum age of the last successful update, seconds.
    pub stale_seconds: i64,
    /// Consecutive healthy cycles required before success.
    pub steady_ok_polls: u32,
    /// Sleep between cycles.
    pub poll_interval: Duration,
    /// Overall deadline, independent of the per-phase deadlines.
    pub timeout: Duration,
    /// Whether a failed or absent init blocks convergence.
    pub require_init_success: bool,
    /// Which phases gate success.
    pub require: PhaseRequirements,
    /// Per-phase deadlines.
    pub timeouts: PhaseTimeouts,
    /// Elapsed time after which the poll interval grows.
    pub backoff_after: Duration,
    /// Poll interval once backoff kicks in.
    pub backoff_interval: Duration,
    /// Sample the backlog probe every this many cycles (0 disables).
    pub monitor_every: u32,
    /// Emit a progress line every this many cycles (0 disables).
    pub log_every: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            targets: WaitTargets::All,
            stale_seconds: 300,
            steady_ok_polls: 3,
            poll_interval: Duration::from_secs(3),
            timeout: Duration::from_secs(180),
            require_init_success: true,
            require: PhaseRequirements::default(),
            timeouts: PhaseTimeouts::default(),
            backoff_after: Duration::from_secs(30),
            backoff_interval: Duration::from_secs(5),
            monitor_every: 3,
            log_every: 5,
        }
    }
}

/// Why a wait call failed: the most specific unmet deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitFailureReason {
    /// `configured` did not hold within its deadline.
    ConfiguredTimeout,
    /// `working` did not hold within its deadline.
    StartTimeout,
    /// `finished` did not hold within its deadline.
    DoneTimeout,
    /// The overall deadline fired with no phase-specific deadline unmet.
    Timeout,
}

impl WaitFailureReason {
    /// Machine-usable reason string.
    pub fn as_str(self) -> &'static str {
        match self {
            WaitFailureReason::ConfiguredTimeout => "configured-timeout",
            WaitFailureReason::StartTimeout => "start-timeout",
            WaitFailureReason::DoneTimeout => "done-timeout",
            WaitFailureReason::Timeout => "timeout",
        }
    }
}

/// Outcome of one wait call.
#[derive(Debug, Clone, Serialize)]
pub struct WaitReport {
    /// Whether the required phases held for the steady streak.
    pub success: bool,
    /// Wall-clock seconds spent waiting.
    pub waited_seconds: u64,
    /// Poll cycles executed.
    pub cycles: u32,
    /// Last observed per-agreement state, phases filled in.
    pub observations: Vec<AgreementStatus>,
    /// Phase aggregates at exit.
    pub summary: Summary,
    /// Failure classification; absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<WaitFailureReason>,
    /// Human-readable diagnostics keyed off observed failure signatures.
    pub hints: Vec<String>,
}

/// Source of fresh snapshots, one per poll cycle.
///
/// The production implementation opens a scoped session per cycle and
/// drops it before sleeping; tests script sequences of observations.
#[async_trait]
pub trait SnapshotSource: Send {
    /// Produce one fresh observation, merging known backlog counts.
    async fn observe(
        &mut self,
        backlog_by_name: Option<&HashMap<String, i64>>,
    ) -> Result<ReplicationInfo>;
}

/// Production source: one scoped LDAP session per cycle.
pub struct LdapSnapshotSource {
    params: LdapConnParams,
    suffix: String,
    options: SnapshotOptions,
}

impl LdapSnapshotSource {
    /// Source reading `suffix` with the given connection parameters.
    pub fn new(params: LdapConnParams, suffix: impl Into<String>, options: SnapshotOptions) -> Self {
        Self {
            params,
            suffix: suffix.into(),
            options,
        }
    }
}

#[async_trait]
impl SnapshotSource for LdapSnapshotSource {
    async fn observe(
        &mut self,
        backlog_by_name: Option<&HashMap<String, i64>>,
    ) -> Result<ReplicationInfo> {
        // Session is scoped to the cycle; dropped before the next sleep.
        let client = LdapClient::connect(self.params.clone()).await?;
        snapshot(&client, &self.suffix, &self.options, backlog_by_name).await
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct AgreementTrend {
    start_epoch: Option<i64>,
    end_epoch: Option<i64>,
    age: Option<i64>,
}

/// The wait/poll state machine.
pub struct WaitEngine {
    config: WaitConfig,
    prev: HashMap<String, AgreementTrend>,
    hints: BTreeSet<String>,
    streak: u32,
    backlog: Option<HashMap<String, i64>>,
}

impl WaitEngine {
    /// Engine with the given budgets; state is per wait call.
    pub fn new(config: WaitConfig) -> Self {
        Self {
            config,
            prev: HashMap::new(),
            hints: BTreeSet::new(),
            streak: 0,
            backlog: None,
        }
    }

    /// Run the loop to success or a diagnosed failure.
    pub async fn run(
        &mut self,
        source: &mut dyn SnapshotSource,
        probe: Option<&dyn BacklogProbe>,
        suffix: &str,
    ) -> WaitReport {
        let started = Instant::now();
        let mut cycle: u32 = 0;
        let mut observations: Vec<AgreementStatus> = Vec::new();
        let mut problems: Vec<String> = Vec::new();
        // Last evaluated phase aggregates; all unmet until the first
        // successful observation.
        let mut configured_met = false;
        let mut working_met = false;
        let mut finished_met = false;

        loop {
            cycle += 1;

            if let Some(probe) = probe {
                let due = cycle == 1
                    || (self.config.monitor_every > 0 && cycle % self.config.monitor_every == 0);
                if due {
                    if let Some(map) = probe.sample(suffix).await {
                        self.backlog = Some(map);
                    }
                }
            }

            let observed = source.observe(self.backlog.as_ref()).await;
            match observed {
                Ok(info) => {
                    let now = now_epoch();
                    (configured_met, working_met, finished_met) =
                        self.evaluate(&info, now, &mut observations);
                    problems = summarize(&observations, self.config.stale_seconds, now).problems;

                    let req = self.config.require;
                    let healthy = (!req.configured || configured_met)
                        && (!req.working || working_met)
                        && (!req.finished || finished_met);
                    if healthy {
                        self.streak += 1;
                        if self.streak >= self.config.steady_ok_polls {
                            let waited = started.elapsed().as_secs();
                            info!(suffix, cycles = cycle, waited_seconds = waited, "replication healthy");
                            return WaitReport {
                                success: true,
                                waited_seconds: waited,
                                cycles: cycle,
                                observations,
                                summary: Summary {
                                    configured: configured_met,
                                    working: working_met,
                                    finished: finished_met,
                                    problems,
                                },
                                reason: None,
                                hints: Vec::new(),
                            };
                        }
                    } else {
                        self.streak = 0;
                    }
                }
                Err(e) if e.is_transient() => {
                    // Skip the cycle: the streak neither resets nor advances.
                    debug!(cycle, error = %e, "transient read failure, skipping cycle");
                }
                Err(e) => {
                    warn!(cycle, error = %e, "poll cycle failed");
                    self.hints.insert(e.remediation());
                    self.streak = 0;
                    configured_met = false;
                    working_met = false;
                    finished_met = false;
                }
            }

            let elapsed = started.elapsed();
            let req = self.config.require;
            let deadlines = self.config.timeouts;
            if req.configured && !configured_met && elapsed >= deadlines.configured {
                self.hints.insert("Agreement disabled or missing".to_string());
                return self.fail(
                    WaitFailureReason::ConfiguredTimeout,
                    elapsed,
                    cycle,
                    observations,
                    (configured_met, working_met, finished_met),
                    problems,
                );
            }
            if req.working && !working_met && elapsed >= deadlines.start {
                self.hints.insert("No replication activity observed".to_string());
                return self.fail(
                    WaitFailureReason::StartTimeout,
                    elapsed,
                    cycle,
                    observations,
                    (configured_met, working_met, finished_met),
                    problems,
                );
            }
            if req.finished && !finished_met && elapsed >= deadlines.done {
                self.hints.insert("Not converged".to_string());
                for obs in &observations {
                    if let Some(backlog) = obs.backlog.filter(|&n| n > 0) {
                        self.hints
                            .insert(format!("{}: backlog={backlog}", obs.short_name()));
                    }
                }
                return self.fail(
                    WaitFailureReason::DoneTimeout,
                    elapsed,
                    cycle,
                    observations,
                    (configured_met, working_met, finished_met),
                    problems,
                );
            }
            if elapsed >= self.config.timeout {
                return self.fail(
                    WaitFailureReason::Timeout,
                    elapsed,
                    cycle,
                    observations,
                    (configured_met, working_met, finished_met),
                    problems,
                );
            }

            if self.config.log_every > 0 && (cycle == 1 || cycle % self.config.log_every == 0) {
                info!(
                    suffix,
                    cycle,
                    elapsed_s = elapsed.as_secs(),
                    ok_streak = self.streak,
                    configured = configured_met,
                    working = working_met,
                    finished = finished_met,
                    "waiting for replication health"
                );
            }

            // Sleep, never past the nearest pending deadline.
            let base = if elapsed < self.config.backoff_after {
                self.config.poll_interval
            } else {
                self.config.poll_interval.max(self.config.backoff_interval)
            };
            let mut next_deadline = self.config.timeout;
            if req.configured && !configured_met {
                next_deadline = next_deadline.min(deadlines.configured);
            }
            if req.working && !working_met {
                next_deadline = next_deadline.min(deadlines.start);
            }
            if req.finished && !finished_met {
                next_deadline = next_deadline.min(deadlines.done);
            }
            let until_deadline = next_deadline.saturating_sub(elapsed);
            tokio::time::sleep(base.min(until_deadline)).await;
        }
    }

    /// Classify every observation, update trends, and aggregate phases.
    fn evaluate(
        &mut self,
        info: &ReplicationInfo,
        now: i64,
        observations: &mut Vec<AgreementStatus>,
    ) -> (bool, bool, bool) {
        let mut configured_met = !info.agreements.is_empty();
        if info.replica.enabled == Some(false) {
            configured_met = false;
            self.hints
                .insert("Replica disabled; enable replication on the supplier".to_string());
        }
        let mut working_met = false;
        let mut finished_met = !info.agreements.is_empty();

        *observations = info.agreements.clone();
        for obs in observations.iter_mut() {
            if obs.enabled != Some(true) {
                configured_met = false;
            }
            let trending = self
                .prev
                .get(&obs.dn)
                .map(|prev| {
                    advanced(prev.start_epoch, obs.last_update_start_epoch)
                        || advanced(prev.end_epoch, obs.last_update_epoch)
                        || receded(prev.age, obs.update_age(now))
                })
                .unwrap_or(false);
            let phase = classify(
                obs,
                &ClassifyContext {
                    now_epoch: now,
                    stale_seconds: self.config.stale_seconds,
                    require_init_success: self.config.require_init_success,
                    trending,
                },
            );
            obs.phase = Some(phase);
            if phase >= AgreementPhase::Working {
                working_met = true;
            }
            if phase != AgreementPhase::Finished {
                finished_met = false;
            }
            self.note_signature_hints(obs, now);
            self.prev.insert(
                obs.dn.clone(),
                AgreementTrend {
                    start_epoch: obs.last_update_start_epoch,
                    end_epoch: obs.last_update_epoch,
                    age: obs.update_age(now),
                },
            );
        }
        (configured_met, working_met, finished_met)
    }

    /// Record hints for the strong failure signatures in one observation.
    fn note_signature_hints(&mut self, obs: &AgreementStatus, now: i64) {
        let name = obs.short_name().split(',').next().unwrap_or("(agmt)").to_string();
        if let Some(code) = obs.last_update_code.filter(|&c| c != 0) {
            if !obs.fresh_success(now, self.config.stale_seconds) {
                self.hints.insert(format!(
                    "{name}: replication update failed (code {code}); check consumer availability and credentials"
                ));
            }
        }
        if self.config.require_init_success {
            if let Some(code) = obs.last_init_code.filter(|&c| c != 0) {
                self.hints
                    .insert(format!("{name}: last init failed (code {code})"));
            }
        }
        if obs.last_update_code == Some(0) {
            if let Some(age) = obs.update_age(now) {
                if age > self.config.stale_seconds {
                    self.hints.insert(format!(
                        "{name}: last update stale >{}s; possible link outage",
                        self.config.stale_seconds
                    ));
                }
            }
        }
    }

    fn fail(
        &self,
        reason: WaitFailureReason,
        elapsed: Duration,
        cycles: u32,
        observations: Vec<AgreementStatus>,
        flags: (bool, bool, bool),
        problems: Vec<String>,
    ) -> WaitReport {
        warn!(
            reason = reason.as_str(),
            elapsed_s = elapsed.as_secs(),
            cycles,
            "wait for replication health failed"
        );
        WaitReport {
            success: false,
            waited_seconds: elapsed.as_secs(),
            cycles,
            observations,
            summary: Summary {
                configured: flags.0,
                working: flags.1,
                finished: flags.2,
                problems,
            },
            reason: Some(reason),
            hints: self.hints.iter().cloned().collect(),
        }
    }
}

/// Wait on a suffix with production sources: scoped LDAP sessions plus the
/// optional `dsconf` backlog probe.
pub async fn wait_for_health(
    params: &LdapConnParams,
    suffix: &str,
    config: WaitConfig,
    monitor_enabled: bool,
) -> WaitReport {
    let options = SnapshotOptions {
        agreement_filter: match &config.targets {
            WaitTargets::All => None,
            WaitTargets::Named(tokens) => Some(tokens.clone()),
        },
        stale_seconds: config.stale_seconds,
    };
    let mut source = LdapSnapshotSource::new(params.clone(), suffix, options);
    let probe = monitor_enabled.then(|| DsconfMonitor::from_params(params));
    let mut engine = WaitEngine::new(config);
    engine
        .run(
            &mut source,
            probe.as_ref().map(|p| p as &dyn BacklogProbe),
            suffix,
        )
        .await
}

fn advanced(prev: Option<i64>, cur: Option<i64>) -> bool {
    matches!((prev, cur), (Some(p), Some(c)) if c > p)
}

fn receded(prev: Option<i64>, cur: Option<i64>) -> bool {
    matches!((prev, cur), (Some(p), Some(c)) if c < p)
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
