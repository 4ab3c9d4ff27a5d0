//! 실험 하네스
//!
//! 시행 하나는 시드 하나로 완전히 재현된다. 시행 `t` 의 시드는 `base_seed + t`.
//! 시행 간 공유 상태는 ID 발급기뿐이라 rayon 으로 병렬 실행한다.

use std::fmt;
use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, LinkConfig};
use crate::delay::DelayTomography;
use crate::loss::LossTomography;
use crate::probe::{Observations, ProbeSimulator};
use crate::stats::{mean, percentage_error, total_variation, ExperimentStats};
use crate::topology::{IdSequence, Tree};
use crate::{Error, Result};

/// 실험 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentKind {
    Loss,
    Delay,
}

impl fmt::Display for ExperimentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExperimentKind::Loss => write!(f, "loss"),
            ExperimentKind::Delay => write!(f, "delay"),
        }
    }
}

/// 링크별 추정 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkEstimate {
    /// 추정 손실률 `1 - alpha`
    Loss { node: u64, inferred_loss: f64 },

    /// bin 별 실제 질량과 추정 질량
    Delay {
        node: u64,
        truth: Vec<f64>,
        inferred: Vec<f64>,
    },
}

/// 시행 결과
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrialOutcome {
    Completed {
        tomography_error: f64,
        links: Vec<LinkEstimate>,
    },
    PreSanityFailed { reason: String },
    PostSanityFailed { reason: String },
    InversionFailed { reason: String },
}

impl TrialOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, TrialOutcome::Completed { .. })
    }
}

/// 시행 하나의 기록
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub trial: usize,
    pub seed: u64,

    /// 독립 프로브로 측정한 실제 손실률의 평균 백분율 오차 (손실 실험만)
    pub in_network_error: Option<f64>,

    pub outcome: TrialOutcome,
}

fn trial_seed(config: &Config, trial: usize) -> u64 {
    config.base_seed.wrapping_add(trial as u64)
}

/// 손실 시행
///
/// 독립 프로브로 실제 손실률을 잰 트리와, 멀티캐스트 프로브로 추정하는 새 트리를
/// 같은 난수 스트림에서 차례로 만든다.
pub fn run_loss_trial(config: &Config, ids: &IdSequence, trial: usize) -> Result<TrialReport> {
    config.validate()?;
    let p = config
        .loss_probability()
        .ok_or_else(|| Error::ExperimentMismatch {
            experiment: "loss",
            link: format!("{:?}", config.link),
        })?;

    let seed = trial_seed(config, trial);
    let mut rng = StdRng::seed_from_u64(seed);
    info!(trial, seed, "손실 시행 시작");

    // in-network 측정
    let tree = Tree::build(config.depth, &config.link, ids, &mut rng)?;
    let mut sim = ProbeSimulator::new(tree, rng);
    for tick in 0..config.num_probes as u64 {
        sim.tick();
        sim.send_independent_probes(tick);
    }
    let (truth_tree, mut rng) = sim.into_parts();
    let truth_errors: Vec<f64> = truth_tree
        .nodes()
        .map(|index| truth_tree.node(index))
        .filter(|node| !node.is_root())
        .map(|node| percentage_error(node.true_loss, p))
        .collect();
    let in_network_error = mean(&truth_errors);

    // 멀티캐스트 토모그래피
    let tree = Tree::build(config.depth, &config.link, ids, &mut rng)?;
    let mut estimator = LossTomography::create_estimator(&tree, config.estimator_mode);
    let mut observations = Observations::new(&tree, false);
    let mut sim = ProbeSimulator::new(tree, rng);
    for tick in 0..config.num_probes as u64 {
        sim.tick();
        let outcome = sim.send_multicast_probe(tick);
        observations.record(&outcome)?;
        estimator.update_y(sim.tree(), &observations)?;
    }

    let tree = sim.tree();
    let report = |outcome: TrialOutcome| TrialReport {
        trial,
        seed,
        in_network_error,
        outcome,
    };

    estimator.compute_gamma(tree)?;
    if let Err(violation) = estimator.pre_sanity_check(tree) {
        warn!(trial, %violation, "사전 검증 실패, 시행 건너뜀");
        return Ok(report(TrialOutcome::PreSanityFailed {
            reason: violation.to_string(),
        }));
    }
    if let Err(err) = estimator.compute_mle(tree) {
        if !err.is_numerical() {
            return Err(err);
        }
        warn!(trial, error = %err, "역산 실패, 시행 건너뜀");
        return Ok(report(TrialOutcome::InversionFailed {
            reason: err.to_string(),
        }));
    }
    if let Err(violation) = estimator.post_sanity_check(tree) {
        warn!(trial, %violation, "사후 검증 실패, 시행 건너뜀");
        return Ok(report(TrialOutcome::PostSanityFailed {
            reason: violation.to_string(),
        }));
    }

    let links: Vec<LinkEstimate> = tree
        .nodes()
        .filter(|&index| !tree.node(index).is_root())
        .map(|index| LinkEstimate::Loss {
            node: tree.node(index).id,
            inferred_loss: 1.0 - estimator.alpha(index),
        })
        .collect();
    let errors: Vec<f64> = links
        .iter()
        .filter_map(|link| match link {
            LinkEstimate::Loss { inferred_loss, .. } => Some(percentage_error(*inferred_loss, p)),
            LinkEstimate::Delay { .. } => None,
        })
        .collect();
    // 수신자 하나짜리 트리는 추정할 비루트 링크가 없다
    let tomography_error = mean(&errors).unwrap_or(0.0);

    info!(trial, tomography_error, ?in_network_error, "손실 시행 완료");
    Ok(report(TrialOutcome::Completed {
        tomography_error,
        links,
    }))
}

/// 지연 시행
///
/// 오차는 노드별 alpha 와 링크의 실제 bin 분포 사이 total variation 거리의 평균.
pub fn run_delay_trial(config: &Config, ids: &IdSequence, trial: usize) -> Result<TrialReport> {
    config.validate()?;
    if !matches!(config.link, LinkConfig::Delay { .. }) {
        return Err(Error::ExperimentMismatch {
            experiment: "delay",
            link: format!("{:?}", config.link),
        });
    }

    let seed = trial_seed(config, trial);
    let mut rng = StdRng::seed_from_u64(seed);
    info!(trial, seed, "지연 시행 시작");

    let tree = Tree::build(config.depth, &config.link, ids, &mut rng)?;
    let mut estimator = DelayTomography::create_estimator(&tree, config.bin_width)?;
    let mut sim = ProbeSimulator::new(tree, rng);
    for _ in 0..config.num_probes {
        let delays = sim.send_delayed_multicast_probe();
        estimator.record_probe(sim.tree(), &delays)?;
    }

    let tree = sim.tree();
    let outcome = match estimator.estimate(tree) {
        Ok(()) => {
            let links: Vec<LinkEstimate> = tree
                .nodes()
                .map(|index| {
                    let node = tree.node(index);
                    let truth = (0..=estimator.i_max())
                        .map(|bin| node.link.delay.bin_mass(bin, config.bin_width))
                        .collect();
                    LinkEstimate::Delay {
                        node: node.id,
                        truth,
                        inferred: estimator.alpha(index).to_vec(),
                    }
                })
                .collect();
            let distances: Vec<f64> = links
                .iter()
                .filter_map(|link| match link {
                    LinkEstimate::Delay {
                        truth, inferred, ..
                    } => Some(total_variation(truth, inferred)),
                    LinkEstimate::Loss { .. } => None,
                })
                .collect();
            let tomography_error = mean(&distances).unwrap_or(0.0);

            info!(trial, tomography_error, i_max = estimator.i_max(), "지연 시행 완료");
            TrialOutcome::Completed {
                tomography_error,
                links,
            }
        }
        Err(err) if err.is_numerical() => {
            warn!(trial, error = %err, "역산 실패, 시행 건너뜀");
            TrialOutcome::InversionFailed {
                reason: err.to_string(),
            }
        }
        Err(err) => return Err(err),
    };

    Ok(TrialReport {
        trial,
        seed,
        in_network_error: None,
        outcome,
    })
}

/// 실험 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    pub kind: ExperimentKind,
    pub config: Config,
    pub trials: Vec<TrialReport>,
    pub stats: ExperimentStats,
}

impl ExperimentReport {
    fn new(kind: ExperimentKind, config: Config, trials: Vec<TrialReport>) -> Self {
        let mut stats = ExperimentStats::new();
        for trial in &trials {
            if let Some(error) = trial.in_network_error {
                stats.record_in_network(error);
            }
            match &trial.outcome {
                TrialOutcome::Completed {
                    tomography_error, ..
                } => stats.record_completed(*tomography_error),
                TrialOutcome::PreSanityFailed { .. } => stats.record_pre_sanity_failure(),
                TrialOutcome::PostSanityFailed { .. } => stats.record_post_sanity_failure(),
                TrialOutcome::InversionFailed { .. } => stats.record_inversion_failure(),
            }
        }

        Self {
            kind,
            config,
            trials,
            stats,
        }
    }

    /// 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "{} experiment | depth={} link={:?} probes={} | {}",
            self.kind,
            self.config.depth,
            self.config.link,
            self.config.num_probes,
            self.stats.summary(),
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// bincode 로 파일에 저장
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

/// 손실 실험 (모든 시행)
pub fn run_loss_experiment(config: &Config) -> Result<ExperimentReport> {
    run_experiment(config, ExperimentKind::Loss, run_loss_trial)
}

/// 지연 실험 (모든 시행)
pub fn run_delay_experiment(config: &Config) -> Result<ExperimentReport> {
    run_experiment(config, ExperimentKind::Delay, run_delay_trial)
}

fn run_experiment<F>(config: &Config, kind: ExperimentKind, run: F) -> Result<ExperimentReport>
where
    F: Fn(&Config, &IdSequence, usize) -> Result<TrialReport> + Sync + Send,
{
    config.validate()?;
    info!(
        %kind,
        trials = config.num_trials,
        workers = config.parallel_workers,
        "실험 시작"
    );

    let ids = IdSequence::new();
    let run_all = || -> Result<Vec<TrialReport>> {
        (0..config.num_trials)
            .into_par_iter()
            .map(|trial| run(config, &ids, trial))
            .collect()
    };

    let trials = if config.parallel_workers > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers)
            .build()?;
        pool.install(run_all)?
    } else {
        run_all()?
    };

    let report = ExperimentReport::new(kind, config.clone(), trials);
    info!(summary = %report.stats.summary(), "실험 완료");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayKind, LossKind};

    fn loss_config() -> Config {
        Config {
            depth: 3,
            num_probes: 20_000,
            num_trials: 4,
            parallel_workers: 2,
            ..Config::bernoulli()
        }
    }

    #[test]
    fn test_loss_experiment() {
        let report = run_loss_experiment(&loss_config()).unwrap();
        assert_eq!(report.trials.len(), 4);
        assert_eq!(report.stats.total_trials, 4);
        assert_eq!(report.stats.in_network_errors.len(), 4);
        assert_eq!(
            report.stats.completed_trials + report.stats.skipped_trials(),
            4
        );
        assert!(report.stats.completed_trials >= 1);
        assert!(report.stats.tomography().unwrap().mean < 15.0);
        assert!(report.stats.in_network().unwrap().mean < 15.0);

        for (t, trial) in report.trials.iter().enumerate() {
            assert_eq!(trial.trial, t);
            assert_eq!(trial.seed, 1 + t as u64);
        }
    }

    #[test]
    fn test_trial_is_reproducible() {
        let config = Config {
            link: LinkConfig::Loss {
                kind: LossKind::GilbertElliott,
                probability: 0.1,
            },
            num_probes: 5_000,
            ..loss_config()
        };
        let a = run_loss_trial(&config, &IdSequence::new(), 3).unwrap();
        let b = run_loss_trial(&config, &IdSequence::new(), 3).unwrap();
        assert_eq!(a, b);

        let c = run_loss_trial(&config, &IdSequence::new(), 4).unwrap();
        assert_ne!(a.in_network_error, c.in_network_error);
    }

    #[test]
    fn test_too_few_probes_are_skipped_not_fatal() {
        let config = Config {
            num_probes: 5,
            num_trials: 20,
            parallel_workers: 0,
            ..loss_config()
        };
        let report = run_loss_experiment(&config).unwrap();
        assert_eq!(report.stats.total_trials, 20);
        assert!(report.stats.skipped_trials() > 0);
        for trial in &report.trials {
            if !trial.outcome.is_completed() {
                assert!(matches!(
                    trial.outcome,
                    TrialOutcome::PreSanityFailed { .. }
                        | TrialOutcome::PostSanityFailed { .. }
                        | TrialOutcome::InversionFailed { .. }
                ));
            }
        }
    }

    #[test]
    fn test_configuration_errors_abort() {
        let config = Config {
            depth: 0,
            ..loss_config()
        };
        assert!(matches!(
            run_loss_experiment(&config),
            Err(Error::InvalidDepth { depth: 0 })
        ));

        let err = run_loss_trial(&Config::delay(), &IdSequence::new(), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::ExperimentMismatch {
                experiment: "loss",
                ..
            }
        ));
        assert!(err.is_configuration());

        let err = run_delay_trial(&loss_config(), &IdSequence::new(), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::ExperimentMismatch {
                experiment: "delay",
                ..
            }
        ));
        assert!(err.is_configuration());
        assert!(matches!(
            run_delay_experiment(&loss_config()),
            Err(Error::ExperimentMismatch { .. })
        ));
    }

    #[test]
    fn test_delay_experiment() {
        let config = Config {
            num_probes: 20_000,
            num_trials: 2,
            ..Config::delay()
        };
        let report = run_delay_experiment(&config).unwrap();
        assert_eq!(report.stats.completed_trials, 2);
        assert!(report.stats.tomography().unwrap().mean < 0.1);
        assert!(report.stats.in_network_errors.is_empty());

        match &report.trials[0].outcome {
            TrialOutcome::Completed { links, .. } => {
                assert_eq!(links.len(), 3);
                for link in links {
                    if let LinkEstimate::Delay { truth, inferred, .. } = link {
                        assert_eq!(truth.len(), inferred.len());
                        assert!((truth.iter().sum::<f64>() - 1.0).abs() < 1e-12);
                    }
                }
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_geometric_delay_trial_runs() {
        let config = Config {
            link: LinkConfig::Delay {
                kind: DelayKind::Geometric,
                mean: 1.0,
            },
            num_probes: 2_000,
            ..Config::delay()
        };
        let report = run_delay_trial(&config, &IdSequence::new(), 0).unwrap();
        assert_eq!(report.in_network_error, None);
        assert_eq!(report.seed, config.base_seed);
    }

    #[test]
    fn test_report_bytes() {
        let config = Config {
            num_probes: 2_000,
            num_trials: 2,
            ..loss_config()
        };
        let report = run_loss_experiment(&config).unwrap();
        let bytes = report.to_bytes().unwrap();
        let decoded = ExperimentReport::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.trials, report.trials);
        assert_eq!(decoded.summary(), report.summary());

        assert!(matches!(
            ExperimentReport::from_bytes(&bytes[..bytes.len() / 2]),
            Err(Error::Serialization(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.bin");
        report.save(&path).unwrap();
        let loaded = ExperimentReport::load(&path).unwrap();
        assert_eq!(loaded.stats.total_trials, 2);
        assert!(matches!(
            ExperimentReport::load(dir.path().join("missing.bin")),
            Err(Error::Io(_))
        ));
    }
}
