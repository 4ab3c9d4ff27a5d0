//! 실험 설정

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::link::{DelayModel, GilbertElliott, LinkProcess, LossModel};
use crate::{Error, Result, DEFAULT_BIN_WIDTH};

/// 손실 모델 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossKind {
    Bernoulli,
    GilbertElliott,
}

impl FromStr for LossKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bernoulli" => Ok(LossKind::Bernoulli),
            "gilbert_elliott" | "gilbert_elliot" => Ok(LossKind::GilbertElliott),
            other => Err(Error::UnknownDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::Bernoulli => write!(f, "bernoulli"),
            LossKind::GilbertElliott => write!(f, "gilbert_elliott"),
        }
    }
}

/// 지연 분포 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayKind {
    Geometric,
    Pareto,
    Uniform,
}

impl FromStr for DelayKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "geometric" => Ok(DelayKind::Geometric),
            "pareto" => Ok(DelayKind::Pareto),
            "uniform" => Ok(DelayKind::Uniform),
            other => Err(Error::UnknownDistribution(other.to_string())),
        }
    }
}

impl fmt::Display for DelayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayKind::Geometric => write!(f, "geometric"),
            DelayKind::Pareto => write!(f, "pareto"),
            DelayKind::Uniform => write!(f, "uniform"),
        }
    }
}

/// 모든 비루트 링크에 적용되는 링크 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkConfig {
    Lossless,
    Loss { kind: LossKind, probability: f64 },
    Delay { kind: DelayKind, mean: f64 },
}

impl LinkConfig {
    /// 설정값 검증
    pub fn validate(&self) -> Result<()> {
        match *self {
            LinkConfig::Lossless => Ok(()),
            LinkConfig::Loss { kind, probability } => {
                if !(probability > 0.0 && probability < 1.0) {
                    return Err(Error::InvalidLossProbability { probability });
                }
                if kind == LossKind::GilbertElliott {
                    let prob_escape_bad =
                        crate::LOW_ESCAPE_PROBABILITY * (1.0 / probability - 1.0);
                    if prob_escape_bad >= 1.0 {
                        return Err(Error::InvalidEscapeProbability {
                            probability,
                            prob_escape_bad,
                        });
                    }
                }
                Ok(())
            }
            LinkConfig::Delay { mean, .. } => {
                if mean > 0.0 && mean.is_finite() {
                    Ok(())
                } else {
                    Err(Error::InvalidMeanDelay { mean })
                }
            }
        }
    }

    /// 링크 확률 과정 생성
    ///
    /// 루트는 손실 없이 전달하지만, 지연 실험에서는 소스-루트 구간의 지연을 가진다.
    pub fn instantiate<R: Rng + ?Sized>(&self, is_root: bool, rng: &mut R) -> Result<LinkProcess> {
        match *self {
            LinkConfig::Lossless => Ok(LinkProcess::identity()),
            LinkConfig::Loss { .. } if is_root => Ok(LinkProcess::identity()),
            LinkConfig::Loss { kind, probability } => {
                let loss = match kind {
                    LossKind::Bernoulli => LossModel::bernoulli(probability)?,
                    LossKind::GilbertElliott => {
                        LossModel::GilbertElliott(GilbertElliott::new(probability, rng)?)
                    }
                };
                Ok(LinkProcess::with_loss(loss))
            }
            LinkConfig::Delay { kind, mean } => {
                let delay = match kind {
                    DelayKind::Geometric => DelayModel::geometric(mean)?,
                    DelayKind::Pareto => DelayModel::pareto(mean)?,
                    DelayKind::Uniform => DelayModel::uniform(mean)?,
                };
                Ok(LinkProcess::with_delay(delay))
            }
        }
    }
}

/// 손실 추정기 동작 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorMode {
    /// 전체 관측 이력으로 재계산
    Batch,
    /// 최신 관측만으로 O(1) 이동 평균 갱신
    Incremental,
}

/// MTOMO 실험 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// 이진 트리 깊이 (1 = 수신자 하나)
    pub depth: usize,

    /// 링크 모델
    pub link: LinkConfig,

    /// 시행당 프로브 수
    pub num_probes: usize,

    /// 시행 수
    pub num_trials: usize,

    /// 시행 t는 base_seed + t 로 시드
    pub base_seed: u64,

    /// 지연 bin 폭
    pub bin_width: f64,

    /// 손실 추정기 방식
    pub estimator_mode: EstimatorMode,

    /// 병렬 시행 워커 수 (0이면 CPU 코어 수 사용)
    pub parallel_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::bernoulli()
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 독립 손실 실험
    pub fn bernoulli() -> Self {
        Self {
            depth: 3,
            link: LinkConfig::Loss {
                kind: LossKind::Bernoulli,
                probability: 0.1,
            },
            num_probes: 10_000,
            num_trials: 10,
            base_seed: 1,
            bin_width: DEFAULT_BIN_WIDTH,
            estimator_mode: EstimatorMode::Batch,
            parallel_workers: 0,
        }
    }

    /// 버스트 손실 실험 (수렴이 느려 프로브를 10배로)
    pub fn bursty() -> Self {
        Self {
            link: LinkConfig::Loss {
                kind: LossKind::GilbertElliott,
                probability: 0.1,
            },
            num_probes: 100_000,
            estimator_mode: EstimatorMode::Incremental,
            ..Self::bernoulli()
        }
    }

    /// 지연 분포 실험
    pub fn delay() -> Self {
        Self {
            depth: 2,
            link: LinkConfig::Delay {
                kind: DelayKind::Uniform,
                mean: 1.0,
            },
            num_probes: 10_000,
            num_trials: 5,
            ..Self::bernoulli()
        }
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.depth < 1 {
            return Err(Error::InvalidDepth { depth: self.depth });
        }
        if self.num_probes == 0 {
            return Err(Error::InvalidProbeCount {
                count: self.num_probes,
            });
        }
        if !(self.bin_width > 0.0 && self.bin_width.is_finite()) {
            return Err(Error::InvalidBinWidth {
                bin_width: self.bin_width,
            });
        }
        self.link.validate()
    }

    /// 비루트 링크의 목표 손실 확률
    pub fn loss_probability(&self) -> Option<f64> {
        match self.link {
            LinkConfig::Loss { probability, .. } => Some(probability),
            _ => None,
        }
    }
}
