//! # MTOMO (Multicast Tomography)
//!
//! 수신자 관측만으로 멀티캐스트 트리 내부 링크의 손실률과 지연 분포를 추정하는 시뮬레이터
//!
//! ## 핵심 특징
//! - **이진 멀티캐스트 트리**: arena 기반, pre-order 저장
//! - **링크 모델**: Bernoulli / Gilbert-Elliott 손실, 기하/파레토/균등 지연
//! - **손실 MLE**: 닫힌 해 역산, 배치 및 O(1) 증분 갱신
//! - **지연 MLE**: bin 별 이차방정식 역산 + 제약 최소제곱
//! - **실험 하네스**: 시드 고정 재현, rayon 병렬 시행, bincode 리포트

pub mod config;
pub mod delay;
pub mod error;
pub mod experiment;
pub mod link;
pub mod loss;
pub mod probe;
pub mod stats;
pub mod topology;

pub use config::{Config, DelayKind, EstimatorMode, LinkConfig, LossKind};
pub use delay::DelayTomography;
pub use error::{Error, Result, SanityViolation};
pub use experiment::{
    run_delay_experiment, run_delay_trial, run_loss_experiment, run_loss_trial, ExperimentReport,
    TrialOutcome, TrialReport,
};
pub use link::{measure_bursts, BurstProfile, DelayModel, GilbertElliott, LinkProcess, LossModel};
pub use loss::LossTomography;
pub use probe::{Observations, ProbeSimulator};
pub use stats::ExperimentStats;
pub use topology::{IdSequence, NodeIndex, Tree};

/// Gilbert-Elliott good 상태 탈출 확률
pub const LOW_ESCAPE_PROBABILITY: f64 = 0.001;

/// Gilbert-Elliott bad 상태 드롭 확률
pub const BAD_STATE_DROP_PROBABILITY: f64 = 1.0;

/// 파레토 지연 형상 모수
pub const PARETO_SHAPE: f64 = 1.3;

/// 분모가 이 값보다 작으면 특이점으로 본다
pub const SINGULARITY_EPSILON: f64 = 1e-10;

/// 기본 지연 bin 폭
pub const DEFAULT_BIN_WIDTH: f64 = 1.0;
