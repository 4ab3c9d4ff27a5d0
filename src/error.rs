//! 에러 타입 정의

use thiserror::Error;

/// MTOMO 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("스레드 풀 생성 실패: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("유효하지 않은 트리 깊이: {depth} (1 이상 필요)")]
    InvalidDepth { depth: usize },

    #[error("유효하지 않은 손실 확률: {probability} (0 < p < 1 필요)")]
    InvalidLossProbability { probability: f64 },

    #[error("유효하지 않은 bad 상태 탈출 확률: {prob_escape_bad} (손실 확률 {probability})")]
    InvalidEscapeProbability {
        probability: f64,
        prob_escape_bad: f64,
    },

    #[error("유효하지 않은 평균 지연: {mean}")]
    InvalidMeanDelay { mean: f64 },

    #[error("유효하지 않은 bin 폭: {bin_width}")]
    InvalidBinWidth { bin_width: f64 },

    #[error("유효하지 않은 프로브 수: {count}")]
    InvalidProbeCount { count: usize },

    #[error("알 수 없는 분포: {0}")]
    UnknownDistribution(String),

    #[error("{experiment} 실험에 맞지 않는 링크 설정: {link}")]
    ExperimentMismatch {
        experiment: &'static str,
        link: String,
    },

    #[error("분모가 0에 가까움: node={node}, bin={bin}, value={value:e}")]
    DegenerateDenominator { node: u64, bin: usize, value: f64 },

    #[error("판별식 음수: node={node}, bin={bin}, value={value:e}")]
    NegativeDiscriminant { node: u64, bin: usize, value: f64 },

    #[error("gamma 값이 (0, 1] 범위 밖: node={node}, bin={bin}, value={value}")]
    NonPositiveGamma { node: u64, bin: usize, value: f64 },

    #[error("beta 값이 양수가 아님: node={node}, bin={bin}, value={value}")]
    NonPositiveBeta { node: u64, bin: usize, value: f64 },

    #[error("관측 데이터 부족")]
    InsufficientData,

    #[error("관측 벡터 길이 불일치: expected {expected}, got {got}")]
    ObservationMismatch { expected: usize, got: usize },

    #[error("알 수 없는 수신자 ID: {id}")]
    UnknownReceiver { id: u64 },

    #[error("검증 실패: {0}")]
    Sanity(#[from] SanityViolation),
}

impl Error {
    /// 설정 에러 여부 (시행 전체 중단 대상)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::InvalidDepth { .. }
                | Error::InvalidLossProbability { .. }
                | Error::InvalidEscapeProbability { .. }
                | Error::InvalidMeanDelay { .. }
                | Error::InvalidBinWidth { .. }
                | Error::InvalidProbeCount { .. }
                | Error::UnknownDistribution(_)
                | Error::ExperimentMismatch { .. }
        )
    }

    /// 수치 특이점 여부 (해당 시행만 실패 처리)
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            Error::DegenerateDenominator { .. }
                | Error::NegativeDiscriminant { .. }
                | Error::NonPositiveGamma { .. }
                | Error::NonPositiveBeta { .. }
        )
    }
}

/// 추정 전후 검증 위반
///
/// 사전 검증은 gamma와 이진 트리 분모를, 사후 검증은 추론된 alpha를 본다.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SanityViolation {
    #[error("gamma == 0: node={node}")]
    ZeroGamma { node: u64 },

    #[error("left.gamma + right.gamma - gamma ~ 0: node={node}, value={value:e}")]
    DegenerateDenominator { node: u64, value: f64 },

    #[error("alpha가 (0, 1) 범위 밖: node={node}, alpha={alpha}")]
    AlphaOutOfRange { node: u64, alpha: f64 },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
