//! 실험 오차 통계

use serde::{Deserialize, Serialize};

/// 산술 평균 (비어 있으면 None)
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// `100 * |estimate - truth| / truth`
pub fn percentage_error(estimate: f64, truth: f64) -> f64 {
    100.0 * (estimate - truth).abs() / truth
}

/// 두 이산 분포의 total variation 거리
///
/// 길이가 다르면 짧은 쪽을 0으로 채운다.
pub fn total_variation(p: &[f64], q: &[f64]) -> f64 {
    let len = p.len().max(q.len());
    let at = |v: &[f64], i: usize| v.get(i).copied().unwrap_or(0.0);
    0.5 * (0..len).map(|i| (at(p, i) - at(q, i)).abs()).sum::<f64>()
}

/// 오차 표본 요약
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl ErrorSummary {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mean = mean(samples)?;
        let variance =
            samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;

        Some(Self {
            count: samples.len(),
            mean,
            std_dev: variance.sqrt(),
            min: samples.iter().copied().fold(f64::INFINITY, f64::min),
            max: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }
}

/// 실험 전체 통계
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentStats {
    /// 전체 시행 수
    pub total_trials: usize,

    /// 추정까지 마친 시행 수
    pub completed_trials: usize,

    /// 사전 검증 실패로 건너뛴 시행 수
    pub pre_sanity_failures: usize,

    /// 사후 검증 실패로 건너뛴 시행 수
    pub post_sanity_failures: usize,

    /// 역산 실패로 건너뛴 시행 수
    pub inversion_failures: usize,

    /// 완료된 시행별 토모그래피 오차
    pub tomography_errors: Vec<f64>,

    /// 시행별 in-network 오차 (손실 실험만)
    pub in_network_errors: Vec<f64>,
}

impl ExperimentStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 완료된 시행 기록
    pub fn record_completed(&mut self, tomography_error: f64) {
        self.total_trials += 1;
        self.completed_trials += 1;
        self.tomography_errors.push(tomography_error);
    }

    pub fn record_pre_sanity_failure(&mut self) {
        self.total_trials += 1;
        self.pre_sanity_failures += 1;
    }

    pub fn record_post_sanity_failure(&mut self) {
        self.total_trials += 1;
        self.post_sanity_failures += 1;
    }

    pub fn record_inversion_failure(&mut self) {
        self.total_trials += 1;
        self.inversion_failures += 1;
    }

    /// in-network 오차 기록 (토모그래피 성공 여부와 무관)
    pub fn record_in_network(&mut self, error: f64) {
        self.in_network_errors.push(error);
    }

    /// 건너뛴 시행 수
    pub fn skipped_trials(&self) -> usize {
        self.pre_sanity_failures + self.post_sanity_failures + self.inversion_failures
    }

    pub fn tomography(&self) -> Option<ErrorSummary> {
        ErrorSummary::from_samples(&self.tomography_errors)
    }

    pub fn in_network(&self) -> Option<ErrorSummary> {
        ErrorSummary::from_samples(&self.in_network_errors)
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let describe = |summary: Option<ErrorSummary>| match summary {
            Some(s) => format!("{:.5} ({} trials)", s.mean, s.count),
            None => "undef".to_string(),
        };

        let mut out = format!(
            "Trials: {}/{} | Skipped: {} (pre {}, post {}, inversion {}) | Tomography error: {}",
            self.completed_trials,
            self.total_trials,
            self.skipped_trials(),
            self.pre_sanity_failures,
            self.post_sanity_failures,
            self.inversion_failures,
            describe(self.tomography()),
        );
        if !self.in_network_errors.is_empty() {
            out.push_str(&format!(" | In-network error: {}", describe(self.in_network())));
        }
        out
    }
}
