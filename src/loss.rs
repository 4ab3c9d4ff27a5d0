//! 손실 토모그래피 MLE
//!
//! 수신자 관측만으로 링크별 통과 확률(alpha)을 추정한다.
//! 이진 트리에서는 우도 방정식이 닫힌 해를 가진다:
//! `A = (left.gamma * right.gamma) / (left.gamma + right.gamma - gamma)`.
//!
//! 상태는 노드 인덱스로 접근하는 `LossNodeState` 배열에 두고 아래에서 위로 갱신한다.

use tracing::debug;

use crate::config::EstimatorMode;
use crate::error::SanityViolation;
use crate::probe::Observations;
use crate::topology::{NodeIndex, Tree};
use crate::{Error, Result, SINGULARITY_EPSILON};

/// 노드별 추정 상태
#[derive(Debug, Clone, Default)]
pub struct LossNodeState {
    /// 관측 이력 (Batch 모드에서만 누적)
    pub y: Vec<bool>,

    /// 최신 관측
    pub latest: bool,

    /// 서브트리에 프로브가 전달된 경험적 확률
    pub gamma: f64,

    /// 소스에서 이 노드까지 경로 통과 확률
    pub a: f64,

    /// 이 노드로 들어오는 링크의 통과 확률
    pub alpha: f64,
}

/// 손실 토모그래피 추정기
#[derive(Debug, Clone)]
pub struct LossTomography {
    mode: EstimatorMode,
    nodes: Vec<LossNodeState>,
    probes: u64,
}

impl LossTomography {
    /// 트리의 모든 노드에 빈 상태 생성
    pub fn create_estimator(tree: &Tree, mode: EstimatorMode) -> Self {
        Self {
            mode,
            nodes: vec![LossNodeState::default(); tree.len()],
            probes: 0,
        }
    }

    pub fn mode(&self) -> EstimatorMode {
        self.mode
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    pub fn node(&self, index: NodeIndex) -> &LossNodeState {
        &self.nodes[index]
    }

    pub fn gamma(&self, index: NodeIndex) -> f64 {
        self.nodes[index].gamma
    }

    pub fn alpha(&self, index: NodeIndex) -> f64 {
        self.nodes[index].alpha
    }

    /// 프로브 하나의 수신자 관측 반영
    ///
    /// Incremental 모드는 gamma 까지 바로 갱신한다.
    pub fn update_y(&mut self, tree: &Tree, observations: &Observations<bool>) -> Result<()> {
        let receivers = tree.receivers();
        if receivers.len() != observations.len() {
            return Err(Error::ObservationMismatch {
                expected: receivers.len(),
                got: observations.len(),
            });
        }

        self.probes += 1;
        for (&index, &delivered) in receivers.iter().zip(observations.values()) {
            let state = &mut self.nodes[index];
            state.latest = delivered;
            if self.mode == EstimatorMode::Batch {
                state.y.push(delivered);
            }
        }

        if self.mode == EstimatorMode::Incremental {
            self.update_incremental(tree, tree.root());
        }
        Ok(())
    }

    /// `update_y` 별칭
    pub fn update(&mut self, tree: &Tree, observations: &Observations<bool>) -> Result<()> {
        self.update_y(tree, observations)
    }

    fn update_incremental(&mut self, tree: &Tree, index: NodeIndex) -> bool {
        let delivered = match tree.node(index).children {
            None => self.nodes[index].latest,
            Some((left, right)) => {
                let l = self.update_incremental(tree, left);
                let r = self.update_incremental(tree, right);
                l || r
            }
        };

        let n = self.probes as f64;
        let state = &mut self.nodes[index];
        state.latest = delivered;
        let sample = if delivered { 1.0 } else { 0.0 };
        state.gamma += (sample - state.gamma) / n;
        delivered
    }

    /// gamma 계산
    ///
    /// 내부 노드의 Y 는 두 자식 Y 의 OR (어느 한쪽이라도 받으면 이 노드까지는 전달됨).
    pub fn compute_gamma(&mut self, tree: &Tree) -> Result<()> {
        if self.probes == 0 {
            return Err(Error::InsufficientData);
        }
        if self.mode == EstimatorMode::Batch {
            self.compute_gamma_batch(tree, tree.root());
        }
        Ok(())
    }

    fn compute_gamma_batch(&mut self, tree: &Tree, index: NodeIndex) {
        if let Some((left, right)) = tree.node(index).children {
            self.compute_gamma_batch(tree, left);
            self.compute_gamma_batch(tree, right);

            let y: Vec<bool> = self.nodes[left]
                .y
                .iter()
                .zip(&self.nodes[right].y)
                .map(|(&l, &r)| l || r)
                .collect();
            self.nodes[index].y = y;
        }

        let state = &mut self.nodes[index];
        let received = state.y.iter().filter(|&&d| d).count();
        state.gamma = received as f64 / state.y.len() as f64;
    }

    /// 닫힌 해 MLE, 루트의 경로 곱은 1
    pub fn compute_mle(&mut self, tree: &Tree) -> Result<()> {
        self.infer(tree, tree.root(), 1.0)
    }

    fn infer(&mut self, tree: &Tree, index: NodeIndex, total_a: f64) -> Result<()> {
        let node = tree.node(index);
        let a = match node.children {
            None => self.nodes[index].gamma,
            Some((left, right)) => {
                let gl = self.nodes[left].gamma;
                let gr = self.nodes[right].gamma;
                let denominator = gl + gr - self.nodes[index].gamma;
                if denominator.abs() < SINGULARITY_EPSILON {
                    return Err(Error::DegenerateDenominator {
                        node: node.id,
                        bin: 0,
                        value: denominator,
                    });
                }
                gl * gr / denominator
            }
        };

        if total_a.abs() < SINGULARITY_EPSILON {
            return Err(Error::DegenerateDenominator {
                node: node.id,
                bin: 0,
                value: total_a,
            });
        }

        let state = &mut self.nodes[index];
        state.a = a;
        state.alpha = a / total_a;

        if let Some((left, right)) = node.children {
            self.infer(tree, left, a)?;
            self.infer(tree, right, a)?;
        }
        Ok(())
    }

    /// 추정 전 검증: gamma == 0 이거나 이진 트리 분모가 0에 가까우면 거부
    pub fn pre_sanity_check(&self, tree: &Tree) -> std::result::Result<(), SanityViolation> {
        for index in tree.nodes() {
            let node = tree.node(index);
            let gamma = self.nodes[index].gamma;
            if gamma == 0.0 {
                return Err(SanityViolation::ZeroGamma { node: node.id });
            }
            if let Some((left, right)) = node.children {
                let value = self.nodes[left].gamma + self.nodes[right].gamma - gamma;
                if value.abs() < SINGULARITY_EPSILON {
                    return Err(SanityViolation::DegenerateDenominator {
                        node: node.id,
                        value,
                    });
                }
            }
        }
        Ok(())
    }

    /// 추정 후 검증: 비루트 alpha 는 (0, 1) 안에 있어야 함
    pub fn post_sanity_check(&self, tree: &Tree) -> std::result::Result<(), SanityViolation> {
        for index in tree.nodes() {
            let node = tree.node(index);
            if node.is_root() {
                continue;
            }
            let alpha = self.nodes[index].alpha;
            if !(alpha > 0.0 && alpha < 1.0) {
                return Err(SanityViolation::AlphaOutOfRange {
                    node: node.id,
                    alpha,
                });
            }
        }
        Ok(())
    }

    /// gamma, 사전 검증, MLE, 사후 검증을 차례로 수행
    pub fn estimate(&mut self, tree: &Tree) -> Result<()> {
        self.compute_gamma(tree)?;
        self.pre_sanity_check(tree)?;
        self.compute_mle(tree)?;
        self.post_sanity_check(tree)?;
        debug!(probes = self.probes, "손실 추정 완료");
        Ok(())
    }
}
