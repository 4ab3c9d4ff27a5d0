//! 지연 분포 토모그래피 MLE
//!
//! 지연을 폭 `q` 의 bin 으로 이산화하고, bin 별 CDF(gamma)에서 노드 경로 지연의
//! 확률 질량(A)을 구한다. bin 0 은 손실과 같은 닫힌 해, bin i >= 1 은
//! `p + q*x + (c1 + c2*x)(c3 + c4*x) = 0` 이차방정식의 작은 근을 쓴다.
//! 마지막으로 부모 A 로 만든 하삼각 행렬 E 에 대해
//! `min ||E x - A||^2, x >= 0, sum(x) <= 1` 을 풀어 링크 지연 분포(alpha)를 얻는다.

use tracing::debug;

use crate::topology::{NodeIndex, Tree};
use crate::{Error, Result, SINGULARITY_EPSILON};

/// 노드별 지연 추정 상태
#[derive(Debug, Clone, Default)]
pub struct DelayNodeState {
    /// 프로브별 최소 도착 지연
    pub y: Vec<f64>,

    /// bin 별 CDF
    pub gamma: Vec<f64>,

    /// bin 별 경로 지연 질량
    pub a: Vec<f64>,

    /// 부모 기준 서브트리 최소 지연 CDF
    pub beta: Vec<f64>,

    /// bin 별 링크 지연 질량
    pub alpha: Vec<f64>,
}

/// 지연 토모그래피 추정기
#[derive(Debug, Clone)]
pub struct DelayTomography {
    bin_width: f64,
    i_max: usize,
    max_delay: f64,
    probes: usize,
    nodes: Vec<DelayNodeState>,
    /// 루트의 가상 부모, A[0] = 1
    source_a: Vec<f64>,
}

impl DelayTomography {
    pub fn create_estimator(tree: &Tree, bin_width: f64) -> Result<Self> {
        if !(bin_width > 0.0 && bin_width.is_finite()) {
            return Err(Error::InvalidBinWidth { bin_width });
        }
        Ok(Self {
            bin_width,
            i_max: 0,
            max_delay: 0.0,
            probes: 0,
            nodes: vec![DelayNodeState::default(); tree.len()],
            source_a: vec![1.0],
        })
    }

    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    pub fn i_max(&self) -> usize {
        self.i_max
    }

    pub fn probes(&self) -> usize {
        self.probes
    }

    pub fn node(&self, index: NodeIndex) -> &DelayNodeState {
        &self.nodes[index]
    }

    pub fn alpha(&self, index: NodeIndex) -> &[f64] {
        &self.nodes[index].alpha
    }

    /// 수신자 순서의 종단 지연 하나 기록
    pub fn record_probe(&mut self, tree: &Tree, delays: &[f64]) -> Result<()> {
        let receivers = tree.receivers();
        if receivers.len() != delays.len() {
            return Err(Error::ObservationMismatch {
                expected: receivers.len(),
                got: delays.len(),
            });
        }

        for (&index, &delay) in receivers.iter().zip(delays) {
            self.nodes[index].y.push(delay);
            self.max_delay = self.max_delay.max(delay);
        }
        self.probes += 1;
        Ok(())
    }

    /// 내부 노드 Y(자식 Y 의 최소)와 bin 별 gamma 계산
    ///
    /// `i_max = ceil(max_delay / q)` 로 bin 수를 정하고 모든 추정 배열을 초기화한다.
    pub fn compute_gamma(&mut self, tree: &Tree) -> Result<()> {
        if self.probes == 0 {
            return Err(Error::InsufficientData);
        }

        self.i_max = (self.max_delay / self.bin_width).ceil() as usize;
        let bins = self.i_max + 1;
        for state in &mut self.nodes {
            state.gamma = vec![0.0; bins];
            state.a = vec![0.0; bins];
            state.beta = vec![-1.0; bins];
            state.alpha = vec![0.0; bins];
        }
        self.source_a = vec![0.0; bins];
        self.source_a[0] = 1.0;

        self.find_y(tree, tree.root())
    }

    fn find_y(&mut self, tree: &Tree, index: NodeIndex) -> Result<()> {
        if let Some((left, right)) = tree.node(index).children {
            self.find_y(tree, left)?;
            self.find_y(tree, right)?;

            let y: Vec<f64> = self.nodes[left]
                .y
                .iter()
                .zip(&self.nodes[right].y)
                .map(|(&l, &r)| l.min(r))
                .collect();
            self.nodes[index].y = y;
        }

        let n = self.probes as f64;
        let q = self.bin_width;
        let id = tree.node(index).id;
        let state = &mut self.nodes[index];
        for i in 0..=self.i_max {
            let edge = i as f64 * q + q / 2.0;
            let count = state.y.iter().filter(|&&y| y <= edge).count();
            let gamma = count as f64 / n;
            if gamma <= 0.0 || gamma > 1.0 {
                return Err(Error::NonPositiveGamma {
                    node: id,
                    bin: i,
                    value: gamma,
                });
            }
            state.gamma[i] = gamma;
        }
        Ok(())
    }

    fn parent_a(&self, tree: &Tree, index: NodeIndex) -> &[f64] {
        match tree.node(index).parent {
            Some(parent) => &self.nodes[parent].a,
            None => &self.source_a,
        }
    }

    /// bin 하나에 대해 루트부터 모든 노드의 A, beta 계산
    ///
    /// 같은 bin 안에서 부모가 자식보다 먼저 처리된다.
    pub fn infer_delay(&mut self, tree: &Tree, bin: usize) -> Result<()> {
        if bin > self.i_max || self.nodes[tree.root()].gamma.len() <= bin {
            return Err(Error::InsufficientData);
        }
        self.infer_node(tree, tree.root(), bin)
    }

    fn infer_node(&mut self, tree: &Tree, index: NodeIndex, i: usize) -> Result<()> {
        let node = tree.node(index);

        let a = if i == 0 {
            match node.children {
                None => self.nodes[index].gamma[0],
                Some((left, right)) => {
                    let gl = self.nodes[left].gamma[0];
                    let gr = self.nodes[right].gamma[0];
                    let denominator = gl + gr - self.nodes[index].gamma[0];
                    if denominator.abs() < SINGULARITY_EPSILON {
                        return Err(Error::DegenerateDenominator {
                            node: node.id,
                            bin: 0,
                            value: denominator,
                        });
                    }
                    gl * gr / denominator
                }
            }
        } else {
            self.solve_bin(tree, index, i)?
        };
        self.nodes[index].a[i] = a;

        let beta = {
            let parent_a = self.parent_a(tree, index);
            let state = &self.nodes[index];
            let mut summation = 0.0;
            for j in 1..=i {
                let b = state.beta[i - j];
                if b <= 0.0 {
                    return Err(Error::NonPositiveBeta {
                        node: node.id,
                        bin: i - j,
                        value: b,
                    });
                }
                summation += parent_a[j] * b;
            }
            if parent_a[0] <= 0.0 {
                return Err(Error::DegenerateDenominator {
                    node: node.id,
                    bin: i,
                    value: parent_a[0],
                });
            }
            (state.gamma[i] - summation) / parent_a[0]
        };
        self.nodes[index].beta[i] = beta;

        if let Some((left, right)) = node.children {
            self.infer_node(tree, left, i)?;
            self.infer_node(tree, right, i)?;
        }
        Ok(())
    }

    /// bin i >= 1 의 A[i]
    ///
    /// 수신자는 CDF 차분, 내부 노드는 이차방정식의 두 근 중 작은 근.
    /// 큰 근은 물리적으로 불가능한 해로 취급한다.
    fn solve_bin(&self, tree: &Tree, index: NodeIndex, i: usize) -> Result<f64> {
        let node = tree.node(index);
        let k = &self.nodes[index];

        let (left, right) = match node.children {
            None => return Ok(k.gamma[i] - k.a[..i].iter().sum::<f64>()),
            Some(children) => children,
        };
        let l = &self.nodes[left];
        let r = &self.nodes[right];

        let a0 = k.a[0];
        if a0 <= 0.0 {
            return Err(Error::DegenerateDenominator {
                node: node.id,
                bin: i,
                value: a0,
            });
        }

        let mut p = k.gamma[i] - a0;
        let mut sum_l = 0.0;
        let mut sum_r = 0.0;
        for j in 1..i {
            let bl = l.beta[i - j];
            let br = r.beta[i - j];
            if bl <= 0.0 {
                return Err(Error::NonPositiveBeta {
                    node: tree.node(left).id,
                    bin: i - j,
                    value: bl,
                });
            }
            if br <= 0.0 {
                return Err(Error::NonPositiveBeta {
                    node: tree.node(right).id,
                    bin: i - j,
                    value: br,
                });
            }
            p += k.a[j] * ((1.0 - bl) * (1.0 - br) - 1.0);
            sum_l += bl * k.a[j];
            sum_r += br * k.a[j];
        }

        let q = (1.0 - l.beta[0]) * (1.0 - r.beta[0]) - 1.0;
        let c1 = a0 - l.gamma[i] + sum_l;
        let c2 = l.beta[0];
        let c3 = 1.0 - r.gamma[i] / a0 + sum_r / a0;
        let c4 = r.beta[0] / a0;

        // (c2*c4) x^2 + (q + c2*c3 + c4*c1) x + (p + c1*c3) = 0
        let qa = c2 * c4;
        let qb = q + c2 * c3 + c4 * c1;
        let qc = p + c1 * c3;
        if qa.abs() < SINGULARITY_EPSILON {
            return Err(Error::DegenerateDenominator {
                node: node.id,
                bin: i,
                value: qa,
            });
        }

        let discriminant = qb * qb - 4.0 * qa * qc;
        if discriminant < 0.0 {
            return Err(Error::NegativeDiscriminant {
                node: node.id,
                bin: i,
                value: discriminant,
            });
        }

        let root = discriminant.sqrt();
        let x1 = (-qb + root) / (2.0 * qa);
        let x2 = (-qb - root) / (2.0 * qa);
        Ok(x1.min(x2))
    }

    /// 모든 노드의 alpha 를 제약 최소제곱으로 정리
    ///
    /// 모든 bin 의 A 가 계산된 뒤에만 호출할 수 있다.
    pub fn least_squares_refine(&mut self, tree: &Tree) -> Result<()> {
        let bins = self.i_max + 1;
        if self.source_a.len() != bins
            || tree.nodes().any(|index| self.nodes[index].a.len() != bins)
        {
            return Err(Error::InsufficientData);
        }

        for index in tree.nodes() {
            let alpha = {
                let parent_a = self.parent_a(tree, index);
                let e: Vec<Vec<f64>> = (0..bins)
                    .map(|row| {
                        (0..bins)
                            .map(|col| if col > row { 0.0 } else { parent_a[row - col] })
                            .collect()
                    })
                    .collect();
                constrained_least_squares(&e, &self.nodes[index].a)
            };
            self.nodes[index].alpha = alpha;
        }
        Ok(())
    }

    /// gamma, 모든 bin 의 A, 최소제곱 alpha 를 차례로 계산
    pub fn estimate(&mut self, tree: &Tree) -> Result<()> {
        self.compute_gamma(tree)?;
        for bin in 0..=self.i_max {
            self.infer_delay(tree, bin)?;
        }
        self.least_squares_refine(tree)?;
        debug!(probes = self.probes, i_max = self.i_max, "지연 추정 완료");
        Ok(())
    }
}

const LSQ_MAX_ITERATIONS: usize = 20_000;
const LSQ_TOLERANCE: f64 = 1e-13;

/// `min ||E x - b||^2, x >= 0, sum(x) <= 1`
///
/// 가속 사영 경사법(FISTA). E 가 하삼각이므로 전진대입 해를 사영해 시작점으로 쓴다.
pub fn constrained_least_squares(e: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    if n == 0 {
        return Vec::new();
    }

    // ||E||_2^2 <= ||E||_1 * ||E||_inf
    let max_row = e
        .iter()
        .map(|row| row.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let max_col = (0..n)
        .map(|col| e.iter().map(|row| row[col].abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let lipschitz = max_row * max_col;

    let mut x = project_capped_simplex(&forward_substitution(e, b));
    if lipschitz <= 0.0 {
        return x;
    }

    let mut y = x.clone();
    let mut t = 1.0f64;
    for _ in 0..LSQ_MAX_ITERATIONS {
        let residual: Vec<f64> = (0..n)
            .map(|row| (0..n).map(|col| e[row][col] * y[col]).sum::<f64>() - b[row])
            .collect();
        let step: Vec<f64> = (0..n)
            .map(|col| {
                let grad: f64 = (0..n).map(|row| e[row][col] * residual[row]).sum();
                y[col] - grad / lipschitz
            })
            .collect();
        let next = project_capped_simplex(&step);

        let change = next
            .iter()
            .zip(&x)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f64, f64::max);

        let t_next = (1.0 + (1.0 + 4.0 * t * t).sqrt()) / 2.0;
        let momentum = (t - 1.0) / t_next;
        y = next
            .iter()
            .zip(&x)
            .map(|(&xn, &xo)| xn + momentum * (xn - xo))
            .collect();
        x = next;
        t = t_next;

        if change < LSQ_TOLERANCE {
            break;
        }
    }
    x
}

/// 하삼각 연립방정식, 대각이 0이면 해당 성분은 0
fn forward_substitution(e: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let mut x = vec![0.0; b.len()];
    for row in 0..b.len() {
        let diag = e[row][row];
        if diag.abs() < SINGULARITY_EPSILON {
            continue;
        }
        let partial: f64 = (0..row).map(|col| e[row][col] * x[col]).sum();
        x[row] = (b[row] - partial) / diag;
    }
    x
}

/// `{x >= 0, sum(x) <= 1}` 위로의 유클리드 사영
fn project_capped_simplex(v: &[f64]) -> Vec<f64> {
    let clipped: Vec<f64> = v.iter().map(|&x| x.max(0.0)).collect();
    if clipped.iter().sum::<f64>() <= 1.0 {
        return clipped;
    }

    // 합 제약이 활성: 확률 단체 위로 사영
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let mut cumulative = 0.0;
    let mut theta = 0.0;
    for (j, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f64;
        if u - candidate > 0.0 {
            theta = candidate;
        }
    }
    v.iter().map(|&x| (x - theta).max(0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelayKind, LinkConfig};
    use crate::link::{DelayModel, LinkProcess};
    use crate::probe::ProbeSimulator;
    use crate::topology::IdSequence;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn simulator(depth: usize, link: LinkConfig, seed: u64) -> ProbeSimulator {
        let ids = IdSequence::new();
        let mut rng = StdRng::seed_from_u64(seed);
        let tree = Tree::build(depth, &link, &ids, &mut rng).unwrap();
        ProbeSimulator::new(tree, rng)
    }

    fn run(sim: &mut ProbeSimulator, probes: usize) -> DelayTomography {
        let mut est = DelayTomography::create_estimator(sim.tree(), 1.0).unwrap();
        for _ in 0..probes {
            let delays = sim.send_delayed_multicast_probe();
            est.record_probe(sim.tree(), &delays).unwrap();
        }
        est
    }

    /// depth 2, 모든 링크 {0, 1, 2} 균등일 때의 bin 0 상태와 bin 1 gamma
    ///
    /// 루트 bin 1 이차방정식의 정확한 근은 1/3, 4/3.
    fn two_bin_estimator(root_gamma_1: f64, child_beta_0: f64) -> (Tree, DelayTomography) {
        let sim = simulator(2, LinkConfig::Lossless, 7);
        let tree = sim.tree().clone();
        let mut est = DelayTomography::create_estimator(&tree, 1.0).unwrap();
        est.i_max = 1;
        est.source_a = vec![1.0, 0.0];
        for index in tree.nodes() {
            let state = &mut est.nodes[index];
            state.a = vec![0.0; 2];
            state.beta = vec![-1.0; 2];
            state.alpha = vec![0.0; 2];
            if tree.node(index).is_root() {
                state.gamma = vec![5.0 / 27.0, root_gamma_1];
                state.a[0] = 1.0 / 3.0;
                state.beta[0] = 5.0 / 27.0;
            } else {
                state.gamma = vec![1.0 / 9.0, 3.0 / 9.0];
                state.a[0] = 1.0 / 9.0;
                state.beta[0] = child_beta_0;
            }
        }
        (tree, est)
    }

    #[test]
    fn test_quadratic_takes_smaller_root() {
        let (tree, est) = two_bin_estimator(13.0 / 27.0, 1.0 / 3.0);
        let a1 = est.solve_bin(&tree, tree.root(), 1).unwrap();
        assert!((a1 - 1.0 / 3.0).abs() < 1e-12, "{}", a1);

        let (tree, mut est) = two_bin_estimator(13.0 / 27.0, 1.0 / 3.0);
        est.infer_delay(&tree, 1).unwrap();
        assert!((est.node(tree.root()).a[1] - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_negative_discriminant_is_rejected() {
        // qb^2 = 25/81, 4*qa*qc = (4/3)(0.6 - 1/3) > qb^2
        let (tree, est) = two_bin_estimator(0.6, 1.0 / 3.0);
        let root_id = tree.node(tree.root()).id;
        match est.solve_bin(&tree, tree.root(), 1) {
            Err(Error::NegativeDiscriminant { node, bin, value }) => {
                assert_eq!(node, root_id);
                assert_eq!(bin, 1);
                assert!(value < 0.0);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_zero_leading_coefficient_is_rejected() {
        // 자식 beta[0] = 0 이면 c2 = 0, 이차항 계수가 0
        let (tree, mut est) = two_bin_estimator(13.0 / 27.0, 0.0);
        assert!(matches!(
            est.infer_delay(&tree, 1),
            Err(Error::DegenerateDenominator { bin: 1, .. })
        ));
    }

    #[test]
    fn test_non_positive_beta_is_rejected() {
        let (tree, mut est) = two_bin_estimator(13.0 / 27.0, 0.0);
        let (left, _) = tree.node(tree.root()).children.unwrap();
        est.nodes[tree.root()].a[1] = 1.0 / 3.0;
        let left_id = tree.node(left).id;
        match est.infer_node(&tree, left, 1) {
            Err(Error::NonPositiveBeta { node, bin, value }) => {
                assert_eq!(node, left_id);
                assert_eq!(bin, 0);
                assert_eq!(value, 0.0);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let (tree, mut est) = two_bin_estimator(13.0 / 27.0, -0.5);
        assert!(matches!(
            est.infer_node(&tree, left, 1),
            Err(Error::NonPositiveBeta { bin: 0, .. })
        ));
    }

    #[test]
    fn test_refine_before_inference_is_rejected() {
        let mut sim = simulator(2, LinkConfig::Lossless, 8);
        let mut est = DelayTomography::create_estimator(sim.tree(), 1.0).unwrap();
        assert!(matches!(
            est.least_squares_refine(sim.tree()),
            Err(Error::InsufficientData)
        ));

        let delays = sim.send_delayed_multicast_probe();
        est.record_probe(sim.tree(), &delays).unwrap();
        assert!(matches!(
            est.least_squares_refine(sim.tree()),
            Err(Error::InsufficientData)
        ));
        assert!(est.alpha(0).is_empty());
    }

    #[test]
    fn test_projection() {
        assert_eq!(project_capped_simplex(&[0.2, -0.1, 0.3]), vec![0.2, 0.0, 0.3]);
        let p = project_capped_simplex(&[0.8, 0.6]);
        assert!((p[0] - 0.6).abs() < 1e-12);
        assert!((p[1] - 0.4).abs() < 1e-12);
        let p = project_capped_simplex(&[2.0, -1.0, 0.5]);
        assert!((p[0] - 1.0).abs() < 1e-12);
        assert_eq!(p[1], 0.0);
        assert_eq!(p[2], 0.0);
    }

    #[test]
    fn test_least_squares_feasible_solution_is_exact() {
        let e = vec![vec![0.5, 0.0], vec![0.5, 0.5]];
        let b = vec![0.2, 0.3];
        let x = constrained_least_squares(&e, &b);
        assert!((x[0] - 0.4).abs() < 1e-9);
        assert!((x[1] - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_least_squares_respects_constraints() {
        let e = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let x = constrained_least_squares(&e, &[0.8, 0.6]);
        assert!((x[0] - 0.6).abs() < 1e-9);
        assert!((x[1] - 0.4).abs() < 1e-9);

        let e = vec![
            vec![0.4, 0.0, 0.0],
            vec![0.3, 0.4, 0.0],
            vec![0.3, 0.3, 0.4],
        ];
        let x = constrained_least_squares(&e, &[0.1, -0.2, 0.5]);
        assert!(x.iter().all(|&v| v >= 0.0));
        assert!(x.iter().sum::<f64>() <= 1.0 + 1e-12);
    }

    #[test]
    fn test_zero_delay_single_receiver() {
        let mut sim = simulator(1, LinkConfig::Lossless, 1);
        sim.tree_mut()
            .set_link(0, LinkProcess::with_delay(DelayModel::Fixed(0.0)));
        let mut est = run(&mut sim, 100);
        est.estimate(sim.tree()).unwrap();
        assert_eq!(est.i_max(), 0);
        assert_eq!(est.node(0).gamma, vec![1.0]);
        assert!((est.alpha(0)[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_first_bin_is_rejected() {
        let mut sim = simulator(1, LinkConfig::Lossless, 2);
        sim.tree_mut()
            .set_link(0, LinkProcess::with_delay(DelayModel::Fixed(1.0)));
        let mut est = run(&mut sim, 100);
        assert!(matches!(
            est.estimate(sim.tree()),
            Err(Error::NonPositiveGamma { bin: 0, .. })
        ));
    }

    #[test]
    fn test_single_receiver_recovers_distribution() {
        let link = LinkConfig::Delay {
            kind: DelayKind::Uniform,
            mean: 1.0,
        };
        let mut sim = simulator(1, link, 3);
        let mut est = run(&mut sim, 30_000);
        est.estimate(sim.tree()).unwrap();

        let alpha = est.alpha(0);
        assert_eq!(alpha.len(), 3);
        for &mass in alpha {
            assert!((mass - 1.0 / 3.0).abs() < 0.02, "{:?}", alpha);
        }
    }

    #[test]
    fn test_two_level_tree_recovers_uniform_links() {
        let link = LinkConfig::Delay {
            kind: DelayKind::Uniform,
            mean: 1.0,
        };
        let mut sim = simulator(2, link, 4);
        let mut est = run(&mut sim, 50_000);
        est.estimate(sim.tree()).unwrap();
        assert_eq!(est.i_max(), 4);

        let tree = sim.tree();
        for index in tree.nodes() {
            let alpha = est.alpha(index);
            assert!(alpha.iter().all(|&v| v >= 0.0));
            assert!(alpha.iter().sum::<f64>() <= 1.0 + 1e-9);

            let tolerance = if tree.node(index).is_root() { 0.03 } else { 0.06 };
            for (bin, &mass) in alpha.iter().enumerate() {
                let expected = if bin < 3 { 1.0 / 3.0 } else { 0.0 };
                assert!(
                    (mass - expected).abs() < tolerance,
                    "node {} bin {}: {:?}",
                    index,
                    bin,
                    alpha
                );
            }
        }
    }

    #[test]
    fn test_record_probe_length_mismatch() {
        let sim = simulator(2, LinkConfig::Lossless, 5);
        let mut est = DelayTomography::create_estimator(sim.tree(), 1.0).unwrap();
        assert!(matches!(
            est.record_probe(sim.tree(), &[1.0]),
            Err(Error::ObservationMismatch { expected: 2, got: 1 })
        ));
        assert!(DelayTomography::create_estimator(sim.tree(), 0.0).is_err());
    }
}
