//! 링크별 확률적 손실/지연 생성기
//!
//! - 손실: Bernoulli, Gilbert-Elliott (2-상태 마르코프 체인)
//! - 지연: Geometric, Pareto, Uniform

use rand::Rng;
use rand_distr::{Distribution, Geometric, Pareto};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, BAD_STATE_DROP_PROBABILITY, LOW_ESCAPE_PROBABILITY, PARETO_SHAPE};

/// Gilbert-Elliott 링크 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// 손실 없음
    Good,
    /// 손실 발생
    Bad,
}

/// Gilbert-Elliott 손실 모델
///
/// 정상 상태에서 bad 상태일 확률이 설정된 손실 확률과 같도록
/// `prob_escape_bad = prob_escape_good * (1/p - 1)` 로 잡는다.
#[derive(Debug, Clone)]
pub struct GilbertElliott {
    /// 목표 손실 확률
    pub loss_prob: f64,

    /// good -> bad 전이 확률
    pub prob_escape_good: f64,

    /// bad -> good 전이 확률
    pub prob_escape_bad: f64,

    /// bad 상태에서의 드롭 확률
    pub bad_drop_prob: f64,

    /// 현재 상태
    pub state: LinkState,
}

impl GilbertElliott {
    /// 새 모델 생성. 초기 상태는 정상 분포에서 뽑는다.
    pub fn new<R: Rng + ?Sized>(loss_prob: f64, rng: &mut R) -> Result<Self> {
        if !(loss_prob > 0.0 && loss_prob < 1.0) {
            return Err(Error::InvalidLossProbability {
                probability: loss_prob,
            });
        }

        let prob_escape_good = LOW_ESCAPE_PROBABILITY;
        let prob_escape_bad = prob_escape_good * (1.0 / loss_prob - 1.0);
        if !(prob_escape_bad > 0.0 && prob_escape_bad < 1.0) {
            return Err(Error::InvalidEscapeProbability {
                probability: loss_prob,
                prob_escape_bad,
            });
        }

        let state = if rng.gen::<f64>() < loss_prob {
            LinkState::Bad
        } else {
            LinkState::Good
        };

        Ok(Self {
            loss_prob,
            prob_escape_good,
            prob_escape_bad,
            bad_drop_prob: BAD_STATE_DROP_PROBABILITY,
            state,
        })
    }

    /// 마르코프 체인 한 스텝
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.state = match self.state {
            LinkState::Good if rng.gen::<f64>() < self.prob_escape_good => LinkState::Bad,
            LinkState::Bad if rng.gen::<f64>() < self.prob_escape_bad => LinkState::Good,
            state => state,
        };
    }

    /// 현재 상태에서 프로브 전달 여부
    pub fn deliver<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        match self.state {
            LinkState::Good => true,
            LinkState::Bad => !rng.gen_bool(self.bad_drop_prob.clamp(0.0, 1.0)),
        }
    }
}

/// 손실 모델
#[derive(Debug, Clone)]
pub enum LossModel {
    /// 손실 없음 (루트 링크)
    Lossless,

    /// 독립 손실
    Bernoulli { loss_prob: f64 },

    /// 버스트 손실
    GilbertElliott(GilbertElliott),
}

impl LossModel {
    /// 검증된 Bernoulli 모델
    pub fn bernoulli(loss_prob: f64) -> Result<Self> {
        if !(loss_prob > 0.0 && loss_prob < 1.0) {
            return Err(Error::InvalidLossProbability {
                probability: loss_prob,
            });
        }
        Ok(LossModel::Bernoulli { loss_prob })
    }

    /// 프로브 전달 여부 샘플링
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        match self {
            LossModel::Lossless => true,
            LossModel::Bernoulli { loss_prob } => rng.gen::<f64>() >= *loss_prob,
            LossModel::GilbertElliott(ge) => ge.deliver(rng),
        }
    }

    /// 상태 전이 (프로브 유무와 관계없이 매 tick 호출)
    pub fn tick<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if let LossModel::GilbertElliott(ge) = self {
            ge.step(rng);
        }
    }
}

/// 지연 모델
#[derive(Debug, Clone)]
pub enum DelayModel {
    /// 지연 없음
    None,

    /// 고정 지연
    Fixed(f64),

    /// 평균 기반 기하분포, 지지집합 {0, 1, 2, ...}
    Geometric { mean: f64, dist: Geometric },

    /// shape 1.3 파레토, 지지집합 [beta_min, inf)
    Pareto { mean: f64, beta_min: f64, dist: Pareto<f64> },

    /// [0, 2*mean] 정수 균등분포
    Uniform { mean: f64, upper: u64 },
}

impl DelayModel {
    pub fn geometric(mean: f64) -> Result<Self> {
        check_mean(mean)?;
        let dist = Geometric::new(1.0 / (mean + 1.0)).map_err(|_| Error::InvalidMeanDelay { mean })?;
        Ok(DelayModel::Geometric { mean, dist })
    }

    pub fn pareto(mean: f64) -> Result<Self> {
        check_mean(mean)?;
        let beta_min = mean * (PARETO_SHAPE - 1.0) / PARETO_SHAPE;
        let dist =
            Pareto::new(beta_min, PARETO_SHAPE).map_err(|_| Error::InvalidMeanDelay { mean })?;
        Ok(DelayModel::Pareto {
            mean,
            beta_min,
            dist,
        })
    }

    pub fn uniform(mean: f64) -> Result<Self> {
        check_mean(mean)?;
        Ok(DelayModel::Uniform {
            mean,
            upper: (2.0 * mean).round() as u64,
        })
    }

    /// 지연 샘플링 (항상 0 이상)
    ///
    /// 파레토 샘플은 연속값 그대로 두고, bin 중심 비교에서 가장 가까운 bin으로 반올림된다.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            DelayModel::None => 0.0,
            DelayModel::Fixed(value) => *value,
            DelayModel::Geometric { dist, .. } => dist.sample(rng) as f64,
            DelayModel::Pareto { dist, .. } => dist.sample(rng),
            DelayModel::Uniform { upper, .. } => rng.gen_range(0..=*upper) as f64,
        }
    }

    /// 누적분포 P(X <= x)
    pub fn cdf(&self, x: f64) -> f64 {
        if x < 0.0 {
            return 0.0;
        }
        match self {
            DelayModel::None => 1.0,
            DelayModel::Fixed(value) => {
                if x >= *value {
                    1.0
                } else {
                    0.0
                }
            }
            DelayModel::Geometric { mean, .. } => {
                let p = 1.0 / (mean + 1.0);
                1.0 - (1.0 - p).powf(x.floor() + 1.0)
            }
            DelayModel::Pareto { beta_min, .. } => {
                if x < *beta_min {
                    0.0
                } else {
                    1.0 - (beta_min / x).powf(PARETO_SHAPE)
                }
            }
            DelayModel::Uniform { upper, .. } => {
                ((x.floor() + 1.0) / (*upper as f64 + 1.0)).min(1.0)
            }
        }
    }

    /// bin `i`, 구간 (i*q - q/2, i*q + q/2] 에 떨어질 확률
    pub fn bin_mass(&self, bin: usize, bin_width: f64) -> f64 {
        let center = bin as f64 * bin_width;
        let hi = self.cdf(center + bin_width / 2.0);
        if bin == 0 {
            return hi;
        }
        hi - self.cdf(center - bin_width / 2.0)
    }
}

fn check_mean(mean: f64) -> Result<()> {
    if mean > 0.0 && mean.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidMeanDelay { mean })
    }
}

/// 노드로 들어오는 링크의 확률 과정
#[derive(Debug, Clone)]
pub struct LinkProcess {
    pub loss: LossModel,
    pub delay: DelayModel,
}

impl LinkProcess {
    /// 손실도 지연도 없는 링크 (루트)
    pub fn identity() -> Self {
        Self {
            loss: LossModel::Lossless,
            delay: DelayModel::None,
        }
    }

    pub fn with_loss(loss: LossModel) -> Self {
        Self {
            loss,
            delay: DelayModel::None,
        }
    }

    pub fn with_delay(delay: DelayModel) -> Self {
        Self {
            loss: LossModel::Lossless,
            delay,
        }
    }

    /// 전달되면 true
    pub fn sample_loss<R: Rng + ?Sized>(&self, rng: &mut R) -> bool {
        self.loss.sample(rng)
    }

    pub fn tick_state<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.loss.tick(rng);
    }

    pub fn sample_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.delay.sample(rng)
    }
}

/// 연속 드롭 구간 통계
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BurstProfile {
    pub ticks: u64,
    pub total_drops: u64,
    pub bursts: u64,
    pub mean_burst_len: f64,
}

/// 손실 모델을 `ticks` 만큼 돌려 드롭을 run-length 로 집계
pub fn measure_bursts<R: Rng + ?Sized>(model: &mut LossModel, ticks: u64, rng: &mut R) -> BurstProfile {
    let mut total_drops = 0u64;
    let mut bursts = 0u64;
    let mut in_burst = false;

    for _ in 0..ticks {
        let dropped = !model.sample(rng);
        if dropped {
            total_drops += 1;
            if !in_burst {
                bursts += 1;
            }
        }
        in_burst = dropped;
        model.tick(rng);
    }

    BurstProfile {
        ticks,
        total_drops,
        bursts,
        mean_burst_len: if bursts == 0 {
            0.0
        } else {
            total_drops as f64 / bursts as f64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gilbert_elliott_escape_probability() {
        let mut rng = StdRng::seed_from_u64(1);
        let ge = GilbertElliott::new(0.1, &mut rng).unwrap();
        assert!((ge.prob_escape_bad - 0.009).abs() < 1e-12);
        assert_eq!(ge.bad_drop_prob, 1.0);

        // p가 너무 작으면 prob_escape_bad >= 1
        assert!(matches!(
            GilbertElliott::new(0.0005, &mut rng),
            Err(Error::InvalidEscapeProbability { .. })
        ));
        assert!(GilbertElliott::new(0.0, &mut rng).is_err());
        assert!(GilbertElliott::new(1.0, &mut rng).is_err());
    }

    #[test]
    fn test_gilbert_elliott_stationarity() {
        let loss_prob = 0.1;
        for initial in [LinkState::Good, LinkState::Bad] {
            let mut rng = StdRng::seed_from_u64(7);
            let mut ge = GilbertElliott::new(loss_prob, &mut rng).unwrap();
            ge.state = initial;

            let steps = 10_000_000u64;
            let mut bad = 0u64;
            for _ in 0..steps {
                ge.step(&mut rng);
                if ge.state == LinkState::Bad {
                    bad += 1;
                }
            }

            let fraction = bad as f64 / steps as f64;
            assert!(
                (fraction - loss_prob).abs() < 0.01,
                "initial={:?}, bad fraction={}",
                initial,
                fraction
            );
        }
    }

    #[test]
    fn test_bernoulli_rate() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = LossModel::bernoulli(0.2).unwrap();
        let n = 200_000;
        let delivered = (0..n).filter(|_| model.sample(&mut rng)).count();
        let loss = 1.0 - delivered as f64 / n as f64;
        assert!((loss - 0.2).abs() < 0.01);
        assert!(LossModel::bernoulli(1.5).is_err());
    }

    #[test]
    fn test_delay_means() {
        let mut rng = StdRng::seed_from_u64(11);
        let n = 200_000;
        for model in [
            DelayModel::geometric(3.0).unwrap(),
            DelayModel::uniform(3.0).unwrap(),
        ] {
            let mean = (0..n).map(|_| model.sample(&mut rng)).sum::<f64>() / n as f64;
            assert!((mean - 3.0).abs() < 0.1, "{:?} mean={}", model, mean);
        }

        let pareto = DelayModel::pareto(4.0).unwrap();
        if let DelayModel::Pareto { beta_min, .. } = pareto {
            for _ in 0..1000 {
                assert!(pareto.sample(&mut rng) >= beta_min);
            }
        }

        assert!(DelayModel::geometric(0.0).is_err());
        assert!(DelayModel::pareto(-1.0).is_err());
    }

    #[test]
    fn test_bin_mass_sums_to_one() {
        for model in [
            DelayModel::geometric(2.0).unwrap(),
            DelayModel::uniform(2.0).unwrap(),
            DelayModel::pareto(2.0).unwrap(),
            DelayModel::Fixed(3.0),
        ] {
            let total: f64 = (0..5000).map(|i| model.bin_mass(i, 1.0)).sum();
            assert!((total - 1.0).abs() < 1e-3, "{:?} total={}", model, total);
        }

        let uniform = DelayModel::uniform(1.0).unwrap();
        for i in 0..3 {
            assert!((uniform.bin_mass(i, 1.0) - 1.0 / 3.0).abs() < 1e-12);
        }
        assert_eq!(uniform.bin_mass(3, 1.0), 0.0);
    }

    #[test]
    fn test_burst_lengths() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut bernoulli = LossModel::bernoulli(0.1).unwrap();
        let profile = measure_bursts(&mut bernoulli, 1_000_000, &mut rng);
        assert!(profile.mean_burst_len < 2.0);

        let mut bursty = LossModel::GilbertElliott(GilbertElliott::new(0.1, &mut rng).unwrap());
        let profile = measure_bursts(&mut bursty, 1_000_000, &mut rng);
        assert!(profile.mean_burst_len > 20.0, "{:?}", profile);
    }
}
