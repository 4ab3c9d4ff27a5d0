//! 프로브 시뮬레이터
//!
//! - 멀티캐스트 프로브: 분기점에서 복제, 드롭 지점 아래는 운명 공유
//! - 독립 프로브: 모든 링크를 매 tick 샘플링 (실제 손실률 측정용)
//! - 지연 멀티캐스트 프로브: 경로 누적 지연

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::trace;

use crate::topology::{NodeIndex, Tree};
use crate::{Error, Result};

/// 수신자 ID 별 관측 벡터 (정규 수신자 순서)
///
/// 새 프로브가 닿지 않은 수신자는 이전 값을 유지한다.
#[derive(Debug, Clone)]
pub struct Observations<T> {
    ids: Vec<u64>,
    values: Vec<T>,
    slots: HashMap<u64, usize>,
}

impl<T: Copy> Observations<T> {
    pub fn new(tree: &Tree, initial: T) -> Self {
        let ids: Vec<u64> = tree
            .receivers()
            .into_iter()
            .map(|index| tree.node(index).id)
            .collect();
        let slots = ids.iter().enumerate().map(|(slot, &id)| (id, slot)).collect();

        Self {
            values: vec![initial; ids.len()],
            ids,
            slots,
        }
    }

    /// 프로브 결과 반영
    pub fn record(&mut self, outcome: &[(u64, T)]) -> Result<()> {
        for &(id, value) in outcome {
            let slot = *self.slots.get(&id).ok_or(Error::UnknownReceiver { id })?;
            self.values[slot] = value;
        }
        Ok(())
    }

    pub fn get(&self, id: u64) -> Option<T> {
        self.slots.get(&id).map(|&slot| self.values[slot])
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 트리 위에서 프로브를 구동
///
/// 시행 하나의 모든 난수는 내부 `StdRng` 하나에서 나온다.
pub struct ProbeSimulator {
    tree: Tree,
    rng: StdRng,
    ticks: u64,
}

impl ProbeSimulator {
    pub fn new(tree: Tree, rng: StdRng) -> Self {
        Self {
            tree,
            rng,
            ticks: 0,
        }
    }

    pub fn with_seed(tree: Tree, seed: u64) -> Self {
        Self::new(tree, StdRng::seed_from_u64(seed))
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// 트리와 난수원 반환 (같은 시행의 다음 단계로 넘길 때)
    pub fn into_parts(self) -> (Tree, StdRng) {
        (self.tree, self.rng)
    }

    /// 모든 링크 상태를 한 스텝 전이
    pub fn tick(&mut self) {
        for index in self.tree.nodes() {
            self.tree.node_mut(index).link.tick_state(&mut self.rng);
        }
        self.ticks += 1;
    }

    /// 멀티캐스트 프로브 전송
    ///
    /// 수신자마다 정확히 한 번 `(receiver_id, delivered)` 를 돌려준다.
    pub fn send_multicast_probe(&mut self, tick: u64) -> Vec<(u64, bool)> {
        let mut out = Vec::with_capacity(self.tree.receivers().len());
        let root = self.tree.root();
        propagate(&self.tree, &mut self.rng, root, &mut out);
        trace!(
            tick,
            delivered = out.iter().filter(|(_, d)| *d).count(),
            "multicast probe"
        );
        out
    }

    /// 독립 프로브 (실제 손실률 측정)
    ///
    /// 조상 결과와 관계없이 모든 비루트 링크를 샘플링하고 이동 평균으로 누적한다.
    pub fn send_independent_probes(&mut self, tick: u64) {
        for index in self.tree.nodes() {
            if self.tree.node(index).is_root() {
                continue;
            }
            let delivered = self.tree.node(index).link.sample_loss(&mut self.rng);
            let node = self.tree.node_mut(index);
            node.packets_incoming += 1;
            let loss = if delivered { 0.0 } else { 1.0 };
            node.true_loss += (loss - node.true_loss) / node.packets_incoming as f64;
        }
        trace!(tick, "independent probes");
    }

    /// 지연 멀티캐스트 프로브, 수신자 순서의 종단 지연
    pub fn send_delayed_multicast_probe(&mut self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.tree.receivers().len());
        let root = self.tree.root();
        propagate_delay(&self.tree, &mut self.rng, root, 0.0, &mut out);
        out
    }
}

fn propagate(tree: &Tree, rng: &mut StdRng, index: NodeIndex, out: &mut Vec<(u64, bool)>) {
    let node = tree.node(index);
    let delivered = node.is_root() || node.link.sample_loss(rng);

    if !delivered {
        // 드롭된 링크 아래 수신자는 자기 링크를 샘플링하지 않고 모두 실패
        out.extend(
            tree.receivers_under(index)
                .into_iter()
                .map(|r| (tree.node(r).id, false)),
        );
        return;
    }

    match node.children {
        None => out.push((node.id, true)),
        Some((left, right)) => {
            propagate(tree, rng, left, out);
            propagate(tree, rng, right, out);
        }
    }
}

fn propagate_delay(tree: &Tree, rng: &mut StdRng, index: NodeIndex, elapsed: f64, out: &mut Vec<f64>) {
    let node = tree.node(index);
    let elapsed = elapsed + node.link.sample_delay(rng);

    match node.children {
        None => out.push(elapsed),
        Some((left, right)) => {
            propagate_delay(tree, rng, left, elapsed, out);
            propagate_delay(tree, rng, right, elapsed, out);
        }
    }
}
