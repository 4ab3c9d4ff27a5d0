//! 이진 멀티캐스트 트리
//!
//! 노드는 arena(`Vec<Node>`)에 pre-order 로 저장되고, 부모/자식은 인덱스로 참조한다.
//! 루트는 항상 인덱스 0.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::config::LinkConfig;
use crate::link::LinkProcess;
use crate::{Error, Result};

/// arena 인덱스
pub type NodeIndex = usize;

/// 노드 ID 발급기
///
/// 여러 시행이 공유해도 ID 는 단조 증가한다.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// 다음 ID (1부터 시작)
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// 트리 노드
#[derive(Debug, Clone)]
pub struct Node {
    /// 전역 고유 ID
    pub id: u64,

    /// 부모 인덱스 (루트면 None)
    pub parent: Option<NodeIndex>,

    /// (left, right) 자식 인덱스 (수신자면 None)
    pub children: Option<(NodeIndex, NodeIndex)>,

    /// 부모 -> 이 노드 링크
    pub link: LinkProcess,

    /// 독립 프로브로 측정한 실제 손실률
    pub true_loss: f64,

    /// 이 링크로 들어온 패킷 수
    pub packets_incoming: u64,
}

impl Node {
    fn new(parent: Option<NodeIndex>, link: LinkProcess) -> Self {
        Self {
            id: 0,
            parent,
            children: None,
            link,
            true_loss: 0.0,
            packets_incoming: 0,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn left(&self) -> Option<NodeIndex> {
        self.children.map(|(left, _)| left)
    }

    pub fn right(&self) -> Option<NodeIndex> {
        self.children.map(|(_, right)| right)
    }
}

/// 완전 이진 트리
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    depth: usize,
}

impl Tree {
    /// 깊이 `depth` 트리 생성 (depth 1 = 수신자 하나)
    pub fn build<R: Rng + ?Sized>(
        depth: usize,
        link: &LinkConfig,
        ids: &IdSequence,
        rng: &mut R,
    ) -> Result<Self> {
        if depth < 1 {
            return Err(Error::InvalidDepth { depth });
        }
        link.validate()?;

        let mut tree = Self {
            nodes: Vec::with_capacity((1usize << depth) - 1),
            depth,
        };
        tree.build_subtree(depth, None, link, ids, rng)?;
        Ok(tree)
    }

    fn build_subtree<R: Rng + ?Sized>(
        &mut self,
        depth: usize,
        parent: Option<NodeIndex>,
        link: &LinkConfig,
        ids: &IdSequence,
        rng: &mut R,
    ) -> Result<NodeIndex> {
        let index = self.nodes.len();
        let process = link.instantiate(parent.is_none(), rng)?;
        self.nodes.push(Node::new(parent, process));

        if depth > 1 {
            let left = self.build_subtree(depth - 1, Some(index), link, ids, rng)?;
            let right = self.build_subtree(depth - 1, Some(index), link, ids, rng)?;
            self.nodes[index].children = Some((left, right));
        }

        // 자식이 먼저 ID 를 받는다
        self.nodes[index].id = ids.next_id();
        Ok(index)
    }

    pub fn root(&self) -> NodeIndex {
        0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut Node {
        &mut self.nodes[index]
    }

    /// pre-order 노드 인덱스 (자신, 왼쪽 서브트리, 오른쪽 서브트리)
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> {
        0..self.nodes.len()
    }

    /// 왼쪽에서 오른쪽 순서의 수신자 (정규 수신자 순서)
    pub fn receivers(&self) -> Vec<NodeIndex> {
        self.receivers_under(self.root())
    }

    /// `index` 아래의 수신자
    pub fn receivers_under(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut out = Vec::new();
        self.collect_receivers(index, &mut out);
        out
    }

    fn collect_receivers(&self, index: NodeIndex, out: &mut Vec<NodeIndex>) {
        match self.nodes[index].children {
            None => out.push(index),
            Some((left, right)) => {
                self.collect_receivers(left, out);
                self.collect_receivers(right, out);
            }
        }
    }

    /// ID 로 노드 찾기
    pub fn index_of(&self, id: u64) -> Option<NodeIndex> {
        self.nodes.iter().position(|n| n.id == id)
    }

    /// 링크 교체 (특정 링크 동작 강제용)
    pub fn set_link(&mut self, index: NodeIndex, link: LinkProcess) {
        self.nodes[index].link = link;
    }

    fn fmt_subtree(&self, index: NodeIndex, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = &self.nodes[index];
        write!(f, "({}", node.id)?;
        if let Some((left, right)) = node.children {
            write!(f, " ")?;
            self.fmt_subtree(left, f)?;
            write!(f, " ")?;
            self.fmt_subtree(right, f)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_subtree(self.root(), f)
    }
}
