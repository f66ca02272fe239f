//! Tree nodes and the split/route/traverse protocol.
//!
//! Every node runs as its own tokio task and owns an unbounded mailbox. A node
//! starts out as a leaf holding entries; once an insert pushes it past its
//! capacity it splits its entries by rank into two freshly spawned leaves and
//! turns into a router for the rest of its life. Routers never answer keyed
//! requests themselves: the request, reply channel included, is moved into the
//! mailbox of the child responsible for the key, so the leaf answers the
//! original caller directly.
//!
//! Whole-tree queries (`Traverse`, `Layout`) fan out to both children and are
//! gathered by a detached task bounded by [`NodeConfig::traverse_timeout`], so
//! the router keeps draining its mailbox while it waits.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    future::Future,
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::error::{Result, TreeError};

/// Reply channel carried inside a request.
pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: i64,
    pub value: String,
}

impl Item {
    pub fn new(key: i64, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.key, self.value)
    }
}

/// Settings every node of one tree shares; children inherit them on split.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Entries a leaf may hold before it splits.
    pub max_size: usize,
    /// Upper bound on how long a router waits for both children during a
    /// scatter-gather query.
    pub traverse_timeout: Duration,
}

/// Label of a node, used for logging and in [`Layout`].
///
/// Roots are named `tree-<id>`; children append `.l` or `.r` to their parent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(Arc<str>);

impl NodeId {
    pub fn root(tenant_id: i64) -> Self {
        Self(format!("tree-{tenant_id}").into())
    }

    fn child(&self, side: &str) -> Self {
        Self(format!("{}.{side}", self.0).into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shape of a (sub)tree as reported by a `Layout` query.
///
/// On the wire a layout is a flat pre-order list of [`LayoutEntry`], so a
/// skewed tree does not turn into deeply nested JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<LayoutEntry>", try_from = "Vec<LayoutEntry>")]
pub enum Layout {
    Leaf {
        id: String,
        len: usize,
    },
    Router {
        id: String,
        split_key: i64,
        left: Box<Layout>,
        right: Box<Layout>,
    },
}

/// One node of a [`Layout`] in pre-order. A router is followed by its left
/// subtree, then its right subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayoutEntry {
    Leaf { id: String, len: usize },
    Router { id: String, split_key: i64 },
}

impl Layout {
    /// Every node with its depth (root at 0), in pre-order.
    pub fn preorder(&self) -> Vec<(usize, &Layout)> {
        let mut visited = Vec::new();
        let mut pending = vec![(0, self)];
        while let Some((depth, layout)) = pending.pop() {
            visited.push((depth, layout));
            if let Layout::Router { left, right, .. } = layout {
                pending.push((depth + 1, right.as_ref()));
                pending.push((depth + 1, left.as_ref()));
            }
        }
        visited
    }

    /// Number of nodes on the longest root-to-leaf path.
    pub fn depth(&self) -> usize {
        self.preorder()
            .into_iter()
            .map(|(depth, _)| depth + 1)
            .max()
            .unwrap_or(1)
    }

    /// Entry counts of all leaves, left to right.
    pub fn leaf_sizes(&self) -> Vec<usize> {
        self.preorder()
            .into_iter()
            .filter_map(|(_, layout)| match layout {
                Layout::Leaf { len, .. } => Some(*len),
                Layout::Router { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.leaf_sizes().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Layout> for Vec<LayoutEntry> {
    fn from(layout: Layout) -> Self {
        let mut entries = Vec::new();
        let mut pending = vec![layout];
        while let Some(layout) = pending.pop() {
            match layout {
                Layout::Leaf { id, len } => entries.push(LayoutEntry::Leaf { id, len }),
                Layout::Router {
                    id,
                    split_key,
                    left,
                    right,
                } => {
                    entries.push(LayoutEntry::Router { id, split_key });
                    pending.push(*right);
                    pending.push(*left);
                }
            }
        }
        entries
    }
}

impl TryFrom<Vec<LayoutEntry>> for Layout {
    type Error = String;

    /// Rebuilds the tree from the back: every router finds its left and
    /// right subtrees on top of the stack.
    fn try_from(entries: Vec<LayoutEntry>) -> std::result::Result<Self, Self::Error> {
        let mut built: Vec<Layout> = Vec::new();
        for entry in entries.into_iter().rev() {
            match entry {
                LayoutEntry::Leaf { id, len } => built.push(Layout::Leaf { id, len }),
                LayoutEntry::Router { id, split_key } => {
                    let (Some(left), Some(right)) = (built.pop(), built.pop()) else {
                        return Err(format!("router {id} is missing a child"));
                    };
                    built.push(Layout::Router {
                        id,
                        split_key,
                        left: Box::new(left),
                        right: Box::new(right),
                    });
                }
            }
        }
        match (built.pop(), built.is_empty()) {
            (Some(root), true) => Ok(root),
            (None, _) => Err("empty layout".to_string()),
            (Some(_), false) => Err("layout has more than one root".to_string()),
        }
    }
}

/// Operations a node answers. Each carries the channel its answer goes to.
#[derive(Debug)]
pub enum NodeRequest {
    Insert { item: Item, reply: Reply<Item> },
    Search { key: i64, reply: Reply<Item> },
    Delete { key: i64, reply: Reply<Item> },
    Traverse { reply: Reply<Vec<Item>> },
    Layout { reply: Reply<Layout> },
}

impl NodeRequest {
    fn key(&self) -> Option<i64> {
        match self {
            NodeRequest::Insert { item, .. } => Some(item.key),
            NodeRequest::Search { key, .. } | NodeRequest::Delete { key, .. } => Some(*key),
            NodeRequest::Traverse { .. } | NodeRequest::Layout { .. } => None,
        }
    }

    /// Answers the request with `error` instead of executing it.
    pub(crate) fn reject(self, error: TreeError) {
        // The caller may have given up already; nothing to do then.
        match self {
            NodeRequest::Insert { reply, .. }
            | NodeRequest::Search { reply, .. }
            | NodeRequest::Delete { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            NodeRequest::Traverse { reply } => {
                let _ = reply.send(Err(error));
            }
            NodeRequest::Layout { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

#[derive(Debug)]
enum Envelope {
    Request(NodeRequest),
    Teardown,
}

/// Address of a running node.
#[derive(Debug, Clone)]
pub struct NodeRef {
    id: NodeId,
    mailbox: mpsc::UnboundedSender<Envelope>,
}

impl NodeRef {
    /// Spawns an empty leaf onto the current tokio runtime.
    pub fn spawn_leaf(id: NodeId, config: NodeConfig) -> Self {
        Self::spawn(id, config, BTreeMap::new())
    }

    fn spawn(id: NodeId, config: NodeConfig, content: BTreeMap<i64, String>) -> Self {
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let node = Node {
            id: id.clone(),
            config,
            state: NodeState::Leaf(Leaf { content }),
        };
        tokio::spawn(node.run(inbox));
        Self { id, mailbox }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Delivers `request` to this node. If the node is gone the request is
    /// answered with [`TreeError::Unavailable`].
    pub fn send(&self, request: NodeRequest) {
        if let Err(mpsc::error::SendError(envelope)) =
            self.mailbox.send(Envelope::Request(request))
        {
            debug!(node = %self.id, "mailbox closed, rejecting request");
            if let Envelope::Request(request) = envelope {
                request.reject(TreeError::Unavailable);
            }
        }
    }

    /// Stops this node and, if it is a router, the whole subtree below it.
    pub fn teardown(&self) {
        let _ = self.mailbox.send(Envelope::Teardown);
    }

    /// True once the node task has stopped.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub async fn insert(&self, key: i64, value: impl Into<String>) -> Result<Item> {
        let item = Item::new(key, value);
        self.ask(|reply| NodeRequest::Insert { item, reply }).await
    }

    pub async fn search(&self, key: i64) -> Result<Item> {
        self.ask(|reply| NodeRequest::Search { key, reply }).await
    }

    pub async fn delete(&self, key: i64) -> Result<Item> {
        self.ask(|reply| NodeRequest::Delete { key, reply }).await
    }

    pub async fn traverse(&self) -> Result<Vec<Item>> {
        self.ask(|reply| NodeRequest::Traverse { reply }).await
    }

    pub async fn layout(&self) -> Result<Layout> {
        self.ask(|reply| NodeRequest::Layout { reply }).await
    }

    async fn ask<T>(&self, request: impl FnOnce(Reply<T>) -> NodeRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(request(reply));
        response.await.unwrap_or(Err(TreeError::Unavailable))
    }
}

struct Node {
    id: NodeId,
    config: NodeConfig,
    state: NodeState,
}

enum NodeState {
    Leaf(Leaf),
    Router(Router),
}

struct Leaf {
    content: BTreeMap<i64, String>,
}

struct Router {
    left: NodeRef,
    right: NodeRef,
    split_key: i64,
}

impl Node {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        debug!(node = %self.id, max_size = self.config.max_size, "node created");
        while let Some(envelope) = inbox.recv().await {
            if self.handle(envelope).is_break() {
                break;
            }
        }
        debug!(node = %self.id, "node stopped");
    }

    fn handle(&mut self, envelope: Envelope) -> ControlFlow<()> {
        let request = match envelope {
            Envelope::Request(request) => request,
            Envelope::Teardown => {
                if let NodeState::Router(router) = &self.state {
                    router.left.teardown();
                    router.right.teardown();
                }
                return ControlFlow::Break(());
            }
        };

        let overfull = match &mut self.state {
            NodeState::Leaf(leaf) => leaf.apply(&self.id, request) > self.config.max_size,
            NodeState::Router(router) => {
                router.dispatch(&self.id, self.config.traverse_timeout, request);
                false
            }
        };
        if overfull {
            self.split();
        }
        ControlFlow::Continue(())
    }

    fn split(&mut self) {
        let NodeState::Leaf(leaf) = &mut self.state else {
            return;
        };
        if leaf.content.len() < 2 {
            return;
        }
        let content = std::mem::take(&mut leaf.content);
        let Some((split_key, lower, upper)) = split_by_rank(content) else {
            return;
        };
        info!(
            node = %self.id,
            split_key,
            left = lower.len(),
            right = upper.len(),
            "splitting leaf"
        );

        let left = NodeRef::spawn(self.id.child("l"), self.config, lower);
        let right = NodeRef::spawn(self.id.child("r"), self.config, upper);
        self.state = NodeState::Router(Router {
            left,
            right,
            split_key,
        });
    }
}

/// Splits `content` by rank: the lower `len / 2` entries and the rest.
///
/// Returns the largest key of the lower half alongside both halves, or `None`
/// when there are fewer than two entries.
fn split_by_rank(
    mut lower: BTreeMap<i64, String>,
) -> Option<(i64, BTreeMap<i64, String>, BTreeMap<i64, String>)> {
    if lower.len() < 2 {
        return None;
    }
    let mid = lower.len() / 2;
    let split_key = *lower.keys().nth(mid - 1)?;
    let upper_start = *lower.keys().nth(mid)?;
    let upper = lower.split_off(&upper_start);
    Some((split_key, lower, upper))
}

impl Leaf {
    /// Executes `request` and returns the entry count afterwards.
    fn apply(&mut self, id: &NodeId, request: NodeRequest) -> usize {
        match request {
            NodeRequest::Insert { item, reply } => {
                debug!(node = %id, key = item.key, value = %item.value, "insert");
                let result = match self.content.entry(item.key) {
                    Entry::Occupied(existing) => Err(TreeError::KeyAlreadyExists {
                        key: item.key,
                        value: existing.get().clone(),
                    }),
                    Entry::Vacant(slot) => {
                        slot.insert(item.value.clone());
                        Ok(item)
                    }
                };
                let _ = reply.send(result);
            }
            NodeRequest::Search { key, reply } => {
                let result = self
                    .content
                    .get(&key)
                    .map(|value| Item::new(key, value.clone()))
                    .ok_or(TreeError::NoSuchKey { key });
                let _ = reply.send(result);
            }
            NodeRequest::Delete { key, reply } => {
                debug!(node = %id, key, "delete");
                let result = self
                    .content
                    .remove(&key)
                    .map(|value| Item::new(key, value))
                    .ok_or(TreeError::NoSuchKey { key });
                let _ = reply.send(result);
            }
            NodeRequest::Traverse { reply } => {
                let items = self
                    .content
                    .iter()
                    .map(|(key, value)| Item::new(*key, value.clone()))
                    .collect();
                let _ = reply.send(Ok(items));
            }
            NodeRequest::Layout { reply } => {
                let _ = reply.send(Ok(Layout::Leaf {
                    id: id.to_string(),
                    len: self.content.len(),
                }));
            }
        }
        self.content.len()
    }
}

impl Router {
    fn dispatch(&self, id: &NodeId, limit: Duration, request: NodeRequest) {
        match request {
            NodeRequest::Traverse { reply } => {
                let (left, right) = self.scatter(|reply| NodeRequest::Traverse { reply });
                tokio::spawn(respond(reply, gather(limit, left, right, merge_sorted)));
            }
            NodeRequest::Layout { reply } => {
                let (left, right) = self.scatter(|reply| NodeRequest::Layout { reply });
                let id = id.to_string();
                let split_key = self.split_key;
                tokio::spawn(respond(
                    reply,
                    gather(limit, left, right, move |left, right| Layout::Router {
                        id,
                        split_key,
                        left: Box::new(left),
                        right: Box::new(right),
                    }),
                ));
            }
            NodeRequest::Insert { .. } | NodeRequest::Search { .. } | NodeRequest::Delete { .. } => {
                self.forward(id, request)
            }
        }
    }

    /// Keys up to and including `split_key` go left, larger keys go right.
    fn forward(&self, id: &NodeId, request: NodeRequest) {
        let key = request.key();
        let child = if key.is_some_and(|key| key > self.split_key) {
            &self.right
        } else {
            &self.left
        };
        debug!(node = %id, ?key, child = %child.id(), "forwarding");
        child.send(request);
    }

    fn scatter<T>(
        &self,
        request: impl Fn(Reply<T>) -> NodeRequest,
    ) -> (oneshot::Receiver<Result<T>>, oneshot::Receiver<Result<T>>) {
        let (left_reply, left) = oneshot::channel();
        let (right_reply, right) = oneshot::channel();
        self.left.send(request(left_reply));
        self.right.send(request(right_reply));
        (left, right)
    }
}

async fn respond<T>(reply: Reply<T>, outcome: impl Future<Output = Result<T>>) {
    let _ = reply.send(outcome.await);
}

/// Waits for both children, at most `limit`, and combines their answers.
///
/// A reply that shows up after the deadline lands in a dropped receiver and
/// is discarded. Any child failure is reported as `TraverseFailed`.
async fn gather<T>(
    limit: Duration,
    left: oneshot::Receiver<Result<T>>,
    right: oneshot::Receiver<Result<T>>,
    combine: impl FnOnce(T, T) -> T,
) -> Result<T> {
    let both = async move { tokio::join!(left, right) };
    let (left, right) = tokio::time::timeout(limit, both)
        .await
        .map_err(|_| {
            TreeError::traverse_failed(format!("children did not answer within {limit:?}"))
        })?;
    let left = child_outcome("left", left)?;
    let right = child_outcome("right", right)?;
    Ok(combine(left, right))
}

fn child_outcome<T>(
    side: &str,
    reply: std::result::Result<Result<T>, oneshot::error::RecvError>,
) -> Result<T> {
    match reply {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error @ TreeError::TraverseFailed { .. })) => Err(error),
        Ok(Err(error)) => Err(TreeError::traverse_failed(format!("{side} child: {error}"))),
        Err(_) => Err(TreeError::traverse_failed(format!(
            "{side} child dropped the request"
        ))),
    }
}

/// Merges two ascending runs into one ascending sequence.
fn merge_sorted(left: Vec<Item>, right: Vec<Item>) -> Vec<Item> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l.key <= r.key,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        merged.extend(next);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_size: usize) -> NodeConfig {
        NodeConfig {
            max_size,
            traverse_timeout: Duration::from_secs(1),
        }
    }

    fn leaf(max_size: usize) -> NodeRef {
        NodeRef::spawn_leaf(NodeId::root(1), config(max_size))
    }

    fn entries(keys: &[i64]) -> BTreeMap<i64, String> {
        keys.iter().map(|key| (*key, format!("v{key}"))).collect()
    }

    #[test]
    fn split_by_rank_halves_by_count() {
        let (split_key, lower, upper) =
            split_by_rank(entries(&[40, 10, 30, 20, 50])).expect("five entries split");
        assert_eq!(split_key, 20);
        assert_eq!(lower.keys().copied().collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(upper.keys().copied().collect::<Vec<_>>(), vec![30, 40, 50]);
    }

    #[test]
    fn split_by_rank_ignores_value_distribution() {
        let (split_key, lower, upper) =
            split_by_rank(entries(&[1, 2, 3, 1_000_000])).expect("four entries split");
        assert_eq!(split_key, 2);
        assert_eq!(lower.len(), 2);
        assert_eq!(upper.len(), 2);
    }

    #[test]
    fn split_by_rank_needs_two_entries() {
        assert!(split_by_rank(entries(&[7])).is_none());
        assert!(split_by_rank(BTreeMap::new()).is_none());
    }

    #[test]
    fn merge_sorted_interleaves_runs() {
        let left = vec![Item::new(1, "a"), Item::new(4, "d")];
        let right = vec![Item::new(2, "b"), Item::new(3, "c"), Item::new(9, "z")];
        let keys: Vec<i64> = merge_sorted(left, right).iter().map(|i| i.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 9]);
    }

    #[tokio::test]
    async fn leaf_inserts_and_searches() {
        let node = leaf(4);
        assert_eq!(node.insert(5, "x").await, Ok(Item::new(5, "x")));
        assert_eq!(node.search(5).await, Ok(Item::new(5, "x")));
        assert_eq!(node.search(6).await, Err(TreeError::NoSuchKey { key: 6 }));
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_the_stored_value() {
        let node = leaf(4);
        node.insert(5, "x").await.expect("first insert");
        assert_eq!(
            node.insert(5, "y").await,
            Err(TreeError::KeyAlreadyExists {
                key: 5,
                value: "x".to_string()
            })
        );
        assert_eq!(node.search(5).await, Ok(Item::new(5, "x")));
    }

    #[tokio::test]
    async fn delete_removes_and_reports_missing_keys() {
        let node = leaf(4);
        node.insert(3, "c").await.expect("insert");
        assert_eq!(node.delete(3).await, Ok(Item::new(3, "c")));
        assert_eq!(node.delete(3).await, Err(TreeError::NoSuchKey { key: 3 }));
        assert_eq!(node.search(3).await, Err(TreeError::NoSuchKey { key: 3 }));
    }

    #[tokio::test]
    async fn overfull_leaf_becomes_router_with_two_leaves() {
        let node = leaf(2);
        for key in [1, 3, 2] {
            node.insert(key, format!("v{key}")).await.expect("insert");
        }

        let layout = node.layout().await.expect("layout");
        match &layout {
            Layout::Router {
                split_key,
                left,
                right,
                ..
            } => {
                assert_eq!(*split_key, 1);
                assert_eq!(left.leaf_sizes(), vec![1]);
                assert_eq!(right.leaf_sizes(), vec![2]);
            }
            other => panic!("expected router, got {other:?}"),
        }
        assert_eq!(layout.depth(), 2);
        assert_eq!(layout.len(), 3);
    }

    #[tokio::test]
    async fn router_forwards_keyed_requests() {
        let node = leaf(2);
        for key in 1..=10 {
            node.insert(key, format!("v{key}")).await.expect("insert");
        }
        for key in 1..=10 {
            assert_eq!(node.search(key).await, Ok(Item::new(key, format!("v{key}"))));
        }
        assert_eq!(node.delete(7).await, Ok(Item::new(7, "v7")));
        assert_eq!(node.search(7).await, Err(TreeError::NoSuchKey { key: 7 }));
        assert_eq!(
            node.insert(4, "again").await,
            Err(TreeError::KeyAlreadyExists {
                key: 4,
                value: "v4".to_string()
            })
        );
    }

    #[tokio::test]
    async fn leaves_never_exceed_capacity() {
        let node = leaf(3);
        for key in [50, 10, 40, 20, 30, 60, 5, 45, 15, 35, 25, 55] {
            node.insert(key, "v").await.expect("insert");
        }
        let layout = node.layout().await.expect("layout");
        assert!(layout.leaf_sizes().iter().all(|len| *len <= 3));
        assert_eq!(layout.len(), 12);
    }

    #[tokio::test]
    async fn traverse_returns_items_in_key_order() {
        let node = leaf(2);
        for (key, value) in [(1, "a"), (3, "b"), (2, "c")] {
            node.insert(key, value).await.expect("insert");
        }
        assert_eq!(
            node.traverse().await,
            Ok(vec![Item::new(1, "a"), Item::new(2, "c"), Item::new(3, "b")])
        );
    }

    #[tokio::test]
    async fn traverse_fails_when_a_child_stalls() {
        // A mailbox that is never drained stands in for a hung child.
        let (stalled, _inbox) = mpsc::unbounded_channel();
        let router = Router {
            left: NodeRef {
                id: NodeId::root(1).child("l"),
                mailbox: stalled,
            },
            right: NodeRef::spawn_leaf(NodeId::root(1).child("r"), config(1)),
            split_key: 1,
        };
        let (reply, response) = oneshot::channel();
        router.dispatch(
            &NodeId::root(1),
            Duration::from_millis(50),
            NodeRequest::Traverse { reply },
        );
        let outcome = response.await.expect("router answers");
        assert!(matches!(outcome, Err(TreeError::TraverseFailed { .. })));
    }

    #[tokio::test]
    async fn layout_fails_when_a_child_is_gone() {
        let (gone, inbox) = mpsc::unbounded_channel();
        drop(inbox);
        let router = Router {
            left: NodeRef::spawn_leaf(NodeId::root(1).child("l"), config(1)),
            right: NodeRef {
                id: NodeId::root(1).child("r"),
                mailbox: gone,
            },
            split_key: 1,
        };
        let (reply, response) = oneshot::channel();
        router.dispatch(
            &NodeId::root(1),
            Duration::from_secs(1),
            NodeRequest::Layout { reply },
        );
        let outcome = response.await.expect("router answers");
        assert_eq!(
            outcome,
            Err(TreeError::TraverseFailed {
                reason: "right child: tree service is not available".to_string()
            })
        );
    }

    async fn wait_closed(node: &NodeRef) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !node.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} still running", node.id()));
    }

    #[tokio::test]
    async fn teardown_stops_the_node() {
        let node = leaf(1);
        node.insert(1, "a").await.expect("insert");
        node.insert(2, "b").await.expect("insert");
        node.teardown();

        wait_closed(&node).await;
        assert_eq!(node.search(1).await, Err(TreeError::Unavailable));
    }

    #[tokio::test]
    async fn router_teardown_reaches_both_children() {
        let id = NodeId::root(1);
        let left = NodeRef::spawn(id.child("l"), config(2), entries(&[1]));
        let right = NodeRef::spawn(id.child("r"), config(2), entries(&[2]));
        let mut node = Node {
            id,
            config: config(2),
            state: NodeState::Router(Router {
                left: left.clone(),
                right: right.clone(),
                split_key: 1,
            }),
        };

        assert!(node.handle(Envelope::Teardown).is_break());
        wait_closed(&left).await;
        wait_closed(&right).await;
    }

    #[tokio::test]
    async fn teardown_cascades_through_grandchildren() {
        let id = NodeId::root(1);
        let inner_id = id.child("l");
        let grandchildren = [
            NodeRef::spawn(inner_id.child("l"), config(2), entries(&[1])),
            NodeRef::spawn(inner_id.child("r"), config(2), entries(&[2])),
        ];
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let inner = Node {
            id: inner_id.clone(),
            config: config(2),
            state: NodeState::Router(Router {
                left: grandchildren[0].clone(),
                right: grandchildren[1].clone(),
                split_key: 1,
            }),
        };
        tokio::spawn(inner.run(inbox));
        let inner = NodeRef {
            id: inner_id,
            mailbox,
        };
        let right = NodeRef::spawn(id.child("r"), config(2), entries(&[3]));
        let mut root = Node {
            id,
            config: config(2),
            state: NodeState::Router(Router {
                left: inner.clone(),
                right: right.clone(),
                split_key: 2,
            }),
        };

        assert!(root.handle(Envelope::Teardown).is_break());
        for node in [&inner, &right, &grandchildren[0], &grandchildren[1]] {
            wait_closed(node).await;
        }
    }

    #[test]
    fn layout_travels_as_a_flat_preorder_list() {
        let layout = Layout::Router {
            id: "tree-1".to_string(),
            split_key: 5,
            left: Box::new(Layout::Leaf {
                id: "tree-1.l".to_string(),
                len: 2,
            }),
            right: Box::new(Layout::Router {
                id: "tree-1.r".to_string(),
                split_key: 9,
                left: Box::new(Layout::Leaf {
                    id: "tree-1.r.l".to_string(),
                    len: 1,
                }),
                right: Box::new(Layout::Leaf {
                    id: "tree-1.r.r".to_string(),
                    len: 3,
                }),
            }),
        };

        let encoded = serde_json::to_value(&layout).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!([
                { "type": "router", "id": "tree-1", "split_key": 5 },
                { "type": "leaf", "id": "tree-1.l", "len": 2 },
                { "type": "router", "id": "tree-1.r", "split_key": 9 },
                { "type": "leaf", "id": "tree-1.r.l", "len": 1 },
                { "type": "leaf", "id": "tree-1.r.r", "len": 3 },
            ])
        );
        let decoded: Layout = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, layout);
    }

    #[test]
    fn malformed_layout_lists_are_rejected() {
        let orphan_router = serde_json::json!([
            { "type": "router", "id": "tree-1", "split_key": 5 },
            { "type": "leaf", "id": "tree-1.l", "len": 2 },
        ]);
        assert!(serde_json::from_value::<Layout>(orphan_router).is_err());

        let two_roots = serde_json::json!([
            { "type": "leaf", "id": "tree-1", "len": 0 },
            { "type": "leaf", "id": "tree-2", "len": 0 },
        ]);
        assert!(serde_json::from_value::<Layout>(two_roots).is_err());

        assert!(serde_json::from_value::<Layout>(serde_json::json!([])).is_err());
    }
}
