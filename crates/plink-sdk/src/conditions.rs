//! Composable error/state flags surfaced to the service.
//!
//! Conditions form a tree declared at startup. Breaking a node breaks its
//! whole subtree; fixing a node bubbles up and fixes each ancestor whose
//! children are all OK again. Changes surface as `CONDITION_CHANGED` events,
//! coalesced per subtree so a cascade reports once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use plink_files::EventSink;
use plink_protocol::{Event, EventKind, Source};
use serde_json::json;
use tracing::debug;

/// Changes within one subtree inside this window collapse into one event.
pub const CONDITION_COALESCE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondState {
    Unknown,
    Ok,
    Nok,
}

struct CondNode {
    name: String,
    state: CondState,
    reason: Option<String>,
    priority: i32,
    changed_at: Instant,
    parent: Option<usize>,
    children: Vec<usize>,
}

struct TreeInner {
    nodes: Vec<CondNode>,
    by_name: HashMap<String, usize>,
    last_emit: HashMap<usize, Instant>,
}

pub struct ConditionTree {
    inner: Mutex<TreeInner>,
    sink: Mutex<Option<EventSink>>,
}

impl ConditionTree {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                nodes: Vec::new(),
                by_name: HashMap::new(),
                last_emit: HashMap::new(),
            }),
            sink: Mutex::new(None),
        }
    }

    /// The stock connectivity chain: INTERNET > HTTP > TOKEN > API.
    pub fn connectivity() -> Self {
        let tree = Self::new();
        tree.add("INTERNET", None, 130);
        tree.add("HTTP", Some("INTERNET"), 120);
        tree.add("TOKEN", Some("HTTP"), 110);
        tree.add("API", Some("TOKEN"), 100);
        tree
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock().expect("cond lock") = Some(sink);
    }

    /// Declare a condition. Unknown parents and duplicate names are ignored
    /// with a log line; the tree is static after startup by convention.
    pub fn add(&self, name: &str, parent: Option<&str>, priority: i32) {
        let mut inner = self.inner.lock().expect("cond lock");
        if inner.by_name.contains_key(name) {
            debug!("condition {name} already declared");
            return;
        }
        let parent_idx = match parent {
            Some(parent_name) => match inner.by_name.get(parent_name).copied() {
                Some(idx) => Some(idx),
                None => {
                    debug!("condition parent {parent_name} unknown, adding {name} as root");
                    None
                }
            },
            None => None,
        };
        let idx = inner.nodes.len();
        inner.nodes.push(CondNode {
            name: name.to_string(),
            state: CondState::Unknown,
            reason: None,
            priority,
            changed_at: Instant::now(),
            parent: parent_idx,
            children: Vec::new(),
        });
        inner.by_name.insert(name.to_string(), idx);
        if let Some(parent_idx) = parent_idx {
            inner.nodes[parent_idx].children.push(idx);
        }
    }

    pub fn state(&self, name: &str) -> Option<CondState> {
        let inner = self.inner.lock().expect("cond lock");
        inner.by_name.get(name).map(|&idx| inner.nodes[idx].state)
    }

    pub fn reason(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().expect("cond lock");
        inner
            .by_name
            .get(name)
            .and_then(|&idx| inner.nodes[idx].reason.clone())
    }

    /// Highest-priority broken condition, for rendering one headline problem.
    pub fn worst(&self) -> Option<(String, Option<String>)> {
        let inner = self.inner.lock().expect("cond lock");
        inner
            .nodes
            .iter()
            .filter(|node| node.state == CondState::Nok)
            .max_by_key(|node| node.priority)
            .map(|node| (node.name.clone(), node.reason.clone()))
    }

    /// Update one condition and propagate.
    pub fn set(&self, name: &str, ok: bool, reason: Option<&str>) {
        let mut changed: Vec<usize> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("cond lock");
            let Some(&idx) = inner.by_name.get(name) else {
                debug!("unknown condition {name}");
                return;
            };
            if ok {
                if inner.nodes[idx].state != CondState::Ok {
                    mark(&mut inner, idx, CondState::Ok, None, &mut changed);
                }
                // Fix bubbles: a parent whose children are all OK is OK.
                let mut cursor = inner.nodes[idx].parent;
                while let Some(parent) = cursor {
                    let all_ok = inner.nodes[parent]
                        .children
                        .iter()
                        .all(|&child| inner.nodes[child].state == CondState::Ok);
                    if !all_ok || inner.nodes[parent].state == CondState::Ok {
                        break;
                    }
                    mark(&mut inner, parent, CondState::Ok, None, &mut changed);
                    cursor = inner.nodes[parent].parent;
                }
            } else {
                // Break cascades down the whole subtree.
                let mut stack = vec![idx];
                let mut first = true;
                while let Some(cursor) = stack.pop() {
                    if inner.nodes[cursor].state != CondState::Nok {
                        let node_reason = if first { reason.map(str::to_string) } else { None };
                        mark(&mut inner, cursor, CondState::Nok, node_reason, &mut changed);
                    }
                    first = false;
                    stack.extend(inner.nodes[cursor].children.iter().copied());
                }
            }
        }
        self.emit_changes(&changed);
    }

    fn emit_changes(&self, changed: &[usize]) {
        if changed.is_empty() {
            return;
        }
        let sink = self.sink.lock().expect("cond lock").clone();
        let Some(sink) = sink else { return };
        let mut inner = self.inner.lock().expect("cond lock");
        // One event per affected subtree root, at most every 200 ms.
        let mut roots: Vec<usize> = Vec::new();
        for &idx in changed {
            let mut cursor = idx;
            while let Some(parent) = inner.nodes[cursor].parent {
                cursor = parent;
            }
            if !roots.contains(&cursor) {
                roots.push(cursor);
            }
        }
        for root in roots {
            let now = Instant::now();
            if inner
                .last_emit
                .get(&root)
                .is_some_and(|last| now.duration_since(*last) < CONDITION_COALESCE)
            {
                continue;
            }
            inner.last_emit.insert(root, now);
            let worst = inner
                .nodes
                .iter()
                .filter(|node| node.state == CondState::Nok)
                .max_by_key(|node| node.priority)
                .map(|node| node.name.clone());
            let event = Event::new(EventKind::ConditionChanged, Source::Wui)
                .with_data("condition", json!(inner.nodes[root].name))
                .with_data("ok", json!(inner.nodes[root].state == CondState::Ok))
                .with_data("worst", json!(worst));
            drop(inner);
            sink(event);
            inner = self.inner.lock().expect("cond lock");
        }
    }
}

fn mark(
    inner: &mut TreeInner,
    idx: usize,
    state: CondState,
    reason: Option<String>,
    changed: &mut Vec<usize>,
) {
    let node = &mut inner.nodes[idx];
    node.state = state;
    node.reason = reason;
    node.changed_at = Instant::now();
    changed.push(idx);
}

impl Default for ConditionTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn breaking_a_parent_breaks_the_subtree() {
        let tree = ConditionTree::connectivity();
        tree.set("HTTP", false, Some("5xx from service"));
        assert_eq!(tree.state("HTTP"), Some(CondState::Nok));
        assert_eq!(tree.state("TOKEN"), Some(CondState::Nok));
        assert_eq!(tree.state("API"), Some(CondState::Nok));
        assert_eq!(tree.state("INTERNET"), Some(CondState::Unknown));
        assert_eq!(tree.reason("HTTP").as_deref(), Some("5xx from service"));
    }

    #[test]
    fn fixing_the_leaf_bubbles_up() {
        let tree = ConditionTree::connectivity();
        tree.set("INTERNET", false, None);
        tree.set("API", true, None);
        assert_eq!(tree.state("API"), Some(CondState::Ok));
        assert_eq!(tree.state("TOKEN"), Some(CondState::Ok));
        assert_eq!(tree.state("HTTP"), Some(CondState::Ok));
        assert_eq!(tree.state("INTERNET"), Some(CondState::Ok));
        assert!(tree.worst().is_none());
    }

    #[test]
    fn worst_prefers_higher_priority() {
        let tree = ConditionTree::connectivity();
        tree.set("API", false, Some("400"));
        assert_eq!(tree.worst().unwrap().0, "API");
        tree.set("INTERNET", false, Some("dns"));
        assert_eq!(tree.worst().unwrap().0, "INTERNET");
    }

    #[test]
    fn cascade_coalesces_into_one_event() {
        let tree = ConditionTree::connectivity();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        tree.set_event_sink(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        // Four nodes break, one subtree, one event.
        tree.set("INTERNET", false, Some("dns"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Immediately fixing again falls inside the coalesce window.
        tree.set("API", true, None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
