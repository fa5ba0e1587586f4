//! Reconstructs the conversation thread around a message for classifier
//! context.
//!
//! Parent links are weak and may be cyclic, so both walks are iterative and
//! bounded. A partial chain is always acceptable: missing or unreadable
//! messages cut the thread short instead of failing the caller.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::domain::Message;
use crate::storage::MessageStore;

/// Default bound on how many parent hops are followed.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Descendants collected per unit of depth on the downward walk.
const FAN_OUT_PER_LEVEL: usize = 10;

/// Thread around a message, oldest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReplyChain {
    pub messages: Vec<Message>,
    /// Set when a bound, a cycle, or a missing message cut the walk short.
    pub truncated: bool,
}

impl ReplyChain {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// One `[timestamp] author: content` line per message.
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(Message::context_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn sorted(mut messages: Vec<Message>, truncated: bool) -> Self {
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Self {
            messages,
            truncated,
        }
    }
}

pub struct ReplyChainResolver {
    messages: Arc<dyn MessageStore>,
    max_depth: usize,
}

impl ReplyChainResolver {
    pub fn new(messages: Arc<dyn MessageStore>, max_depth: usize) -> Self {
        Self {
            messages,
            max_depth: max_depth.max(1),
        }
    }

    pub async fn resolve(&self, message_id: &str) -> ReplyChain {
        let start = match self.messages.get(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(target: "processor", message_id = %message_id, "reply chain start not found");
                return ReplyChain {
                    messages: Vec::new(),
                    truncated: true,
                };
            }
            Err(err) => {
                warn!(target: "processor", message_id = %message_id, error = %err, "failed to load reply chain start");
                return ReplyChain {
                    messages: Vec::new(),
                    truncated: true,
                };
            }
        };

        let mut visited: HashSet<String> = HashSet::from([start.id.clone()]);
        let mut ancestors = vec![start];
        let mut depth = 0;

        // Upward: follow parent links to the root.
        loop {
            let Some(current) = ancestors.last() else {
                break;
            };
            let Some(parent_id) = current.parent_id.clone() else {
                break;
            };

            if depth >= self.max_depth {
                debug!(target: "processor", message_id = %message_id, depth, "reply chain depth bound reached");
                return ReplyChain::sorted(ancestors, true);
            }
            if !visited.insert(parent_id.clone()) {
                warn!(target: "processor", message_id = %message_id, parent_id = %parent_id, "reply chain cycle detected");
                return ReplyChain::sorted(ancestors, true);
            }

            match self.messages.get(&parent_id).await {
                Ok(Some(parent)) => {
                    ancestors.push(parent);
                    depth += 1;
                }
                Ok(None) => {
                    debug!(target: "processor", parent_id = %parent_id, "parent message missing; treating oldest known message as root");
                    return self.collect_thread(ancestors, true).await;
                }
                Err(err) => {
                    warn!(target: "processor", parent_id = %parent_id, error = %err, "failed to load parent message");
                    return self.collect_thread(ancestors, true).await;
                }
            }
        }

        self.collect_thread(ancestors, false).await
    }

    /// Downward: breadth-first from the root over every reply.
    async fn collect_thread(&self, ancestors: Vec<Message>, mut truncated: bool) -> ReplyChain {
        let node_cap = self.max_depth * FAN_OUT_PER_LEVEL;
        let Some(root) = ancestors.last().cloned() else {
            return ReplyChain::default();
        };

        let mut visited: HashSet<String> = HashSet::from([root.id.clone()]);
        let mut frontier: VecDeque<String> = VecDeque::from([root.id.clone()]);
        let mut thread = vec![root];

        'walk: while let Some(id) = frontier.pop_front() {
            let replies = match self.messages.replies_to(&id).await {
                Ok(replies) => replies,
                Err(err) => {
                    warn!(target: "processor", message_id = %id, error = %err, "failed to load replies");
                    truncated = true;
                    continue;
                }
            };

            for reply in replies {
                if !visited.insert(reply.id.clone()) {
                    continue;
                }
                if thread.len() >= node_cap {
                    truncated = true;
                    break 'walk;
                }
                frontier.push_back(reply.id.clone());
                thread.push(reply);
            }
        }

        // A capped walk may have skipped the branch leading to the start
        // message; keep every ancestor regardless.
        for ancestor in ancestors {
            if !thread.iter().any(|m| m.id == ancestor.id) {
                thread.push(ancestor);
            }
        }

        ReplyChain::sorted(thread, truncated)
    }
}
