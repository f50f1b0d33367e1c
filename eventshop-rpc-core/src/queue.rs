// eventshop-rpc-core/src/queue.rs
use uuid::Uuid;

use crate::{MessagingError, MinorError};

/// The connector's single queue. Name and TTL freeze once the queue is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    name: String,
    auto_generated: bool,
    message_ttl: Option<u32>,
    bound: bool,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self::new("", None)
    }
}

impl QueueSpec {
    pub fn new(name: &str, message_ttl: Option<u32>) -> Self {
        let (name, auto_generated) = resolve_name(name);
        Self {
            name,
            auto_generated,
            message_ttl,
            bound: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Auto-named queues are exclusive to the connection that declared them.
    pub fn is_ephemeral(&self) -> bool {
        self.auto_generated
    }

    pub fn message_ttl(&self) -> Option<u32> {
        self.message_ttl
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), MessagingError> {
        self.assert_unbound("queue name")?;
        let (name, auto_generated) = resolve_name(name);
        self.name = name;
        self.auto_generated = auto_generated;
        Ok(())
    }

    pub fn set_message_ttl(&mut self, ttl_ms: Option<u32>) -> Result<(), MessagingError> {
        self.assert_unbound("message TTL")?;
        self.message_ttl = ttl_ms;
        Ok(())
    }

    pub fn mark_bound(&mut self) {
        self.bound = true;
    }

    /// Only after the queue was deleted on the broker.
    pub fn mark_unbound(&mut self) {
        self.bound = false;
    }

    fn assert_unbound(&self, what: &str) -> Result<(), MessagingError> {
        if self.bound {
            return Err(MinorError::new(format!(
                "Cannot change {what} after the queue has been bound"
            ))
            .into());
        }
        Ok(())
    }
}

fn resolve_name(name: &str) -> (String, bool) {
    let name = name.trim();
    if name.is_empty() {
        (format!("auto-gen-{}", Uuid::new_v4().simple()), true)
    } else {
        (name.to_string(), false)
    }
}

/// Patterns currently bound to the queue, in subscription order.
#[derive(Debug, Clone, Default)]
pub struct SubscribedPatterns(Vec<String>);

impl SubscribedPatterns {
    /// Returns false if the pattern was already tracked.
    pub fn insert(&mut self, pattern: &str) -> bool {
        if self.contains(pattern) {
            return false;
        }
        self.0.push(pattern.to_string());
        true
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        match self.0.iter().position(|p| p == pattern) {
            Some(idx) => {
                self.0.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.0.iter().any(|p| p == pattern)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    match_words(&pattern, &topic)
}

fn match_words(pattern: &[&str], topic: &[&str]) -> bool {
    match (pattern.first(), topic.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            match_words(&pattern[1..], topic)
                || (!topic.is_empty() && match_words(pattern, &topic[1..]))
        }
        (Some(&"*"), Some(_)) => match_words(&pattern[1..], &topic[1..]),
        (Some(p), Some(t)) if p == t => match_words(&pattern[1..], &topic[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_auto_generated_and_ephemeral() {
        let q = QueueSpec::new("", None);
        assert!(q.name().starts_with("auto-gen-"));
        assert!(q.is_ephemeral());

        let named = QueueSpec::new("billing", Some(1000));
        assert_eq!(named.name(), "billing");
        assert!(!named.is_ephemeral());
        assert_eq!(named.message_ttl(), Some(1000));
    }

    #[test]
    fn name_and_ttl_freeze_once_bound() {
        let mut q = QueueSpec::new("orders", None);
        q.set_name("orders-v2").unwrap();
        q.set_message_ttl(Some(3000)).unwrap();

        q.mark_bound();
        let err = q.set_name("other").unwrap_err();
        assert!(err.is_minor());
        assert!(q.set_message_ttl(None).unwrap_err().is_minor());
        assert_eq!(q.name(), "orders-v2");
        assert_eq!(q.message_ttl(), Some(3000));
    }

    #[test]
    fn patterns_have_no_duplicates() {
        let mut set = SubscribedPatterns::default();
        assert!(set.insert("request.A.*"));
        assert!(!set.insert("request.A.*"));
        assert_eq!(set.len(), 1);

        assert!(!set.remove("request.B.*"));
        assert_eq!(set.len(), 1);
        assert!(set.remove("request.A.*"));
        assert!(set.is_empty());
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("request.ModB.echo", "request.ModB.echo"));
        assert!(topic_matches("request.*.echo", "request.ModB.echo"));
        assert!(topic_matches("request.#", "request.ModB.echo"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("request.ModB.#", "request.ModB"));
        assert!(!topic_matches("request.*", "request.ModB.echo"));
        assert!(!topic_matches("request.ModB.echo", "request.ModB.find"));
        assert!(topic_matches(
            "response.ModB.echo@0f1e",
            "response.ModB.echo@0f1e"
        ));
    }
}
