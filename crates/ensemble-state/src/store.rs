use ensemble_core::{EnsembleError, EnsembleResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Callback invoked when a watched path changes. Receives the changed path
/// and the new value at that path.
pub type ChangeCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct StateInner {
    tree: Map<String, Value>,
    subscribers: HashMap<Uuid, (String, ChangeCallback)>,
}

impl StateInner {
    /// Subscribers watching the changed path: `*`, an exact match, or a
    /// dot-prefix of it.
    fn matching_subscribers(&self, changed: &str) -> Vec<ChangeCallback> {
        self.subscribers
            .values()
            .filter(|(watched, _)| {
                watched == "*"
                    || changed == watched.as_str()
                    || changed.starts_with(&format!("{watched}."))
            })
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }
}

/// Hierarchical key-value store addressed by dot-separated paths.
///
/// Cloning yields another handle to the same tree. Writes are visible to any
/// subsequent read before `set` returns; there is no cross-path atomicity.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<RwLock<StateInner>>,
}

impl SharedState {
    /// Create an empty state tree.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                tree: Map::new(),
                subscribers: HashMap::new(),
            })),
        }
    }

    /// Overwrite the value at `path`, creating intermediate objects as
    /// needed. A non-object intermediate value is replaced by an object.
    pub async fn set(&self, path: &str, value: Value) -> EnsembleResult<()> {
        let to_notify = {
            let mut inner = self.inner.write().await;
            set_at(&mut inner.tree, path, value.clone())?;
            inner.matching_subscribers(path)
        };
        // Callbacks run after the write lock is released so a subscriber may
        // read state without deadlocking.
        for callback in to_notify {
            callback(path, &value);
        }
        Ok(())
    }

    /// Value at `path`, or `None` if the path has never been written.
    pub async fn get(&self, path: &str) -> Option<Value> {
        let inner = self.inner.read().await;
        get_at(&inner.tree, path).cloned()
    }

    /// Value at `path`, falling back to `default` for never-written paths.
    pub async fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).await.unwrap_or(default)
    }

    /// Remove the value (or subtree) at `path`, returning it if present.
    pub async fn remove(&self, path: &str) -> Option<Value> {
        let mut inner = self.inner.write().await;
        remove_at(&mut inner.tree, path)
    }

    /// Reset the entire tree. Subscribers on any path are notified once with
    /// the changed path `*`.
    pub async fn clear(&self) {
        let to_notify = {
            let mut inner = self.inner.write().await;
            inner.tree = Map::new();
            inner
                .subscribers
                .values()
                .map(|(_, callback)| Arc::clone(callback))
                .collect::<Vec<_>>()
        };
        debug!("state cleared");
        let empty = Value::Object(Map::new());
        for callback in to_notify {
            callback("*", &empty);
        }
    }

    /// Deep copy of the full tree.
    pub async fn snapshot(&self) -> Value {
        let inner = self.inner.read().await;
        Value::Object(inner.tree.clone())
    }

    /// Watch `path` (or `*` for everything) for changes. Returns a
    /// subscription id for [`SharedState::unsubscribe`].
    pub async fn subscribe(
        &self,
        path: &str,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner
            .subscribers
            .insert(id, (path.to_string(), Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns false for an unknown id.
    pub async fn unsubscribe(&self, id: Uuid) -> bool {
        let mut inner = self.inner.write().await;
        inner.subscribers.remove(&id).is_some()
    }

    /// Write the full tree to `path` as pretty JSON.
    ///
    /// The snapshot is written to a temp file and renamed into place, so the
    /// caller never observes a partial write. I/O failure is surfaced and
    /// leaves the in-memory tree untouched.
    pub async fn save(&self, path: &Path) -> EnsembleResult<()> {
        let json = {
            let inner = self.inner.read().await;
            serde_json::to_string_pretty(&Value::Object(inner.tree.clone()))?
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        info!(path = %path.display(), "state snapshot saved");
        Ok(())
    }

    /// Replace the tree with the snapshot at `path`.
    ///
    /// A missing file, unparsable content, or a non-object root is surfaced
    /// as an error and leaves the in-memory tree untouched.
    pub async fn load(&self, path: &Path) -> EnsembleResult<()> {
        let data = tokio::fs::read_to_string(path).await?;
        let value: Value = serde_json::from_str(&data).map_err(|e| {
            EnsembleError::State(format!("invalid snapshot {}: {e}", path.display()))
        })?;
        let Value::Object(map) = value else {
            return Err(EnsembleError::State(format!(
                "snapshot root must be an object: {}",
                path.display()
            )));
        };
        let mut inner = self.inner.write().await;
        inner.tree = map;
        info!(path = %path.display(), "state snapshot loaded");
        Ok(())
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

// --- Path helpers ---

fn split_path(path: &str) -> EnsembleResult<Vec<&str>> {
    if path.is_empty() {
        return Err(EnsembleError::State("state path must not be empty".to_string()));
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(EnsembleError::State(format!(
            "state path contains an empty segment: {path}"
        )));
    }
    Ok(parts)
}

fn get_at<'a>(tree: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = tree.get(first)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_at(tree: &mut Map<String, Value>, path: &str, value: Value) -> EnsembleResult<()> {
    let mut parts = split_path(path)?;
    let last = parts.pop().unwrap_or(path);
    let mut current = tree;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(EnsembleError::State(format!(
                    "state path {path} is not addressable"
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn remove_at(tree: &mut Map<String, Value>, path: &str) -> Option<Value> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop()?;
    let mut current = tree;
    for part in parts {
        current = match current.get_mut(part) {
            Some(Value::Object(map)) => map,
            _ => return None,
        };
    }
    current.remove(last)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_set_then_get() {
        let state = SharedState::new();
        state.set("agents.a1.status", json!("available")).await.unwrap();
        assert_eq!(state.get("agents.a1.status").await, Some(json!("available")));
        assert_eq!(state.get("agents.a1").await, Some(json!({"status": "available"})));
    }

    #[tokio::test]
    async fn test_get_unwritten_path_returns_default() {
        let state = SharedState::new();
        assert_eq!(state.get("nothing.here").await, None);
        assert_eq!(state.get_or("nothing.here", json!(0)).await, json!(0));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let state = SharedState::new();
        state.set("counter", json!(1)).await.unwrap();
        state.set("counter", json!(2)).await.unwrap();
        assert_eq!(state.get("counter").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_set_replaces_non_object_intermediate() {
        let state = SharedState::new();
        state.set("a", json!("scalar")).await.unwrap();
        state.set("a.b", json!(true)).await.unwrap();
        assert_eq!(state.get("a.b").await, Some(json!(true)));
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let state = SharedState::new();
        assert!(state.set("", json!(1)).await.is_err());
        assert!(state.set("a..b", json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_remove() {
        let state = SharedState::new();
        state.set("agents.a1.status", json!("busy")).await.unwrap();
        let removed = state.remove("agents.a1").await;
        assert_eq!(removed, Some(json!({"status": "busy"})));
        assert_eq!(state.get("agents.a1").await, None);
        assert!(state.remove("agents.a1").await.is_none());
    }

    #[tokio::test]
    async fn test_clear() {
        let state = SharedState::new();
        state.set("a.b", json!(1)).await.unwrap();
        state.clear().await;
        assert_eq!(state.get("a.b").await, None);
        assert_eq!(state.snapshot().await, json!({}));
    }

    #[tokio::test]
    async fn test_subscribe_prefix_matching() {
        let state = SharedState::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        state
            .subscribe("agents", move |_, _| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        state.set("agents.a1.status", json!("busy")).await.unwrap();
        state.set("tasks.t1.status", json!("pending")).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_wildcard_and_unsubscribe() {
        let state = SharedState::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let id = state
            .subscribe("*", move |_, _| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        state.set("anything", json!(1)).await.unwrap();
        state.clear().await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        assert!(state.unsubscribe(id).await);
        assert!(!state.unsubscribe(id).await);
        state.set("anything", json!(2)).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscriber_may_read_state() {
        let state = SharedState::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let reader = state.clone();
        state
            .subscribe("a", move |_, _| {
                // Reading from inside a callback must not deadlock.
                let reader = reader.clone();
                let seen = Arc::clone(&seen_clone);
                tokio::spawn(async move {
                    if reader.get("a").await.is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                });
            })
            .await;
        state.set("a", json!(1)).await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(state.get("a").await, Some(json!(1)));
    }
}
