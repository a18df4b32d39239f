use serde_json::{Map, Value};

/// Local mirror of a watched Realtime Database location.
///
/// Streaming events address a child path relative to the watched location;
/// applying them in order reproduces the server-side value.
#[derive(Debug, Default, Clone)]
pub struct JsonTree {
    root: Value,
}

impl JsonTree {
    /// Replace the value at `path`. Writing `null` deletes it, and parents
    /// left empty disappear with it.
    pub fn put(&mut self, path: &str, data: Value) {
        let segments = split_path(path);
        set_at(&mut self.root, &segments, data);
    }

    /// Merge `data`'s children into the value at `path`.
    pub fn patch(&mut self, path: &str, data: Value) {
        match data {
            Value::Object(children) => {
                let base = split_path(path);
                for (key, value) in children {
                    let mut segments = base.clone();
                    segments.extend(split_path(&key));
                    set_at(&mut self.root, &segments, value);
                }
            }
            other => self.put(path, other),
        }
    }

    /// Current value, or `None` when the location is empty.
    pub fn snapshot(&self) -> Option<Value> {
        match &self.root {
            Value::Null => None,
            value => Some(value.clone()),
        }
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn set_at(node: &mut Value, segments: &[&str], data: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = data;
        return;
    };

    if !node.is_object() {
        if data.is_null() {
            return;
        }
        *node = Value::Object(Map::new());
    }

    let now_empty = match node {
        Value::Object(children) => {
            if rest.is_empty() {
                if data.is_null() {
                    children.remove(*head);
                } else {
                    children.insert((*head).to_string(), data);
                }
            } else {
                let child = children.entry((*head).to_string()).or_insert(Value::Null);
                set_at(child, rest, data);
                if is_empty(child) {
                    children.remove(*head);
                }
            }
            children.is_empty()
        }
        _ => false,
    };

    if now_empty {
        *node = Value::Null;
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(children) => children.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_put_replaces_everything() {
        let mut tree = JsonTree::default();
        tree.put("/", json!({"call1": {"room": "1"}}));
        tree.put("/", json!({"call2": {"room": "2"}}));
        assert_eq!(tree.snapshot(), Some(json!({"call2": {"room": "2"}})));
    }

    #[test]
    fn child_put_and_delete() {
        let mut tree = JsonTree::default();
        tree.put("/", json!({"call1": {"room": "1"}}));
        tree.put("/call2/room", json!("2"));
        assert_eq!(
            tree.snapshot(),
            Some(json!({"call1": {"room": "1"}, "call2": {"room": "2"}}))
        );

        tree.put("/call1", Value::Null);
        tree.put("/call2/room", Value::Null);
        assert_eq!(tree.snapshot(), None);
    }

    #[test]
    fn patch_merges_children() {
        let mut tree = JsonTree::default();
        tree.put("/", json!({"call1": {"room": "1", "carer": ""}}));
        tree.patch("/call1", json!({"carer": "Sam", "end": "12:01"}));
        assert_eq!(
            tree.snapshot(),
            Some(json!({"call1": {"room": "1", "carer": "Sam", "end": "12:01"}}))
        );
    }

    #[test]
    fn null_put_on_empty_tree_stays_empty() {
        let mut tree = JsonTree::default();
        tree.put("/missing/child", Value::Null);
        assert_eq!(tree.snapshot(), None);
    }
}
