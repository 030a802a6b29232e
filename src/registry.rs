//! A per-worker table of named values.
//!
//! Every worker owns exactly one [`Registry`]. It is built empty when the
//! worker is spawned, filled by the registry initializer during bootstrap (see
//! [`Builder::registry`](crate::config::Builder::registry)), and read by the
//! payloads that later run on that worker. The controller reaches it with
//! [`Controller::get`](crate::controller::Controller::get).
//!
//! Names are dotted paths such as `"model.weights.scale"`. Each segment but the
//! last names a namespace; the last names an entry. Lookups never fall back to
//! a default: a missing segment is always an error.

use std::{any::Any, collections::BTreeMap, fmt};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("`{path}` is not a valid dotted path")]
    InvalidPath { path: String },

    #[error("`{path}` not found: no entry named `{segment}`")]
    NotFound { path: String, segment: String },

    #[error("`{path}` names a namespace, not a value")]
    NotAValue { path: String },

    #[error("`{path}` cannot be used as a namespace: `{segment}` holds a value")]
    NotANamespace { path: String, segment: String },

    #[error("`{path}` holds a `{found}`, not a `{expected}`")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}

type Accessor = Box<dyn Fn() -> Box<dyn Any + Send> + Send>;

/// A registered value, read through an accessor so that every lookup observes
/// the current state.
struct Entry {
    type_name: &'static str,
    accessor: Accessor,
}

enum Node {
    Entry(Entry),
    Namespace(Namespace),
}

#[derive(Default)]
struct Namespace {
    children: BTreeMap<String, Node>,
}

/// A mapping from dotted names to values, owned by one worker.
#[derive(Default)]
pub struct Registry {
    root: Namespace,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Registers a value under `path`. Every lookup returns a clone of it.
    ///
    /// Intermediate namespaces are created as needed. An existing entry at
    /// `path` is replaced.
    pub fn register<T>(&mut self, path: &str, value: T) -> Result<(), RegistryError>
    where
        T: Clone + Send + 'static,
    {
        self.register_fn(path, move || value.clone())
    }

    /// Registers an accessor under `path`. Every lookup calls it, so the
    /// registry reports whatever the accessor currently observes.
    pub fn register_fn<T, F>(&mut self, path: &str, accessor: F) -> Result<(), RegistryError>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        let segments = split_path(path)?;
        let (last, parents) = segments.split_last().ok_or_else(|| invalid(path))?;

        let mut namespace = &mut self.root;
        for segment in parents {
            let node = namespace
                .children
                .entry((*segment).to_string())
                .or_insert_with(|| Node::Namespace(Namespace::default()));
            namespace = match node {
                Node::Namespace(inner) => inner,
                Node::Entry(_) => {
                    return Err(RegistryError::NotANamespace {
                        path: path.to_string(),
                        segment: (*segment).to_string(),
                    })
                }
            };
        }

        if let Some(Node::Namespace(_)) = namespace.children.get(*last) {
            return Err(RegistryError::NotAValue {
                path: path.to_string(),
            });
        }

        let entry = Entry {
            type_name: std::any::type_name::<T>(),
            accessor: Box::new(move || Box::new(accessor()) as Box<dyn Any + Send>),
        };
        namespace
            .children
            .insert((*last).to_string(), Node::Entry(entry));
        Ok(())
    }

    /// Resolves `path` and returns the current value as a `T`.
    pub fn lookup<T: 'static>(&self, path: &str) -> Result<T, RegistryError> {
        let entry = self.entry(path)?;
        (entry.accessor)()
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| RegistryError::TypeMismatch {
                path: path.to_string(),
                expected: std::any::type_name::<T>(),
                found: entry.type_name,
            })
    }

    /// Returns `true` if `path` resolves to a value.
    pub fn contains(&self, path: &str) -> bool {
        self.entry(path).is_ok()
    }

    /// Removes the value or namespace at `path`. Returns `false` if nothing
    /// was registered there.
    pub fn remove(&mut self, path: &str) -> bool {
        let Ok(segments) = split_path(path) else {
            return false;
        };
        let Some((last, parents)) = segments.split_last() else {
            return false;
        };
        let mut namespace = &mut self.root;
        for segment in parents {
            match namespace.children.get_mut(*segment) {
                Some(Node::Namespace(inner)) => namespace = inner,
                _ => return false,
            }
        }
        namespace.children.remove(*last).is_some()
    }

    /// Lists the dotted path of every registered value, in sorted order.
    pub fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_paths(&self.root, &mut String::new(), &mut paths);
        paths
    }

    fn entry(&self, path: &str) -> Result<&Entry, RegistryError> {
        let segments = split_path(path)?;
        let mut namespace = &self.root;
        let mut iter = segments.iter().peekable();
        while let Some(segment) = iter.next() {
            let node = namespace
                .children
                .get(*segment)
                .ok_or_else(|| RegistryError::NotFound {
                    path: path.to_string(),
                    segment: (*segment).to_string(),
                })?;
            match (node, iter.peek()) {
                (Node::Entry(entry), None) => return Ok(entry),
                (Node::Namespace(inner), Some(_)) => namespace = inner,
                (Node::Namespace(_), None) => {
                    return Err(RegistryError::NotAValue {
                        path: path.to_string(),
                    })
                }
                (Node::Entry(_), Some(next)) => {
                    return Err(RegistryError::NotFound {
                        path: path.to_string(),
                        segment: (**next).to_string(),
                    })
                }
            }
        }
        Err(invalid(path))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("paths", &self.paths())
            .finish()
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, RegistryError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.trim().is_empty()) {
        return Err(invalid(path));
    }
    Ok(segments)
}

fn invalid(path: &str) -> RegistryError {
    RegistryError::InvalidPath {
        path: path.to_string(),
    }
}

fn collect_paths(namespace: &Namespace, prefix: &mut String, out: &mut Vec<String>) {
    for (name, node) in &namespace.children {
        let len = prefix.len();
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(name);
        match node {
            Node::Entry(_) => out.push(prefix.clone()),
            Node::Namespace(inner) => collect_paths(inner, prefix, out),
        }
        prefix.truncate(len);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn nested_lookup() {
        let mut registry = Registry::new();
        registry.register("a.b.c", 42_u32).unwrap();
        registry.register("a.name", "left".to_string()).unwrap();

        assert_eq!(registry.lookup::<u32>("a.b.c"), Ok(42));
        assert_eq!(registry.lookup::<String>("a.name").unwrap(), "left");
        assert_eq!(registry.paths(), vec!["a.b.c", "a.name"]);
    }

    #[test]
    fn missing_segment_is_an_error() {
        let mut registry = Registry::new();
        registry.register("a.b", 1_i64).unwrap();

        assert_eq!(
            registry.lookup::<i64>("a.x"),
            Err(RegistryError::NotFound {
                path: "a.x".into(),
                segment: "x".into()
            })
        );
        assert_eq!(
            registry.lookup::<i64>("missing"),
            Err(RegistryError::NotFound {
                path: "missing".into(),
                segment: "missing".into()
            })
        );
        assert!(matches!(
            registry.lookup::<i64>("a.b.c"),
            Err(RegistryError::NotFound { segment, .. }) if segment == "c"
        ));
        assert!(!registry.contains("a.x"));
    }

    #[test]
    fn namespaces_are_not_values() {
        let mut registry = Registry::new();
        registry.register("a.b", 1_u8).unwrap();
        assert_eq!(
            registry.lookup::<u8>("a"),
            Err(RegistryError::NotAValue { path: "a".into() })
        );
        assert_eq!(
            registry.register("a", 2_u8),
            Err(RegistryError::NotAValue { path: "a".into() })
        );
    }

    #[test]
    fn values_are_not_namespaces() {
        let mut registry = Registry::new();
        registry.register("a", 1_u8).unwrap();
        assert_eq!(
            registry.register("a.b", 2_u8),
            Err(RegistryError::NotANamespace {
                path: "a.b".into(),
                segment: "a".into()
            })
        );
    }

    #[test]
    fn wrong_type_is_reported() {
        let mut registry = Registry::new();
        registry.register("rate", 0.5_f64).unwrap();
        assert!(matches!(
            registry.lookup::<u32>("rate"),
            Err(RegistryError::TypeMismatch { found: "f64", .. })
        ));
    }

    #[test]
    fn malformed_paths() {
        let mut registry = Registry::new();
        for path in ["", ".", "a..b", "a.", " .b"] {
            assert_eq!(
                registry.register(path, 0_u8),
                Err(RegistryError::InvalidPath { path: path.into() })
            );
            assert!(matches!(
                registry.lookup::<u8>(path),
                Err(RegistryError::InvalidPath { .. })
            ));
        }
    }

    #[test]
    fn accessors_see_current_state() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let counter = Arc::clone(&counter);
            registry
                .register_fn("stats.calls", move || counter.load(Ordering::SeqCst))
                .unwrap();
        }
        assert_eq!(registry.lookup::<usize>("stats.calls"), Ok(0));
        counter.store(5, Ordering::SeqCst);
        assert_eq!(registry.lookup::<usize>("stats.calls"), Ok(5));
    }

    #[test]
    fn replace_and_remove() {
        let mut registry = Registry::new();
        registry.register("a.b", 1_u8).unwrap();
        registry.register("a.b", 2_u8).unwrap();
        assert_eq!(registry.lookup::<u8>("a.b"), Ok(2));

        assert!(registry.remove("a.b"));
        assert!(!registry.remove("a.b"));
        assert!(!registry.contains("a.b"));
        assert!(registry.remove("a"));
        assert!(registry.paths().is_empty());
    }
}
