//! Announced-worker registry.
//!
//! Per backend, the registry keeps either a flat list of worker connections
//! or, when the backend is filtered, lists bucketed by announced filter
//! value. A backend is never in both forms at once. Selection rotates the
//! matching list by one and prefers the least-loaded connection.

use std::collections::HashMap;

use super::SwitchError;

pub(crate) type ConnId = u64;

enum Bucket {
    Flat(Vec<ConnId>),
    Filtered(HashMap<String, Vec<ConnId>>),
}

#[derive(Default)]
pub(crate) struct WorkerRegistry {
    buckets: HashMap<String, Bucket>,
}

impl WorkerRegistry {
    pub fn announce(
        &mut self,
        backend: &str,
        filter_value: Option<String>,
        conn: ConnId,
    ) -> Result<(), SwitchError> {
        match filter_value {
            None => {
                let bucket = self
                    .buckets
                    .entry(backend.to_string())
                    .or_insert_with(|| Bucket::Flat(Vec::new()));
                match bucket {
                    Bucket::Flat(list) => {
                        list.push(conn);
                        Ok(())
                    }
                    Bucket::Filtered(_) => Err(SwitchError::Handler(format!(
                        "backend '{backend}' already has filtered announcements"
                    ))),
                }
            }
            Some(value) => {
                let bucket = self
                    .buckets
                    .entry(backend.to_string())
                    .or_insert_with(|| Bucket::Filtered(HashMap::new()));
                match bucket {
                    Bucket::Filtered(map) => {
                        map.entry(value).or_default().push(conn);
                        Ok(())
                    }
                    Bucket::Flat(_) => Err(SwitchError::Handler(format!(
                        "backend '{backend}' already has unfiltered announcements"
                    ))),
                }
            }
        }
    }

    pub fn withdraw(&mut self, backend: &str, filter_value: Option<&str>, conn: ConnId) {
        let Some(bucket) = self.buckets.get_mut(backend) else {
            return;
        };
        let emptied = match bucket {
            Bucket::Flat(list) => {
                if let Some(pos) = list.iter().position(|&c| c == conn) {
                    list.remove(pos);
                }
                list.is_empty()
            }
            Bucket::Filtered(map) => {
                if let Some(value) = filter_value {
                    if let Some(list) = map.get_mut(value) {
                        if let Some(pos) = list.iter().position(|&c| c == conn) {
                            list.remove(pos);
                        }
                        if list.is_empty() {
                            map.remove(value);
                        }
                    }
                }
                map.is_empty()
            }
        };
        if emptied {
            self.buckets.remove(backend);
        }
    }

    /// Rotate the matching list by one and return it in post-rotation
    /// order. The caller picks the least-loaded entry from the result.
    pub fn candidates(
        &mut self,
        backend: &str,
        filter_value: Option<&str>,
    ) -> Result<Vec<ConnId>, SwitchError> {
        let no_worker = || SwitchError::NoWorker(backend.to_string());
        let bucket = self.buckets.get_mut(backend).ok_or_else(no_worker)?;
        let list = match (bucket, filter_value) {
            (Bucket::Flat(list), _) => list,
            (Bucket::Filtered(map), Some(value)) => map.get_mut(value).ok_or_else(no_worker)?,
            (Bucket::Filtered(_), None) => return Err(no_worker()),
        };
        if list.is_empty() {
            return Err(no_worker());
        }
        if list.len() > 1 {
            list.rotate_left(1);
        }
        Ok(list.clone())
    }

    /// All announcements as `(backend, filter value, connection)` rows, for
    /// introspection.
    pub fn snapshot(&self) -> Vec<(String, Option<String>, ConnId)> {
        let mut rows = Vec::new();
        for (backend, bucket) in &self.buckets {
            match bucket {
                Bucket::Flat(list) => {
                    for &conn in list {
                        rows.push((backend.clone(), None, conn));
                    }
                }
                Bucket::Filtered(map) => {
                    for (value, list) in map {
                        for &conn in list {
                            rows.push((backend.clone(), Some(value.clone()), conn));
                        }
                    }
                }
            }
        }
        rows
    }
}

/// First entry with minimal refcount, in the order given.
pub(crate) fn pick_least_loaded(
    candidates: &[ConnId],
    refcount: impl Fn(ConnId) -> usize,
) -> Option<ConnId> {
    let mut best: Option<(ConnId, usize)> = None;
    for &conn in candidates {
        let load = refcount(conn);
        match best {
            Some((_, least)) if load >= least => {}
            _ => best = Some((conn, load)),
        }
    }
    best.map(|(conn, _)| conn)
}
