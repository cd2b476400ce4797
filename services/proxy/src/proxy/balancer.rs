//! Backend selection.
//!
//! Both strategies return a priority-ordered candidate list for a single
//! connection attempt. Callers dial the candidates in order and fall
//! through to the next one on dial failure. Only Up backends are ever
//! returned; an empty list means nothing is available.

use std::sync::Arc;

use super::backend::Backend;

/// Round robin position: the current backend and how many times it has
/// been picked in this rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundRobinCursor {
    pub last_backend: usize,
    pub last_count: u32,
}

/// Weighted round robin.
///
/// The cursor stays on a backend until it has been picked `weight` times,
/// then moves on. Down backends are skipped. The remaining Up backends
/// follow the pick, in list order, as fallbacks.
pub fn round_robin(backends: &[Arc<Backend>], cursor: &mut RoundRobinCursor) -> Vec<Arc<Backend>> {
    match backends.len() {
        0 => return Vec::new(),
        1 => {
            return if backends[0].is_up() {
                vec![Arc::clone(&backends[0])]
            } else {
                Vec::new()
            }
        }
        _ => {}
    }

    let count = backends.len();
    if cursor.last_backend >= count {
        *cursor = RoundRobinCursor::default();
    }

    // A full lap plus one revisits the starting backend with a fresh count.
    let mut chosen = None;
    for _ in 0..=count {
        let backend = &backends[cursor.last_backend];
        if backend.is_up() && cursor.last_count < backend.weight() {
            cursor.last_count += 1;
            chosen = Some(cursor.last_backend);
            break;
        }
        cursor.last_backend = (cursor.last_backend + 1) % count;
        cursor.last_count = 0;
    }

    let Some(first) = chosen else {
        return Vec::new();
    };

    (0..count)
        .map(|offset| &backends[(first + offset) % count])
        .filter(|b| b.is_up())
        .cloned()
        .collect()
}

/// Least active connections. Ties keep list order.
pub fn least_conn(backends: &[Arc<Backend>]) -> Vec<Arc<Backend>> {
    let mut up: Vec<(u64, Arc<Backend>)> = backends
        .iter()
        .filter(|b| b.is_up())
        .map(|b| (b.active(), Arc::clone(b)))
        .collect();

    // sort_by_key is stable
    up.sort_by_key(|(active, _)| *active);
    up.into_iter().map(|(_, b)| b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BackendConfig;
    use crate::proxy::backend::BackendSettings;

    fn backend(name: &str, weight: u32) -> Arc<Backend> {
        let mut config = BackendConfig::new(name, "127.0.0.1:1");
        config.weight = weight;
        config.check_address = "127.0.0.1:1".to_string();
        let settings = BackendSettings {
            rise: 1,
            fall: 1,
            ..BackendSettings::default()
        };
        Arc::new(Backend::new(config, settings))
    }

    fn names(list: &[Arc<Backend>]) -> Vec<&str> {
        list.iter().map(|b| b.name()).collect()
    }

    fn firsts(backends: &[Arc<Backend>], cursor: &mut RoundRobinCursor, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| round_robin(backends, cursor)[0].name().to_string())
            .collect()
    }

    #[test]
    fn weighted_round_robin_sequence() {
        let backends = vec![backend("b0", 1), backend("b1", 2), backend("b2", 3)];
        let mut cursor = RoundRobinCursor::default();

        assert_eq!(
            firsts(&backends, &mut cursor, 7),
            vec!["b0", "b1", "b1", "b2", "b2", "b2", "b0"]
        );
    }

    #[test]
    fn round_robin_appends_fallbacks_in_order() {
        let backends = vec![backend("b0", 1), backend("b1", 1), backend("b2", 1)];
        let mut cursor = RoundRobinCursor::default();

        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b0", "b1", "b2"]);
        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b1", "b2", "b0"]);
        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b2", "b0", "b1"]);
    }

    #[test]
    fn round_robin_skips_down_backends() {
        let backends = vec![backend("b0", 1), backend("b1", 1), backend("b2", 1)];
        backends[1].record_check(false);
        let mut cursor = RoundRobinCursor::default();

        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b0", "b2"]);
        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b2", "b0"]);
        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["b0", "b2"]);
    }

    #[test]
    fn round_robin_single_backend() {
        let backends = vec![backend("only", 5)];
        let mut cursor = RoundRobinCursor::default();
        assert_eq!(names(&round_robin(&backends, &mut cursor)), vec!["only"]);
        assert_eq!(cursor, RoundRobinCursor::default());

        backends[0].record_check(false);
        assert!(round_robin(&backends, &mut cursor).is_empty());
    }

    #[test]
    fn round_robin_all_down_is_empty() {
        let backends = vec![backend("b0", 1), backend("b1", 1)];
        for b in &backends {
            b.record_check(false);
        }
        let mut cursor = RoundRobinCursor::default();
        assert!(round_robin(&backends, &mut cursor).is_empty());
        assert!(round_robin(&[], &mut cursor).is_empty());
    }

    #[test]
    fn round_robin_recovers_from_stale_cursor() {
        let backends = vec![backend("b0", 1), backend("b1", 1)];
        let mut cursor = RoundRobinCursor {
            last_backend: 9,
            last_count: 3,
        };
        assert_eq!(round_robin(&backends, &mut cursor)[0].name(), "b0");
    }

    #[test]
    fn least_conn_orders_by_active() {
        let backends = vec![backend("b0", 1), backend("b1", 1), backend("b2", 1)];
        let _g0 = [backends[0].track(), backends[0].track()];
        let _g1 = backends[1].track();

        assert_eq!(names(&least_conn(&backends)), vec!["b2", "b1", "b0"]);
    }

    #[test]
    fn least_conn_ties_keep_list_order() {
        let backends = vec![backend("b0", 1), backend("b1", 1), backend("b2", 1)];
        assert_eq!(names(&least_conn(&backends)), vec!["b0", "b1", "b2"]);

        let _g = backends[0].track();
        assert_eq!(names(&least_conn(&backends)), vec!["b1", "b2", "b0"]);
    }

    #[test]
    fn least_conn_skips_down_backends() {
        let backends = vec![backend("b0", 1), backend("b1", 1)];
        backends[0].record_check(false);
        assert_eq!(names(&least_conn(&backends)), vec!["b1"]);

        backends[1].record_check(false);
        assert!(least_conn(&backends).is_empty());
    }
}
