//! Fan an async operation out over every (owner, unit) pair.
//!
//! Pairs are flattened owner-major: all units of owner 0, then owner 1, and
//! so on. Results always come back in that order, whether the pairs ran one
//! after another or all at once.

use std::future::Future;

use futures::future::try_join_all;

/// How the pairs are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Iteration {
    /// One pair at a time
    #[default]
    Series,
    /// Every pair launched together
    Parallel,
}

/// One flattened pair handed to the mapped operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem<O, U> {
    pub owner: O,
    pub unit: U,
    pub owner_index: usize,
    pub unit_index: usize,
}

/// Owners paired with their units
#[derive(Debug, Clone)]
pub struct BatchMapper<O, U> {
    groups: Vec<(O, Vec<U>)>,
    iteration: Iteration,
}

impl<O: Clone, U: Clone> BatchMapper<O, U> {
    pub fn new(groups: Vec<(O, Vec<U>)>) -> Self {
        Self {
            groups,
            iteration: Iteration::default(),
        }
    }

    pub fn iteration(mut self, iteration: Iteration) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn mode(&self) -> Iteration {
        self.iteration
    }

    /// Total number of pairs
    pub fn len(&self) -> usize {
        self.groups.iter().map(|(_, units)| units.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All pairs in owner-major order
    pub fn items(&self) -> Vec<BatchItem<O, U>> {
        self.groups
            .iter()
            .enumerate()
            .flat_map(|(owner_index, (owner, units))| {
                units.iter().enumerate().map(move |(unit_index, unit)| BatchItem {
                    owner: owner.clone(),
                    unit: unit.clone(),
                    owner_index,
                    unit_index,
                })
            })
            .collect()
    }

    /// Apply `f` to every pair. The first error wins; in series mode the
    /// remaining pairs are not started.
    pub async fn map_instances<F, Fut, R, E>(&self, f: F) -> Result<Vec<R>, E>
    where
        F: Fn(BatchItem<O, U>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let items = self.items();
        match self.iteration {
            Iteration::Series => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    results.push(f(item).await?);
                }
                Ok(results)
            }
            Iteration::Parallel => try_join_all(items.into_iter().map(f)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    fn mapper() -> BatchMapper<&'static str, u64> {
        BatchMapper::new(vec![("a", vec![30, 10]), ("b", vec![]), ("c", vec![20, 0, 5])])
    }

    #[test]
    fn test_items_are_owner_major() {
        let items = mapper().items();
        let order: Vec<(&str, u64, usize, usize)> = items
            .iter()
            .map(|i| (i.owner, i.unit, i.owner_index, i.unit_index))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a", 30, 0, 0),
                ("a", 10, 0, 1),
                ("c", 20, 2, 0),
                ("c", 0, 2, 1),
                ("c", 5, 2, 2),
            ]
        );
        assert_eq!(mapper().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_order_is_independent_of_mode_and_timing() {
        for mode in [Iteration::Series, Iteration::Parallel] {
            let completed = Arc::new(Mutex::new(Vec::new()));
            let results = mapper()
                .iteration(mode)
                .map_instances(|item| {
                    let completed = completed.clone();
                    async move {
                        // Unit doubles as a delay so parallel runs finish out of order
                        tokio::time::sleep(Duration::from_millis(item.unit)).await;
                        completed.lock().push(item.unit);
                        Ok::<_, ()>(format!("{}{}", item.owner, item.unit))
                    }
                })
                .await
                .unwrap();

            assert_eq!(results, vec!["a30", "a10", "c20", "c0", "c5"]);
            let completed = completed.lock().clone();
            match mode {
                Iteration::Series => assert_eq!(completed, vec![30, 10, 20, 0, 5]),
                Iteration::Parallel => assert_eq!(completed, vec![0, 5, 10, 20, 30]),
            }
        }
    }

    #[tokio::test]
    async fn test_series_stops_at_first_error() {
        let started = Arc::new(Mutex::new(0));
        let result = mapper()
            .map_instances(|item| {
                let started = started.clone();
                async move {
                    *started.lock() += 1;
                    if item.unit == 10 {
                        Err(item.unit)
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(result, Err(10));
        assert_eq!(*started.lock(), 2);
    }

    #[tokio::test]
    async fn test_empty_mapper() {
        let mapper: BatchMapper<&str, u64> = BatchMapper::new(vec![("a", vec![])]);
        assert!(mapper.is_empty());
        let results = mapper
            .iteration(Iteration::Parallel)
            .map_instances(|_| async { Ok::<u64, ()>(1) })
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
