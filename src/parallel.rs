//! Fan-out keyed tasks, fan-in their results.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use crate::coroutine;
use crate::report::Panic;
use crate::sync::{Channel, WaitGroup};

type Task<T, E> = Box<dyn FnOnce() -> Result<T, E>>;

/// Identifies a task and its outcome.
///
/// Positional keys sort before named ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Index(usize),
    Name(String),
}

impl From<usize> for Key {
    fn from(index: usize) -> Self {
        Key::Index(index)
    }
}

impl From<&str> for Key {
    fn from(name: &str) -> Self {
        Key::Name(name.to_owned())
    }
}

impl From<String> for Key {
    fn from(name: String) -> Self {
        Key::Name(name)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{index}"),
            Key::Name(name) => f.write_str(name),
        }
    }
}

/// Why a single task has no result.
pub enum TaskError<E> {
    /// The task returned an error.
    Failed(E),
    Panicked(Panic),
}

impl<E: fmt::Debug> fmt::Debug for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
            TaskError::Panicked(failure) => f.debug_tuple("Panicked").field(failure).finish(),
        }
    }
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(error) => error.fmt(f),
            TaskError::Panicked(failure) => failure.fmt(f),
        }
    }
}

impl<E: Error + 'static> Error for TaskError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TaskError::Failed(error) => Some(error),
            TaskError::Panicked(_) => None,
        }
    }
}

/// Every failure of a [Parallel] run, along with the results of the tasks that succeeded.
pub struct ParallelError<T, E> {
    results: BTreeMap<Key, T>,
    errors: BTreeMap<Key, TaskError<E>>,
}

impl<T, E> ParallelError<T, E> {
    pub fn results(&self) -> &BTreeMap<Key, T> {
        &self.results
    }

    pub fn errors(&self) -> &BTreeMap<Key, TaskError<E>> {
        &self.errors
    }

    pub fn into_parts(self) -> (BTreeMap<Key, T>, BTreeMap<Key, TaskError<E>>) {
        (self.results, self.errors)
    }
}

impl<T, E: fmt::Debug> fmt::Debug for ParallelError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelError")
            .field("results", &self.results.keys().collect::<Vec<_>>())
            .field("errors", &self.errors)
            .finish()
    }
}

impl<T, E: fmt::Display> fmt::Display for ParallelError<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "detected {} failure(s) during parallel execution:", self.errors.len())?;
        for (key, error) in &self.errors {
            write!(f, "\n  {key}: {error}")?;
        }
        Ok(())
    }
}

impl<T, E: fmt::Debug + fmt::Display> Error for ParallelError<T, E> {}

/// Set of keyed tasks run in their own coroutines, collected when waited on.
///
/// With a concurrency of 0 every task runs at once, otherwise at most that many at a time.
pub struct Parallel<T, E = Box<dyn Error>> {
    concurrency: usize,
    tasks: Vec<(Key, Task<T, E>)>,
    next_index: usize,
}

impl<T: 'static, E: 'static> Parallel<T, E> {
    pub fn new(concurrency: usize) -> Self {
        Parallel {
            concurrency,
            tasks: Vec::new(),
            next_index: 0,
        }
    }

    /// Adds [task] under the next positional key, which is returned.
    pub fn add(&mut self, task: impl FnOnce() -> Result<T, E> + 'static) -> Key {
        let key = Key::Index(self.next_index);
        self.add_keyed(key.clone(), task);
        key
    }

    /// Adds [task] under [key], replacing a pending task with the same key.
    pub fn add_keyed(&mut self, key: impl Into<Key>, task: impl FnOnce() -> Result<T, E> + 'static) {
        let key = key.into();
        if let Key::Index(index) = key {
            self.next_index = self.next_index.max(index.saturating_add(1));
        }

        let task: Task<T, E> = Box::new(task);
        match self.tasks.iter_mut().find(|(pending, _)| *pending == key) {
            Some((_, pending)) => *pending = task,
            None => self.tasks.push((key, task)),
        }
    }

    /// Pending tasks.
    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Drops every pending task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.next_index = 0;
    }

    /// Runs every pending task and parks until all of them have finished.
    ///
    /// Fails if any task returned an error or panicked, carrying the other tasks' results.
    pub fn wait(&mut self) -> Result<BTreeMap<Key, T>, ParallelError<T, E>> {
        let (results, errors) = self.run();

        if errors.is_empty() {
            Ok(results)
        } else {
            Err(ParallelError { results, errors })
        }
    }

    /// Same as [Parallel::wait], leaving failed tasks out of the results.
    pub fn wait_partial(&mut self) -> BTreeMap<Key, T> {
        let (results, errors) = self.run();
        if !errors.is_empty() {
            log::debug!("dropping {} failure(s) of parallel execution", errors.len());
        }

        results
    }

    fn run(&mut self) -> (BTreeMap<Key, T>, BTreeMap<Key, TaskError<E>>) {
        let tasks = std::mem::take(&mut self.tasks);
        self.next_index = 0;

        let group = WaitGroup::with_count(tasks.len());
        let slots = (self.concurrency > 0).then(|| Channel::new(self.concurrency));
        let results = Rc::new(RefCell::new(BTreeMap::new()));
        let errors = Rc::new(RefCell::new(BTreeMap::new()));

        for (key, task) in tasks {
            if let Some(slots) = &slots {
                // never closed and waits indefinitely, so it can't fail
                let _ = slots.push((), None);
            }

            let (group, slots) = (group.clone(), slots.clone());
            let (results, errors) = (results.clone(), errors.clone());
            coroutine::spawn(move || {
                coroutine::defer(move || {
                    if let Some(slots) = slots {
                        let _ = slots.pop(Some(Duration::ZERO));
                    }
                });
                coroutine::defer(move || {
                    if let Err(error) = group.done() {
                        log::error!("failed to mark parallel task as done: {error}");
                    }
                });

                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(Ok(value)) => {
                        results.borrow_mut().insert(key, value);
                    }
                    Ok(Err(error)) => {
                        errors.borrow_mut().insert(key, TaskError::Failed(error));
                    }
                    Err(payload) => {
                        errors.borrow_mut().insert(key, TaskError::Panicked(Panic::new(payload)));
                    }
                }
            });
        }

        // the group is private and every task was counted up front
        let _ = group.wait(None);

        let results = std::mem::take(&mut *results.borrow_mut());
        let errors = std::mem::take(&mut *errors.borrow_mut());
        (results, errors)
    }
}

impl<T: 'static, E: 'static> Default for Parallel<T, E> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T, E> fmt::Debug for Parallel<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parallel")
            .field("concurrency", &self.concurrency)
            .field("tasks", &self.tasks.iter().map(|(key, _)| key).collect::<Vec<_>>())
            .finish()
    }
}

/// Runs [tasks] under positional keys, at most [concurrency] at a time (0 for no limit).
pub fn parallel<T, E, F>(
    tasks: impl IntoIterator<Item = F>,
    concurrency: usize,
) -> Result<BTreeMap<Key, T>, ParallelError<T, E>>
where
    T: 'static,
    E: 'static,
    F: FnOnce() -> Result<T, E> + 'static,
{
    let mut parallel = Parallel::new(concurrency);
    for task in tasks {
        parallel.add(task);
    }
    parallel.wait()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io;

    use super::*;
    use crate::runtime::start;
    use crate::time::sleep;

    fn three_with_failure() -> Parallel<&'static str, io::Error> {
        let mut parallel = Parallel::new(0);
        parallel.add(|| Ok("zero"));
        parallel.add(|| Err(io::Error::new(io::ErrorKind::Other, "one failed")));
        parallel.add(|| Ok("two"));
        parallel
    }

    mod keys {
        use super::*;

        #[test]
        fn positional_keys_follow_insertion() {
            let mut parallel = Parallel::<(), io::Error>::new(0);

            assert_eq!(parallel.add(|| Ok(())), Key::Index(0));
            assert_eq!(parallel.add(|| Ok(())), Key::Index(1));
            parallel.add_keyed(5_usize, || Ok(()));
            parallel.add_keyed("named", || Ok(()));

            assert_eq!(parallel.add(|| Ok(())), Key::Index(6));
            assert_eq!(parallel.count(), 5);
        }

        #[test]
        fn same_key_replaces_pending_task() {
            start(|| {
                let mut parallel = Parallel::<_, io::Error>::new(0);
                parallel.add_keyed("key", || Ok(1));
                parallel.add_keyed("key", || Ok(2));

                assert_eq!(parallel.count(), 1);
                assert_eq!(parallel.wait().unwrap(), BTreeMap::from([(Key::from("key"), 2)]));
            })
            .unwrap();
        }

        #[test]
        fn largest_index_doesnt_overflow() {
            let mut parallel = Parallel::<(), io::Error>::new(0);
            parallel.add_keyed(usize::MAX, || Ok(()));

            // nothing fits past it, so the next positional task takes its place
            assert_eq!(parallel.add(|| Ok(())), Key::Index(usize::MAX));
            assert_eq!(parallel.count(), 1);
        }

        #[test]
        fn clear_drops_tasks() {
            let mut parallel = Parallel::<(), io::Error>::new(0);
            parallel.add(|| Ok(()));

            parallel.clear();

            assert_eq!(parallel.count(), 0);
            assert_eq!(parallel.add(|| Ok(())), Key::Index(0));
        }

        #[test]
        fn orders_and_displays() {
            assert!(Key::Index(10) < Key::from("a"));
            assert_eq!(Key::Index(3).to_string(), "3");
            assert_eq!(Key::from(String::from("name")).to_string(), "name");
        }
    }

    mod wait {
        use super::*;

        #[test]
        fn collects_results() {
            start(|| {
                let mut parallel = Parallel::<_, io::Error>::new(0);
                for n in 0..4 {
                    parallel.add(move || {
                        sleep(Duration::from_millis(4 - n as u64));
                        Ok(n * 10)
                    });
                }

                let results = parallel.wait().unwrap();

                assert_eq!(results.into_values().collect::<Vec<_>>(), vec![0, 10, 20, 30]);
                assert_eq!(parallel.count(), 0);
            })
            .unwrap();
        }

        #[test]
        fn aggregates_failures() {
            start(|| {
                let error = three_with_failure().wait().unwrap_err();

                assert_eq!(error.results().len(), 2);
                assert_eq!(error.errors().len(), 1);
                assert!(matches!(error.errors().get(&Key::Index(1)), Some(TaskError::Failed(_))));
                assert_eq!(
                    error.to_string(),
                    "detected 1 failure(s) during parallel execution:\n  1: one failed"
                );
            })
            .unwrap();
        }

        #[test]
        fn partial_leaves_out_failures() {
            start(|| {
                let results = three_with_failure().wait_partial();

                assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![Key::Index(0), Key::Index(2)]);
            })
            .unwrap();
        }

        #[test]
        fn panic_is_a_failure() {
            start(|| {
                let mut parallel = Parallel::<(), io::Error>::new(0);
                parallel.add(|| panic!("task panicked"));

                let (results, errors) = parallel.wait().unwrap_err().into_parts();

                assert!(results.is_empty());
                match &errors[&Key::Index(0)] {
                    TaskError::Panicked(failure) => assert_eq!(failure.message(), Some("task panicked")),
                    TaskError::Failed(_) => panic!("expected a panic"),
                }
            })
            .unwrap();
        }

        #[test]
        fn bounds_concurrency() {
            start(|| {
                let running = Rc::new(Cell::new(0));
                let peak = Rc::new(Cell::new(0));
                let mut parallel = Parallel::<(), io::Error>::new(2);

                for _ in 0..6 {
                    let (running, peak) = (running.clone(), peak.clone());
                    parallel.add(move || {
                        running.set(running.get() + 1);
                        peak.set(peak.get().max(running.get()));
                        sleep(Duration::from_millis(1));
                        running.set(running.get() - 1);
                        Ok(())
                    });
                }

                assert_eq!(parallel.wait().unwrap().len(), 6);
                assert_eq!(peak.get(), 2);
            })
            .unwrap();
        }

        #[test]
        fn nothing_to_wait_for() {
            start(|| {
                let mut parallel = Parallel::<(), io::Error>::default();

                assert!(parallel.wait().unwrap().is_empty());
            })
            .unwrap();
        }
    }

    #[test]
    fn helper_runs_tasks() {
        start(|| {
            let tasks = (1..=3).map(|n| move || Ok::<_, io::Error>(n));

            let results = parallel(tasks, 1).unwrap();

            assert_eq!(results.values().sum::<i32>(), 6);
        })
        .unwrap();
    }
}
