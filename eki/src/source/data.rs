use crate::queue::Queue;
use crate::source::{Source, SourceInner, SourceKind};
use std::ops::Deref;

/// How values passed to [`DataSource::merge_data`] combine while an event is
/// pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceKind {
    /// Values are summed.
    Add,

    /// Values are combined with a bitwise OR.
    Or,
}

/// Source whose events are triggered by the application.
///
/// Created suspended, like every source. Dropping it releases its handlers,
/// without running the cancel handler, and cancels it.
pub struct DataSource {
    source: Source,
}

impl DataSource {
    pub fn new(kind: DataSourceKind, queue: Queue) -> Self {
        Self {
            source: Source {
                inner: SourceInner::new(queue, SourceKind::Data(kind)),
            },
        }
    }

    /// Folds `value` into the pending event and schedules its delivery.
    /// Zero is a no-op. While suspended, values keep accumulating and are
    /// delivered as one event on resume.
    pub fn merge_data(&self, value: u64) {
        if value != 0 {
            self.source.inner.merge(value);
        }
    }

    pub fn kind(&self) -> DataSourceKind {
        match self.source.inner.kind {
            SourceKind::Data(kind) => kind,
            SourceKind::Timer => unreachable!("data source created with timer kind"),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }
}

impl Deref for DataSource {
    type Target = Source;

    fn deref(&self) -> &Source {
        &self.source
    }
}

impl Drop for DataSource {
    fn drop(&mut self) {
        self.source.inner.teardown();
    }
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DataSource").field(&self.source).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueKind;
    use crate::test_utils::{Recorder, wait_until};
    use rstest::rstest;
    use std::thread;
    use std::time::Duration;

    fn recording(kind: DataSourceKind) -> (DataSource, Recorder<u64>) {
        let events = Recorder::new();
        let source = DataSource::new(kind, Queue::new("data-test", QueueKind::Serial));
        {
            let events = events.clone();
            source.set_handler(move |source| events.push(source.data()));
        }
        (source, events)
    }

    #[rstest]
    #[case::add(DataSourceKind::Add, &[1, 2, 3, 4], 10)]
    #[case::or(DataSourceKind::Or, &[0b0001, 0b0100, 0b0101], 0b0101)]
    fn test_merges_while_suspended(
        #[case] kind: DataSourceKind,
        #[case] values: &[u64],
        #[case] expected: u64,
    ) {
        let (source, events) = recording(kind);
        assert_eq!(source.kind(), kind);

        for &value in values {
            source.merge_data(value);
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(events.len(), 0);

        source.resume();
        assert!(wait_until(|| events.len() == 1));
        assert_eq!(events.events(), vec![expected]);
    }

    #[test]
    fn test_each_merge_is_delivered() {
        let (source, events) = recording(DataSourceKind::Add);
        source.resume();

        source.merge_data(3);
        assert!(wait_until(|| events.len() == 1));
        source.merge_data(4);
        assert!(wait_until(|| events.len() == 2));

        assert_eq!(events.events(), vec![3, 4]);
    }

    #[test]
    fn test_add_saturates_instead_of_wrapping() {
        let (source, events) = recording(DataSourceKind::Add);

        source.merge_data(u64::MAX);
        source.merge_data(1);
        source.resume();

        assert!(wait_until(|| events.len() == 1));
        assert_eq!(events.events(), vec![u64::MAX]);
    }

    #[test]
    fn test_merge_zero_does_not_fire() {
        let (source, events) = recording(DataSourceKind::Or);
        source.resume();

        source.merge_data(0);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(events.len(), 0);
    }

    #[test]
    fn test_merge_after_cancel_is_dropped() {
        let (source, events) = recording(DataSourceKind::Add);
        let cancelled = Recorder::new();
        {
            let cancelled = cancelled.clone();
            source.set_cancel_handler(move |_| cancelled.push(()));
        }

        source.resume();
        source.cancel();
        source.merge_data(7);

        assert!(wait_until(|| cancelled.len() == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(events.len(), 0);
    }
}
