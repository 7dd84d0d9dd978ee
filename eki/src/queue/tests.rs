use crate::queue::{Priority, Queue, QueueKind};
use crate::test_utils::{CountLatch, Recorder, wait_until};
use anyhow::Result;
use rstest::rstest;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Flags concurrent entries into a section that must be exclusive.
#[derive(Clone, Default)]
struct OverlapProbe {
    inside: Arc<AtomicUsize>,
    overlapped: Arc<AtomicBool>,
}

impl OverlapProbe {
    fn enter(&self) {
        if self.inside.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }

    fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

#[test]
fn test_serial_queue_runs_in_order_without_overlap() {
    let queue = Queue::new("serial-fifo", QueueKind::Serial);
    let order = Recorder::new();
    let probe = OverlapProbe::default();

    for i in 0..50 {
        let order = order.clone();
        let probe = probe.clone();
        queue.submit(move || {
            probe.enter();
            thread::sleep(Duration::from_micros(200));
            order.push(i);
            probe.exit();
        });
    }

    queue.submit_and_wait(|| {});
    assert_eq!(order.events(), (0..50).collect::<Vec<_>>());
    assert!(!probe.overlapped());
}

#[test]
fn test_serial_queue_abc() {
    let queue = Queue::new("Q", QueueKind::Serial);
    let order = Recorder::new();

    for name in ["A", "B", "C"] {
        let order = order.clone();
        queue.submit(move || order.push(name));
    }

    assert!(wait_until(|| order.len() == 3));
    assert_eq!(order.events(), vec!["A", "B", "C"]);
}

#[test]
fn test_main_queue_is_serial() {
    assert_eq!(Queue::Main.kind(), QueueKind::Serial);
    assert_eq!(Queue::Main.priority(), Priority::UserInteractive);
    assert_eq!(Queue::Background.kind(), QueueKind::Concurrent);
    assert!(Queue::Main.is_system());
    assert_eq!(Queue::Main, Queue::Main);
    assert_ne!(Queue::Main, Queue::Default);
}

#[rstest]
#[case::serial(QueueKind::Serial)]
#[case::concurrent(QueueKind::Concurrent)]
fn test_custom_queue_accessors(#[case] kind: QueueKind) {
    let queue = Queue::with_priority("accessors", kind, Priority::Utility);
    assert_eq!(queue.label(), "accessors");
    assert_eq!(queue.to_string(), "accessors");
    assert_eq!(queue.kind(), kind);
    assert_eq!(queue.priority(), Priority::Utility);
    assert!(!queue.is_system());
    assert_eq!(queue, queue.clone());
    assert_ne!(queue, Queue::new("accessors", kind));
}

#[test]
fn test_barrier_excludes_surrounding_work() {
    let queue = Queue::new("barrier", QueueKind::Concurrent);
    let before_done = Arc::new(AtomicUsize::new(0));
    let after_started = Arc::new(AtomicUsize::new(0));
    let observed = Recorder::new();

    for _ in 0..8 {
        let before_done = Arc::clone(&before_done);
        queue.submit(move || {
            thread::sleep(Duration::from_millis(5));
            before_done.fetch_add(1, Ordering::SeqCst);
        });
    }

    {
        let before_done = Arc::clone(&before_done);
        let after_started = Arc::clone(&after_started);
        let observed = observed.clone();
        queue.submit_barrier(move || {
            observed.push(before_done.load(Ordering::SeqCst));
            thread::sleep(Duration::from_millis(10));
            observed.push(after_started.load(Ordering::SeqCst));
        });
    }

    let done = Arc::new(CountLatch::new(8));
    for _ in 0..8 {
        let after_started = Arc::clone(&after_started);
        let done = Arc::clone(&done);
        queue.submit(move || {
            after_started.fetch_add(1, Ordering::SeqCst);
            done.count_down();
        });
    }

    done.wait();
    assert_eq!(observed.events(), vec![8, 0]);
}

#[test]
fn test_concurrent_queue_runs_in_parallel() {
    let queue = Queue::new("parallel", QueueKind::Concurrent);
    let probe = OverlapProbe::default();
    let done = Arc::new(CountLatch::new(2));

    for _ in 0..2 {
        let probe = probe.clone();
        let done = Arc::clone(&done);
        queue.submit(move || {
            probe.enter();
            wait_until(|| probe.overlapped());
            probe.exit();
            done.count_down();
        });
    }

    done.wait();
    assert!(probe.overlapped());
}

#[test]
fn test_submit_and_wait_returns_result() {
    let queue = Queue::new("sync", QueueKind::Serial);
    let value = queue.submit_and_wait(|| {
        assert!(queue.is_current());
        21 * 2
    });

    assert_eq!(value, 42);
    assert!(!queue.is_current());
}

#[test]
fn test_submit_and_wait_borrows_caller_state() {
    let queue = Queue::new("borrow", QueueKind::Concurrent);
    let mut items = vec![1, 2, 3];

    queue.submit_and_wait(|| items.push(4));
    assert_eq!(items, [1, 2, 3, 4]);
}

#[test]
fn test_submit_and_wait_from_own_queue_runs_inline() {
    let queue = Queue::new("reentrant", QueueKind::Serial);
    let inner = queue.clone();

    let (outer_thread, inner_thread) = queue.submit_and_wait(move || {
        let outer_thread = thread::current().id();
        let inner_thread = inner.submit_and_wait(|| thread::current().id());
        (outer_thread, inner_thread)
    });

    assert_eq!(outer_thread, inner_thread);
}

#[test]
fn test_submit_and_wait_from_async_work_on_own_queue() {
    let queue = Queue::new("reentrant-async", QueueKind::Serial);
    let result = Recorder::new();

    {
        let queue2 = queue.clone();
        let result = result.clone();
        queue.submit(move || result.push(queue2.submit_and_wait(|| 7)));
    }

    assert!(wait_until(|| result.len() == 1));
    assert_eq!(result.events(), vec![7]);
}

#[test]
fn test_nested_queues_are_all_current() {
    let outer = Queue::new("outer", QueueKind::Serial);
    let inner = Queue::new("inner", QueueKind::Serial);

    let seen = outer.submit_and_wait(|| {
        inner.submit_and_wait(|| (outer.is_current(), inner.is_current(), Queue::Main.is_current()))
    });

    assert_eq!(seen, (true, true, false));
}

#[test]
fn test_submit_and_wait_propagates_panic() {
    let queue = Queue::new("panicky", QueueKind::Serial);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.submit_and_wait(|| panic!("boom"));
    }));
    assert!(result.is_err());

    // The slot was released.
    assert_eq!(queue.submit_and_wait(|| 1), 1);
}

#[test]
fn test_async_panic_does_not_stall_serial_queue() {
    let queue = Queue::new("panicky-async", QueueKind::Serial);

    queue.submit(|| panic!("async boom"));
    assert_eq!(queue.submit_and_wait(|| "still running"), "still running");
}

#[test]
fn test_barrier_and_wait_runs_exclusively() {
    let queue = Queue::new("barrier-sync", QueueKind::Concurrent);
    let finished = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let finished = Arc::clone(&finished);
        queue.submit(move || {
            thread::sleep(Duration::from_millis(5));
            finished.fetch_add(1, Ordering::SeqCst);
        });
    }

    let seen = queue.submit_barrier_and_wait(|| finished.load(Ordering::SeqCst));
    assert_eq!(seen, 4);
}

#[test]
fn test_barrier_and_wait_from_own_queue_panics() {
    let queue = Queue::new("self-barrier", QueueKind::Concurrent);
    let inner = queue.clone();

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.submit_and_wait(|| inner.submit_barrier_and_wait(|| {}));
    }));

    let payload = result.unwrap_err();
    let message = payload.downcast_ref::<String>().unwrap();
    assert!(message.contains("submit_barrier_and_wait called from the context of queue"));
}

#[rstest]
#[case::concurrent(QueueKind::Concurrent, 4)]
#[case::concurrent_many(QueueKind::Concurrent, 1000)]
#[case::serial(QueueKind::Serial, 16)]
fn test_iterate_visits_every_index_once(#[case] kind: QueueKind, #[case] iterations: usize) {
    let queue = Queue::new("iterate", kind);
    let hits: Vec<AtomicUsize> = (0..iterations).map(|_| AtomicUsize::new(0)).collect();

    queue.iterate(iterations, |i| {
        hits[i].fetch_add(1, Ordering::Relaxed);
    });

    assert!(hits.iter().all(|hit| hit.load(Ordering::Relaxed) == 1));
}

#[test]
fn test_iterate_serial_runs_in_order() {
    let queue = Queue::new("iterate-serial", QueueKind::Serial);
    let order = Recorder::new();

    queue.iterate(8, |i| order.push(i));
    assert_eq!(order.events(), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_iterate_zero_is_noop() {
    Queue::Default.iterate(0, |_| unreachable!());
}

#[test]
fn test_iterate_from_own_queue_runs_inline() {
    let queue = Queue::new("iterate-nested", QueueKind::Concurrent);
    let inner = queue.clone();

    let sum = queue.submit_and_wait(|| {
        let sum = AtomicUsize::new(0);
        inner.iterate(10, |i| {
            sum.fetch_add(i, Ordering::Relaxed);
        });
        sum.into_inner()
    });

    assert_eq!(sum, 45);
}

#[test]
fn test_iterate_propagates_panic() {
    let queue = Queue::new("iterate-panic", QueueKind::Concurrent);
    let ran = AtomicUsize::new(0);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        queue.iterate(32, |i| {
            ran.fetch_add(1, Ordering::Relaxed);
            if i == 5 {
                panic!("index 5 failed");
            }
        });
    }));

    assert!(result.is_err());
    assert!(ran.load(Ordering::Relaxed) >= 1);

    // Every helper finished, the queue is usable again.
    assert_eq!(queue.submit_barrier_and_wait(|| 3), 3);
}

#[test]
fn test_after_waits_for_delay() {
    let queue = Queue::new("after", QueueKind::Serial);
    let fired_at = Recorder::new();
    let delay = Duration::from_millis(30);
    let start = Instant::now();

    {
        let fired_at = fired_at.clone();
        queue.after(delay, move || fired_at.push(Instant::now()));
    }

    assert!(wait_until(|| fired_at.len() == 1));
    assert!(fired_at.events()[0] >= start + delay);
}

#[test]
fn test_submit_all_tracks_every_item() {
    let queue = Queue::new("batch", QueueKind::Concurrent);
    let count = Arc::new(AtomicUsize::new(0));

    let works = (0..10).map(|_| {
        let count = Arc::clone(&count);
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });

    let group = queue.submit_all(works);
    group.wait();
    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert_eq!(group.count(), 0);
}

#[test]
fn test_submit_all_and_wait() {
    let queue = Queue::new("batch-sync", QueueKind::Serial);
    let order = Recorder::new();

    let works = (0..5).map(|i| {
        let order = order.clone();
        move || order.push(i)
    });

    queue.submit_all_and_wait(works);
    assert_eq!(order.events(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_suspend_holds_back_pending_work() -> Result<()> {
    let queue = Queue::new("suspended", QueueKind::Serial);
    let ran = Recorder::new();

    queue.suspend();
    queue.suspend();
    assert!(queue.is_suspended());

    {
        let ran = ran.clone();
        queue.submit(move || ran.push(()));
    }

    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.len(), 0);

    queue.resume();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.len(), 0);

    queue.resume();
    assert!(!queue.is_suspended());
    assert!(wait_until(|| ran.len() == 1));
    Ok(())
}

#[test]
fn test_suspend_does_not_interrupt_running_work() {
    let queue = Queue::new("suspend-running", QueueKind::Serial);
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        queue.submit(move || {
            started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            finished.store(true, Ordering::SeqCst);
        });
    }

    assert!(wait_until(|| started.load(Ordering::SeqCst)));
    queue.suspend();
    assert!(wait_until(|| finished.load(Ordering::SeqCst)));
    queue.resume();
}

#[rstest]
#[case::main(Queue::Main)]
#[case::default(Queue::Default)]
#[case::background(Queue::Background)]
#[should_panic(expected = "cannot suspend system queue")]
fn test_suspend_system_queue_panics(#[case] queue: Queue) {
    queue.suspend();
}

#[test]
#[should_panic(expected = "cannot resume system queue")]
fn test_resume_system_queue_panics() {
    Queue::Utility.resume();
}

#[test]
#[should_panic(expected = "resumed more times than suspended")]
fn test_over_resume_panics() {
    let queue = Queue::new("over-resume", QueueKind::Concurrent);
    queue.resume();
}

#[test]
fn test_pending_work_keeps_queue_alive() {
    let ran = Recorder::new();

    {
        let queue = Queue::new("dropped", QueueKind::Serial);
        queue.suspend();
        let ran = ran.clone();
        queue.submit(move || ran.push(()));

        let handle = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            handle.resume();
        });
    }

    assert!(wait_until(|| ran.len() == 1));
}
