use crate::queue::dispatch::QueueInner;
use crate::queue::{Priority, QueueKind};
use std::sync::{Arc, OnceLock};

/// The well-known queues. Created together on first use and never destroyed.
pub(super) struct SystemQueues {
    pub(super) main: Arc<QueueInner>,
    pub(super) user_interactive: Arc<QueueInner>,
    pub(super) user_initiated: Arc<QueueInner>,
    pub(super) default: Arc<QueueInner>,
    pub(super) utility: Arc<QueueInner>,
    pub(super) background: Arc<QueueInner>,
}

static SYSTEM_QUEUES: OnceLock<SystemQueues> = OnceLock::new();

pub(super) fn get() -> &'static SystemQueues {
    SYSTEM_QUEUES.get_or_init(|| SystemQueues {
        main: system("eki.main", QueueKind::Serial, Priority::UserInteractive),
        user_interactive: concurrent("eki.user-interactive", Priority::UserInteractive),
        user_initiated: concurrent("eki.user-initiated", Priority::UserInitiated),
        default: concurrent("eki.default", Priority::Default),
        utility: concurrent("eki.utility", Priority::Utility),
        background: concurrent("eki.background", Priority::Background),
    })
}

fn concurrent(label: &str, priority: Priority) -> Arc<QueueInner> {
    system(label, QueueKind::Concurrent, priority)
}

fn system(label: &str, kind: QueueKind, priority: Priority) -> Arc<QueueInner> {
    Arc::new(QueueInner::new(label.to_owned(), kind, priority, true))
}
