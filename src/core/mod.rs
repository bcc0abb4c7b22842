pub mod coordinator;
pub mod notifications;
pub mod progress;
pub mod scheduler;
pub mod snapshot;

pub use coordinator::{
    Coordinator, CoordinatorHandle, CoordinatorStatus, MonitorError, MonitoringState,
};
pub use notifications::{Notification, NotificationChannel, create_notifier};
pub use progress::ProgressTracker;
pub use scheduler::{Scheduler, TimerEvent, TimerFired, TimerToken, TokioScheduler};
pub use snapshot::{JobMetrics, MetricValue, StatusSnapshot};
