pub mod daemon;
pub(crate) mod jobs;

pub use self::daemon::spawn_interval_daemon;
pub use self::jobs::Scheduler;
