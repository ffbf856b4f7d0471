//! Default task profiles seeded into an empty store.

use super::{Task, TaskType};

/// The out-of-box tasks: a daily subscription refresh and a node test
/// every four hours.
pub fn defaults() -> Vec<Task> {
    vec![
        Task::new(
            "subscription-refresh",
            TaskType::SubscriptionRefresh,
            "Refresh subscriptions",
            "0 0 3 * * *", // 03:00 daily
        ),
        Task::new(
            "node-test",
            TaskType::NodeTest,
            "Test node health",
            "0 0 */4 * * *", // every 4 hours
        ),
    ]
}
