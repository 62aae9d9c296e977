use std::time::Duration;

use lib_presence::{PresenceClient, PresenceEvent};
use tokio::sync::broadcast;
use tokio::time::interval;

fn describe(event: &PresenceEvent) -> String {
    match event {
        PresenceEvent::Connected => "connected".to_string(),
        PresenceEvent::Disconnected { code, reason } => format!("disconnected ({} {})", code, reason),
        PresenceEvent::Reconnecting { attempt, delay } => format!("reconnect #{} in {:?}", attempt, delay),
        PresenceEvent::PresenceUpdated { count } => format!("{} user(s) online", count),
        PresenceEvent::ServerError(message) => format!("server error: {}", message),
        PresenceEvent::TaskStarted(activity) => format!(
            "user {} started {}",
            activity.sender_id,
            activity.task.label().unwrap_or("a task")
        ),
        PresenceEvent::TaskCompleted(activity) => format!(
            "user {} completed {}",
            activity.sender_id,
            activity.task.label().unwrap_or("a task")
        ),
        PresenceEvent::PrivacyModeChanged(enabled) => format!("privacy mode {}", if *enabled { "on" } else { "off" }),
        PresenceEvent::Notice(notice) => notice.to_string(),
    }
}

fn report(client: &PresenceClient) {
    let status = client.status();
    let users = client.presence().sorted_by_recency();
    log::info!(
        "Presence report: {} | {} user(s) online | reconnect attempts {}",
        status.state,
        users.len(),
        status.reconnect_attempts
    );
    for user in users {
        log::info!(
            "  #{} {}{} (last activity {})",
            user.user_id,
            user.display_name,
            if user.privacy_mode { " [private]" } else { "" },
            user.last_activity
        );
    }
}

pub async fn run(client: PresenceClient, report_every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut events = client.subscribe();
    let mut report_interval = interval(report_every);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Monitor received shutdown signal.");
                break;
            }
            event = events.recv() => match event {
                Ok(PresenceEvent::Notice(notice)) => log::warn!("{}", describe(&PresenceEvent::Notice(notice))),
                Ok(event) => log::info!("Presence event: {}", describe(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Monitor fell behind, {} event(s) skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = report_interval.tick() => report(&client),
        }
    }
}
