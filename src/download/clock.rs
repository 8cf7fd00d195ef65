use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Spawn the scheduling clock: a tick on the channel every `period`,
/// starting immediately, until stop fires or the receiver is dropped.
pub(crate) fn spawn_clock(
    period: Duration,
    ticks: mpsc::Sender<()>,
    mut stop: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if ticks.send(()).await.is_err() {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_ticks_repeatedly() {
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        spawn_clock(Duration::from_secs(1), tick_tx, stop_rx);

        for _ in 0..3 {
            assert!(tick_rx.recv().await.is_some());
        }
    }

    #[tokio::test]
    async fn test_clock_stops_on_signal() {
        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        spawn_clock(Duration::from_secs(1), tick_tx, stop_rx);
        // First tick fires immediately
        assert!(tick_rx.recv().await.is_some());

        stop_tx.send(true).unwrap();
        assert!(tick_rx.recv().await.is_none());
    }
}
